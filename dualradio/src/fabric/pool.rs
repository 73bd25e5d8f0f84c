use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{Duration, Instant};
use heapless::{Deque, Vec};

/// Capacity of one pooled message buffer.
pub const MSG_CAP: usize = 2048;
/// Number of buffers in the pool.
pub const POOL_SLOTS: usize = 8;

/// Consecutive allocation failures after which a watchdog reboot is due.
const MAX_ALLOC_FAILS: u8 = 5;

struct Slot {
    refs: i16,
    incoming: bool,
    ts: Instant,
    buf: Vec<u8, MSG_CAP>,
}

impl Slot {
    fn free() -> Self {
        Self {
            refs: 0,
            incoming: false,
            ts: Instant::from_ticks(0),
            buf: Vec::new(),
        }
    }
}

struct PoolInner {
    slots: [Slot; POOL_SLOTS],
    /// Incoming messages waiting for a `wait_for` consumer, oldest first.
    /// The queue holds one reference per entry.
    pending: Deque<u8, POOL_SLOTS>,
    live_refs: i32,
    alloc_fails: u8,
}

/// Why an allocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolExhausted {
    /// Five allocations in a row have failed; the caller must request a
    /// watchdog reboot on the power channel.
    pub reboot_needed: bool,
}

/// Bounded slab of reference-counted message buffers.
///
/// Every exchange with the Wi-Fi modem is backed by one slot. Slots are
/// created with refcount 1 and handed out as [`MsgRef`]; cloning a handle
/// retains the slot, dropping releases it, and the buffer returns to the
/// pool at refcount zero. When the slab is full, the oldest pending
/// incoming message older than the flush age is evicted to make room.
pub struct MsgPool {
    inner: Mutex<CriticalSectionRawMutex, RefCell<PoolInner>>,
    flush_age: Duration,
}

impl MsgPool {
    pub fn new(flush_age: Duration) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(PoolInner {
                slots: core::array::from_fn(|_| Slot::free()),
                pending: Deque::new(),
                live_refs: 0,
                alloc_fails: 0,
            })),
            flush_age,
        }
    }

    /// Allocate a slot holding a copy of `bytes`.
    pub fn alloc(&self, bytes: &[u8], incoming: bool, now: Instant) -> Result<MsgRef<'_>, PoolExhausted> {
        if bytes.len() > MSG_CAP {
            // Oversized frames cannot be stored; treated like exhaustion
            // without bumping the watchdog counter.
            return Err(PoolExhausted { reboot_needed: false });
        }
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            loop {
                if let Some(idx) = inner.slots.iter().position(|s| s.refs == 0) {
                    let slot = &mut inner.slots[idx];
                    slot.refs = 1;
                    slot.incoming = incoming;
                    slot.ts = now;
                    slot.buf.clear();
                    // Length checked above.
                    let _ = slot.buf.extend_from_slice(bytes);
                    inner.live_refs += 1;
                    inner.alloc_fails = 0;
                    return Ok(MsgRef { pool: self, slot: idx as u8 });
                }
                // No free slot. Evict the oldest pending message if it has
                // aged past the flush threshold, then retry.
                let evictable = match inner.pending.front() {
                    Some(&idx) => now - inner.slots[idx as usize].ts > self.flush_age,
                    None => false,
                };
                if !evictable {
                    inner.alloc_fails = inner.alloc_fails.saturating_add(1);
                    let reboot = inner.alloc_fails > MAX_ALLOC_FAILS;
                    if reboot {
                        error!("msg pool: too many alloc fails in a row");
                    }
                    return Err(PoolExhausted { reboot_needed: reboot });
                }
                let idx = inner.pending.pop_front().unwrap_or(0) as usize;
                release_slot(&mut inner, idx);
            }
        })
    }

    /// Queue an incoming message for `wait_for` consumers. The queue holds
    /// its own reference. Fails when the queue is full.
    pub fn push_pending(&self, msg: &MsgRef<'_>) -> Result<(), ()> {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            if inner.pending.push_back(msg.slot).is_err() {
                return Err(());
            }
            inner.slots[msg.slot as usize].refs += 1;
            inner.live_refs += 1;
            Ok(())
        })
    }

    /// Take the oldest pending message, transferring the queue's reference
    /// to the returned handle.
    pub fn pop_pending(&self) -> Option<MsgRef<'_>> {
        self.inner.lock(|inner| {
            let slot = inner.borrow_mut().pending.pop_front()?;
            Some(MsgRef { pool: self, slot })
        })
    }

    /// Drop every pending message.
    pub fn flush_pending(&self) {
        self.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            while let Some(idx) = inner.pending.pop_front() {
                release_slot(&mut inner, idx as usize);
            }
        });
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock(|inner| inner.borrow().pending.len())
    }

    /// System-wide count of live references, for diagnostics.
    pub fn live_refs(&self) -> i32 {
        self.inner.lock(|inner| inner.borrow().live_refs)
    }

    pub fn slots_in_use(&self) -> usize {
        self.inner.lock(|inner| inner.borrow().slots.iter().filter(|s| s.refs > 0).count())
    }

    /// Consecutive allocation failures so far.
    pub fn alloc_fails(&self) -> u8 {
        self.inner.lock(|inner| inner.borrow().alloc_fails)
    }

    #[cfg(test)]
    fn refs_sum(&self) -> i32 {
        self.inner
            .lock(|inner| inner.borrow().slots.iter().map(|s| s.refs as i32).sum())
    }
}

fn release_slot(inner: &mut PoolInner, idx: usize) {
    let slot = &mut inner.slots[idx];
    slot.refs -= 1;
    inner.live_refs -= 1;
    if slot.refs < 0 {
        error!("msg pool: slot {} over-released", idx);
        slot.refs = 0;
    } else if slot.refs == 0 {
        slot.buf.clear();
    }
}

/// Shared-ownership handle to one pooled message.
///
/// `Clone` retains the slot, `Drop` releases it. Do not call other pool
/// methods from inside [`MsgRef::with_bytes`]; the closure runs under the
/// pool lock.
pub struct MsgRef<'p> {
    pool: &'p MsgPool,
    slot: u8,
}

impl core::fmt::Debug for MsgRef<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MsgRef").field("slot", &self.slot).finish()
    }
}

impl<'p> MsgRef<'p> {
    pub fn timestamp(&self) -> Instant {
        self.pool.inner.lock(|inner| inner.borrow().slots[self.slot as usize].ts)
    }

    pub fn incoming(&self) -> bool {
        self.pool
            .inner
            .lock(|inner| inner.borrow().slots[self.slot as usize].incoming)
    }

    pub fn len(&self) -> usize {
        self.pool
            .inner
            .lock(|inner| inner.borrow().slots[self.slot as usize].buf.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the message bytes.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.pool
            .inner
            .lock(|inner| f(&inner.borrow().slots[self.slot as usize].buf))
    }

    /// Copy the message bytes into `out`, returning the copied length.
    pub fn copy_to(&self, out: &mut [u8]) -> usize {
        self.with_bytes(|b| {
            let n = b.len().min(out.len());
            out[..n].copy_from_slice(&b[..n]);
            n
        })
    }
}

impl<'p> Clone for MsgRef<'p> {
    fn clone(&self) -> Self {
        self.pool.inner.lock(|inner| {
            let mut inner = inner.borrow_mut();
            inner.slots[self.slot as usize].refs += 1;
            inner.live_refs += 1;
        });
        Self { pool: self.pool, slot: self.slot }
    }
}

impl<'p> Drop for MsgRef<'p> {
    fn drop(&mut self) {
        self.pool.inner.lock(|inner| {
            release_slot(&mut inner.borrow_mut(), self.slot as usize);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> MsgPool {
        MsgPool::new(Duration::from_millis(2_000))
    }

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    #[test]
    fn alloc_retain_release() {
        let p = pool();
        let m = p.alloc(b"hello", true, at(0)).unwrap();
        assert_eq!(p.live_refs(), 1);
        assert_eq!(p.refs_sum(), 1);
        let m2 = m.clone();
        assert_eq!(p.live_refs(), 2);
        assert_eq!(p.refs_sum(), 2);
        m2.with_bytes(|b| assert_eq!(b, b"hello"));
        drop(m2);
        assert_eq!(p.live_refs(), 1);
        drop(m);
        assert_eq!(p.live_refs(), 0);
        assert_eq!(p.slots_in_use(), 0);
        assert_eq!(p.refs_sum(), 0);
    }

    #[test]
    fn pending_queue_holds_a_reference() {
        let p = pool();
        let m = p.alloc(b"+RSSI:-40", true, at(0)).unwrap();
        p.push_pending(&m).unwrap();
        assert_eq!(p.live_refs(), 2);
        drop(m);
        assert_eq!(p.live_refs(), 1);
        let back = p.pop_pending().unwrap();
        back.with_bytes(|b| assert_eq!(b, b"+RSSI:-40"));
        assert_eq!(p.live_refs(), 1);
        drop(back);
        assert_eq!(p.live_refs(), 0);
    }

    #[test]
    fn exhaustion_with_young_pending_fails() {
        let p = pool();
        let mut held = std::vec::Vec::new();
        for i in 0..POOL_SLOTS {
            let m = p.alloc(b"x", true, at(i as u64)).unwrap();
            p.push_pending(&m).ok();
            held.push(m);
        }
        // Everything is younger than the flush age.
        let err = p.alloc(b"y", true, at(100)).unwrap_err();
        assert!(!err.reboot_needed);
        assert_eq!(p.alloc_fails(), 1);
    }

    #[test]
    fn eviction_of_aged_pending() {
        let p = pool();
        for i in 0..POOL_SLOTS {
            // Only the queue keeps these alive.
            let m = p.alloc(b"old", true, at(i as u64)).unwrap();
            p.push_pending(&m).unwrap();
        }
        assert_eq!(p.slots_in_use(), POOL_SLOTS);
        // Well past the flush age: the oldest pending entry is evicted.
        let m = p.alloc(b"new", true, at(10_000)).unwrap();
        m.with_bytes(|b| assert_eq!(b, b"new"));
        assert_eq!(p.pending_len(), POOL_SLOTS - 1);
        assert_eq!(p.alloc_fails(), 0);
    }

    #[test]
    fn five_failures_request_reboot() {
        let p = pool();
        let mut held = std::vec::Vec::new();
        for _ in 0..POOL_SLOTS {
            held.push(p.alloc(b"x", true, at(0)).unwrap());
        }
        // No pending entries at all, so nothing is evictable.
        for n in 1..=MAX_ALLOC_FAILS {
            let err = p.alloc(b"y", true, at(0)).unwrap_err();
            assert!(!err.reboot_needed, "fail {} should not reboot yet", n);
        }
        let err = p.alloc(b"y", true, at(0)).unwrap_err();
        assert!(err.reboot_needed);
        // A successful allocation clears the counter.
        drop(held.pop());
        assert!(p.alloc(b"z", true, at(0)).is_ok());
        assert_eq!(p.alloc_fails(), 0);
    }

    #[test]
    fn oversized_frame_rejected() {
        let p = pool();
        let big = [0u8; MSG_CAP + 1];
        assert!(p.alloc(&big, true, at(0)).is_err());
        assert_eq!(p.alloc_fails(), 0);
    }

    #[test]
    fn flush_drops_only_queue_references() {
        let p = pool();
        let m = p.alloc(b"keep", true, at(0)).unwrap();
        p.push_pending(&m).unwrap();
        p.flush_pending();
        assert_eq!(p.pending_len(), 0);
        // Our handle still works.
        m.with_bytes(|b| assert_eq!(b, b"keep"));
        assert_eq!(p.live_refs(), 1);
    }
}

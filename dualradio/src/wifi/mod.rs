//! AT-command driver for the DA16200 Wi-Fi modem.
//!
//! The driver exposes a layered interface: framed command sends, OK/ERROR
//! transactions, multi-pattern response waits with scanf-style captures, and
//! domain operations built on top (MQTT, AP management, sleep coordination,
//! boot configuration, OTA). A single fair mutex serializes every logical
//! transaction with the modem; inbound frames are decoded on the ingest path
//! without ever touching that mutex.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer, with_timeout};

use crate::config::Config;
use crate::error::Error;
use crate::fabric::{Fabric, MsgPool, MsgRef, PowerCommand};
use crate::port::{Uicr, WifiCtrl, WifiLink};
use crate::types::Tri;

mod ap;
mod boot;
mod decode;
mod device;
mod http;
mod mqtt;
mod ota;
mod pattern;
mod sleep;
mod state;

pub use ap::{CurrentAp, MAX_SCAN_ENTRIES, ScanEntry};
pub use boot::{
    NET_STATE_ADDR, ONBOARDED_ADDR, UICR_BACKUP_ADDR, UICR_BACKUP_FLAG_ADDR, USER_NVRAM_BASE,
};
pub use device::MacSource;
pub use http::{HttpSink, MAX_HTTP_URL_LEN};
pub use mqtt::{msg_type, pub_topic, sub_topic};
pub use ota::{
    MAX_OTA_URL_LEN, OTA_STATUS_DOWNLOADING, OTA_STATUS_FAILED, OTA_STATUS_INSTALLED,
};
pub use pattern::{CapBuf, CapDst, MAX_CAPTURES, MAX_WAIT_PATTERNS, Pattern, WaitSet};
pub use sleep::SleepProbe;
pub use state::{DaState, StateStore};

/// Follow-up work decoded off inbound events, run by [`WifiAt::run_worker`].
///
/// Listeners must not block, so anything that needs the modem mutex is
/// deferred here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum DriverWork {
    /// Acknowledge a DPM wake (`MCUWUDONE` + `CLRDPMSLPEXT`).
    WakeHandshake,
    /// One-time post-boot configuration.
    BootInit,
    /// AP dropped: stop the modem from reusing its stored profile.
    ApDisconnected,
    /// Ask the modem for wall-clock time after broker traffic.
    QueryTime,
}

pub(crate) struct DriverFlags {
    /// One-shot boot configuration still pending. Re-armed by power-cycle.
    pub needs_one_time_config: bool,
    /// We expect the modem to restart (deliberate `AT+RESTART` / OTA renew).
    pub rebooting: bool,
    /// DPM was entered with "stay awake after boot".
    pub awake_on_boot: bool,
    /// Last time a wake pulse was issued.
    pub last_wake: Option<Instant>,
    /// Last time the modem was put to sleep.
    pub last_sleep: Option<Instant>,
    /// Last deliberate DPM mode change (the modem reboots on those).
    pub last_dpm_change: Option<Instant>,
    /// Async `+NWOTADWSTART:<code>` result, consumed by the OTA engine.
    pub ota_start_result: Option<heapless::String<4>>,
    /// Terminal `+NWHTCSTATUS` code of the current HTTP fetch.
    pub http_result: Option<i32>,
    /// Bytes seen in `+NWHTCDATA` chunks of the current fetch.
    pub http_bytes: u64,
}

impl DriverFlags {
    fn new() -> Self {
        Self {
            needs_one_time_config: true,
            rebooting: false,
            awake_on_boot: false,
            last_wake: None,
            last_sleep: None,
            last_dpm_change: None,
            ota_start_result: None,
            http_result: None,
            http_bytes: 0,
        }
    }
}

struct Owner {
    label: &'static str,
}

/// The Wi-Fi AT driver.
pub struct WifiAt<'p, L: WifiLink, C: WifiCtrl> {
    link: Mutex<CriticalSectionRawMutex, L>,
    ctrl: Mutex<CriticalSectionRawMutex, C>,
    owner: BlockingMutex<CriticalSectionRawMutex, RefCell<Owner>>,
    shadow: StateStore<'p>,
    pool: &'p MsgPool,
    fabric: &'p Fabric<'p>,
    uicr: &'p dyn Uicr,
    config: Config,
    rx_signal: Signal<CriticalSectionRawMutex, ()>,
    work: Channel<CriticalSectionRawMutex, DriverWork, 8>,
    pub(crate) flags: BlockingMutex<CriticalSectionRawMutex, RefCell<DriverFlags>>,
    pub(crate) ota: BlockingMutex<CriticalSectionRawMutex, RefCell<ota::OtaInfo>>,
    pub(crate) ssids: BlockingMutex<CriticalSectionRawMutex, RefCell<ap::SsidCache>>,
}

impl<'p, L: WifiLink, C: WifiCtrl> WifiAt<'p, L, C> {
    pub fn new(
        link: L,
        ctrl: C,
        pool: &'p MsgPool,
        fabric: &'p Fabric<'p>,
        uicr: &'p dyn Uicr,
        config: Config,
    ) -> Self {
        Self {
            link: Mutex::new(link),
            ctrl: Mutex::new(ctrl),
            owner: BlockingMutex::new(RefCell::new(Owner { label: "" })),
            shadow: StateStore::new(fabric),
            pool,
            fabric,
            uicr,
            config,
            rx_signal: Signal::new(),
            work: Channel::new(),
            flags: BlockingMutex::new(RefCell::new(DriverFlags::new())),
            ota: BlockingMutex::new(RefCell::new(ota::OtaInfo::new())),
            ssids: BlockingMutex::new(RefCell::new(ap::SsidCache::new())),
        }
    }

    /// The modem shadow.
    pub fn shadow(&self) -> &StateStore<'p> {
        &self.shadow
    }

    /// Snapshot of the modem shadow.
    pub fn state(&self) -> DaState {
        self.shadow.snapshot()
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn uicr(&self) -> &'p dyn Uicr {
        self.uicr
    }

    pub(crate) fn fabric(&self) -> &'p Fabric<'p> {
        self.fabric
    }

    /// Label of the transaction currently holding the modem mutex.
    pub fn mutex_owner(&self) -> &'static str {
        self.owner.lock(|o| o.borrow().label)
    }

    /// Open a serialized transaction with the modem.
    ///
    /// `label` is recorded for diagnostics while the mutex is held. Inner
    /// helpers borrow the returned [`Transaction`] instead of re-locking.
    pub async fn begin(
        &self,
        label: &'static str,
        timeout: Duration,
    ) -> Result<Transaction<'_, 'p, L, C>, Error> {
        let Ok(guard) = with_timeout(timeout, self.link.lock()).await else {
            warn!(
                "'{}' failed to get modem mutex, current owner '{}'",
                label,
                self.mutex_owner()
            );
            return Err(Error::MutexBusy);
        };
        self.owner.lock(|o| o.borrow_mut().label = label);
        Ok(Transaction { drv: self, link: guard })
    }

    /// Serialize one command to the modem under its own transaction.
    pub async fn send(&self, cmd: &str, timeout: Duration) -> Result<(), Error> {
        let mut tx = self.begin("send", timeout).await?;
        tx.send(cmd).await
    }

    /// Send `cmd` and wait for exactly one of `OK` / `ERROR:<code>`.
    pub async fn send_ok_err(&self, cmd: &str, timeout: Duration) -> Result<(), Error> {
        let mut tx = self.begin("send_ok_err", timeout).await?;
        tx.send_ok_err(cmd, timeout).await
    }

    /// Send `cmd` and watch inbound frames for any pattern in `wait`.
    pub async fn send_and_wait(
        &self,
        cmd: &str,
        wait: &mut WaitSet<'_>,
        timeout: Duration,
    ) -> Result<usize, Error> {
        let mut tx = self.begin("send_and_wait", timeout).await?;
        tx.send_and_wait(cmd, wait, timeout).await
    }

    /// Watch inbound frames for any pattern in `wait`, without a send.
    pub async fn wait_for(&self, wait: &mut WaitSet<'_>, timeout: Duration) -> Result<usize, Error> {
        let mut tx = self.begin("wait_for", timeout).await?;
        tx.wait_for(wait, timeout).await
    }

    /// Hand one received frame to the driver.
    ///
    /// Called by the transport glue for every inbound frame. Runs the
    /// prefix decoder (which never takes the modem mutex), then queues the
    /// frame for any transaction waiting on it.
    pub fn ingest(&self, frame: &[u8]) -> Result<(), Error> {
        let now = Instant::now();
        let msg = match self.pool.alloc(frame, true, now) {
            Ok(msg) => msg,
            Err(e) => {
                error!("dropping inbound frame, pool exhausted");
                if e.reboot_needed {
                    self.fabric.publish_power(PowerCommand::Reboot);
                }
                return Err(Error::OutOfMemory);
            }
        };
        decode::process(self, &msg);
        if self.pool.push_pending(&msg).is_err() {
            warn!("inbound queue full, frame seen by decoder only");
        }
        self.rx_signal.signal(());
        Ok(())
    }

    pub(crate) fn queue_work(&self, work: DriverWork) {
        if self.work.try_send(work).is_err() {
            error!("driver work queue full, dropping {:?}", work);
        }
    }

    /// Long-lived task running deferred driver work.
    pub async fn run_worker(&self) -> ! {
        loop {
            match self.work.receive().await {
                DriverWork::WakeHandshake => {
                    if let Err(e) = self.wake_handshake().await {
                        warn!("wake handshake failed: {}", e);
                    }
                }
                DriverWork::BootInit => {
                    if let Err(e) = boot::run(self).await {
                        error!("boot configuration failed: {}", e);
                    }
                }
                DriverWork::ApDisconnected => {
                    if let Err(e) = self.disable_profile_after_disconnect().await {
                        debug!("profile disable after disconnect: {}", e);
                    }
                }
                DriverWork::QueryTime => {
                    let _ = self.send_ok_err("AT+TIME=?", Duration::from_millis(1_000)).await;
                }
            }
        }
    }

    /// Assert or drop the modem power rails, keeping the shadow honest.
    ///
    /// Powering down resets every dependent shadow field and re-arms the
    /// one-time boot configuration.
    pub async fn set_power(&self, on: bool) {
        if Tri::from(on) == self.shadow.read(|s| s.powered_on) {
            return;
        }
        self.ctrl.lock().await.set_power(on);
        self.shadow.set_powered(on);
        self.flags.lock(|f| {
            let mut f = f.borrow_mut();
            if on {
                // The upcoming INIT:DONE is a real power-on boot.
                f.rebooting = true;
            } else {
                f.needs_one_time_config = true;
            }
        });
    }

    /// Power-cycle the modem.
    pub async fn reset(&self) {
        warn!("power-cycling wifi modem");
        {
            let mut ctrl = self.ctrl.lock().await;
            ctrl.set_power(false);
            self.shadow.set_powered(false);
            self.flags.lock(|f| {
                let mut f = f.borrow_mut();
                f.needs_one_time_config = true;
                f.rebooting = true;
            });
            Timer::after_millis(2).await;
            ctrl.set_power(true);
        }
        self.shadow.set_powered(true);
    }

    /// Make sure the modem is powered and has reported its bootstrap.
    pub async fn ensure_powered(&self, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        if !self.shadow.read(|s| s.powered_on.is_true()) {
            self.set_power(true).await;
        }
        while !self.shadow.read(|s| s.initialized.is_true()) {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            Timer::after_millis(50).await;
        }
        Ok(())
    }

    /// Pulse the wake line, recording the time for the inter-wake guard.
    pub(crate) async fn pulse_wake(&self) {
        self.flags.lock(|f| f.borrow_mut().last_wake = Some(Instant::now()));
        let mut ctrl = self.ctrl.lock().await;
        ctrl.wake_pulse().await;
        Timer::after_millis(5).await;
        ctrl.wake_pulse().await;
    }

    /// Milliseconds until the modem will accept another wake pulse.
    pub fn time_to_next_wake(&self) -> Duration {
        let last = self.flags.lock(|f| f.borrow().last_sleep);
        match last {
            None => Duration::from_ticks(0),
            Some(t) => {
                let now = Instant::now();
                let since = if now < t { Duration::from_ticks(0) } else { now - t };
                if since >= self.config.after_sleep_wait {
                    Duration::from_ticks(0)
                } else {
                    self.config.after_sleep_wait - since
                }
            }
        }
    }

    /// Live pool references, for diagnostics.
    pub fn pool_refs(&self) -> i32 {
        self.pool.live_refs()
    }

    pub(crate) fn pool(&self) -> &'p MsgPool {
        self.pool
    }
}

/// An open, serialized exchange with the modem.
///
/// Holds the modem mutex for its lifetime. Inner helpers take
/// `&mut Transaction` rather than re-locking, which is how same-owner
/// re-entry is expressed.
pub struct Transaction<'t, 'p, L: WifiLink, C: WifiCtrl> {
    drv: &'t WifiAt<'p, L, C>,
    link: MutexGuard<'t, CriticalSectionRawMutex, L>,
}

impl<'t, 'p, L: WifiLink, C: WifiCtrl> Drop for Transaction<'t, 'p, L, C> {
    fn drop(&mut self) {
        self.drv.owner.lock(|o| o.borrow_mut().label = "");
    }
}

impl<'t, 'p, L: WifiLink, C: WifiCtrl> Transaction<'t, 'p, L, C> {
    pub(crate) fn drv(&self) -> &'t WifiAt<'p, L, C> {
        self.drv
    }

    /// Drop all frames queued for `wait_for` consumers.
    pub fn flush(&mut self) {
        self.drv.pool.flush_pending();
    }

    /// Serialize one command to the modem.
    pub async fn send(&mut self, cmd: &str) -> Result<(), Error> {
        self.drv.shadow.set_last_cmd(cmd);
        // Outbound exchanges are recorded in the pool as well; shortage is
        // tolerable here, the send itself must not fail on it.
        drop(self.drv.pool.alloc(cmd.as_bytes(), false, Instant::now()));
        self.link.write_frame(cmd.as_bytes()).await
    }

    /// Send `cmd`, then wait for `OK` or `ERROR:<code>`.
    ///
    /// A numeric `ERROR:-N` maps to [`Error::ModemError`]; any other error
    /// payload maps to [`Error::BadResponse`].
    pub async fn send_ok_err(&mut self, cmd: &str, timeout: Duration) -> Result<(), Error> {
        self.drv.shadow.guard_powered_awake()?;
        let deadline = Instant::now() + timeout;
        self.flush();
        self.send(cmd).await?;

        let mut err = CapBuf::<19>::new();
        let mut wait = WaitSet::new();
        wait.push(Pattern::new("\r\nOK\r\n").stop());
        wait.push(Pattern::new("\r\nERROR:%19s\r\n").stop().capture(&mut err));
        let idx = self.wait_until(&mut wait, deadline).await?;
        drop(wait);
        match idx {
            0 => Ok(()),
            _ => Err(parse_modem_error(err.as_str())),
        }
    }

    /// Send `cmd` and watch inbound frames for the given patterns.
    pub async fn send_and_wait(
        &mut self,
        cmd: &str,
        wait: &mut WaitSet<'_>,
        timeout: Duration,
    ) -> Result<usize, Error> {
        let deadline = Instant::now() + timeout;
        self.send(cmd).await?;
        self.wait_until(wait, deadline).await
    }

    /// Watch inbound frames for the given patterns.
    pub async fn wait_for(&mut self, wait: &mut WaitSet<'_>, timeout: Duration) -> Result<usize, Error> {
        self.wait_until(wait, Instant::now() + timeout).await
    }

    pub(crate) async fn wait_until(
        &mut self,
        wait: &mut WaitSet<'_>,
        deadline: Instant,
    ) -> Result<usize, Error> {
        Ok(self.wait_inner(wait, deadline).await?.0)
    }

    /// Like [`Self::wait_for`] but also hands back the matched frame, for
    /// responses whose payload is not capturable by pattern (binary chunks).
    pub(crate) async fn wait_msg(
        &mut self,
        wait: &mut WaitSet<'_>,
        timeout: Duration,
    ) -> Result<(usize, MsgRef<'p>), Error> {
        self.wait_inner(wait, Instant::now() + timeout).await
    }

    async fn wait_inner(
        &mut self,
        wait: &mut WaitSet<'_>,
        deadline: Instant,
    ) -> Result<(usize, MsgRef<'p>), Error> {
        loop {
            while let Some(msg) = self.drv.pool.pop_pending() {
                let matched = msg.with_bytes(|bytes| wait.match_msg(bytes));
                if let Some(idx) = matched {
                    if wait.stop_on(idx) {
                        return Ok((idx, msg));
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            if with_timeout(deadline - now, self.drv.rx_signal.wait()).await.is_err() {
                return Err(Error::Timeout);
            }
        }
    }
}

pub(crate) fn parse_modem_error(text: &str) -> Error {
    if let Some(num) = text.strip_prefix('-') {
        if let Ok(code) = num.trim().parse::<i16>() {
            return Error::ModemError(code);
        }
    }
    Error::BadResponse
}

#[cfg(test)]
pub(crate) mod testutil {
    use core::cell::RefCell;

    use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use heapless::{String, Vec};

    use crate::error::Error;
    use crate::port::{Uicr, UicrCompare, WifiCtrl, WifiLink, UICR_BACKUP_LEN};

    /// Records sent frames; responses are injected via `WifiAt::ingest`.
    pub struct FakeLink {
        pub sent: BlockingMutex<CriticalSectionRawMutex, RefCell<Vec<String<128>, 32>>>,
    }

    impl FakeLink {
        pub fn new() -> Self {
            Self {
                sent: BlockingMutex::new(RefCell::new(Vec::new())),
            }
        }
    }

    impl WifiLink for &FakeLink {
        async fn write_frame(&mut self, bytes: &[u8]) -> Result<(), Error> {
            let text = core::str::from_utf8(bytes).unwrap_or("<bin>");
            self.sent.lock(|s| {
                let mut s = s.borrow_mut();
                let mut owned = String::new();
                let _ = owned.push_str(&text[..text.len().min(128)]);
                let _ = s.push(owned);
            });
            Ok(())
        }
    }

    impl FakeLink {
        pub fn sent_at(&self, idx: usize) -> std::string::String {
            self.sent
                .lock(|s| s.borrow().get(idx).map(|c| std::string::String::from(c.as_str())))
                .unwrap_or_default()
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock(|s| s.borrow().len())
        }

        pub fn all_sent(&self) -> std::vec::Vec<std::string::String> {
            self.sent.lock(|s| {
                s.borrow()
                    .iter()
                    .map(|c| std::string::String::from(c.as_str()))
                    .collect()
            })
        }
    }

    /// Inline ctrl fake for tests that don't inspect it.
    #[derive(Default)]
    pub struct FakeCtrl {
        pub power_on: bool,
        pub wake_pulses: u32,
    }

    impl WifiCtrl for FakeCtrl {
        fn set_power(&mut self, on: bool) {
            self.power_on = on;
        }

        async fn wake_pulse(&mut self) {
            self.wake_pulses += 1;
        }
    }

    pub struct FakeUicr {
        pub serial: &'static str,
        pub mac: &'static str,
        pub xtal: i32,
        pub shipped: bool,
    }

    impl Default for FakeUicr {
        fn default() -> Self {
            Self {
                serial: "DT0123456789AB",
                mac: "AABBCCDDEEFF",
                xtal: 0x25,
                shipped: true,
            }
        }
    }

    impl Uicr for FakeUicr {
        fn serial_number(&self) -> &str {
            self.serial
        }

        fn wifi_mac(&self) -> &str {
            self.mac
        }

        fn xtal_trim(&self) -> i32 {
            self.xtal
        }

        fn version_word(&self) -> u32 {
            0xBEEF_0004
        }

        fn verify(&self) -> bool {
            true
        }

        fn export(&self, out: &mut [u8; UICR_BACKUP_LEN]) {
            out.fill(0xA5);
            out[..4].copy_from_slice(&0xBEEF_0004u32.to_le_bytes());
        }

        fn compare_restore(&self, backup: &[u8; UICR_BACKUP_LEN]) -> UicrCompare {
            let mut expected = [0u8; UICR_BACKUP_LEN];
            self.export(&mut expected);
            if *backup == expected {
                UicrCompare::Match
            } else {
                UicrCompare::Mismatch
            }
        }

        fn shipping_flag(&self) -> bool {
            self.shipped
        }

        fn in_factory(&self) -> bool {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use embassy_futures::block_on;
    use embassy_futures::join::join;

    fn fixtures() -> (&'static MsgPool, &'static Fabric<'static>, &'static FakeLink, &'static FakeUicr) {
        let pool = Box::leak(Box::new(MsgPool::new(Duration::from_secs(2))));
        let fabric = Box::leak(Box::new(Fabric::new()));
        let link: &'static FakeLink = Box::leak(Box::new(FakeLink::new()));
        let uicr = Box::leak(Box::new(FakeUicr::default()));
        (pool, fabric, link, uicr)
    }

    fn driver(
        pool: &'static MsgPool,
        fabric: &'static Fabric<'static>,
        link: &'static FakeLink,
        uicr: &'static FakeUicr,
    ) -> WifiAt<'static, &'static FakeLink, FakeCtrl> {
        let drv = WifiAt::new(link, FakeCtrl::default(), pool, fabric, uicr, Config::default());
        drv.shadow().set_powered(true);
        drv
    }

    #[test]
    fn send_records_last_cmd() {
        let (pool, fabric, link, uicr) = fixtures();
        let drv = driver(pool, fabric, link, uicr);
        block_on(drv.send("AT+VER", Duration::from_millis(100))).unwrap();
        assert_eq!(link.sent_at(0), "AT+VER");
        assert_eq!(drv.state().last_cmd.as_str(), "AT+VER");
        // The transient outbound record was released.
        assert_eq!(pool.live_refs(), 0);
    }

    #[test]
    fn send_ok_err_maps_numeric_error() {
        let (pool, fabric, link, uicr) = fixtures();
        let drv = driver(pool, fabric, link, uicr);
        let result = block_on(join(
            drv.send_ok_err("AT+WFJAPA=x,y", Duration::from_millis(200)),
            async {
                // Let the send happen first, then answer.
                embassy_futures::yield_now().await;
                drv.ingest(b"\r\nERROR:-102\r\n").unwrap();
            },
        ))
        .0;
        assert_eq!(result, Err(Error::ModemError(102)));
    }

    #[test]
    fn send_ok_err_accepts_ok() {
        let (pool, fabric, link, uicr) = fixtures();
        let drv = driver(pool, fabric, link, uicr);
        let result = block_on(join(
            drv.send_ok_err("AT", Duration::from_millis(200)),
            async {
                embassy_futures::yield_now().await;
                drv.ingest(b"\r\nOK\r\n").unwrap();
            },
        ))
        .0;
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn send_rejected_while_asleep() {
        let (pool, fabric, link, uicr) = fixtures();
        let drv = driver(pool, fabric, link, uicr);
        drv.shadow()
            .set_tri(crate::fabric::DaBits::IS_SLEEPING, |s| &mut s.is_sleeping, Tri::KnownTrue);
        let result = block_on(drv.send_ok_err("AT", Duration::from_millis(50)));
        assert_eq!(result, Err(Error::Asleep));
        assert_eq!(link.sent_count(), 0);
    }

    #[test]
    fn wait_for_skips_unrelated_frames() {
        let (pool, fabric, link, uicr) = fixtures();
        let drv = driver(pool, fabric, link, uicr);
        drv.ingest(b"\r\n+RSSI:-44\r\n").unwrap();
        drv.ingest(b"\r\n+NWMQCL:1\r\n").unwrap();
        let mut wait = WaitSet::new();
        wait.push(Pattern::new("+NWMQCL:1").stop());
        let idx = block_on(drv.wait_for(&mut wait, Duration::from_millis(100))).unwrap();
        assert_eq!(idx, 0);
    }

    #[test]
    fn bad_error_payload_is_bad_response() {
        assert_eq!(parse_modem_error("WEIRD"), Error::BadResponse);
        assert_eq!(parse_modem_error("-102"), Error::ModemError(102));
        assert_eq!(parse_modem_error("-x"), Error::BadResponse);
    }

    #[test]
    fn ingest_pool_exhaustion_requests_reboot() {
        let (pool, fabric, link, uicr) = fixtures();
        let drv = driver(pool, fabric, link, uicr);
        let mut sub = fabric.power_events();
        // Fill the pool with young held messages, then fail six allocations.
        let held: std::vec::Vec<_> = (0..crate::fabric::POOL_SLOTS)
            .map(|_| pool.alloc(b"x", true, Instant::now()).unwrap())
            .collect();
        for _ in 0..5 {
            assert_eq!(drv.ingest(b"\r\n+RSSI:-40\r\n"), Err(Error::OutOfMemory));
        }
        assert!(sub.try_next_message_pure().is_none());
        assert_eq!(drv.ingest(b"\r\n+RSSI:-40\r\n"), Err(Error::OutOfMemory));
        assert_eq!(sub.try_next_message_pure(), Some(PowerCommand::Reboot));
        drop(held);
    }

    #[test]
    fn mutex_owner_label_tracks_transactions() {
        let (pool, fabric, link, uicr) = fixtures();
        let drv = driver(pool, fabric, link, uicr);
        assert_eq!(drv.mutex_owner(), "");
        block_on(async {
            let tx = drv.begin("diagnostic", Duration::from_millis(10)).await.unwrap();
            assert_eq!(drv.mutex_owner(), "diagnostic");
            drop(tx);
        });
        assert_eq!(drv.mutex_owner(), "");
    }

    #[test]
    fn second_transaction_times_out_with_busy() {
        let (pool, fabric, link, uicr) = fixtures();
        let drv = driver(pool, fabric, link, uicr);
        block_on(async {
            let _tx = drv.begin("holder", Duration::from_millis(10)).await.unwrap();
            let second = drv.begin("contender", Duration::from_millis(10)).await;
            assert!(matches!(second, Err(Error::MutexBusy)));
        });
    }
}

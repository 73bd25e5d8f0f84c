//! Multi-pattern matching of inbound modem frames.
//!
//! A [`WaitSet`] holds up to eight patterns. Each pattern is a scanf-style
//! format containing zero or more `%s` / `%Ns` capture slots, a stop-on-match
//! flag and a hit counter. Matching anchors on the literal prefix of the
//! format (up to the first `%`, at most nine bytes) found anywhere in the
//! frame, then fills captures in order. A format that *begins* with `%Ns`
//! grabs the whole frame, line feeds included, truncated to the width.

use heapless::Vec;

/// Max patterns one wait can watch for.
pub const MAX_WAIT_PATTERNS: usize = 8;
/// Max capture slots per pattern.
pub const MAX_CAPTURES: usize = 5;

/// Writable, bounded capture destination.
///
/// Destinations are borrowed for the duration of the wait; a pattern that
/// never matches leaves its destinations untouched.
pub trait CapDst {
    fn capacity(&self) -> usize;
    fn put(&mut self, bytes: &[u8]);
}

/// Fixed-capacity capture buffer.
pub struct CapBuf<const N: usize> {
    len: usize,
    buf: [u8; N],
}

impl<const N: usize> CapBuf<N> {
    pub const fn new() -> Self {
        Self { len: 0, buf: [0; N] }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(self.as_bytes()).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl<const N: usize> Default for CapBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> CapDst for CapBuf<N> {
    fn capacity(&self) -> usize {
        N
    }

    fn put(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(N);
        self.buf[..n].copy_from_slice(&bytes[..n]);
        self.len = n;
    }
}

/// One format to watch for.
pub struct Pattern<'a> {
    fmt: &'a str,
    stop_on_match: bool,
    hits: u8,
    caps: Vec<&'a mut dyn CapDst, MAX_CAPTURES>,
}

impl<'a> Pattern<'a> {
    pub fn new(fmt: &'a str) -> Self {
        Self {
            fmt,
            stop_on_match: false,
            hits: 0,
            caps: Vec::new(),
        }
    }

    /// End the wait when this pattern matches.
    pub fn stop(mut self) -> Self {
        self.stop_on_match = true;
        self
    }

    /// Attach the next capture destination, in `%s` order.
    pub fn capture(mut self, dst: &'a mut dyn CapDst) -> Self {
        if self.caps.push(dst).is_err() {
            error!("pattern has too many captures");
        }
        self
    }

    pub fn hits(&self) -> u8 {
        self.hits
    }
}

/// The set of patterns one wait watches for.
pub struct WaitSet<'a> {
    pats: Vec<Pattern<'a>, MAX_WAIT_PATTERNS>,
}

impl<'a> WaitSet<'a> {
    pub fn new() -> Self {
        Self { pats: Vec::new() }
    }

    pub fn push(&mut self, pat: Pattern<'a>) {
        if self.pats.push(pat).is_err() {
            error!("exceeded max patterns that can be waited for");
        }
    }

    pub fn len(&self) -> usize {
        self.pats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pats.is_empty()
    }

    pub fn stop_on(&self, idx: usize) -> bool {
        self.pats.get(idx).map(|p| p.stop_on_match).unwrap_or(true)
    }

    pub fn hits(&self, idx: usize) -> u8 {
        self.pats.get(idx).map(|p| p.hits).unwrap_or(0)
    }

    /// Match one inbound frame against the set, filling captures of the
    /// first matching pattern. Returns its index.
    pub fn match_msg(&mut self, data: &[u8]) -> Option<usize> {
        for i in 0..self.pats.len() {
            if self.match_one(i, data) {
                self.pats[i].hits = self.pats[i].hits.saturating_add(1);
                return Some(i);
            }
        }
        None
    }

    fn match_one(&mut self, i: usize, data: &[u8]) -> bool {
        let fmt = self.pats[i].fmt.as_bytes();

        // A leading `%Ns` grabs the whole frame, truncated to the width.
        if let Some(width) = leading_whole_capture(fmt) {
            let pat = &mut self.pats[i];
            let Some(dst) = pat.caps.first_mut() else {
                return false;
            };
            let n = data.len().min(width.unwrap_or(usize::MAX));
            dst.put(&data[..n]);
            return true;
        }

        match fmt.iter().position(|&b| b == b'%') {
            None => {
                // Pure literal: substring search.
                find(data, fmt).is_some()
            }
            Some(pct) => {
                let prefix = &fmt[..pct.min(9)];
                let Some(start) = find(data, prefix) else {
                    return false;
                };
                scanf(&data[start..], self.pats[i].fmt, &mut self.pats[i].caps);
                true
            }
        }
    }
}

impl<'a> Default for WaitSet<'a> {
    fn default() -> Self {
        Self::new()
    }
}

/// `Some(width)` when the format begins with `%Ns` / `%s`.
fn leading_whole_capture(fmt: &[u8]) -> Option<Option<usize>> {
    if fmt.first() != Some(&b'%') {
        return None;
    }
    let digits = fmt[1..].iter().take_while(|b| b.is_ascii_digit()).count();
    if fmt.get(1 + digits) != Some(&b's') {
        return None;
    }
    if digits == 0 {
        return Some(None);
    }
    let width = core::str::from_utf8(&fmt[1..1 + digits])
        .ok()
        .and_then(|s| s.parse::<usize>().ok());
    Some(width)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Minimal sscanf: literal bytes must match (format whitespace matches any
/// run of input whitespace), `%s` / `%Ns` captures a non-whitespace run.
/// Conversion stops at the first mismatch; earlier captures stay filled.
fn scanf(data: &[u8], fmt: &str, caps: &mut Vec<&mut dyn CapDst, MAX_CAPTURES>) -> usize {
    let fmt = fmt.as_bytes();
    let mut fi = 0;
    let mut di = 0;
    let mut converted = 0;
    let mut cap_idx = 0;

    while fi < fmt.len() {
        match fmt[fi] {
            b'%' => {
                let digits = fmt[fi + 1..].iter().take_while(|b| b.is_ascii_digit()).count();
                if fmt.get(fi + 1 + digits) != Some(&b's') {
                    // Only %s conversions are supported.
                    return converted;
                }
                let width = if digits == 0 {
                    usize::MAX
                } else {
                    core::str::from_utf8(&fmt[fi + 1..fi + 1 + digits])
                        .ok()
                        .and_then(|s| s.parse::<usize>().ok())
                        .unwrap_or(usize::MAX)
                };
                while di < data.len() && data[di].is_ascii_whitespace() {
                    di += 1;
                }
                let start = di;
                while di < data.len() && !data[di].is_ascii_whitespace() && di - start < width {
                    di += 1;
                }
                if di == start {
                    return converted;
                }
                if let Some(dst) = caps.get_mut(cap_idx) {
                    dst.put(&data[start..di]);
                }
                cap_idx += 1;
                converted += 1;
                fi += 2 + digits;
            }
            c if c.is_ascii_whitespace() => {
                while di < data.len() && data[di].is_ascii_whitespace() {
                    di += 1;
                }
                fi += 1;
            }
            c => {
                if data.get(di) != Some(&c) {
                    return converted;
                }
                di += 1;
                fi += 1;
            }
        }
    }
    converted
}

//! HTTP(S) fetches through the modem's client.
//!
//! The modem streams the body as `+NWHTCDATA:<len>,<bytes>` frames and
//! finishes with `+NWHTCSTATUS:<code>`. Chunks are handed to a caller sink;
//! where the bytes go (a file system, a flash partition) is not this
//! crate's concern.

use core::fmt::Write as _;

use embassy_time::{Duration, Instant};
use heapless::String;

use crate::error::Error;
use crate::fabric::MSG_CAP;
use crate::port::{WifiCtrl, WifiLink};

use super::pattern::{CapBuf, Pattern, WaitSet};
use super::{WifiAt, parse_modem_error};

/// Longest accepted fetch URL.
pub const MAX_HTTP_URL_LEN: usize = 1900;

/// Receives body bytes of an HTTP fetch in arrival order.
pub trait HttpSink {
    fn data(&mut self, chunk: &[u8]);
}

impl<F: FnMut(&[u8])> HttpSink for F {
    fn data(&mut self, chunk: &[u8]) {
        self(chunk)
    }
}

impl<'p, L: WifiLink, C: WifiCtrl> WifiAt<'p, L, C> {
    /// Fetch `url` through the modem, streaming the body into `sink`.
    /// Returns the terminal status code the modem reported.
    pub async fn http_get(
        &self,
        url: &str,
        skip_headers: bool,
        sink: &mut dyn HttpSink,
        timeout: Duration,
    ) -> Result<i32, Error> {
        if url.is_empty() || url.len() > MAX_HTTP_URL_LEN {
            return Err(Error::Invalid);
        }
        self.shadow().guard_powered_awake()?;
        let deadline = Instant::now() + timeout;
        let mut tx = self.begin("http_get", timeout).await?;
        self.flags.lock(|f| {
            let mut f = f.borrow_mut();
            f.http_result = None;
            f.http_bytes = 0;
        });
        tx.flush();

        let mut cmd: String<{ MAX_HTTP_URL_LEN + 16 }> = String::new();
        let _ = write!(cmd, "AT+NWHTCH={},get", url);
        tx.send(&cmd).await?;

        let mut in_headers = skip_headers;
        loop {
            let mut status = CapBuf::<8>::new();
            let mut err = CapBuf::<19>::new();
            let mut wait = WaitSet::new();
            wait.push(Pattern::new("\r\nERROR:%19s\r\n").stop().capture(&mut err));
            wait.push(Pattern::new("+NWHTCSTATUS:%8s").stop().capture(&mut status));
            wait.push(Pattern::new("+NWHTCDATA:").stop());
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let (idx, msg) = tx.wait_msg(&mut wait, deadline - now).await?;
            drop(wait);
            match idx {
                0 => return Err(parse_modem_error(err.as_str())),
                1 => {
                    let code = super::decode::parse_int(status.as_str()).unwrap_or(-1);
                    debug!("http fetch finished with status {}", code);
                    return Ok(code);
                }
                _ => {
                    let mut buf = [0u8; MSG_CAP];
                    let len = msg.copy_to(&mut buf);
                    if let Some(body) = chunk_payload(&buf[..len]) {
                        let fed = if in_headers {
                            match split_headers(body) {
                                Some(rest) => {
                                    in_headers = false;
                                    rest
                                }
                                None => &[],
                            }
                        } else {
                            body
                        };
                        if !fed.is_empty() {
                            sink.data(fed);
                        }
                    }
                }
            }
        }
    }

    /// Bytes of body seen in the current/last fetch, for diagnostics.
    pub fn http_bytes_received(&self) -> u64 {
        self.flags.lock(|f| f.borrow().http_bytes)
    }
}

/// Extract the payload of a `+NWHTCDATA:<len>,<bytes>` frame.
fn chunk_payload(frame: &[u8]) -> Option<&[u8]> {
    const TAG: &[u8] = b"+NWHTCDATA:";
    let start = frame.windows(TAG.len()).position(|w| w == TAG)? + TAG.len();
    let rest = &frame[start..];
    let comma = rest.iter().position(|&b| b == b',')?;
    let declared: usize = core::str::from_utf8(&rest[..comma]).ok()?.trim().parse().ok()?;
    let body = &rest[comma + 1..];
    if declared > body.len() {
        warn!("http chunk shorter than declared length");
        return Some(body);
    }
    Some(&body[..declared])
}

/// Body text after the `\r\n\r\n` header terminator, if present.
fn split_headers(chunk: &[u8]) -> Option<&[u8]> {
    chunk
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| &chunk[pos + 4..])
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::super::WifiAt;
    use super::*;
    use crate::config::Config;
    use crate::fabric::{Fabric, MsgPool};
    use embassy_futures::block_on;
    use embassy_futures::join::join;

    #[test]
    fn chunk_payload_respects_declared_length() {
        assert_eq!(chunk_payload(b"\r\n+NWHTCDATA:5,hello world"), Some(&b"hello"[..]));
        assert_eq!(chunk_payload(b"\r\n+NWHTCDATA:bogus"), None);
    }

    #[test]
    fn header_splitting() {
        assert_eq!(
            split_headers(b"HTTP/1.1 200 OK\r\nX: y\r\n\r\nbody"),
            Some(&b"body"[..])
        );
        assert_eq!(split_headers(b"HTTP/1.1 200 OK\r\n"), None);
    }

    #[test]
    fn fetch_streams_chunks_until_status() {
        let pool = Box::leak(Box::new(MsgPool::new(Duration::from_secs(2))));
        let fabric = Box::leak(Box::new(Fabric::new()));
        let link: &'static FakeLink = Box::leak(Box::new(FakeLink::new()));
        let uicr = Box::leak(Box::new(FakeUicr::default()));
        let drv: WifiAt<'static, &'static FakeLink, FakeCtrl> =
            WifiAt::new(link, FakeCtrl::default(), pool, fabric, uicr, Config::default());
        drv.shadow().set_powered(true);

        let mut collected = Vec::new();
        let mut sink = |chunk: &[u8]| collected.extend_from_slice(chunk);
        let result = block_on(join(
            drv.http_get("https://example/fw.bin", false, &mut sink, Duration::from_secs(1)),
            async {
                embassy_futures::yield_now().await;
                drv.ingest(b"\r\n+NWHTCDATA:5,abcde").unwrap();
                drv.ingest(b"\r\n+NWHTCDATA:3,fgh").unwrap();
                drv.ingest(b"\r\n+NWHTCSTATUS:200\r\n").unwrap();
            },
        ))
        .0;
        assert_eq!(result, Ok(200));
        assert_eq!(collected, b"abcdefgh");
        assert_eq!(link.sent_at(0), "AT+NWHTCH=https://example/fw.bin,get");
        assert_eq!(drv.http_bytes_received() > 0, true);
    }
}

//! Device-level operations: identity, radio calibration, NVRAM and restart.
//!
//! Cores live on [`Transaction`] so multi-step flows (boot configuration in
//! particular) can run them under one modem transaction; the `WifiAt`
//! methods are the public single-shot forms.

use core::fmt::Write as _;

use embassy_time::{Duration, Instant, Timer};
use heapless::String;

use crate::error::Error;
use crate::port::{WifiCtrl, WifiLink};

use super::pattern::{CapBuf, Pattern, WaitSet};
use super::{Transaction, WifiAt, parse_modem_error};

/// Which store the modem's MAC currently comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MacSource {
    User,
    Spoof,
    Otp,
}

impl<'p, L: WifiLink, C: WifiCtrl> WifiAt<'p, L, C> {
    /// Ask the modem for its firmware version. The decoded `+VER` reply
    /// updates the shadow and publishes `VersionChanged`.
    pub async fn query_version(&self, timeout: Duration) -> Result<(), Error> {
        self.send_ok_err("AT+VER", timeout).await
    }

    /// Current RSSI of the associated AP. Updated in the shadow by the
    /// decoded `+RSSI` reply.
    pub async fn query_rssi(&self, timeout: Duration) -> Result<i8, Error> {
        self.send_ok_err("AT+WFRSSI", timeout).await?;
        Ok(self.shadow().read(|s| s.rssi))
    }

    /// Read the modem's active MAC address and which store it came from.
    pub async fn get_mac(&self, timeout: Duration) -> Result<(String<20>, MacSource), Error> {
        self.shadow().guard_powered_awake()?;
        let mut tx = self.begin("get_mac", timeout).await?;
        tx.get_mac(timeout).await
    }

    /// Program a spoof MAC (`XX:XX:XX:XX:XX:XX`). Takes effect after a
    /// modem restart.
    pub async fn set_mac(&self, mac: &str, timeout: Duration) -> Result<(), Error> {
        self.shadow().guard_powered_awake()?;
        let mut tx = self.begin("set_mac", timeout).await?;
        tx.set_mac(mac, timeout).await
    }

    /// Read the XTAL tuning register.
    pub async fn get_xtal(&self, timeout: Duration) -> Result<i32, Error> {
        self.shadow().guard_powered_awake()?;
        let mut tx = self.begin("get_xtal", timeout).await?;
        tx.get_xtal(timeout).await
    }

    /// Set the XTAL tuning register (volatile).
    pub async fn set_xtal(&self, value: i32, timeout: Duration) -> Result<(), Error> {
        self.shadow().guard_powered_awake()?;
        let mut tx = self.begin("set_xtal", timeout).await?;
        tx.set_xtal(value, timeout).await
    }

    /// Read `out.len()` bytes of the modem's user NVRAM at `addr`.
    pub async fn get_nvram(&self, addr: u32, out: &mut [u8], timeout: Duration) -> Result<(), Error> {
        self.shadow().guard_powered_awake()?;
        let mut tx = self.begin("get_nvram", timeout).await?;
        tx.get_nvram(addr, out, timeout).await
    }

    /// Write bytes into the modem's user NVRAM at `addr`.
    pub async fn put_nvram(&self, addr: u32, data: &[u8], timeout: Duration) -> Result<(), Error> {
        self.shadow().guard_powered_awake()?;
        let mut tx = self.begin("put_nvram", timeout).await?;
        tx.put_nvram(addr, data, timeout).await
    }

    /// Read an OTP register.
    pub async fn get_otp(&self, reg: u32, size: u8, timeout: Duration) -> Result<i64, Error> {
        self.shadow().guard_powered_awake()?;
        let mut tx = self.begin("get_otp", timeout).await?;
        tx.get_otp(reg, size, timeout).await
    }

    /// Write an OTP register, but only when it still reads zero. OTP writes
    /// OR at the bit level, so a programmed value is never written over.
    pub async fn set_otp(&self, reg: u32, size: u8, value: i64, timeout: Duration) -> Result<i64, Error> {
        self.shadow().guard_powered_awake()?;
        let mut tx = self.begin("set_otp", timeout).await?;
        let current = tx.get_otp(reg, size, timeout).await?;
        if current != 0 {
            return Ok(current);
        }
        let mut cmd: String<48> = String::new();
        let _ = write!(cmd, "AT+UOTPWRASC=0x{:x},{},{:x}", reg, size, value);
        tx.send_ok_err(&cmd, timeout).await?;
        Ok(value)
    }

    /// Restart the modem. The reply may never come; a timeout is expected.
    pub async fn restart(&self, timeout: Duration) -> Result<(), Error> {
        let mut tx = self.begin("restart", timeout).await?;
        tx.restart_modem(timeout).await
    }

    /// Reboot the modem into RF test mode and start a CW carrier, for
    /// XTAL trimming on the factory line.
    pub async fn start_xtal_test(&self) -> Result<(), Error> {
        self.shadow().guard_powered_awake()?;
        let mut tx = self.begin("start_xtal_test", Duration::from_secs(1)).await?;
        tx.send_ok_err("AT+TMRFNOINIT=1", Duration::from_secs(1)).await?;
        tx.restart_modem(Duration::from_secs(1)).await?;
        // Give the modem time to come back up in test mode.
        Timer::after_millis(3_000).await;
        if let Err(e) = tx.send_ok_err("AT+RFTESTSTART", Duration::from_secs(1)).await {
            let _ = self.stop_xtal_test_in(&mut tx).await;
            return Err(e);
        }
        if let Err(e) = tx.send_ok_err("AT+RFCWTEST=2412,0,0", Duration::from_secs(1)).await {
            let _ = self.stop_xtal_test_in(&mut tx).await;
            return Err(e);
        }
        Ok(())
    }

    /// Reboot the modem out of RF test mode.
    pub async fn stop_xtal_test(&self) -> Result<(), Error> {
        let mut tx = self.begin("stop_xtal_test", Duration::from_secs(1)).await?;
        self.stop_xtal_test_in(&mut tx).await
    }

    async fn stop_xtal_test_in(&self, tx: &mut Transaction<'_, 'p, L, C>) -> Result<(), Error> {
        tx.send_ok_err("AT+TMRFNOINIT=0", Duration::from_millis(100)).await?;
        // The modem just boots; the reply is usually cut off.
        tx.restart_modem(Duration::from_millis(100)).await
    }
}

impl<'t, 'p, L: WifiLink, C: WifiCtrl> Transaction<'t, 'p, L, C> {
    pub(crate) async fn get_mac(&mut self, timeout: Duration) -> Result<(String<20>, MacSource), Error> {
        let deadline = Instant::now() + timeout;
        self.flush();
        self.send("AT+WFMAC=?").await?;

        let mut mac = String::new();
        let mut source = MacSource::User;
        let mut have_mac = false;
        loop {
            let mut cap_mac = CapBuf::<20>::new();
            let mut cap_spf = CapBuf::<20>::new();
            let mut cap_otp = CapBuf::<20>::new();
            let mut err = CapBuf::<19>::new();
            let mut wait = WaitSet::new();
            wait.push(Pattern::new("\r\nOK\r\n").stop());
            wait.push(Pattern::new("\r\nERROR:%19s\r\n").stop().capture(&mut err));
            wait.push(Pattern::new("+WFMAC:%20s").stop().capture(&mut cap_mac));
            wait.push(Pattern::new("+WFSPF:%20s").stop().capture(&mut cap_spf));
            wait.push(Pattern::new("+WFOTP:%20s").stop().capture(&mut cap_otp));
            let idx = self.wait_until(&mut wait, deadline).await?;
            drop(wait);
            match idx {
                0 => {
                    if have_mac {
                        return Ok((mac, source));
                    }
                }
                1 => return Err(parse_modem_error(err.as_str())),
                n => {
                    let cap = match n {
                        2 => &cap_mac,
                        3 => &cap_spf,
                        _ => &cap_otp,
                    };
                    if !cap.is_empty() {
                        mac = String::try_from(cap.as_str()).unwrap_or_default();
                        have_mac = true;
                        source = match n {
                            2 => MacSource::User,
                            3 => MacSource::Spoof,
                            _ => MacSource::Otp,
                        };
                    }
                }
            }
        }
    }

    pub(crate) async fn set_mac(&mut self, mac: &str, timeout: Duration) -> Result<(), Error> {
        if mac.len() != 17 {
            return Err(Error::Invalid);
        }
        let mut cmd: String<40> = String::new();
        let _ = write!(cmd, "AT+WFSPF={}", mac);
        self.send_ok_err(&cmd, timeout).await
    }

    pub(crate) async fn get_xtal(&mut self, timeout: Duration) -> Result<i32, Error> {
        let deadline = Instant::now() + timeout;
        self.flush();
        self.send("AT+XTALRD").await?;

        let mut value: Option<i32> = None;
        loop {
            let mut cap = CapBuf::<16>::new();
            let mut err = CapBuf::<19>::new();
            let mut wait = WaitSet::new();
            wait.push(Pattern::new("\r\nOK\r\n").stop());
            wait.push(Pattern::new("\r\nERROR:%19s\r\n").stop().capture(&mut err));
            wait.push(Pattern::new("0x%16s").stop().capture(&mut cap));
            let idx = self.wait_until(&mut wait, deadline).await?;
            drop(wait);
            match idx {
                0 => {
                    if let Some(v) = value {
                        return Ok(v);
                    }
                }
                1 => return Err(parse_modem_error(err.as_str())),
                _ => value = i32::from_str_radix(cap.as_str(), 16).ok(),
            }
        }
    }

    pub(crate) async fn set_xtal(&mut self, value: i32, timeout: Duration) -> Result<(), Error> {
        let mut cmd: String<24> = String::new();
        let _ = write!(cmd, "AT+XTALWR={:x}", value);
        self.send_ok_err(&cmd, timeout).await
    }

    pub(crate) async fn get_nvram(&mut self, addr: u32, out: &mut [u8], timeout: Duration) -> Result<(), Error> {
        if out.is_empty() || out.len() > 512 {
            return Err(Error::Invalid);
        }
        let deadline = Instant::now() + timeout;
        self.flush();
        let mut cmd: String<40> = String::new();
        let _ = write!(cmd, "AT+FLASHREAD=0x{:x},{}", addr, out.len());
        self.send(&cmd).await?;

        let mut filled = false;
        loop {
            let mut cap = CapBuf::<1024>::new();
            let mut err = CapBuf::<19>::new();
            let mut wait = WaitSet::new();
            wait.push(Pattern::new("\r\nOK\r\n").stop());
            wait.push(Pattern::new("\r\nERROR:%19s\r\n").stop().capture(&mut err));
            wait.push(Pattern::new("+FLASHREAD:%1024s").stop().capture(&mut cap));
            let idx = self.wait_until(&mut wait, deadline).await?;
            drop(wait);
            match idx {
                0 => {
                    if filled {
                        return Ok(());
                    }
                }
                1 => return Err(parse_modem_error(err.as_str())),
                _ => {
                    decode_hex(cap.as_str(), out)?;
                    filled = true;
                }
            }
        }
    }

    pub(crate) async fn put_nvram(&mut self, addr: u32, data: &[u8], timeout: Duration) -> Result<(), Error> {
        if data.is_empty() || data.len() > 512 {
            return Err(Error::Invalid);
        }
        let mut cmd: String<1088> = String::new();
        let _ = write!(cmd, "AT+FLASHWRITE=0x{:x},", addr);
        for b in data {
            let _ = write!(cmd, "{:02X}", b);
        }
        self.send_ok_err(&cmd, timeout).await
    }

    pub(crate) async fn get_otp(&mut self, reg: u32, size: u8, timeout: Duration) -> Result<i64, Error> {
        let deadline = Instant::now() + timeout;
        self.flush();
        let mut cmd: String<40> = String::new();
        let _ = write!(cmd, "AT+UOTPRDASC=0x{:x},{}", reg, size);
        self.send(&cmd).await?;

        let mut value: Option<i64> = None;
        loop {
            let mut cap = CapBuf::<20>::new();
            let mut err = CapBuf::<19>::new();
            let mut wait = WaitSet::new();
            wait.push(Pattern::new("\r\nOK\r\n").stop());
            wait.push(Pattern::new("\r\nERROR:%19s\r\n").stop().capture(&mut err));
            wait.push(Pattern::new("0x%20s").stop().capture(&mut cap));
            let idx = self.wait_until(&mut wait, deadline).await?;
            drop(wait);
            match idx {
                0 => {
                    if let Some(v) = value {
                        return Ok(v);
                    }
                }
                1 => return Err(parse_modem_error(err.as_str())),
                _ => value = i64::from_str_radix(cap.as_str(), 16).ok(),
            }
        }
    }

    /// Restart the modem, tolerating the reply being cut off by the reboot.
    pub(crate) async fn restart_modem(&mut self, timeout: Duration) -> Result<(), Error> {
        self.drv().flags.lock(|f| f.borrow_mut().rebooting = true);
        match self.send_ok_err("AT+RESTART", timeout).await {
            Ok(()) | Err(Error::Timeout) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn decode_hex(text: &str, out: &mut [u8]) -> Result<(), Error> {
    let hex = text.trim();
    if hex.len() < out.len() * 2 {
        return Err(Error::BadResponse);
    }
    for (i, slot) in out.iter_mut().enumerate() {
        let pair = &hex[i * 2..i * 2 + 2];
        *slot = u8::from_str_radix(pair, 16).map_err(|_| Error::BadResponse)?;
    }
    Ok(())
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

    fn setup() -> (
        &'static FakeLink,
        WifiAt<'static, &'static FakeLink, FakeCtrl>,
    ) {
        let pool = Box::leak(Box::new(MsgPool::new(Duration::from_secs(2))));
        let fabric = Box::leak(Box::new(Fabric::new()));
        let link: &'static FakeLink = Box::leak(Box::new(FakeLink::new()));
        let uicr = Box::leak(Box::new(FakeUicr::default()));
        let drv = WifiAt::new(link, FakeCtrl::default(), pool, fabric, uicr, Config::default());
        drv.shadow().set_powered(true);
        (link, drv)
    }

    #[test]
    fn hex_decode() {
        let mut out = [0u8; 3];
        decode_hex("EA01FF", &mut out).unwrap();
        assert_eq!(out, [0xEA, 0x01, 0xFF]);
        assert_eq!(decode_hex("EA", &mut out), Err(Error::BadResponse));
    }

    #[test]
    fn get_mac_classifies_source() {
        let (link, drv) = setup();
        let result = block_on(join(drv.get_mac(Duration::from_millis(300)), async {
            embassy_futures::yield_now().await;
            drv.ingest(b"\r\n+WFSPF:AA:BB:CC:DD:EE:FF\r\n").unwrap();
            drv.ingest(b"\r\nOK\r\n").unwrap();
        }))
        .0;
        let (mac, source) = result.unwrap();
        assert_eq!(mac.as_str(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(source, MacSource::Spoof);
        assert_eq!(link.sent_at(0), "AT+WFMAC=?");
    }

    #[test]
    fn get_xtal_parses_hex() {
        let (_link, drv) = setup();
        let result = block_on(join(drv.get_xtal(Duration::from_millis(300)), async {
            embassy_futures::yield_now().await;
            drv.ingest(b"\r\n0x25\r\n").unwrap();
            drv.ingest(b"\r\nOK\r\n").unwrap();
        }))
        .0;
        assert_eq!(result, Ok(0x25));
    }

    #[test]
    fn nvram_roundtrip_encoding() {
        let (link, drv) = setup();
        let result = block_on(join(
            drv.put_nvram(0x003a_d000, &[0xEA, 0x42], Duration::from_millis(300)),
            async {
                embassy_futures::yield_now().await;
                drv.ingest(b"\r\nOK\r\n").unwrap();
            },
        ))
        .0;
        assert_eq!(result, Ok(()));
        assert_eq!(link.sent_at(0), "AT+FLASHWRITE=0x3ad000,EA42");

        let mut out = [0u8; 2];
        let result = block_on(join(
            drv.get_nvram(0x003a_d000, &mut out, Duration::from_millis(300)),
            async {
                embassy_futures::yield_now().await;
                drv.ingest(b"\r\n+FLASHREAD:EA42\r\n").unwrap();
                drv.ingest(b"\r\nOK\r\n").unwrap();
            },
        ));
        assert_eq!(result.0, Ok(()));
        assert_eq!(out, [0xEA, 0x42]);
    }

    #[test]
    fn restart_tolerates_silence() {
        let (_link, drv) = setup();
        let result = block_on(drv.restart(Duration::from_millis(60)));
        assert_eq!(result, Ok(()));
        assert!(drv.flags.lock(|f| f.borrow().rebooting));
    }
}

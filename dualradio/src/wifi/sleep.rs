//! Sleep-mode coordination with the modem.
//!
//! The modem has two sleep families: DPM (deep power management, survives
//! across broker sessions) and RTC sleep (timed). Changing DPM reboots the
//! modem, and changing it while associated makes the modem error out, so
//! every transition disassociates first. A wake pulse issued too soon after
//! a sleep is silently dropped by the modem; such wakes are refused with
//! `TooSoon`.

use core::fmt::Write as _;

use embassy_time::{Duration, Instant, Timer};

use crate::error::Error;
use crate::fabric::DaBits;
use crate::port::{WifiCtrl, WifiLink};
use crate::types::{SleepMode, Tri};

use super::pattern::{CapBuf, Pattern, WaitSet};
use super::{Transaction, WifiAt, parse_modem_error};

/// Outcome of the destructive DPM probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SleepProbe {
    /// Not in DPM and awake.
    NotDpm,
    /// In DPM, was asleep (now briefly awake).
    DpmAsleep,
    /// In DPM and awake.
    DpmAwake,
    /// Was in RTC sleep; the probe woke it.
    RtcWoke,
}

impl<'p, L: WifiLink, C: WifiCtrl> WifiAt<'p, L, C> {
    /// Non-destructively check whether the modem is sleeping by pinging it.
    /// With `change_state` the shadow is updated to what was observed.
    pub async fn check_sleeping(&self, change_state: bool) -> Result<Tri, Error> {
        if self.shadow().read(|s| s.powered_on.is_false()) {
            return Err(Error::NotPowered);
        }
        let mut tx = self.begin("check_sleeping", Duration::from_millis(500)).await?;
        tx.ping_sleeping(change_state).await
    }

    /// Destructively probe the DPM mode with a wake pulse. See
    /// [`SleepProbe`] for what the response classifies.
    pub async fn check_sleep_mode(&self) -> Result<SleepProbe, Error> {
        if self.shadow().read(|s| s.powered_on.is_false()) {
            return Err(Error::NotPowered);
        }
        if self.time_to_next_wake() > Duration::from_ticks(0) {
            return Err(Error::TooSoon);
        }
        let mut tx = self.begin("check_sleep_mode", Duration::from_millis(400)).await?;
        tx.probe_sleep_mode().await
    }

    /// Wake the modem and keep it from going back to sleep.
    pub async fn wake_no_sleep(&self, timeout: Duration) -> Result<(), Error> {
        if self.shadow().read(|s| s.powered_on.is_false()) {
            return Err(Error::NotPowered);
        }
        if self.time_to_next_wake() > Duration::from_ticks(0) {
            return Err(Error::TooSoon);
        }
        let mut tx = self.begin("wake_no_sleep", timeout).await?;
        tx.wake_no_sleep().await
    }

    /// Let the modem go back to DPM sleep, entering DPM first if needed.
    pub async fn dpm_back_to_sleep(&self, timeout: Duration) -> Result<(), Error> {
        if self.shadow().read(|s| s.powered_on.is_false()) {
            return Err(Error::NotPowered);
        }
        let mut tx = self.begin("dpm_back_to_sleep", timeout).await?;
        tx.dpm_back_to_sleep(timeout).await
    }

    /// Query the modem's DPM mode.
    pub async fn dpm_state(&self, timeout: Duration) -> Result<bool, Error> {
        self.shadow().guard_powered_awake()?;
        let mut tx = self.begin("dpm_state", timeout).await?;
        tx.get_dpm_state(timeout).await
    }

    /// Set the modem's DPM mode. The modem reboots on this command.
    pub async fn set_dpm_state(&self, on: bool, awake_on_boot: bool, timeout: Duration) -> Result<(), Error> {
        self.shadow().guard_powered_awake()?;
        let mut tx = self.begin("set_dpm_state", timeout).await?;
        tx.set_dpm_state(on, awake_on_boot, timeout).await
    }

    /// Put the modem into RTC sleep for `duration`.
    pub async fn rtc_sleep(&self, duration: Duration) -> Result<(), Error> {
        if self.shadow().read(|s| s.powered_on.is_false()) {
            return Err(Error::NotPowered);
        }
        if duration.as_millis() > 2_097_151_000 {
            return Err(Error::Invalid);
        }
        let mut tx = self.begin("rtc_sleep", Duration::from_secs(1)).await?;
        if self.shadow().read(|s| s.is_sleeping.is_true()) {
            tx.wake_no_sleep().await?;
        }
        let mut cmd: heapless::String<40> = heapless::String::new();
        let _ = write!(cmd, "AT+SETSLEEP3EXT={}", duration.as_millis());
        tx.send_ok_err(&cmd, Duration::from_millis(100)).await?;
        let now = Instant::now();
        self.shadow()
            .set_tri(DaBits::IS_SLEEPING, |s| &mut s.is_sleeping, Tri::KnownTrue);
        self.shadow()
            .set_timestamp(DaBits::RTC_WAKE_TIME, |s| &mut s.rtc_wake_time, now + duration);
        self.flags.lock(|f| f.borrow_mut().last_sleep = Some(now));
        Ok(())
    }

    /// Drive the modem into the requested sleep state from whatever state
    /// the shadow last observed.
    pub async fn set_sleep_mode(&self, mode: SleepMode) -> Result<(), Error> {
        if self.shadow().read(|s| s.powered_on.is_false()) {
            return Err(Error::NotPowered);
        }
        let mut tx = self.begin("set_sleep_mode", Duration::from_secs(1)).await?;
        // Re-observe before deciding; the modem can sleep without telling us.
        let _ = tx.ping_sleeping(true).await;
        let (dpm, sleeping, ap) = self
            .shadow()
            .read(|s| (s.dpm_mode, s.is_sleeping, s.ap_connected));
        debug!(
            "set sleep mode {:?}, current dpm {:?} sleeping {:?}",
            mode, dpm, sleeping
        );

        match mode {
            SleepMode::None => {
                if dpm.is_false() && sleeping.is_false() {
                    return tx.verify_sleep_state(Tri::KnownFalse).await;
                }
                if sleeping.is_true() {
                    tx.wake_no_sleep().await?;
                }
                // The modem reboots on a DPM change even when already in the
                // requested mode, so ask first to avoid thrash.
                if tx.get_dpm_state(Duration::from_secs(1)).await? {
                    if ap.is_true() {
                        tx.disconnect_ap().await?;
                    }
                    tx.set_dpm_state(false, false, Duration::from_secs(1)).await?;
                    Timer::after_millis(1_500).await;
                }
                tx.verify_sleep_state(Tri::KnownFalse).await
            }

            SleepMode::DpmAsleep => {
                if dpm.is_true() && sleeping.is_true() {
                    return tx.verify_sleep_state(Tri::KnownTrue).await;
                }
                if dpm.is_true() {
                    tx.dpm_back_to_sleep(Duration::from_secs(4)).await?;
                } else {
                    if sleeping.is_true() {
                        tx.wake_no_sleep().await?;
                    }
                    if !tx.get_dpm_state(Duration::from_secs(1)).await? {
                        if ap.is_true() {
                            tx.disconnect_ap().await?;
                        }
                        tx.set_dpm_state(true, false, Duration::from_secs(1)).await?;
                        Timer::after_millis(1_500).await;
                    } else {
                        tx.dpm_back_to_sleep(Duration::from_millis(300)).await?;
                    }
                }
                tx.verify_sleep_state(Tri::KnownTrue).await?;
                self.flags.lock(|f| f.borrow_mut().last_sleep = Some(Instant::now()));
                Ok(())
            }

            SleepMode::DpmAwake => {
                if dpm.is_true() && sleeping.is_false() {
                    return tx.verify_sleep_state(Tri::KnownFalse).await;
                }
                if sleeping.is_true() {
                    tx.wake_no_sleep().await?;
                }
                if !tx.get_dpm_state(Duration::from_secs(1)).await? {
                    if ap.is_true() {
                        tx.disconnect_ap().await?;
                    }
                    tx.set_dpm_state(true, true, Duration::from_secs(1)).await?;
                    Timer::after_millis(1_000).await;
                }
                tx.verify_sleep_state(Tri::KnownFalse).await
            }

            SleepMode::RtcAsleep(duration) => {
                if dpm.is_false() && sleeping.is_true() {
                    // Already in a non-DPM sleep; nothing to change.
                    return Ok(());
                }
                if sleeping.is_true() {
                    tx.wake_no_sleep().await?;
                }
                if tx.get_dpm_state(Duration::from_secs(1)).await? {
                    if ap.is_true() {
                        tx.disconnect_ap().await?;
                    }
                    tx.set_dpm_state(false, false, Duration::from_secs(1)).await?;
                    Timer::after_millis(1_500).await;
                }
                let mut cmd: heapless::String<40> = heapless::String::new();
                let _ = write!(cmd, "AT+SETSLEEP3EXT={}", duration.as_millis());
                tx.send_ok_err(&cmd, Duration::from_millis(100)).await?;
                let now = Instant::now();
                self.shadow()
                    .set_tri(DaBits::IS_SLEEPING, |s| &mut s.is_sleeping, Tri::KnownTrue);
                self.shadow()
                    .set_timestamp(DaBits::RTC_WAKE_TIME, |s| &mut s.rtc_wake_time, now + duration);
                self.flags.lock(|f| f.borrow_mut().last_sleep = Some(now));
                Ok(())
            }
        }
    }

    /// Deferred acknowledgement of a DPM wake report: tell the modem we are
    /// up and hold it awake long enough to receive what woke it.
    pub(crate) async fn wake_handshake(&self) -> Result<(), Error> {
        let mut tx = self.begin("wake_handshake", Duration::from_secs(3)).await?;
        let old = self.shadow().override_sleeping(Tri::KnownFalse);
        if let Err(e) = tx.send_ok_err("AT+MCUWUDONE", Duration::from_millis(80)).await {
            error!("wake ack MCUWUDONE failed, packet may be lost: {}", e);
            self.shadow().override_sleeping(old);
            return Err(e);
        }
        if let Err(e) = tx.send_ok_err("AT+CLRDPMSLPEXT", Duration::from_millis(50)).await {
            error!("wake hold CLRDPMSLPEXT failed, packet may be lost: {}", e);
            self.shadow().override_sleeping(old);
            return Err(e);
        }
        self.shadow().override_sleeping(old);
        self.shadow()
            .set_tri(DaBits::IS_SLEEPING, |s| &mut s.is_sleeping, Tri::KnownFalse);
        drop(tx);
        // The radio manager holds the modem awake briefly so the downlink
        // that triggered the wake can arrive.
        self.shadow().pulse_wake_unicast();
        Ok(())
    }
}

impl<'t, 'p, L: WifiLink, C: WifiCtrl> Transaction<'t, 'p, L, C> {
    /// Ping the modem to observe whether it is asleep. A timeout means
    /// asleep, `OK` means awake, anything else leaves the state unknown.
    pub(crate) async fn ping_sleeping(&mut self, change_state: bool) -> Result<Tri, Error> {
        let drv = self.drv();
        let old = drv.shadow().override_sleeping(Tri::KnownFalse);
        let ret = self.send_ok_err("AT", Duration::from_millis(80)).await;
        drv.shadow().override_sleeping(old);
        match ret {
            Err(Error::Timeout) => {
                if change_state {
                    drv.shadow()
                        .set_tri(DaBits::IS_SLEEPING, |s| &mut s.is_sleeping, Tri::KnownTrue);
                }
                Ok(Tri::KnownTrue)
            }
            Ok(()) => {
                if change_state {
                    drv.shadow()
                        .set_tri(DaBits::IS_SLEEPING, |s| &mut s.is_sleeping, Tri::KnownFalse);
                }
                Ok(Tri::KnownFalse)
            }
            Err(e) => {
                warn!("'{}' received checking if modem is sleeping", e);
                if change_state {
                    drv.shadow()
                        .set_tri(DaBits::IS_SLEEPING, |s| &mut s.is_sleeping, Tri::Unknown);
                }
                Err(e)
            }
        }
    }

    /// Wake-pulse probe classifying the modem's sleep family.
    pub(crate) async fn probe_sleep_mode(&mut self) -> Result<SleepProbe, Error> {
        let drv = self.drv();
        let shadow = drv.shadow();
        let now = Instant::now();

        drv.pulse_wake().await;

        let mut wait = WaitSet::new();
        wait.push(Pattern::new("+INIT:WAKEUP").stop());
        wait.push(Pattern::new("+RUN:RTCWAKEUP").stop());
        wait.push(Pattern::new("+INIT:DONE,0,DPM=0").stop());
        wait.push(Pattern::new("+INIT:DONE,0,DPM=1").stop());
        wait.push(Pattern::new("+RUN:POR").stop());
        let idx = self.wait_for(&mut wait, Duration::from_millis(400)).await;

        let probe = match idx {
            // No response at all: not in DPM, not asleep.
            Err(Error::Timeout) => {
                shadow.set_tri(DaBits::DPM_MODE, |s| &mut s.dpm_mode, Tri::KnownFalse);
                shadow.set_tri(DaBits::IS_SLEEPING, |s| &mut s.is_sleeping, Tri::KnownFalse);
                SleepProbe::NotDpm
            }
            Err(e) => return Err(e),
            Ok(0) => {
                shadow.set_tri(DaBits::DPM_MODE, |s| &mut s.dpm_mode, Tri::KnownTrue);
                shadow.set_tri(DaBits::IS_SLEEPING, |s| &mut s.is_sleeping, Tri::KnownTrue);
                SleepProbe::DpmAsleep
            }
            Ok(2) => {
                shadow.set_tri(DaBits::DPM_MODE, |s| &mut s.dpm_mode, Tri::KnownFalse);
                shadow.set_tri(DaBits::IS_SLEEPING, |s| &mut s.is_sleeping, Tri::KnownFalse);
                shadow.set_timestamp(DaBits::RTC_WAKE_TIME, |s| &mut s.rtc_wake_time, now);
                SleepProbe::RtcWoke
            }
            Ok(_) => {
                shadow.set_tri(DaBits::DPM_MODE, |s| &mut s.dpm_mode, Tri::KnownTrue);
                shadow.set_tri(DaBits::IS_SLEEPING, |s| &mut s.is_sleeping, Tri::KnownFalse);
                SleepProbe::DpmAwake
            }
        };
        Ok(probe)
    }

    pub(crate) async fn wake_no_sleep(&mut self) -> Result<(), Error> {
        let drv = self.drv();
        self.flush();
        let state = self.probe_sleep_mode().await?;
        if matches!(state, SleepProbe::NotDpm | SleepProbe::RtcWoke) {
            debug!("modem is not in DPM and will stay awake");
            return Ok(());
        }

        // Awake may be temporary: hold it awake before DPM pulls it back.
        let old = drv.shadow().override_sleeping(Tri::KnownFalse);
        if let Err(e) = self.send_ok_err("AT+MCUWUDONE", Duration::from_millis(50)).await {
            error!("'{}' sending MCUWUDONE", e);
            drv.shadow().override_sleeping(old);
            drv.shadow()
                .set_tri(DaBits::IS_SLEEPING, |s| &mut s.is_sleeping, Tri::KnownTrue);
            return Err(e);
        }
        if let Err(e) = self.send_ok_err("AT+CLRDPMSLPEXT", Duration::from_millis(50)).await {
            error!("'{}' sending CLRDPMSLPEXT to keep modem awake", e);
            drv.shadow().override_sleeping(old);
            drv.shadow()
                .set_tri(DaBits::IS_SLEEPING, |s| &mut s.is_sleeping, Tri::KnownTrue);
            return Err(e);
        }
        drv.flags.lock(|f| f.borrow_mut().last_wake = Some(Instant::now()));
        drv.shadow().override_sleeping(old);
        drv.shadow()
            .set_tri(DaBits::IS_SLEEPING, |s| &mut s.is_sleeping, Tri::KnownFalse);
        debug!("modem is in DPM awake and will stay awake");
        Ok(())
    }

    pub(crate) async fn dpm_back_to_sleep(&mut self, timeout: Duration) -> Result<(), Error> {
        let drv = self.drv();
        if !drv.shadow().read(|s| s.dpm_mode.is_true()) {
            return self.set_dpm_state(true, false, timeout).await;
        }
        match self.send_ok_err("AT+SETDPMSLPEXT", timeout).await {
            // The modem often sleeps before acknowledging.
            Ok(()) | Err(Error::Timeout) => {
                drv.shadow()
                    .set_tri(DaBits::IS_SLEEPING, |s| &mut s.is_sleeping, Tri::KnownTrue);
                Ok(())
            }
            Err(e) => {
                error!("error allowing dpm sleep: {}", e);
                Err(e)
            }
        }
    }

    pub(crate) async fn get_dpm_state(&mut self, timeout: Duration) -> Result<bool, Error> {
        let deadline = Instant::now() + timeout;
        self.flush();
        self.send("AT+DPM=?").await?;
        let mut result: Option<bool> = None;
        loop {
            let mut state = CapBuf::<1>::new();
            let mut err = CapBuf::<19>::new();
            let mut wait = WaitSet::new();
            wait.push(Pattern::new("\r\nOK\r\n").stop());
            wait.push(Pattern::new("+DPM:%1s\r\n").stop().capture(&mut state));
            wait.push(Pattern::new("\r\nERROR:%19s\r\n").stop().capture(&mut err));
            let idx = self.wait_until(&mut wait, deadline).await?;
            drop(wait);
            match idx {
                0 => {
                    if let Some(r) = result {
                        return Ok(r);
                    }
                }
                1 => result = Some(state.as_str() == "1"),
                _ => return Err(parse_modem_error(err.as_str())),
            }
        }
    }

    pub(crate) async fn set_dpm_state(
        &mut self,
        on: bool,
        awake_on_boot: bool,
        timeout: Duration,
    ) -> Result<(), Error> {
        let drv = self.drv();
        let mut cmd: heapless::String<20> = heapless::String::new();
        let _ = write!(cmd, "AT+DPM={}", on as u8);
        self.send_ok_err(&cmd, timeout).await?;
        drv.flags.lock(|f| {
            let mut f = f.borrow_mut();
            f.awake_on_boot = on && awake_on_boot;
            f.last_dpm_change = Some(Instant::now());
        });
        // The modem reboots to apply the change; BootInit's fast path keys
        // off last_dpm_change.
        drv.flags.lock(|f| f.borrow_mut().rebooting = true);
        Ok(())
    }

    pub(crate) async fn disconnect_ap(&mut self) -> Result<(), Error> {
        self.send_ok_err("AT+WFQAP", Duration::from_secs(1)).await
    }

    /// Confirm the modem settles into the expected sleep observation.
    pub(crate) async fn verify_sleep_state(&mut self, expect: Tri) -> Result<(), Error> {
        for _ in 0..8 {
            match self.ping_sleeping(true).await {
                Ok(observed) if observed == expect => return Ok(()),
                Ok(_) => {}
                Err(_) => return Err(Error::Asleep),
            }
            Timer::after_millis(10).await;
        }
        error!("modem did not settle into expected sleep state");
        Err(Error::Asleep)
    }
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
    fn ping_awake_updates_shadow() {
        let (link, drv) = setup();
        let result = block_on(join(drv.check_sleeping(true), async {
            embassy_futures::yield_now().await;
            drv.ingest(b"\r\nOK\r\n").unwrap();
        }))
        .0;
        assert_eq!(result, Ok(Tri::KnownFalse));
        assert_eq!(link.sent_at(0), "AT");
        assert_eq!(drv.state().is_sleeping, Tri::KnownFalse);
    }

    #[test]
    fn ping_timeout_means_sleeping() {
        let (_link, drv) = setup();
        let result = block_on(drv.check_sleeping(true));
        assert_eq!(result, Ok(Tri::KnownTrue));
        assert_eq!(drv.state().is_sleeping, Tri::KnownTrue);
    }

    #[test]
    fn wake_refused_inside_guard_window() {
        let (_link, drv) = setup();
        drv.flags.lock(|f| f.borrow_mut().last_sleep = Some(Instant::now()));
        let result = block_on(drv.wake_no_sleep(Duration::from_millis(400)));
        assert_eq!(result, Err(Error::TooSoon));
        let result = block_on(drv.check_sleep_mode());
        assert_eq!(result, Err(Error::TooSoon));
    }

    #[test]
    fn probe_classifies_dpm_asleep() {
        let (_link, drv) = setup();
        let result = block_on(join(drv.check_sleep_mode(), async {
            embassy_futures::yield_now().await;
            drv.ingest(b"\r\n+INIT:WAKEUP,UC\r\n").unwrap();
        }))
        .0;
        assert_eq!(result, Ok(SleepProbe::DpmAsleep));
        let snap = drv.state();
        assert_eq!(snap.dpm_mode, Tri::KnownTrue);
        assert_eq!(snap.is_sleeping, Tri::KnownTrue);
    }

    #[test]
    fn probe_timeout_means_not_dpm() {
        let (_link, drv) = setup();
        let result = block_on(drv.check_sleep_mode());
        assert_eq!(result, Ok(SleepProbe::NotDpm));
        let snap = drv.state();
        assert_eq!(snap.dpm_mode, Tri::KnownFalse);
        assert_eq!(snap.is_sleeping, Tri::KnownFalse);
    }

    #[test]
    fn dpm_state_query_roundtrip() {
        let (link, drv) = setup();
        let result = block_on(join(drv.dpm_state(Duration::from_millis(200)), async {
            embassy_futures::yield_now().await;
            drv.ingest(b"\r\n+DPM:1\r\n").unwrap();
            drv.ingest(b"\r\nOK\r\n").unwrap();
        }))
        .0;
        assert_eq!(result, Ok(true));
        assert_eq!(link.sent_at(0), "AT+DPM=?");
    }

    #[test]
    fn rtc_sleep_sets_wake_time() {
        let (link, drv) = setup();
        drv.shadow()
            .set_tri(DaBits::IS_SLEEPING, |s| &mut s.is_sleeping, Tri::KnownFalse);
        let result = block_on(join(drv.rtc_sleep(Duration::from_secs(60)), async {
            embassy_futures::yield_now().await;
            drv.ingest(b"\r\nOK\r\n").unwrap();
        }))
        .0;
        assert_eq!(result, Ok(()));
        assert_eq!(link.sent_at(0), "AT+SETSLEEP3EXT=60000");
        let snap = drv.state();
        assert_eq!(snap.is_sleeping, Tri::KnownTrue);
        assert!(snap.rtc_wake_time.is_some());
    }

    #[test]
    fn wake_handshake_pulses_unicast_event() {
        let (link, drv) = setup();
        let mut sub = drv.fabric().da_events();
        let result = block_on(join(drv.wake_handshake(), async {
            embassy_futures::yield_now().await;
            drv.ingest(b"\r\nOK\r\n").unwrap();
            // Second OK for CLRDPMSLPEXT.
            loop {
                embassy_futures::yield_now().await;
                if link.sent_count() == 2 {
                    drv.ingest(b"\r\nOK\r\n").unwrap();
                    break;
                }
            }
        }))
        .0;
        assert_eq!(result, Ok(()));
        assert_eq!(link.sent_at(0), "AT+MCUWUDONE");
        assert_eq!(link.sent_at(1), "AT+CLRDPMSLPEXT");
        let mut saw_wake = false;
        while let Some(evt) = sub.try_next_message_pure() {
            if evt.bits.contains(DaBits::WAKE_UNICAST) {
                saw_wake = true;
            }
        }
        assert!(saw_wake);
    }
}

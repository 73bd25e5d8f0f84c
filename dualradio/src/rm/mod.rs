//! Radio manager: owns which radio carries MQTT.
//!
//! Exposes a small, totally ordered interface to the application. Only this
//! component flips `active_radio`; the cooperative switch state machine in
//! [`switch`] quiesces one radio before authorizing the other, and a
//! per-radio reference count decides when the Wi-Fi modem may go back to
//! sleep.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};

use crate::cellular::{CellularModem, CellularStatusExt};
use crate::error::Error;
use crate::fabric::Fabric;
use crate::port::{Pmic, RadioNotify, Uicr, WifiCtrl, WifiLink};
use crate::types::{ApCreds, MAX_SAVED_SSIDS, Radio, SleepMode};
use crate::wifi::{CurrentAp, WifiAt};

mod listen;
mod switch;

pub use switch::{SrsState, StepOutcome};

pub(crate) enum ConnectRequest {
    Creds { creds: ApCreds, disconnect_first: bool },
    Index { idx: usize, ssid: heapless::String<32>, disconnect_first: bool },
}

pub(crate) struct RmState {
    pub active_radio: Radio,
    pub switching: bool,
    pub switching_since: Option<Instant>,
    pub target: Radio,
    pub enabled: bool,
    pub use_wifi: bool,
    pub use_sleep: bool,
    /// Sleep policy saved while the USB/BT override is engaged.
    pub sleep_pre_override: Option<bool>,
    pub usb_connected: bool,
    pub bt_connected: bool,
    pub usb_bt_prepped: bool,
    pub connecting_ap: bool,
    pub prep_refs: [i16; 2],
    pub last_conn: Option<ApCreds>,
    // Bookkeeping for the current switch step.
    pub cur_op: SrsState,
    pub op_start: Instant,
    pub op_failures: u8,
    pub op_max_retries: u8,
    pub op_timeout: Duration,
    pub op_expired: bool,
    pub radio_enabled: bool,
    pub radio_disabled: bool,
    pub reconnect_duration: Duration,
    pub reconnect_period: Duration,
}

/// The radio manager.
pub struct RadioMgr<'p, L: WifiLink, C: WifiCtrl> {
    pub(crate) wifi: &'p WifiAt<'p, L, C>,
    pub(crate) cell: &'p dyn CellularModem,
    pub(crate) pmic: &'p dyn Pmic,
    pub(crate) notify: &'p dyn RadioNotify,
    pub(crate) uicr: &'p dyn Uicr,
    pub(crate) fabric: &'p Fabric<'p>,
    pub(crate) state: BlockingMutex<CriticalSectionRawMutex, RefCell<RmState>>,
    /// Serializes executions of the switch state machine. Acquired before
    /// any modem transaction and released last.
    pub(crate) sm_lock: Mutex<CriticalSectionRawMutex, ()>,
    pub(crate) kick: Signal<CriticalSectionRawMutex, ()>,
    pub(crate) connect_req: Channel<CriticalSectionRawMutex, ConnectRequest, 1>,
    pub(crate) started_at: Instant,
}

impl<'p, L: WifiLink, C: WifiCtrl> RadioMgr<'p, L, C> {
    pub fn new(
        wifi: &'p WifiAt<'p, L, C>,
        cell: &'p dyn CellularModem,
        pmic: &'p dyn Pmic,
        notify: &'p dyn RadioNotify,
        uicr: &'p dyn Uicr,
        fabric: &'p Fabric<'p>,
    ) -> Self {
        let cfg = wifi.config();
        Self {
            wifi,
            cell,
            pmic,
            notify,
            uicr,
            fabric,
            state: BlockingMutex::new(RefCell::new(RmState {
                active_radio: Radio::None,
                switching: false,
                switching_since: None,
                target: Radio::Lte,
                enabled: true,
                use_wifi: true,
                use_sleep: true,
                sleep_pre_override: None,
                usb_connected: false,
                bt_connected: false,
                usb_bt_prepped: false,
                connecting_ap: false,
                prep_refs: [0; 2],
                last_conn: None,
                cur_op: SrsState::Idle,
                op_start: Instant::from_ticks(0),
                op_failures: 0,
                op_max_retries: 0,
                op_timeout: Duration::from_ticks(0),
                op_expired: false,
                radio_enabled: false,
                radio_disabled: false,
                reconnect_duration: cfg.reconnect_duration,
                reconnect_period: cfg.reconnect_period,
            })),
            sm_lock: Mutex::new(()),
            kick: Signal::new(),
            connect_req: Channel::new(),
            started_at: Instant::now(),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut RmState) -> R) -> R {
        self.state.lock(|s| f(&mut s.borrow_mut()))
    }

    /// The radio currently authorized to carry MQTT. The radios can change
    /// state at any time, so a send may still fail.
    pub fn get_active_mqtt_radio(&self) -> Radio {
        self.with_state(|s| s.active_radio)
    }

    /// Whether a switch or an association attempt is in flight.
    pub fn is_switching(&self) -> bool {
        self.with_state(|s| s.switching || s.connecting_ap)
    }

    /// An association attempt is in flight, or a switch is targeting Wi-Fi.
    pub fn wifi_is_connecting(&self) -> bool {
        self.with_state(|s| s.connecting_ap || (s.switching && s.target == Radio::Wifi))
    }

    /// A radio is active and its broker shadow says connected.
    pub fn ready_for_mqtt(&self) -> bool {
        match self.get_active_mqtt_radio() {
            Radio::Lte => self.cell.mqtt_enabled() && self.cell.mqtt_connected(),
            Radio::Wifi => self.wifi.shadow().read(|s| s.mqtt_broker_connected.is_true()),
            Radio::None => false,
        }
    }

    pub fn is_active_radio_mqtt_connected(&self) -> bool {
        match self.get_active_mqtt_radio() {
            Radio::Lte => self.cell.mqtt_connected(),
            Radio::Wifi => self.wifi.shadow().read(|s| s.mqtt_broker_connected.is_true()),
            Radio::None => false,
        }
    }

    /// Enable or disable the manager (state machine and reconnect job).
    pub fn enable(&self, enable: bool) {
        self.with_state(|s| s.enabled = enable);
    }

    pub fn is_enabled(&self) -> bool {
        self.with_state(|s| s.enabled)
    }

    /// Allow or forbid use of the Wi-Fi radio. Forbidding it while Wi-Fi is
    /// active or targeted falls the manager back to LTE.
    pub fn wifi_enable(&self, use_wifi: bool) {
        let fallback = self.with_state(|s| {
            s.use_wifi = use_wifi;
            !use_wifi && (s.active_radio == Radio::Wifi || (s.switching && s.target == Radio::Wifi))
        });
        if fallback {
            let _ = self.switch_to(Radio::Lte, true, false);
        }
    }

    pub fn is_wifi_enabled(&self) -> bool {
        self.with_state(|s| s.use_wifi)
    }

    /// Whether the Wi-Fi modem is put into DPM sleep when unused.
    pub fn use_sleep(&self, enable: bool) {
        self.with_state(|s| s.use_sleep = enable);
    }

    pub fn uses_sleep(&self) -> bool {
        self.with_state(|s| s.use_sleep)
    }

    /// Diagnostic description of the current switch sub-state.
    pub fn op_str(&self) -> &'static str {
        self.with_state(|s| s.cur_op.describe())
    }

    /// Re-arm the periodic reconnect job. `persist` is surfaced to the
    /// platform layer; parameter storage itself lives outside this crate.
    pub fn set_reconnect_timer(&self, duration: Duration, period: Duration, persist: bool) {
        self.with_state(|s| {
            s.reconnect_duration = duration;
            s.reconnect_period = period;
        });
        if persist {
            info!("reconnect timer change marked for persistence");
        }
    }

    /// The modem reported a downlink-triggered wake; hold it awake on its
    /// behalf. Released by the listener after the downlink window.
    pub fn got_unicast_from_ap(&self) {
        self.with_state(|s| s.prep_refs[0] += 1);
    }

    /// Prepare a radio for a group of sends, taking a prep-reference.
    ///
    /// For Wi-Fi: wake it (respecting the sleep policy) and, with
    /// `need_mqtt`, wait for the broker shadow to go known-true. For LTE:
    /// with `need_mqtt`, wait for its MQTT session. The reference is taken
    /// only on success; every call that returns `Ok` must be paired with
    /// [`RadioMgr::done`].
    pub async fn prepare(&self, radio: Radio, need_mqtt: bool, timeout: Duration) -> Result<(), Error> {
        let Some(slot) = radio.slot() else {
            return Err(Error::Invalid);
        };
        let deadline = Instant::now() + timeout;
        let refs = self.with_state(|s| {
            s.prep_refs[slot] += 1;
            s.prep_refs[slot]
        });
        debug!("prep ref for {} now {}", radio.as_str(), refs);

        let result = self.prepare_inner(radio, need_mqtt, deadline).await;
        if result.is_err() {
            // We did not actually prep the radio; undo our own increment.
            self.with_state(|s| s.prep_refs[slot] -= 1);
        }
        result
    }

    async fn prepare_inner(&self, radio: Radio, need_mqtt: bool, deadline: Instant) -> Result<(), Error> {
        match radio {
            Radio::Wifi => {
                self.ensure_wifi_awake().await?;
                if need_mqtt {
                    // The broker session can drop transiently; poll the
                    // shadow and nudge the modem for its state.
                    while !self.wifi.shadow().read(|s| s.mqtt_broker_connected.is_true()) {
                        if Instant::now() >= deadline {
                            error!("MQTT is not connected on wifi, but is needed");
                            return Err(Error::Timeout);
                        }
                        Timer::after_millis(50).await;
                        let _ = self.wifi.mqtt_state(Duration::from_millis(100)).await;
                    }
                }
                Ok(())
            }
            Radio::Lte => {
                if need_mqtt {
                    while !self.cell.mqtt_connected() {
                        if Instant::now() >= deadline {
                            return Err(Error::Timeout);
                        }
                        Timer::after_millis(100).await;
                    }
                }
                Ok(())
            }
            Radio::None => Err(Error::Invalid),
        }
    }

    /// Release one prep-reference. When the last reference drops, the
    /// Wi-Fi modem may go back to sleep per the sleep policy.
    pub async fn done(&self, radio: Radio) -> Result<(), Error> {
        let Some(slot) = radio.slot() else {
            return Err(Error::Invalid);
        };
        let remaining = self.with_state(|s| {
            if s.prep_refs[slot] <= 0 {
                return None;
            }
            s.prep_refs[slot] -= 1;
            Some(s.prep_refs[slot])
        });
        let Some(remaining) = remaining else {
            error!("done called too many times for {}", radio.as_str());
            return Err(Error::TooManyReleases);
        };
        debug!("done with {}, ref count {}", radio.as_str(), remaining);
        if remaining > 0 {
            return Ok(());
        }
        if radio == Radio::Wifi {
            if let Err(e) = self.sleep_wifi().await {
                error!("'{}' trying to sleep wifi modem", e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Current prep-reference count for a radio.
    pub fn prep_refs(&self, radio: Radio) -> i16 {
        radio
            .slot()
            .map(|slot| self.with_state(|s| s.prep_refs[slot]))
            .unwrap_or(0)
    }

    /// Begin an asynchronous switch of the active MQTT radio.
    ///
    /// Idempotent while already targeting `target`. With `clear_existing`
    /// the current active radio is deauthorized immediately. `force`
    /// commits the bookkeeping without touching the modems (development
    /// only).
    pub fn switch_to(&self, target: Radio, clear_existing: bool, force: bool) -> Result<(), Error> {
        if target == Radio::None {
            return Err(Error::Invalid);
        }
        let start = self.with_state(|s| {
            if s.switching && s.target == target {
                debug!("already switching to {}", target.as_str());
                return false;
            }
            if target == Radio::Wifi && !s.use_wifi {
                warn!("wifi is disabled, not switching to it");
                return false;
            }
            if clear_existing {
                s.active_radio = Radio::None;
            }
            s.radio_enabled = false;
            s.radio_disabled = false;
            if force {
                s.active_radio = target;
                s.switching = false;
                s.switching_since = None;
                s.cur_op = SrsState::Idle;
                return false;
            }
            debug!("switching to {} from {}", target.as_str(), s.active_radio.as_str());
            s.target = target;
            s.switching_since = Some(Instant::now());
            if !s.switching {
                s.switching = true;
                return true;
            }
            false
        });
        if start {
            // Steps can take unknown time; the switch task re-enters the
            // state machine until both sides are in their target shape.
            self.kick.signal(());
        }
        Ok(())
    }

    /// Initiate an association with explicit credentials. At most one
    /// attempt may be in flight.
    pub async fn connect_to_ap(&self, creds: ApCreds) -> Result<(), Error> {
        if self.with_state(|s| s.connecting_ap) {
            error!("already connecting to an AP");
            return Err(Error::Busy);
        }
        if !self.is_wifi_enabled() {
            error!("wifi is disabled, can't connect to AP");
            return Err(Error::NotSupported);
        }

        // Asking for the AP we are already on, with the credentials that
        // made that association, needs no wire traffic at all.
        let same_again = self.with_state(|s| s.last_conn.as_ref() == Some(&creds))
            && self
                .wifi
                .shadow()
                .read(|s| s.ap_connected.is_true() && s.ap_name == creds.ssid);
        if same_again {
            debug!("already connected to that AP with those creds");
            return Err(Error::AlreadyConnected);
        }

        let disconnect_first = match self.wifi.is_curr_ap(&creds).await? {
            CurrentAp::SameCreds => {
                debug!("already connected to that AP with those creds");
                return Err(Error::AlreadyConnected);
            }
            CurrentAp::SameSsidDifferentCreds => true,
            CurrentAp::Different => false,
        };

        self.with_state(|s| s.connecting_ap = true);
        if self
            .connect_req
            .try_send(ConnectRequest::Creds { creds, disconnect_first })
            .is_err()
        {
            self.with_state(|s| s.connecting_ap = false);
            return Err(Error::Busy);
        }
        Ok(())
    }

    /// Initiate an association with a saved-SSID slot.
    pub async fn connect_to_ap_by_index(&self, idx: usize) -> Result<(), Error> {
        if self.with_state(|s| s.connecting_ap) {
            error!("already connecting to an AP");
            return Err(Error::Busy);
        }
        if !self.is_wifi_enabled() {
            error!("wifi is disabled, can't connect to AP");
            return Err(Error::NotSupported);
        }
        if idx >= MAX_SAVED_SSIDS {
            return Err(Error::Invalid);
        }
        let Some(saved) = self.wifi.saved_ssid_by_index(idx) else {
            error!("no saved ssid at index {}", idx);
            return Err(Error::Invalid);
        };

        let (connected, current) = self.wifi.shadow().read(|s| (s.ap_connected, s.ap_name.clone()));
        let mut disconnect_first = false;
        if connected.is_true() {
            if current == saved.ssid {
                if self.get_active_mqtt_radio() != Radio::Wifi {
                    // Connected but not using it; just switch.
                    return self.switch_to(Radio::Wifi, false, false);
                }
                debug!("already connected to and switched to AP at idx {}", idx);
                return Err(Error::AlreadyConnected);
            }
            disconnect_first = true;
        }

        self.with_state(|s| s.connecting_ap = true);
        if self
            .connect_req
            .try_send(ConnectRequest::Index { idx, ssid: saved.ssid, disconnect_first })
            .is_err()
        {
            self.with_state(|s| s.connecting_ap = false);
            return Err(Error::Busy);
        }
        Ok(())
    }

    /// Make sure the Wi-Fi modem is powered, booted and in the sleep mode
    /// the policy wants for active use.
    pub(crate) async fn ensure_wifi_awake(&self) -> Result<(), Error> {
        if !self.uicr.shipping_flag() {
            return Ok(());
        }
        if !self.is_enabled() {
            warn!("radio mgmt off, not ensuring wifi is awake");
            return Ok(());
        }
        let was_powered = self.wifi.shadow().read(|s| s.powered_on.is_true());
        self.wifi.ensure_powered(Duration::from_secs(5)).await?;

        if self.uses_sleep() {
            if was_powered {
                // The modem drops wake pulses too soon after a sleep; wait
                // out the settle window instead of losing the pulse.
                let wait = self.wifi.time_to_next_wake();
                if wait > Duration::from_ticks(0) {
                    debug!("too soon to wake modem, waiting {} ms", wait.as_millis());
                    Timer::after(wait).await;
                }
            }
            self.wifi.set_sleep_mode(SleepMode::DpmAwake).await
        } else {
            self.wifi.set_sleep_mode(SleepMode::None).await
        }
    }

    /// Return the Wi-Fi modem to the state the sleep policy wants when the
    /// last prep-reference drops.
    pub(crate) async fn sleep_wifi(&self) -> Result<(), Error> {
        if !self.uicr.shipping_flag() {
            return Ok(());
        }
        if !self.is_enabled() {
            warn!("radio mgmt off, not changing wifi state");
            return Ok(());
        }
        if self.wifi_is_connecting() {
            debug!("wifi is connecting to an AP, not sleeping it");
            return Ok(());
        }

        if self.get_active_mqtt_radio() == Radio::Wifi {
            if self.uses_sleep() {
                let (dpm, sleeping, ap) = self
                    .wifi
                    .shadow()
                    .read(|s| (s.dpm_mode, s.is_sleeping, s.ap_connected));
                if !dpm.is_known() || !sleeping.is_known() {
                    error!("modem DPM or sleep state unknown, cannot manage them");
                    return Err(Error::BadResponse);
                }
                if ap.is_true() {
                    debug!("setting DPM sleep mode");
                    // The modem may not sleep right away, but absent an
                    // error it eventually will.
                    return self.wifi.set_sleep_mode(SleepMode::DpmAsleep).await;
                }
                // Active radio without an AP is stale; hand over to LTE.
                warn!("wifi is active radio but not associated, going to LTE");
                let _ = self.switch_to(Radio::Lte, true, false);
                if !self.with_state(|s| s.usb_bt_prepped) {
                    self.wifi.set_power(false).await;
                }
                Ok(())
            } else {
                debug!("keeping wifi awake, sleep policy off");
                self.wifi.set_sleep_mode(SleepMode::None).await
            }
        } else {
            // Not the active radio and not becoming it; power it down.
            if !self.with_state(|s| s.usb_bt_prepped) {
                self.wifi.set_power(false).await;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use core::cell::RefCell;

    use embassy_futures::block_on;
    use embassy_futures::select::{Either, select};
    use embassy_sync::blocking_mutex::Mutex as TestMutex;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use embassy_time::Timer;

    use super::*;
    use crate::config::Config;
    use crate::fabric::{DaBits, LteStatus, LteStatusUpdate, MsgPool};
    use crate::types::Tri;
    use crate::wifi::testutil::{FakeCtrl, FakeLink, FakeUicr};

    struct FakeCell {
        state: TestMutex<CriticalSectionRawMutex, RefCell<(bool, LteStatus)>>,
    }

    impl FakeCell {
        fn new() -> Self {
            Self {
                state: TestMutex::new(RefCell::new((false, LteStatus::default()))),
            }
        }

        fn set(&self, powered: bool, status: LteStatus) {
            self.state.lock(|s| *s.borrow_mut() = (powered, status));
        }
    }

    impl CellularModem for FakeCell {
        fn power_on(&self) -> Result<(), Error> {
            self.state.lock(|s| {
                let mut s = s.borrow_mut();
                s.0 = true;
                s.1 = s.1.with(LteStatus::LTE_CONNECTED, true).with(LteStatus::LTE_WORKING, true);
            });
            Ok(())
        }

        fn power_off(&self) -> Result<(), Error> {
            self.state.lock(|s| *s.borrow_mut() = (false, LteStatus::default()));
            Ok(())
        }

        fn is_powered(&self) -> bool {
            self.state.lock(|s| s.borrow().0)
        }

        fn start_mqtt(&self) -> Result<(), Error> {
            self.state.lock(|s| {
                let mut s = s.borrow_mut();
                s.1 = s.1.with(LteStatus::MQTT_ENABLED, true).with(LteStatus::MQTT_CONNECTED, true);
            });
            Ok(())
        }

        fn stop_mqtt(&self) -> Result<(), Error> {
            self.state.lock(|s| {
                let mut s = s.borrow_mut();
                s.1 = s.1.with(LteStatus::MQTT_ENABLED, false).with(LteStatus::MQTT_CONNECTED, false);
            });
            Ok(())
        }

        fn status(&self) -> LteStatus {
            self.state.lock(|s| s.borrow().1)
        }
    }

    struct FakePmic {
        reboots: TestMutex<CriticalSectionRawMutex, RefCell<u32>>,
    }

    impl Default for FakePmic {
        fn default() -> Self {
            Self {
                reboots: TestMutex::new(RefCell::new(0)),
            }
        }
    }

    impl Pmic for FakePmic {
        fn reboot(&self, _reason: &str) {
            self.reboots.lock(|r| *r.borrow_mut() += 1);
        }

        fn modem_power_off(&self, _force: bool) -> Result<(), Error> {
            Ok(())
        }

        fn modem_power_on(&self) -> Result<(), Error> {
            Ok(())
        }
    }

    struct FakeNotify {
        counts: TestMutex<CriticalSectionRawMutex, RefCell<(u32, u32)>>,
    }

    impl Default for FakeNotify {
        fn default() -> Self {
            Self {
                counts: TestMutex::new(RefCell::new((0, 0))),
            }
        }
    }

    impl FakeNotify {
        fn wifi_count(&self) -> u32 {
            self.counts.lock(|c| c.borrow().0)
        }

        fn lte_count(&self) -> u32 {
            self.counts.lock(|c| c.borrow().1)
        }
    }

    impl RadioNotify for FakeNotify {
        fn switched_to_wifi(&self) {
            self.counts.lock(|c| c.borrow_mut().0 += 1);
        }

        fn switched_to_lte(&self) {
            self.counts.lock(|c| c.borrow_mut().1 += 1);
        }
    }

    struct Rig {
        link: &'static FakeLink,
        cell: &'static FakeCell,
        notify: &'static FakeNotify,
        mgr: &'static RadioMgr<'static, &'static FakeLink, FakeCtrl>,
        wifi: &'static WifiAt<'static, &'static FakeLink, FakeCtrl>,
    }

    fn rig(shipped: bool) -> Rig {
        let pool = Box::leak(Box::new(MsgPool::new(Duration::from_secs(2))));
        let fabric = Box::leak(Box::new(Fabric::new()));
        let link: &'static FakeLink = Box::leak(Box::new(FakeLink::new()));
        let uicr = Box::leak(Box::new(FakeUicr { shipped, ..FakeUicr::default() }));
        let cfg = Config {
            boot_grace: Duration::from_ticks(0),
            ..Config::default()
        };
        let wifi = Box::leak(Box::new(WifiAt::new(link, FakeCtrl::default(), pool, fabric, uicr, cfg)));
        let cell = Box::leak(Box::new(FakeCell::new()));
        let pmic = Box::leak(Box::new(FakePmic::default()));
        let notify = Box::leak(Box::new(FakeNotify::default()));
        let mgr = Box::leak(Box::new(RadioMgr::new(wifi, cell, pmic, notify, uicr, fabric)));
        Rig { link, cell, notify, mgr, wifi }
    }

    async fn drive_until_done(mgr: &RadioMgr<'static, &'static FakeLink, FakeCtrl>) {
        for _ in 0..80 {
            match mgr.step().await {
                StepOutcome::Done | StepOutcome::Failed => {
                    if !mgr.with_state(|s| s.switching) {
                        return;
                    }
                }
                StepOutcome::SleepFor(_) => Timer::after_millis(20).await,
            }
        }
        panic!("switch never completed");
    }

    /// Answers modem commands the way the Wi-Fi modem would.
    async fn modem_sim(link: &'static FakeLink, wifi: &'static WifiAt<'static, &'static FakeLink, FakeCtrl>) -> ! {
        let mut answered = 0;
        loop {
            embassy_futures::yield_now().await;
            while answered < link.sent_count() {
                let cmd = link.sent_at(answered);
                answered += 1;
                match cmd.as_str() {
                    "AT" => {
                        let _ = wifi.ingest(b"\r\nOK\r\n");
                    }
                    "AT+NWMQCL=?" => {
                        let _ = wifi.ingest(b"\r\n+NWMQCL:0\r\n");
                        let _ = wifi.ingest(b"\r\nOK\r\n");
                    }
                    "AT+NWMQAUTO=?" => {
                        let _ = wifi.ingest(b"\r\n+NWMQAUTO:0\r\n");
                        let _ = wifi.ingest(b"\r\nOK\r\n");
                    }
                    "AT+NWMQCL=1" => {
                        let _ = wifi.ingest(b"\r\nOK\r\n");
                        let _ = wifi.ingest(b"\r\n+NWMQCL:1\r\n");
                    }
                    _ => {
                        let _ = wifi.ingest(b"\r\nOK\r\n");
                    }
                }
            }
        }
    }

    #[test]
    fn cold_boot_lte_only() {
        let r = rig(true);
        r.wifi.shadow().set_powered(false);
        r.cell.set(
            true,
            LteStatus::default()
                .with(LteStatus::LTE_CONNECTED, true)
                .with(LteStatus::LTE_WORKING, true)
                .with(LteStatus::MQTT_ENABLED, true)
                .with(LteStatus::MQTT_CONNECTED, true),
        );
        r.mgr.switch_to(Radio::Lte, false, false).unwrap();
        block_on(drive_until_done(r.mgr));
        assert_eq!(r.mgr.get_active_mqtt_radio(), Radio::Lte);
        assert!(r.mgr.ready_for_mqtt());
        assert!(!r.mgr.is_switching());
        assert_eq!(r.notify.lte_count(), 1);
    }

    #[test]
    fn handoff_to_wifi() {
        let r = rig(true);
        // Start established on LTE.
        r.cell.set(
            true,
            LteStatus::default()
                .with(LteStatus::LTE_CONNECTED, true)
                .with(LteStatus::LTE_WORKING, true)
                .with(LteStatus::MQTT_ENABLED, true)
                .with(LteStatus::MQTT_CONNECTED, true),
        );
        r.mgr.switch_to(Radio::Lte, false, true).unwrap();
        assert_eq!(r.mgr.get_active_mqtt_radio(), Radio::Lte);

        // Keep the modem awake for the test; the sim does not model DPM.
        r.mgr.use_sleep(false);
        r.wifi.shadow().set_powered(true);
        r.wifi.ingest(b"\r\n+INIT:DONE,0,DPM=0\r\n").unwrap();
        r.wifi.ingest(b"\r\n+WFJAP:1,'ProtoSorcery',10.1.91.148\r\n").unwrap();

        r.mgr.switch_to(Radio::Wifi, false, false).unwrap();
        block_on(async {
            match select(drive_until_done(r.mgr), modem_sim(r.link, r.wifi)).await {
                Either::First(()) => {}
                Either::Second(never) => never,
            }
        });

        assert_eq!(r.mgr.get_active_mqtt_radio(), Radio::Wifi);
        assert!(r.mgr.ready_for_mqtt());
        assert_eq!(r.notify.wifi_count(), 1);
        // The LTE side was quiesced before the flip.
        assert!(!r.cell.mqtt_enabled());
        // MQTT came up through on-boot enable, enable, broker wait.
        let sent = r.link.all_sent();
        assert!(sent.iter().any(|c| c == "AT+NWMQAUTO=1"));
        assert!(sent.iter().any(|c| c == "AT+NWMQCL=1"));
    }

    #[test]
    fn wifi_flap_falls_back_to_lte() {
        let r = rig(true);
        r.cell.set(
            true,
            LteStatus::default()
                .with(LteStatus::LTE_CONNECTED, true)
                .with(LteStatus::LTE_WORKING, true)
                .with(LteStatus::MQTT_ENABLED, true)
                .with(LteStatus::MQTT_CONNECTED, true),
        );
        r.mgr.switch_to(Radio::Wifi, false, true).unwrap();
        r.wifi.shadow().set_powered(true);
        r.wifi.ingest(b"\r\n+WFJAP:1,'ProtoSorcery',10.1.91.148\r\n").unwrap();

        // The AP vanishes.
        r.wifi.ingest(b"\r\n+WFJAP:0,NOT_FOUND\r\n").unwrap();
        assert_eq!(r.wifi.state().ap_connected, Tri::KnownFalse);
        block_on(r.mgr.handle_da_event(&crate::fabric::DaEvent {
            ts: Instant::now(),
            bits: DaBits::AP_CONNECT,
            old: crate::fabric::DaValue::Tri(Tri::KnownTrue),
            new: crate::fabric::DaValue::Tri(Tri::KnownFalse),
        }));

        // The fallback switch to LTE was started with the active radio
        // cleared.
        assert!(r.mgr.with_state(|s| s.switching && s.target == Radio::Lte));
        assert_eq!(r.mgr.get_active_mqtt_radio(), Radio::None);
        block_on(drive_until_done(r.mgr));
        assert_eq!(r.mgr.get_active_mqtt_radio(), Radio::Lte);
        assert_eq!(r.notify.lte_count(), 1);
    }

    #[test]
    fn prep_refcount_releases_to_sleep_policy() {
        // Unshipped unit short-circuits the wake/sleep machinery so the
        // refcount logic itself is observable.
        let r = rig(false);
        block_on(async {
            r.mgr.prepare(Radio::Wifi, false, Duration::from_millis(100)).await.unwrap();
            r.mgr.prepare(Radio::Wifi, false, Duration::from_millis(100)).await.unwrap();
            assert_eq!(r.mgr.prep_refs(Radio::Wifi), 2);
            r.mgr.done(Radio::Wifi).await.unwrap();
            assert_eq!(r.mgr.prep_refs(Radio::Wifi), 1);
            r.mgr.done(Radio::Wifi).await.unwrap();
            assert_eq!(r.mgr.prep_refs(Radio::Wifi), 0);
            // One release too many.
            assert_eq!(r.mgr.done(Radio::Wifi).await, Err(Error::TooManyReleases));
        });
    }

    #[test]
    fn prepare_failure_leaves_no_reference() {
        let r = rig(false);
        // Broker never goes known-true; the deadline elapses.
        let result = block_on(r.mgr.prepare(Radio::Wifi, true, Duration::from_millis(250)));
        assert_eq!(result, Err(Error::Timeout));
        assert_eq!(r.mgr.prep_refs(Radio::Wifi), 0);
    }

    #[test]
    fn prepare_and_done_do_not_disturb_active_radio() {
        let r = rig(false);
        r.mgr.switch_to(Radio::Lte, false, true).unwrap();
        block_on(async {
            r.mgr.prepare(Radio::Wifi, false, Duration::from_millis(100)).await.unwrap();
            r.mgr.done(Radio::Wifi).await.unwrap();
        });
        assert_eq!(r.mgr.get_active_mqtt_radio(), Radio::Lte);
    }

    #[test]
    fn switch_to_same_target_is_idempotent() {
        let r = rig(true);
        r.mgr.switch_to(Radio::Lte, false, false).unwrap();
        assert!(r.mgr.with_state(|s| s.switching));
        let since = r.mgr.with_state(|s| s.switching_since);
        r.mgr.switch_to(Radio::Lte, false, false).unwrap();
        assert_eq!(r.mgr.with_state(|s| s.switching_since), since);
    }

    #[test]
    fn switch_to_wifi_refused_when_wifi_disabled() {
        let r = rig(true);
        r.mgr.wifi_enable(false);
        r.mgr.switch_to(Radio::Wifi, false, false).unwrap();
        assert!(!r.mgr.with_state(|s| s.switching));
    }

    #[test]
    fn lte_mqtt_disable_under_active_radio_reenables() {
        let r = rig(true);
        r.mgr.switch_to(Radio::Lte, false, true).unwrap();
        let update = LteStatusUpdate {
            status: LteStatus::default().with(LteStatus::LTE_CONNECTED, true),
            changed: LteStatus::MQTT_ENABLED,
        };
        r.mgr.handle_lte_event(&update);
        assert!(r.mgr.with_state(|s| s.switching && s.target == Radio::Lte));
    }

    #[test]
    fn usb_bt_override_saves_and_restores_sleep_policy() {
        let r = rig(false);
        assert!(r.mgr.uses_sleep());
        r.mgr.with_state(|s| s.usb_connected = true);
        block_on(r.mgr.apply_usb_bt_override());
        assert!(!r.mgr.uses_sleep());
        assert!(r.mgr.with_state(|s| s.usb_bt_prepped));

        // Flip the policy while overridden, then release: the override
        // restores the value saved at engage time.
        r.mgr.with_state(|s| s.usb_connected = false);
        block_on(r.mgr.apply_usb_bt_override());
        assert!(r.mgr.uses_sleep());
        assert!(!r.mgr.with_state(|s| s.usb_bt_prepped));
    }

    #[test]
    fn connect_rejected_while_attempt_outstanding() {
        let r = rig(false);
        let creds = ApCreds {
            ssid: heapless::String::try_from("ProtoSorcery").unwrap(),
            password: heapless::String::try_from("hunter22").unwrap(),
            sec: 4,
            enc: 2,
            ..Default::default()
        };
        block_on(async {
            r.mgr.connect_to_ap(creds.clone()).await.unwrap();
            assert_eq!(r.mgr.connect_to_ap(creds.clone()).await, Err(Error::Busy));
        });
    }

    #[test]
    fn connect_to_same_ap_with_same_creds_is_already_connected() {
        let r = rig(false);
        let creds = ApCreds {
            ssid: heapless::String::try_from("ProtoSorcery").unwrap(),
            password: heapless::String::try_from("hunter22").unwrap(),
            sec: 4,
            enc: 2,
            ..Default::default()
        };
        r.mgr.with_state(|s| s.last_conn = Some(creds.clone()));
        r.wifi.shadow().set_powered(true);
        r.wifi.ingest(b"\r\n+WFJAP:1,'ProtoSorcery',10.1.91.148\r\n").unwrap();
        let sends_before = r.link.sent_count();
        let result = block_on(r.mgr.connect_to_ap(creds));
        assert_eq!(result, Err(Error::AlreadyConnected));
        // No wire traffic was needed to answer.
        assert_eq!(r.link.sent_count(), sends_before);
    }

    #[test]
    fn ready_for_mqtt_requires_active_radio_broker() {
        let r = rig(true);
        assert!(!r.mgr.ready_for_mqtt());
        r.mgr.switch_to(Radio::Wifi, false, true).unwrap();
        assert!(!r.mgr.ready_for_mqtt());
        r.wifi.shadow().set_powered(true);
        r.wifi.ingest(b"\r\n+NWMQCL:1\r\n").unwrap();
        assert!(r.mgr.ready_for_mqtt());
    }
}

//! The switch-radios state machine.
//!
//! A cooperative step function re-entered by the switch task: enable the
//! target radio, quiesce the other so the two never contend for the cloud
//! session, then flip `active_radio` and notify the application. Each step
//! has a timeout and retry budget held as data; a step that exhausts its
//! budget while targeting Wi-Fi falls back to LTE, one targeting LTE
//! power-cycles the cellular modem.

use embassy_time::{Duration, Instant, Timer};

use crate::cellular::CellularStatusExt;
use crate::error::Error;
use crate::port::{WifiCtrl, WifiLink};
use crate::types::Radio;

use super::RadioMgr;

/// One step of the switch state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SrsState {
    Idle,
    WaitingForShadowKnown,
    WakingWifi,
    SleepingWifi,
    EnablingBrokerOnBoot,
    EnablingBroker,
    DisablingBroker,
    WaitForAp,
    WaitForBroker,
    DisablingLteMqtt,
    EnablingLteMqtt,
    WaitForLteReady,
    StopApProfileUse,
}

/// Timeout and retry budget of one step.
#[derive(Debug, Clone, Copy)]
pub struct OpBudget {
    pub timeout: Duration,
    pub max_retries: u8,
}

impl SrsState {
    /// Budgets are data, one row per state.
    pub const fn budget(self) -> OpBudget {
        let (ms, retries): (u64, u8) = match self {
            SrsState::Idle => (0, 0),
            SrsState::WaitingForShadowKnown => (1_000, 3),
            SrsState::WakingWifi => (500, 3),
            SrsState::SleepingWifi => (1_200, 4),
            SrsState::EnablingBrokerOnBoot => (1_500, 2),
            SrsState::EnablingBroker => (1_500, 2),
            SrsState::DisablingBroker => (1_500, 3),
            SrsState::WaitForAp => (1_000, 3),
            SrsState::WaitForBroker => (30_000, 1),
            SrsState::DisablingLteMqtt => (1_500, 3),
            SrsState::EnablingLteMqtt => (1_500, 3),
            SrsState::WaitForLteReady => (4_000, 3),
            SrsState::StopApProfileUse => (1_000, 2),
        };
        OpBudget {
            timeout: Duration::from_millis(ms),
            max_retries: retries,
        }
    }

    pub const fn describe(self) -> &'static str {
        match self {
            SrsState::Idle => "Idle",
            SrsState::WaitingForShadowKnown => "Waiting for modem state to be known",
            SrsState::WakingWifi => "Waking wifi",
            SrsState::SleepingWifi => "Sleeping wifi",
            SrsState::EnablingBrokerOnBoot => "Enabling mqtt on boot",
            SrsState::EnablingBroker => "Enabling mqtt",
            SrsState::DisablingBroker => "Disabling mqtt",
            SrsState::WaitForAp => "Waiting for AP to connect",
            SrsState::WaitForBroker => "Waiting for MQTT broker to connect",
            SrsState::DisablingLteMqtt => "Disabling LTE MQTT",
            SrsState::EnablingLteMqtt => "Enabling LTE MQTT",
            SrsState::WaitForLteReady => "Waiting for LTE to be ready for commands",
            SrsState::StopApProfileUse => "Stopping AP profile from being used",
        }
    }
}

/// Result of one state-machine entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StepOutcome {
    /// Both radios are in their target shape; nothing scheduled.
    Done,
    /// Re-enter after this long.
    SleepFor(Duration),
    /// The machine cannot run at all (unit not shipped / manager off).
    Failed,
}

/// Outcome of entering a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpState {
    /// First entry (or a retry slot opened); attempt the operation now.
    Started,
    /// Same step, still inside its timeout.
    StillGoing(Duration),
    /// The step exceeded `timeout × (max_retries + 1)`.
    Failed,
}

impl<'p, L: WifiLink, C: WifiCtrl> RadioMgr<'p, L, C> {
    /// Enter (or continue) the step named by `op`.
    fn start_op(&self, op: SrsState) -> OpState {
        let now = Instant::now();
        let budget = op.budget();
        self.with_state(|s| {
            if s.cur_op != op {
                s.cur_op = op;
                s.op_start = now;
                s.op_failures = 0;
                s.op_max_retries = budget.max_retries;
                s.op_timeout = budget.timeout;
                s.op_expired = false;
                return OpState::Started;
            }
            let spent = if now < s.op_start { Duration::from_ticks(0) } else { now - s.op_start };
            if spent > s.op_timeout || s.op_expired {
                s.op_expired = false;
                s.op_failures += 1;
                if s.op_failures > s.op_max_retries {
                    return OpState::Failed;
                }
                s.op_start = now;
                return OpState::Started;
            }
            OpState::StillGoing(s.op_timeout - spent)
        })
    }

    /// Expire the current attempt immediately, burning one retry.
    fn fail_op(&self) {
        self.with_state(|s| s.op_expired = true);
    }

    /// Burn a retry only for modem-reported errors; transient errors wait
    /// out the step timeout instead.
    fn note_op_error(&self, e: &Error) {
        if !e.is_transient() {
            self.fail_op();
        }
    }

    fn retarget_lte(&self, clear: bool) {
        let _ = self.switch_to(Radio::Lte, clear, false);
    }

    /// The sleep state the policy wants the Wi-Fi modem in.
    fn wifi_in_right_sleep_mode(&self) -> bool {
        let (dpm, sleeping) = self.wifi.shadow().read(|s| (s.dpm_mode, s.is_sleeping));
        if self.uses_sleep() {
            dpm.is_true() && sleeping.is_true()
        } else {
            dpm.is_false() && sleeping.is_false()
        }
    }

    /// Long-lived task driving switches. Re-enters [`Self::step`] until it
    /// reports done, then parks until the next kick.
    pub async fn run_switcher(&self) -> ! {
        loop {
            self.kick.wait().await;
            loop {
                let outcome = {
                    let _guard = self.sm_lock.lock().await;
                    self.step().await
                };
                match outcome {
                    StepOutcome::Done | StepOutcome::Failed => break,
                    StepOutcome::SleepFor(wait) => Timer::after(wait).await,
                }
            }
        }
    }

    /// One entry of the switch state machine.
    ///
    /// The target is re-read on every entry, so `switch_to` may legally
    /// retarget mid-switch.
    pub async fn step(&self) -> StepOutcome {
        if !self.uicr.shipping_flag() {
            return StepOutcome::Failed;
        }
        if !self.is_enabled() {
            return StepOutcome::Failed;
        }
        // Give the rest of the system a moment before moving radios.
        let boot_grace = self.wifi.config().boot_grace;
        if Instant::now() < self.started_at + boot_grace {
            return StepOutcome::SleepFor(Duration::from_secs(5));
        }

        let (target, enabled_done, disabled_done) =
            self.with_state(|s| (s.target, s.radio_enabled, s.radio_disabled));

        if !enabled_done {
            let wait = match target {
                Radio::Wifi => self.enable_wifi_side().await,
                Radio::Lte => self.enable_lte_side().await,
                Radio::None => None,
            };
            if let Some(wait) = wait {
                return StepOutcome::SleepFor(wait);
            }
            self.with_state(|s| s.radio_enabled = true);
        }

        if !disabled_done {
            if target != Radio::Wifi {
                if let Some(wait) = self.disable_wifi_side().await {
                    return StepOutcome::SleepFor(wait);
                }
            }
            if target != Radio::Lte {
                self.disable_lte_side();
            }
            self.with_state(|s| s.radio_disabled = true);
        }

        // Both sides are in their target configuration; authorize the new
        // radio and tell the application exactly once.
        self.with_state(|s| {
            s.active_radio = target;
            s.cur_op = SrsState::Idle;
            s.switching = false;
            s.switching_since = None;
        });
        match target {
            Radio::Wifi => {
                warn!("switched to wifi");
                self.notify.switched_to_wifi();
            }
            Radio::Lte => {
                warn!("switched to LTE");
                self.notify.switched_to_lte();
                // Confirmed on LTE; make sure the Wi-Fi side is parked.
                // Covers the power-to-battery transition.
                if let Err(e) = self.sleep_wifi().await {
                    debug!("'{}' parking wifi after LTE switch", e);
                }
            }
            Radio::None => {}
        }
        StepOutcome::Done
    }

    /// Bring the Wi-Fi side up: powered, awake, associated, MQTT enabled
    /// (and auto-enabled at boot), broker connected, then parked in the
    /// policy's sleep mode. Returns how long to wait before re-entry, or
    /// `None` when the side is in shape.
    async fn enable_wifi_side(&self) -> Option<Duration> {
        self.wifi.set_power(true).await;
        let _ = self.wifi.check_sleeping(true).await;

        let snap = self.wifi.state();
        if snap.mqtt_enabled.is_true()
            && snap.mqtt_on_boot.is_true()
            && snap.mqtt_broker_connected.is_true()
            && self.wifi_in_right_sleep_mode()
        {
            return None;
        }

        // Quiesce LTE's broker session while bringing Wi-Fi up; a failed
        // switch falls back and re-enables it.
        if self.get_active_mqtt_radio() == Radio::Lte && self.cell.mqtt_enabled() {
            match self.start_op(SrsState::DisablingLteMqtt) {
                OpState::Started => {
                    debug!("disabling LTE MQTT");
                    if let Err(e) = self.lte_set_mqtt_enable(false, Duration::from_secs(1)).await {
                        error!("'{}' disabling LTE MQTT, will retry", e);
                    }
                    return Some(Duration::from_millis(500));
                }
                OpState::StillGoing(_) => return Some(Duration::from_millis(500)),
                OpState::Failed => {
                    debug!("LTE MQTT is taking too long to disable, fallback to LTE");
                    self.retarget_lte(false);
                    return Some(Duration::from_millis(200));
                }
            }
        }

        if !self.wifi.shadow().read(|s| s.is_sleeping.is_false()) {
            match self.start_op(SrsState::WakingWifi) {
                OpState::Started => {
                    debug!("waking wifi modem");
                    if let Err(e) = self.ensure_wifi_awake().await {
                        error!("'{}' waking wifi modem, will retry", e);
                        self.note_op_error(&e);
                        return Some(Duration::from_millis(200));
                    }
                    // No error: assume awake and fall through.
                }
                OpState::StillGoing(_) => return Some(Duration::from_millis(100)),
                OpState::Failed => {
                    error!("wifi modem never woke to enable, fallback to LTE");
                    self.retarget_lte(false);
                    return Some(Duration::from_millis(200));
                }
            }
        }

        // Fresh boots leave these unknown for a while.
        let (on_boot, broker) = self
            .wifi
            .shadow()
            .read(|s| (s.mqtt_on_boot, s.mqtt_broker_connected));
        if !on_boot.is_known() || !broker.is_known() {
            match self.start_op(SrsState::WaitingForShadowKnown) {
                OpState::Started => {
                    if !broker.is_known() {
                        debug!("mqtt state unknown, querying");
                        let _ = self.wifi.mqtt_state(Duration::from_millis(100)).await;
                    }
                    if !on_boot.is_known() {
                        warn!("mqtt on-boot state unknown, querying");
                        let _ = self.wifi.mqtt_boot_state(Duration::from_millis(150)).await;
                    }
                    return Some(Duration::from_millis(100));
                }
                OpState::StillGoing(_) => return Some(Duration::from_millis(100)),
                OpState::Failed => {
                    error!("modem state stayed unknown, fallback to LTE");
                    self.retarget_lte(false);
                    return Some(Duration::from_millis(200));
                }
            }
        }

        if !self.wifi.shadow().read(|s| s.ap_connected.is_true()) {
            match self.start_op(SrsState::WaitForAp) {
                OpState::Started => {
                    debug!("waiting for AP to connect");
                    return Some(Duration::from_millis(1_000));
                }
                OpState::StillGoing(left) => return Some(left),
                OpState::Failed => {
                    error!("modem never associated, fallback to LTE");
                    self.retarget_lte(false);
                    return Some(Duration::from_millis(200));
                }
            }
        }

        if !self.wifi.shadow().read(|s| s.mqtt_on_boot.is_true()) {
            match self.start_op(SrsState::EnablingBrokerOnBoot) {
                OpState::Started => {
                    debug!("enabling MQTT on boot");
                    if let Err(e) = self
                        .wifi
                        .set_mqtt_boot_state(true, Duration::from_millis(500))
                        .await
                    {
                        error!("'{}' enabling MQTT on boot, will retry", e);
                        self.note_op_error(&e);
                    }
                    return Some(Duration::from_millis(100));
                }
                OpState::StillGoing(_) => return Some(Duration::from_millis(100)),
                OpState::Failed => {
                    error!("could not enable MQTT on boot, fallback to LTE");
                    self.retarget_lte(false);
                    return Some(Duration::from_millis(200));
                }
            }
        }

        if !self.wifi.shadow().read(|s| s.mqtt_enabled.is_true()) {
            match self.start_op(SrsState::EnablingBroker) {
                OpState::Started => {
                    debug!("enabling MQTT");
                    if let Err(e) = self.wifi.set_mqtt_state(true, Duration::from_millis(500)).await {
                        error!("'{}' enabling MQTT, will retry", e);
                        self.note_op_error(&e);
                    }
                    return Some(Duration::from_millis(100));
                }
                OpState::StillGoing(_) => return Some(Duration::from_millis(100)),
                OpState::Failed => {
                    error!("could not enable MQTT, fallback to LTE");
                    self.retarget_lte(false);
                    return Some(Duration::from_millis(200));
                }
            }
        }

        if !self.wifi.shadow().read(|s| s.mqtt_broker_connected.is_true()) {
            match self.start_op(SrsState::WaitForBroker) {
                OpState::Started | OpState::StillGoing(_) => {
                    debug!("waiting for MQTT broker to connect");
                    return Some(Duration::from_millis(3_000));
                }
                OpState::Failed => {
                    error!("MQTT broker never connected, fallback to LTE");
                    self.retarget_lte(false);
                    return Some(Duration::from_millis(200));
                }
            }
        }

        if !self.wifi_in_right_sleep_mode() {
            match self.start_op(SrsState::SleepingWifi) {
                OpState::Started => {
                    debug!("parking wifi modem per sleep policy");
                    match self.sleep_wifi().await {
                        // Sleep may land later (the modem finishes broker
                        // work first); no error means it eventually will.
                        Ok(()) => return None,
                        Err(e) => {
                            error!("'{}' sleeping wifi modem, will retry", e);
                            self.note_op_error(&e);
                            return Some(Duration::from_millis(700));
                        }
                    }
                }
                OpState::StillGoing(_) => return Some(Duration::from_millis(600)),
                OpState::Failed => {
                    error!("could not sleep wifi modem, fallback to LTE");
                    self.retarget_lte(false);
                    return Some(Duration::from_millis(200));
                }
            }
        }
        None
    }

    /// Quiesce the Wi-Fi side: MQTT off, disassociated, parked per the
    /// sleep policy.
    async fn disable_wifi_side(&self) -> Option<Duration> {
        let snap = self.wifi.state();
        if snap.mqtt_enabled.is_false()
            && snap.mqtt_broker_connected.is_false()
            && self.wifi_in_right_sleep_mode()
        {
            return None;
        }
        if snap.powered_on.is_false() {
            // Off is quiesced enough.
            return None;
        }

        let _ = self.wifi.check_sleeping(true).await;

        if !self.wifi.shadow().read(|s| s.is_sleeping.is_false()) {
            match self.start_op(SrsState::WakingWifi) {
                OpState::Started => {
                    debug!("waking wifi modem to disconnect");
                    if let Err(e) = self.ensure_wifi_awake().await {
                        error!("'{}' waking wifi modem to disconnect, will retry", e);
                        self.note_op_error(&e);
                        return Some(Duration::from_millis(200));
                    }
                }
                OpState::StillGoing(_) => return Some(Duration::from_millis(100)),
                OpState::Failed => {
                    error!("wifi modem never woke to disconnect, resetting it");
                    self.wifi.reset().await;
                    return Some(Duration::from_millis(700));
                }
            }
        }

        if !self.wifi.shadow().read(|s| s.mqtt_enabled.is_false()) {
            // Not critical if the disassociation below lands; keep going.
            if let Err(e) = self.wifi.set_mqtt_state(false, Duration::from_secs(2)).await {
                error!("'{}' disabling wifi MQTT", e);
            }
        }

        if !self.wifi.shadow().read(|s| s.ap_connected.is_false()) {
            match self.start_op(SrsState::StopApProfileUse) {
                OpState::Started => {
                    if let Err(e) = self.wifi.disconnect_from_ap(Duration::from_secs(2)).await {
                        error!("'{}' disconnecting wifi", e);
                        self.note_op_error(&e);
                    }
                    return Some(Duration::from_millis(500));
                }
                OpState::StillGoing(_) => return Some(Duration::from_millis(500)),
                OpState::Failed => {
                    error!("modem kept its association, resetting it");
                    self.wifi.reset().await;
                    return Some(Duration::from_millis(700));
                }
            }
        }

        if !self.wifi_in_right_sleep_mode() {
            match self.start_op(SrsState::SleepingWifi) {
                OpState::Started => {
                    debug!("putting wifi modem to sleep");
                    match self.sleep_wifi().await {
                        Ok(()) => return None,
                        Err(e) => {
                            error!("'{}' sleeping wifi modem, will retry", e);
                            self.note_op_error(&e);
                            return Some(Duration::from_millis(700));
                        }
                    }
                }
                OpState::StillGoing(_) => return Some(Duration::from_millis(600)),
                OpState::Failed => {
                    error!("could not sleep wifi modem, turning it off");
                    self.wifi.set_power(false).await;
                    return None;
                }
            }
        }
        None
    }

    /// Bring the LTE side up: modem powered and ready for commands, MQTT
    /// enabled. LTE is usable once enabled; there is no wait for its
    /// broker here.
    async fn enable_lte_side(&self) -> Option<Duration> {
        // In erroneous cases Wi-Fi MQTT can still hold the cloud session;
        // release it before authorizing LTE.
        if self.get_active_mqtt_radio() == Radio::Wifi
            && self.wifi.shadow().read(|s| s.mqtt_broker_connected.is_true())
        {
            match self.start_op(SrsState::DisablingBroker) {
                OpState::Started => {
                    debug!("disabling wifi MQTT");
                    if self
                        .prepare(Radio::Wifi, false, Duration::from_secs(3))
                        .await
                        .is_err()
                    {
                        error!("failed to prepare wifi modem for MQTT disable");
                        return Some(Duration::from_millis(500));
                    }
                    if let Err(e) = self.wifi.set_mqtt_state(false, Duration::from_millis(500)).await {
                        error!("'{}' disabling wifi MQTT, will retry", e);
                    }
                    let _ = self.done(Radio::Wifi).await;
                    return Some(Duration::from_millis(500));
                }
                OpState::StillGoing(_) => return Some(Duration::from_millis(500)),
                OpState::Failed => {
                    debug!("wifi MQTT is taking too long to disable, restarting the modem");
                    self.wifi.reset().await;
                    return Some(Duration::from_millis(1_000));
                }
            }
        }

        if self.cell.is_powered() && self.cell.mqtt_enabled() && self.cell.lte_has_worked() {
            return None;
        }

        if !self.cell.is_powered() {
            match self.start_op(SrsState::WaitForLteReady) {
                OpState::Started => {
                    if let Err(e) = self.cell.power_on() {
                        error!("'{}' powering on cellular modem", e);
                        self.note_op_error(&e);
                        return Some(Duration::from_millis(500));
                    }
                    debug!("waiting for LTE to be ready for commands");
                    return Some(Duration::from_millis(500));
                }
                OpState::StillGoing(_) => return Some(Duration::from_millis(500)),
                OpState::Failed => {
                    error!("LTE never became ready for commands, hard resetting it");
                    self.hard_reset_cellular().await;
                    return Some(Duration::from_millis(1_000));
                }
            }
        }

        if !self.cell.mqtt_enabled() {
            match self.start_op(SrsState::EnablingLteMqtt) {
                OpState::Started => {
                    debug!("enabling LTE MQTT");
                    if let Err(e) = self.lte_set_mqtt_enable(true, Duration::from_secs(1)).await {
                        error!("'{}' enabling LTE MQTT, will retry", e);
                    }
                    return Some(Duration::from_millis(500));
                }
                OpState::StillGoing(_) => return Some(Duration::from_millis(500)),
                OpState::Failed => {
                    error!("LTE MQTT is taking too long to enable, hard resetting the modem");
                    self.hard_reset_cellular().await;
                    return Some(Duration::from_millis(200));
                }
            }
        }
        None
    }

    fn disable_lte_side(&self) {
        warn!("disabling LTE");
        if let Err(e) = self.cell.power_off() {
            error!("'{}' powering off cellular modem", e);
        }
    }

    /// Power-cycle the cellular modem at the rail level.
    async fn hard_reset_cellular(&self) {
        if let Err(e) = self.pmic.modem_power_off(true) {
            error!("'{}' powering off cellular modem", e);
        }
        Timer::after_secs(3).await;
        if let Err(e) = self.pmic.modem_power_on() {
            error!("'{}' powering on cellular modem", e);
        }
    }

    /// Flip the LTE MQTT client and wait for the status shadow to agree.
    pub(crate) async fn lte_set_mqtt_enable(&self, on: bool, timeout: Duration) -> Result<(), Error> {
        if on == self.cell.mqtt_enabled() {
            return Ok(());
        }
        debug!("changing LTE MQTT state to {}", on);
        if on {
            self.cell.start_mqtt()?;
        } else {
            self.cell.stop_mqtt()?;
        }
        let deadline = Instant::now() + timeout;
        while on != self.cell.mqtt_enabled() {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            Timer::after_millis(10).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budgets_match_design_rows() {
        assert_eq!(SrsState::WakingWifi.budget().timeout, Duration::from_millis(500));
        assert_eq!(SrsState::WakingWifi.budget().max_retries, 3);
        assert_eq!(SrsState::WaitForBroker.budget().timeout, Duration::from_secs(30));
        assert_eq!(SrsState::WaitForBroker.budget().max_retries, 1);
        assert_eq!(SrsState::SleepingWifi.budget().max_retries, 4);
    }

    #[test]
    fn every_state_has_a_description() {
        let states = [
            SrsState::Idle,
            SrsState::WaitingForShadowKnown,
            SrsState::WakingWifi,
            SrsState::SleepingWifi,
            SrsState::EnablingBrokerOnBoot,
            SrsState::EnablingBroker,
            SrsState::DisablingBroker,
            SrsState::WaitForAp,
            SrsState::WaitForBroker,
            SrsState::DisablingLteMqtt,
            SrsState::EnablingLteMqtt,
            SrsState::WaitForLteReady,
            SrsState::StopApProfileUse,
        ];
        for s in states {
            assert!(!s.describe().is_empty());
        }
    }
}

//! Shadow of the Wi-Fi modem's externally visible state.
//!
//! The shadow is written only by the driver (on decoded events or confirmed
//! commands) and read by everyone. Mutation and delta publication are a
//! single helper on [`StateStore`] so no code path can change a field
//! without the corresponding `da_state` event.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::Instant;
use heapless::{String, Vec};

use crate::error::Error;
use crate::fabric::{DaBits, DaEvent, DaValue, Fabric};
use crate::port::UICR_BACKUP_LEN;
use crate::types::{
    BackupStatus, MAX_SUB_TOPICS, MAX_TOPIC_LEN, OtaProgress, RSSI_NOT_CONNECTED, Tri, Version,
};

/// Last observed externally-visible state of the Wi-Fi modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaState {
    pub initialized: Tri,
    pub powered_on: Tri,
    pub ap_connected: Tri,
    pub ap_safe: Tri,
    pub ap_name: String<32>,
    pub ip_address: String<20>,
    pub ap_disconnect_reason: String<40>,
    pub dpm_mode: Tri,
    pub is_sleeping: Tri,
    pub mqtt_enabled: Tri,
    pub mqtt_on_boot: Tri,
    pub mqtt_broker_connected: Tri,
    pub mqtt_certs_installed: Tri,
    pub mqtt_client_id: String<17>,
    pub mqtt_sub_topics: Vec<String<MAX_TOPIC_LEN>, MAX_SUB_TOPICS>,
    pub mqtt_last_msg_time: Option<Instant>,
    pub ntp_server_set: Tri,
    pub dhcp_client_name_set: Tri,
    pub dhcp_client_name: String<32>,
    pub mac_set: Tri,
    pub xtal_set: Tri,
    pub onboarded: Tri,
    pub ap_profile_disabled: Tri,
    pub uicr_bu_status: BackupStatus,
    pub uicr_bu: [u8; UICR_BACKUP_LEN],
    pub ota_progress: OtaProgress,
    pub reboot_cnt: i32,
    pub version: Version,
    pub rssi: i8,
    pub rtc_wake_time: Option<Instant>,
    /// Last outbound command, for postmortem. Not published.
    pub last_cmd: String<40>,
}

impl Default for DaState {
    fn default() -> Self {
        Self {
            initialized: Tri::Unknown,
            powered_on: Tri::Unknown,
            ap_connected: Tri::Unknown,
            ap_safe: Tri::Unknown,
            ap_name: String::new(),
            ip_address: String::new(),
            ap_disconnect_reason: String::new(),
            dpm_mode: Tri::Unknown,
            is_sleeping: Tri::Unknown,
            mqtt_enabled: Tri::Unknown,
            mqtt_on_boot: Tri::Unknown,
            mqtt_broker_connected: Tri::Unknown,
            mqtt_certs_installed: Tri::Unknown,
            mqtt_client_id: String::new(),
            mqtt_sub_topics: Vec::new(),
            mqtt_last_msg_time: None,
            ntp_server_set: Tri::Unknown,
            dhcp_client_name_set: Tri::Unknown,
            dhcp_client_name: String::new(),
            mac_set: Tri::Unknown,
            xtal_set: Tri::Unknown,
            onboarded: Tri::Unknown,
            ap_profile_disabled: Tri::Unknown,
            uicr_bu_status: BackupStatus::Unknown,
            uicr_bu: [0; UICR_BACKUP_LEN],
            ota_progress: OtaProgress::None,
            reboot_cnt: 0,
            version: [0; 3],
            rssi: RSSI_NOT_CONNECTED,
            rtc_wake_time: None,
            last_cmd: String::new(),
        }
    }
}

/// Shadow plus its delta publisher.
pub struct StateStore<'p> {
    state: Mutex<CriticalSectionRawMutex, RefCell<DaState>>,
    fabric: &'p Fabric<'p>,
}

impl<'p> StateStore<'p> {
    pub fn new(fabric: &'p Fabric<'p>) -> Self {
        Self {
            state: Mutex::new(RefCell::new(DaState::default())),
            fabric,
        }
    }

    pub fn snapshot(&self) -> DaState {
        self.state.lock(|s| s.borrow().clone())
    }

    pub fn read<R>(&self, f: impl FnOnce(&DaState) -> R) -> R {
        self.state.lock(|s| f(&s.borrow()))
    }

    fn publish(&self, bits: DaBits, old: DaValue, new: DaValue) {
        self.fabric.publish_da(DaEvent {
            ts: Instant::now(),
            bits,
            old,
            new,
        });
    }

    /// Set one tri-state field, publishing the delta when it changes.
    pub fn set_tri(&self, bits: DaBits, field: fn(&mut DaState) -> &mut Tri, new: Tri) {
        let old = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let slot = field(&mut s);
            let old = *slot;
            *slot = new;
            old
        });
        if old != new {
            self.publish(bits, DaValue::Tri(old), DaValue::Tri(new));
        }
    }

    /// Set an integer field; `force` publishes even when unchanged.
    pub fn set_int(&self, bits: DaBits, field: fn(&mut DaState) -> &mut i32, new: i32, force: bool) {
        let old = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let slot = field(&mut s);
            let old = *slot;
            *slot = new;
            old
        });
        if old != new || force {
            self.publish(bits, DaValue::Int(old), DaValue::Int(new));
        }
    }

    pub fn set_rssi(&self, new: i8) {
        let old = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let old = s.rssi;
            s.rssi = new;
            old
        });
        if old != new {
            self.publish(DaBits::RSSI, DaValue::Int(old as i32), DaValue::Int(new as i32));
        }
    }

    pub fn set_timestamp(
        &self,
        bits: DaBits,
        field: fn(&mut DaState) -> &mut Option<Instant>,
        new: Instant,
    ) {
        let old = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let slot = field(&mut s);
            let old = *slot;
            *slot = Some(new);
            old
        });
        if old != Some(new) {
            self.publish(
                bits,
                old.map(DaValue::Ts).unwrap_or(DaValue::None),
                DaValue::Ts(new),
            );
        }
    }

    /// Set a bounded string field. The event carries no text; readers take
    /// the current value from the shadow.
    pub fn set_string<const N: usize>(
        &self,
        bits: DaBits,
        field: fn(&mut DaState) -> &mut String<N>,
        new: &str,
    ) {
        let changed = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let slot = field(&mut s);
            if slot.as_str() == new {
                return false;
            }
            slot.clear();
            let _ = slot.push_str(truncated(new, N));
            true
        });
        if changed {
            self.publish(bits, DaValue::None, DaValue::None);
        }
    }

    /// Set a bounded string field without an event, for fields whose change
    /// is announced through an accompanying tri-state delta.
    pub(crate) fn set_str_quiet<const N: usize>(
        &self,
        field: fn(&mut DaState) -> &mut String<N>,
        new: &str,
    ) {
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let slot = field(&mut s);
            slot.clear();
            let _ = slot.push_str(truncated(new, N));
        });
    }

    pub fn set_version(&self, new: Version) {
        let old = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let old = s.version;
            s.version = new;
            old
        });
        if old != new {
            self.publish(DaBits::VERSION, DaValue::Ver(old), DaValue::Ver(new));
        }
    }

    pub fn set_bu_status(&self, new: BackupStatus) {
        let old = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let old = s.uicr_bu_status;
            s.uicr_bu_status = new;
            old
        });
        if old != new {
            self.publish(DaBits::UICR_BU_STATUS, DaValue::Bu(old), DaValue::Bu(new));
        }
    }

    pub fn set_bu_blob(&self, blob: &[u8; UICR_BACKUP_LEN]) {
        self.state.lock(|s| s.borrow_mut().uicr_bu = *blob);
    }

    pub fn set_ota(&self, new: OtaProgress) {
        let old = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let old = s.ota_progress;
            s.ota_progress = new;
            old
        });
        if old != new {
            self.publish(DaBits::OTA_PROGRESS, DaValue::Ota(old), DaValue::Ota(new));
        }
    }

    /// Replace the subscription topic list, publishing when it changed.
    pub fn set_sub_topics(&self, topics: &[&str]) {
        let changed = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let same = s.mqtt_sub_topics.len() == topics.len()
                && s.mqtt_sub_topics.iter().zip(topics).all(|(a, b)| a.as_str() == *b);
            if same {
                return false;
            }
            s.mqtt_sub_topics.clear();
            for t in topics.iter().take(MAX_SUB_TOPICS) {
                let mut owned = String::new();
                let _ = owned.push_str(truncated(t, MAX_TOPIC_LEN));
                let _ = s.mqtt_sub_topics.push(owned);
            }
            true
        });
        if changed {
            self.publish(DaBits::MQTT_SUB_TOPICS, DaValue::None, DaValue::None);
        }
    }

    /// Record the last outbound command. Deliberately unpublished.
    pub fn set_last_cmd(&self, cmd: &str) {
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.last_cmd.clear();
            let _ = s.last_cmd.push_str(truncated(cmd, 40));
        });
    }

    /// Marker event: the modem restarted. Carried as a pulse, the shadow
    /// holds no corresponding field.
    pub fn pulse_restarted(&self) {
        self.publish(
            DaBits::DA_RESTARTED,
            DaValue::Tri(Tri::Unknown),
            DaValue::Tri(Tri::KnownTrue),
        );
    }

    /// Marker event: downlink-triggered wake reported by the modem.
    pub fn pulse_wake_unicast(&self) {
        self.publish(
            DaBits::WAKE_UNICAST,
            DaValue::Tri(Tri::Unknown),
            DaValue::Tri(Tri::KnownTrue),
        );
    }

    pub fn bump_reboot_cnt(&self) {
        let new = self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.reboot_cnt += 1;
            s.reboot_cnt
        });
        self.publish(
            DaBits::REBOOT_CNT,
            DaValue::Int(new - 1),
            DaValue::Int(new),
        );
    }

    /// Power transition bookkeeping. Powering down resets every dependent
    /// field to `Unknown`/`KnownFalse`, publishing the resulting deltas.
    pub fn set_powered(&self, on: bool) {
        self.set_tri(DaBits::POWERED_ON, |s| &mut s.powered_on, Tri::from(on));
        if on {
            return;
        }
        self.set_tri(DaBits::WIFI_INIT, |s| &mut s.initialized, Tri::Unknown);
        self.set_tri(DaBits::AP_CONNECT, |s| &mut s.ap_connected, Tri::KnownFalse);
        self.set_tri(DaBits::AP_SAFE, |s| &mut s.ap_safe, Tri::Unknown);
        self.set_tri(DaBits::DPM_MODE, |s| &mut s.dpm_mode, Tri::Unknown);
        self.set_tri(DaBits::IS_SLEEPING, |s| &mut s.is_sleeping, Tri::Unknown);
        self.set_tri(DaBits::MQTT_ENABLED, |s| &mut s.mqtt_enabled, Tri::Unknown);
        self.set_tri(DaBits::BOOT_MQTT_STATE, |s| &mut s.mqtt_on_boot, Tri::Unknown);
        self.set_tri(
            DaBits::MQTT_BROKER_CONNECT,
            |s| &mut s.mqtt_broker_connected,
            Tri::KnownFalse,
        );
        self.set_tri(DaBits::NTP_SERVER_SET, |s| &mut s.ntp_server_set, Tri::Unknown);
        self.set_tri(
            DaBits::DHCP_CLIENT_NAME_SET,
            |s| &mut s.dhcp_client_name_set,
            Tri::Unknown,
        );
        self.set_tri(DaBits::MAC_SET, |s| &mut s.mac_set, Tri::Unknown);
        self.set_tri(DaBits::XTAL_SET, |s| &mut s.xtal_set, Tri::Unknown);
        self.set_tri(
            DaBits::AP_PROFILE_USE,
            |s| &mut s.ap_profile_disabled,
            Tri::Unknown,
        );
        self.set_string(DaBits::AP_CONNECT, |s| &mut s.ap_name, "");
        self.set_string(DaBits::AP_CONNECT, |s| &mut s.ip_address, "");
        self.set_rssi(RSSI_NOT_CONNECTED);
    }

    /// Sends are rejected while the shadow says the modem is off or asleep.
    pub fn guard_powered_awake(&self) -> Result<(), Error> {
        self.read(|s| {
            if s.powered_on.is_false() {
                return Err(Error::NotPowered);
            }
            if s.is_sleeping.is_true() {
                return Err(Error::Asleep);
            }
            Ok(())
        })
    }

    /// Temporarily override `is_sleeping` for probes that must talk to a
    /// possibly-sleeping modem. Returns the prior value.
    pub fn override_sleeping(&self, new: Tri) -> Tri {
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            let old = s.is_sleeping;
            s.is_sleeping = new;
            old
        })
    }
}

/// Truncate to at most `max` bytes without splitting a UTF-8 character.
fn truncated(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

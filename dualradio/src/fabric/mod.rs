//! Typed publish/subscribe fabric and the reference-counted message pool.
//!
//! Channels carry state deltas between the Wi-Fi driver, the radio manager
//! and the application. Delivery within one channel is in publication order;
//! listeners must not block, so anything slow is deferred to the
//! subscriber's own task.

use core::ops::{BitOr, BitOrAssign};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::pubsub::{PubSubChannel, Subscriber};
use embassy_time::Instant;
use heapless::String;
use static_cell::StaticCell;

use crate::port::{OtaStatus, Pmic};
use crate::types::{BackupStatus, OtaProgress, Tri, Version};

mod pool;

pub use pool::{MSG_CAP, MsgPool, MsgRef, POOL_SLOTS, PoolExhausted};

/// Bitmask naming the shadow fields touched by one [`DaEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DaBits(pub u32);

impl DaBits {
    pub const WIFI_INIT: DaBits = DaBits(1 << 0);
    pub const AP_CONNECT: DaBits = DaBits(1 << 1);
    pub const DPM_MODE: DaBits = DaBits(1 << 2);
    pub const IS_SLEEPING: DaBits = DaBits(1 << 3);
    pub const MQTT_BROKER_CONNECT: DaBits = DaBits(1 << 4);
    pub const MQTT_MSG_SENT: DaBits = DaBits(1 << 5);
    pub const MQTT_CERTS: DaBits = DaBits(1 << 6);
    pub const NTP_SERVER_SET: DaBits = DaBits(1 << 7);
    pub const DHCP_CLIENT_NAME_SET: DaBits = DaBits(1 << 8);
    pub const MQTT_SUB_TOPICS: DaBits = DaBits(1 << 9);
    pub const UICR_BU_STATUS: DaBits = DaBits(1 << 11);
    pub const MAC_SET: DaBits = DaBits(1 << 12);
    pub const XTAL_SET: DaBits = DaBits(1 << 13);
    pub const ONBOARDED: DaBits = DaBits(1 << 14);
    pub const BOOT_MQTT_STATE: DaBits = DaBits(1 << 15);
    pub const DA_RESTARTED: DaBits = DaBits(1 << 16);
    pub const HTTP_COMPLETE: DaBits = DaBits(1 << 17);
    pub const AP_SAFE: DaBits = DaBits(1 << 18);
    pub const OTA_PROGRESS: DaBits = DaBits(1 << 19);
    pub const REBOOT_CNT: DaBits = DaBits(1 << 20);
    pub const VERSION: DaBits = DaBits(1 << 21);
    pub const RTC_WAKE_TIME: DaBits = DaBits(1 << 22);
    pub const MQTT_ENABLED: DaBits = DaBits(1 << 23);
    pub const AP_PROFILE_USE: DaBits = DaBits(1 << 24);
    pub const POWERED_ON: DaBits = DaBits(1 << 25);
    pub const DISCONNECT_REASON: DaBits = DaBits(1 << 26);
    pub const RSSI: DaBits = DaBits(1 << 27);
    /// The modem reported a downlink-triggered wake (`+INIT:WAKEUP,UC`).
    pub const WAKE_UNICAST: DaBits = DaBits(1 << 28);

    pub const fn contains(self, other: DaBits) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for DaBits {
    type Output = DaBits;
    fn bitor(self, rhs: DaBits) -> DaBits {
        DaBits(self.0 | rhs.0)
    }
}

impl BitOrAssign for DaBits {
    fn bitor_assign(&mut self, rhs: DaBits) {
        self.0 |= rhs.0;
    }
}

/// Old/new value carried by a [`DaEvent`], sized for any single field.
///
/// String-typed fields publish `None`; subscribers read the current text
/// from the shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DaValue {
    #[default]
    None,
    Tri(Tri),
    Int(i32),
    Ts(Instant),
    Ver(Version),
    Bu(BackupStatus),
    Ota(OtaProgress),
}

/// One shadow-state delta on the `da_state` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DaEvent {
    pub ts: Instant,
    pub bits: DaBits,
    pub old: DaValue,
    pub new: DaValue,
}

/// Status bits of the cellular modem shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LteStatus(pub u32);

impl LteStatus {
    pub const LTE_CONNECTED: LteStatus = LteStatus(1 << 0);
    /// LTE has been connected at some point since power-up.
    pub const LTE_WORKING: LteStatus = LteStatus(1 << 1);
    pub const MQTT_ENABLED: LteStatus = LteStatus(1 << 2);
    pub const MQTT_CONNECTED: LteStatus = LteStatus(1 << 3);

    pub const fn get(self, flag: LteStatus) -> bool {
        self.0 & flag.0 != 0
    }

    pub const fn with(self, flag: LteStatus, on: bool) -> LteStatus {
        if on { LteStatus(self.0 | flag.0) } else { LteStatus(self.0 & !flag.0) }
    }
}

impl BitOr for LteStatus {
    type Output = LteStatus;
    fn bitor(self, rhs: LteStatus) -> LteStatus {
        LteStatus(self.0 | rhs.0)
    }
}

/// Cellular status snapshot plus the bits that changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LteStatusUpdate {
    pub status: LteStatus,
    pub changed: LteStatus,
}

/// A cloud-to-device MQTT delivery.
///
/// The payload stays in the pool; `handle` is the retained reference and
/// `payload_off..payload_off + payload_len` locates the body inside it.
#[derive(Clone)]
pub struct CloudMessage<'p> {
    pub topic: String<64>,
    /// Message type parsed from the topic (`messages/<id>/<type>/…`).
    pub msg_type: u16,
    pub payload_off: u16,
    pub payload_len: u16,
    pub handle: MsgRef<'p>,
}

impl<'p> CloudMessage<'p> {
    /// Borrow the payload bytes.
    pub fn with_payload<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.handle.with_bytes(|b| {
            let start = (self.payload_off as usize).min(b.len());
            let end = (start + self.payload_len as usize).min(b.len());
            f(&b[start..end])
        })
    }
}

/// Shutdown/reboot requests on the `power_state` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerCommand {
    Reboot,
    Shutdown,
}

const DA_CAP: usize = 16;
const DA_SUBS: usize = 4;
const DA_PUBS: usize = 2;

pub type DaSubscriber<'a> = Subscriber<'a, CriticalSectionRawMutex, DaEvent, DA_CAP, DA_SUBS, DA_PUBS>;
pub type LteSubscriber<'a> = Subscriber<'a, CriticalSectionRawMutex, LteStatusUpdate, 4, 3, 2>;
pub type CloudSubscriber<'a, 'p> = Subscriber<'a, CriticalSectionRawMutex, CloudMessage<'p>, 4, 2, 2>;
pub type BoolSubscriber<'a> = Subscriber<'a, CriticalSectionRawMutex, bool, 2, 2, 2>;
pub type PowerSubscriber<'a> = Subscriber<'a, CriticalSectionRawMutex, PowerCommand, 2, 2, 4>;
pub type OtaSubscriber<'a> = Subscriber<'a, CriticalSectionRawMutex, OtaStatus, 4, 2, 2>;

/// The typed channel set connecting driver, manager and application.
pub struct Fabric<'p> {
    da_state: PubSubChannel<CriticalSectionRawMutex, DaEvent, DA_CAP, DA_SUBS, DA_PUBS>,
    lte_status: PubSubChannel<CriticalSectionRawMutex, LteStatusUpdate, 4, 3, 2>,
    mqtt_cloud_to_device: PubSubChannel<CriticalSectionRawMutex, CloudMessage<'p>, 4, 2, 2>,
    usb_power: PubSubChannel<CriticalSectionRawMutex, bool, 2, 2, 2>,
    bt_conn: PubSubChannel<CriticalSectionRawMutex, bool, 2, 2, 2>,
    power: PubSubChannel<CriticalSectionRawMutex, PowerCommand, 2, 2, 4>,
    fota: PubSubChannel<CriticalSectionRawMutex, OtaStatus, 4, 2, 2>,
}

impl<'p> Fabric<'p> {
    pub const fn new() -> Self {
        Self {
            da_state: PubSubChannel::new(),
            lte_status: PubSubChannel::new(),
            mqtt_cloud_to_device: PubSubChannel::new(),
            usb_power: PubSubChannel::new(),
            bt_conn: PubSubChannel::new(),
            power: PubSubChannel::new(),
            fota: PubSubChannel::new(),
        }
    }

    /// Publish a shadow delta. Non-blocking; the oldest queued event is
    /// evicted if a subscriber has fallen behind.
    pub fn publish_da(&self, evt: DaEvent) {
        self.da_state.immediate_publisher().publish_immediate(evt);
    }

    pub fn publish_lte(&self, update: LteStatusUpdate) {
        self.lte_status.immediate_publisher().publish_immediate(update);
    }

    pub fn publish_cloud(&self, msg: CloudMessage<'p>) {
        self.mqtt_cloud_to_device.immediate_publisher().publish_immediate(msg);
    }

    pub fn publish_usb_power(&self, connected: bool) {
        self.usb_power.immediate_publisher().publish_immediate(connected);
    }

    pub fn publish_bt_conn(&self, connected: bool) {
        self.bt_conn.immediate_publisher().publish_immediate(connected);
    }

    pub fn publish_power(&self, cmd: PowerCommand) {
        self.power.immediate_publisher().publish_immediate(cmd);
    }

    pub fn publish_fota(&self, status: OtaStatus) {
        self.fota.immediate_publisher().publish_immediate(status);
    }

    /// Subscribe to shadow deltas.
    ///
    /// # Panics
    ///
    /// Panics when all subscriber slots are taken.
    pub fn da_events(&self) -> DaSubscriber<'_> {
        unwrap!(self.da_state.subscriber())
    }

    pub fn lte_events(&self) -> LteSubscriber<'_> {
        unwrap!(self.lte_status.subscriber())
    }

    pub fn cloud_messages(&self) -> CloudSubscriber<'_, 'p> {
        unwrap!(self.mqtt_cloud_to_device.subscriber())
    }

    pub fn usb_power_events(&self) -> BoolSubscriber<'_> {
        unwrap!(self.usb_power.subscriber())
    }

    pub fn bt_conn_events(&self) -> BoolSubscriber<'_> {
        unwrap!(self.bt_conn.subscriber())
    }

    pub fn power_events(&self) -> PowerSubscriber<'_> {
        unwrap!(self.power.subscriber())
    }

    pub fn fota_events(&self) -> OtaSubscriber<'_> {
        unwrap!(self.fota.subscriber())
    }
}

impl Fabric<'static> {
    /// The singleton fabric for firmware use. Tests build their own with
    /// [`Fabric::new`].
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub fn take_static() -> &'static Fabric<'static> {
        static FABRIC: StaticCell<Fabric<'static>> = StaticCell::new();
        FABRIC.init(Fabric::new())
    }
}

/// Shutdown listener: reacts to `power_state` commands with a PMIC reboot.
pub async fn run_shutdown(fabric: &Fabric<'_>, pmic: &dyn Pmic) -> ! {
    let mut events = fabric.power_events();
    loop {
        match events.next_message_pure().await {
            PowerCommand::Reboot => {
                warn!("power channel: reboot requested");
                pmic.reboot("power channel");
            }
            PowerCommand::Shutdown => {
                warn!("power channel: shutdown requested");
                pmic.reboot("shutdown");
            }
        }
    }
}

/// Diagnostic subscriber logging interesting shadow transitions.
pub async fn run_watcher(fabric: &Fabric<'_>) -> ! {
    let mut events = fabric.da_events();
    loop {
        let evt = events.next_message_pure().await;
        if evt.bits.contains(DaBits::AP_CONNECT) {
            debug!("da_state: ap_connected -> {:?}", evt.new);
        }
        if evt.bits.contains(DaBits::MQTT_BROKER_CONNECT) {
            debug!("da_state: mqtt_broker_connected -> {:?}", evt.new);
        }
        if evt.bits.contains(DaBits::IS_SLEEPING) {
            trace!("da_state: is_sleeping -> {:?}", evt.new);
        }
        if evt.bits.contains(DaBits::DPM_MODE) {
            trace!("da_state: dpm_mode -> {:?}", evt.new);
        }
        if evt.bits.contains(DaBits::DA_RESTARTED) {
            info!("da_state: modem restarted");
        }
        if evt.bits.contains(DaBits::OTA_PROGRESS) {
            debug!("da_state: ota {:?}", evt.new);
        }
        if evt.bits.contains(DaBits::VERSION) {
            info!("da_state: version changed {:?}", evt.new);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_ops() {
        let b = DaBits::AP_CONNECT | DaBits::RSSI;
        assert!(b.contains(DaBits::AP_CONNECT));
        assert!(b.contains(DaBits::RSSI));
        assert!(!b.contains(DaBits::DPM_MODE));
    }

    #[test]
    fn lte_status_flags() {
        let s = LteStatus::default()
            .with(LteStatus::LTE_CONNECTED, true)
            .with(LteStatus::MQTT_CONNECTED, true);
        assert!(s.get(LteStatus::LTE_CONNECTED));
        assert!(s.get(LteStatus::MQTT_CONNECTED));
        assert!(!s.get(LteStatus::MQTT_ENABLED));
        let s = s.with(LteStatus::MQTT_CONNECTED, false);
        assert!(!s.get(LteStatus::MQTT_CONNECTED));
    }

    #[test]
    fn da_channel_delivers_in_order() {
        let fabric = Fabric::new();
        let mut sub = fabric.da_events();
        for n in 0..3 {
            fabric.publish_da(DaEvent {
                ts: Instant::from_millis(n),
                bits: DaBits::RSSI,
                old: DaValue::Int(0),
                new: DaValue::Int(n as i32),
            });
        }
        for n in 0..3 {
            let evt = sub.try_next_message_pure().expect("event queued");
            assert_eq!(evt.new, DaValue::Int(n));
        }
        assert!(sub.try_next_message_pure().is_none());
    }

    #[test]
    fn cloud_message_payload_window() {
        use embassy_time::Duration;
        let pool = MsgPool::new(Duration::from_secs(2));
        let raw = b"\r\n+NWMQMSG:Hello world!,messages/1_DT00/5/x,12\r\n";
        let handle = pool.alloc(raw, true, Instant::from_millis(0)).unwrap();
        let msg = CloudMessage {
            topic: String::try_from("messages/1_DT00/5/x").unwrap(),
            msg_type: 5,
            payload_off: 11,
            payload_len: 12,
            handle,
        };
        msg.with_payload(|p| assert_eq!(p, b"Hello world!"));
    }
}

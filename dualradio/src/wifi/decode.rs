//! Inbound-event decoder.
//!
//! Runs on the ingest path for every received frame, before the frame is
//! queued for `wait_for` consumers. Updates the shadow (publishing deltas)
//! and defers anything that needs the modem mutex to the driver work queue.
//! This path must never take the modem mutex itself.

use embassy_time::Instant;

use crate::fabric::{CloudMessage, DaBits, MSG_CAP, MsgRef};
use crate::port::{WifiCtrl, WifiLink};
use crate::types::{RSSI_NOT_CONNECTED, Tri, Version};

use super::{DriverWork, WifiAt, ap};

pub(crate) fn process<'p, L: WifiLink, C: WifiCtrl>(drv: &WifiAt<'p, L, C>, msg: &MsgRef<'p>) {
    if !msg.incoming() {
        return;
    }
    // Handlers run on a copy so publishing (which may drop evicted pool
    // handles) cannot re-enter the pool lock.
    let mut buf = [0u8; MSG_CAP];
    let len = msg.copy_to(&mut buf);
    let Ok(text) = core::str::from_utf8(&buf[..len]) else {
        warn!("dropping non-utf8 frame from modem");
        return;
    };
    dispatch(drv, msg, text);
}

fn dispatch<'p, L: WifiLink, C: WifiCtrl>(drv: &WifiAt<'p, L, C>, msg: &MsgRef<'p>, text: &str) {
    let shadow = drv.shadow();

    if let Some(pos) = text.find("\r\n+INIT:") {
        if drv.uicr().shipping_flag() || !drv.uicr().in_factory() {
            handle_init(drv, &text[pos + 8..]);
        }
    } else if text.contains("\r\n+WFJAP:") {
        if let Some(pos) = text.find("\r\n+WFJAP:1") {
            handle_ap_connected(drv, &text[pos..]);
        }
        if text.contains("\r\n+WFJAP:0") {
            handle_ap_disconnected(drv, text);
        }
    } else if text.contains("\r\n+WFDAP") {
        handle_ap_disconnected(drv, text);
    } else if text.contains("\r\n+DPM") {
        handle_dpm(drv, text);
    } else if text.contains("\r\n+TIME") {
        // Wall-clock sync is owned by the platform layer; nothing to shadow.
        trace!("modem reported time");
    } else if let Some(pos) = text.find("\r\n+RSSI:") {
        let rest = &text[pos + 8..];
        let rssi = parse_int(rest).map(|v| v.clamp(-128, 127) as i8).unwrap_or(RSSI_NOT_CONNECTED);
        shadow.set_rssi(rssi);
    } else if text.contains("\r\n+NWMQCL:1") {
        drv.queue_work(DriverWork::QueryTime);
        shadow.set_tri(DaBits::MQTT_ENABLED, |s| &mut s.mqtt_enabled, Tri::KnownTrue);
        shadow.set_tri(
            DaBits::MQTT_BROKER_CONNECT,
            |s| &mut s.mqtt_broker_connected,
            Tri::KnownTrue,
        );
    } else if text.contains("\r\n+NWMQCL:0") {
        // Broker not connected; says nothing about the enable state.
        shadow.set_tri(
            DaBits::MQTT_BROKER_CONNECT,
            |s| &mut s.mqtt_broker_connected,
            Tri::KnownFalse,
        );
    } else if text.contains("\r\n+NWMQMSGSND") {
        shadow.set_timestamp(DaBits::MQTT_MSG_SENT, |s| &mut s.mqtt_last_msg_time, Instant::now());
        drv.queue_work(DriverWork::QueryTime);
    } else if let Some(pos) = text.find("\r\n+NWMQTS:") {
        handle_sub_topics(drv, &text[pos + 10..]);
    } else if let Some(pos) = text.find("\r\n+NWCCRT:") {
        let installed = parse_int(&text[pos + 10..]).map(|f| f & 0x07 != 0).unwrap_or(false);
        shadow.set_tri(
            DaBits::MQTT_CERTS,
            |s| &mut s.mqtt_certs_installed,
            Tri::from(installed),
        );
    } else if let Some(pos) = text.find("\r\n+NWMQMSG:") {
        handle_cloud_message(drv, msg, text, pos);
        drv.queue_work(DriverWork::QueryTime);
    } else if let Some(pos) = text.find("\r\n+NWMQAUTO:") {
        let on = parse_int(&text[pos + 12..]).unwrap_or(0) == 1;
        shadow.set_tri(DaBits::BOOT_MQTT_STATE, |s| &mut s.mqtt_on_boot, Tri::from(on));
    } else if let Some(pos) = text.find("\r\n+WFDIS:") {
        let disabled = text.as_bytes().get(pos + 9) == Some(&b'1');
        shadow.set_tri(
            DaBits::AP_PROFILE_USE,
            |s| &mut s.ap_profile_disabled,
            Tri::from(disabled),
        );
    } else if let Some(pos) = text.find("\r\n+NWHTCSTATUS:") {
        let code = parse_int(&text[pos + 15..]).unwrap_or(-1);
        drv.flags.lock(|f| f.borrow_mut().http_result = Some(code));
    } else if text.contains("\r\n+NWHTCDATA:") {
        drv.flags.lock(|f| f.borrow_mut().http_bytes += msg.len() as u64);
    } else if let Some(pos) = text.find("\r\n+NWOTADWSTART:") {
        let code = &text[pos + 16..];
        let code = &code[..code.len().min(4)];
        let code = code.trim_end_matches(['\r', '\n']);
        drv.flags.lock(|f| {
            let mut f = f.borrow_mut();
            f.ota_start_result = heapless::String::try_from(code).ok();
        });
    } else if text.contains("\r\n+SSIDLIST:") {
        ap::handle_ssid_list(drv, text);
    } else if let Some(pos) = text.find(VER_PREFIX) {
        handle_version(drv, &text[pos + VER_PREFIX.len()..]);
    }
}

const VER_PREFIX: &str = "\r\n+VER:FRTOS-GEN01-01-TDEVER_";

fn handle_init<L: WifiLink, C: WifiCtrl>(drv: &WifiAt<'_, L, C>, subtype: &str) {
    let shadow = drv.shadow();

    if subtype.starts_with("DONE") {
        shadow.set_tri(DaBits::WIFI_INIT, |s| &mut s.initialized, Tri::KnownTrue);

        if let Some(pos) = subtype.find(",DPM=") {
            let tri = match subtype.as_bytes().get(pos + 5) {
                Some(b'0') => Tri::KnownFalse,
                Some(b'1') => Tri::KnownTrue,
                _ => Tri::Unknown,
            };
            shadow.set_tri(DaBits::DPM_MODE, |s| &mut s.dpm_mode, tri);
        }

        let awaiting_ota_reboot = drv.ota.lock(|o| o.borrow().awaiting_reboot());
        let rebooting = drv.flags.lock(|f| f.borrow().rebooting);
        if !awaiting_ota_reboot && !rebooting {
            // Not the power-on boot; the modem pings INIT:DONE at other
            // times too.
            shadow.set_tri(DaBits::IS_SLEEPING, |s| &mut s.is_sleeping, Tri::KnownFalse);
            return;
        }
        drv.flags.lock(|f| f.borrow_mut().rebooting = false);

        drv.queue_work(DriverWork::BootInit);
        shadow.pulse_restarted();
        shadow.bump_reboot_cnt();

        // A restart means we are no longer associated.
        remember_last_ap(drv);
        shadow.set_str_quiet(|s| &mut s.ap_name, "");
        shadow.set_str_quiet(|s| &mut s.ip_address, "");
        shadow.set_tri(DaBits::AP_CONNECT, |s| &mut s.ap_connected, Tri::KnownFalse);
        shadow.set_tri(DaBits::AP_SAFE, |s| &mut s.ap_safe, Tri::Unknown);
        shadow.set_tri(DaBits::IS_SLEEPING, |s| &mut s.is_sleeping, Tri::KnownFalse);
        shadow.set_tri(
            DaBits::MQTT_BROKER_CONNECT,
            |s| &mut s.mqtt_broker_connected,
            Tri::KnownFalse,
        );
    } else if let Some(waketype) = subtype.strip_prefix("WAKEUP,") {
        drv.queue_work(DriverWork::WakeHandshake);
        shadow.set_tri(DaBits::DPM_MODE, |s| &mut s.dpm_mode, Tri::KnownTrue);

        // No message is sent when the modem goes back to sleep, so the
        // sleeping flag is left alone here; whoever holds it awake updates
        // the shadow.
        if waketype.starts_with("DEAUTH") || waketype.starts_with("NOBCN") {
            remember_last_ap(drv);
            drv.shadow().set_str_quiet(|s| &mut s.ap_name, "");
            drv.shadow().set_str_quiet(|s| &mut s.ip_address, "");
            shadow.set_tri(DaBits::AP_CONNECT, |s| &mut s.ap_connected, Tri::KnownFalse);
            shadow.set_tri(DaBits::AP_SAFE, |s| &mut s.ap_safe, Tri::Unknown);
            shadow.set_tri(
                DaBits::MQTT_BROKER_CONNECT,
                |s| &mut s.mqtt_broker_connected,
                Tri::KnownFalse,
            );
        }
    } else {
        error!("unknown modem init subtype");
    }
}

/// `+WFJAP:1,'<ssid>',<ip>`
fn handle_ap_connected<L: WifiLink, C: WifiCtrl>(drv: &WifiAt<'_, L, C>, text: &str) {
    let shadow = drv.shadow();
    let Some(q1) = text.find('\'') else {
        error!("missing AP name quote in +WFJAP:1");
        return;
    };
    let rest = &text[q1 + 1..];
    let Some(q2) = rest.find('\'') else {
        error!("missing closing AP name quote in +WFJAP:1");
        return;
    };
    let ssid = &rest[..q2];
    let after = &rest[q2 + 1..];
    let ip_text = after.strip_prefix(',').unwrap_or(after);
    let ip_len = ip_text
        .bytes()
        .take_while(|b| b.is_ascii_digit() || *b == b'.')
        .count();
    if !(8..=15).contains(&ip_len) {
        error!("IP address size is incorrect in +WFJAP:1");
        return;
    }
    let ip = &ip_text[..ip_len];

    shadow.set_str_quiet(|s| &mut s.ap_name, ssid);
    shadow.set_str_quiet(|s| &mut s.ip_address, ip);
    shadow.set_tri(DaBits::AP_CONNECT, |s| &mut s.ap_connected, Tri::KnownTrue);

    // Safe-zone flag comes from the saved-SSID store when we know the AP.
    let safe = drv.ssids.lock(|c| {
        c.borrow()
            .find_saved(ssid)
            .map(|idx| c.borrow().saved_safe(idx))
    });
    match safe {
        Some(true) => shadow.set_tri(DaBits::AP_SAFE, |s| &mut s.ap_safe, Tri::KnownTrue),
        _ => shadow.set_tri(DaBits::AP_SAFE, |s| &mut s.ap_safe, Tri::KnownFalse),
    }
}

/// `+WFDAP`, `+WFJAP:0,NOT_FOUND`, `+WFJAP:0,TIMEOUT`
fn handle_ap_disconnected<L: WifiLink, C: WifiCtrl>(drv: &WifiAt<'_, L, C>, text: &str) {
    let shadow = drv.shadow();

    // The attempted credentials did not stick; forget them.
    drv.ssids.lock(|c| c.borrow_mut().unstage());

    let reason = text
        .find("\r\n+WFDAP:0")
        .or_else(|| text.find("\r\n+WFJAP:0"))
        .map(|pos| &text[pos + 10..])
        .map(|r| r.trim_matches(|c| c == ',' || c == '\r' || c == '\n'))
        .filter(|r| !r.is_empty())
        .unwrap_or("no reason given");
    shadow.set_string(DaBits::DISCONNECT_REASON, |s| &mut s.ap_disconnect_reason, reason);

    // Disabling the stored AP profile needs the modem mutex; defer it.
    drv.queue_work(DriverWork::ApDisconnected);

    shadow.set_tri(DaBits::IS_SLEEPING, |s| &mut s.is_sleeping, Tri::KnownFalse);
    remember_last_ap(drv);
    shadow.set_str_quiet(|s| &mut s.ap_name, "");
    shadow.set_str_quiet(|s| &mut s.ip_address, "");
    shadow.set_tri(DaBits::AP_CONNECT, |s| &mut s.ap_connected, Tri::KnownFalse);
    shadow.set_tri(DaBits::AP_SAFE, |s| &mut s.ap_safe, Tri::KnownFalse);
    shadow.set_rssi(RSSI_NOT_CONNECTED);
}

fn handle_dpm<L: WifiLink, C: WifiCtrl>(drv: &WifiAt<'_, L, C>, text: &str) {
    let shadow = drv.shadow();
    if text.contains("\r\n+DPM:1") {
        shadow.set_tri(DaBits::DPM_MODE, |s| &mut s.dpm_mode, Tri::KnownTrue);
    } else if text.contains("\r\n+DPM:0") {
        shadow.set_tri(DaBits::DPM_MODE, |s| &mut s.dpm_mode, Tri::KnownFalse);
    } else if text.contains("\r\n+DPM_ABNORM_SLEEP") {
        debug!("modem reported abnormal sleep");
        shadow.set_tri(DaBits::DPM_MODE, |s| &mut s.dpm_mode, Tri::KnownTrue);
        shadow.set_tri(DaBits::IS_SLEEPING, |s| &mut s.is_sleeping, Tri::KnownTrue);
    }
}

/// `+NWMQTS:<n>,"t1","t2"…`
fn handle_sub_topics<L: WifiLink, C: WifiCtrl>(drv: &WifiAt<'_, L, C>, rest: &str) {
    let Some(count) = parse_int(rest) else {
        error!("malformed +NWMQTS count");
        return;
    };
    if count as usize > crate::types::MAX_SUB_TOPICS {
        error!("modem sent more MQTT sub topics than expected");
        return;
    }
    let mut topics: heapless::Vec<&str, { crate::types::MAX_SUB_TOPICS }> = heapless::Vec::new();
    let mut cursor = rest;
    for _ in 0..count {
        let Some(q1) = cursor.find('"') else {
            error!("missing topic quote in +NWMQTS");
            return;
        };
        let body = &cursor[q1 + 1..];
        let Some(q2) = body.find('"') else {
            error!("missing closing topic quote in +NWMQTS");
            return;
        };
        let _ = topics.push(&body[..q2]);
        cursor = &body[q2 + 1..];
    }
    drv.shadow().set_sub_topics(&topics);
}

/// `+NWMQMSG:<payload>,<topic>,<len>`
fn handle_cloud_message<'p, L: WifiLink, C: WifiCtrl>(
    drv: &WifiAt<'p, L, C>,
    msg: &MsgRef<'p>,
    text: &str,
    prefix_pos: usize,
) {
    const PREFIX: &str = "\r\n+NWMQMSG:";

    // The payload may itself contain commas, so the length and topic are
    // found by scanning from the end.
    let bytes = text.as_bytes();
    let mut commas = [0usize; 2];
    let mut found = 0;
    for i in (0..bytes.len()).rev() {
        if bytes[i] == b',' {
            commas[found] = i;
            found += 1;
            if found == 2 {
                break;
            }
        }
    }
    if found < 2 {
        error!("cannot find length and topic in +NWMQMSG");
        return;
    }
    let len_text = &text[commas[0] + 1..];
    let Some(declared) = parse_int(len_text) else {
        error!("bad length in +NWMQMSG");
        return;
    };
    if declared < 0 || declared as usize > msg.len() {
        // Declared length beyond the received bytes: reject, do not retain.
        error!("MQTT RX message length is longer than the message");
        return;
    }
    let topic = &text[commas[1] + 1..commas[0]];
    let Some(type_text) = topic.strip_prefix("messages/").and_then(|t| t.split('/').nth(1)) else {
        error!("MQTT RX topic has no message type");
        return;
    };
    let msg_type = parse_int(type_text).unwrap_or(0).clamp(0, u16::MAX as i32) as u16;

    let mut owned_topic = heapless::String::<64>::new();
    let _ = owned_topic.push_str(&topic[..topic.len().min(64)]);

    drv.fabric().publish_cloud(CloudMessage {
        topic: owned_topic,
        msg_type,
        payload_off: (prefix_pos + PREFIX.len()) as u16,
        payload_len: declared as u16,
        handle: msg.clone(),
    });
}

/// `+VER:FRTOS-GEN01-01-TDEVER_ABC-YYMMDD`
fn handle_version<L: WifiLink, C: WifiCtrl>(drv: &WifiAt<'_, L, C>, rest: &str) {
    let b = rest.as_bytes();
    if b.len() < 3 || !b[..3].iter().all(|c| c.is_ascii_digit()) {
        error!("unparseable modem version");
        return;
    }
    let ver: Version = [b[0] - b'0', b[1] - b'0', b[2] - b'0'];
    drv.shadow().set_version(ver);
}

fn remember_last_ap<L: WifiLink, C: WifiCtrl>(drv: &WifiAt<'_, L, C>) {
    let (connected, name) = drv.shadow().read(|s| (s.ap_connected, s.ap_name.clone()));
    if connected.is_true() && !name.is_empty() {
        drv.ssids.lock(|c| c.borrow_mut().remember_last_ap(name.as_str()));
    }
}

/// Parse a leading (possibly signed) decimal integer, ignoring leading
/// whitespace and stopping at the first non-digit.
pub(crate) fn parse_int(text: &str) -> Option<i32> {
    let text = text.trim_start();
    let (neg, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let end = digits.bytes().take_while(|b| b.is_ascii_digit()).count();
    if end == 0 {
        return None;
    }
    let value: i32 = digits[..end].parse().ok()?;
    Some(if neg { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::super::WifiAt;
    use super::*;
    use crate::config::Config;
    use crate::fabric::{DaBits, Fabric, MsgPool};
    use embassy_time::Duration;

    fn setup() -> (
        &'static MsgPool,
        &'static Fabric<'static>,
        WifiAt<'static, &'static FakeLink, FakeCtrl>,
    ) {
        let pool = Box::leak(Box::new(MsgPool::new(Duration::from_secs(2))));
        let fabric = Box::leak(Box::new(Fabric::new()));
        let link: &'static FakeLink = Box::leak(Box::new(FakeLink::new()));
        let uicr = Box::leak(Box::new(FakeUicr::default()));
        let drv = WifiAt::new(link, FakeCtrl::default(), pool, fabric, uicr, Config::default());
        drv.shadow().set_powered(true);
        (pool, fabric, drv)
    }

    #[test]
    fn parse_int_variants() {
        assert_eq!(parse_int("-102\r\n"), Some(-102));
        assert_eq!(parse_int(" 47,"), Some(47));
        assert_eq!(parse_int("abc"), None);
    }

    #[test]
    fn ap_join_sets_shadow() {
        let (_pool, fabric, drv) = setup();
        let mut sub = fabric.da_events();
        drv.ingest(b"\r\n+WFJAP:1,'ProtoSorcery',10.1.91.148\r\n").unwrap();
        let snap = drv.state();
        assert_eq!(snap.ap_connected, Tri::KnownTrue);
        assert_eq!(snap.ap_name.as_str(), "ProtoSorcery");
        assert_eq!(snap.ip_address.as_str(), "10.1.91.148");
        let evt = sub.try_next_message_pure().expect("connect event");
        assert!(evt.bits.contains(DaBits::AP_CONNECT));
    }

    #[test]
    fn ap_drop_clears_shadow_and_records_reason() {
        let (_pool, _fabric, drv) = setup();
        drv.ingest(b"\r\n+WFJAP:1,'ProtoSorcery',10.1.91.148\r\n").unwrap();
        drv.ingest(b"\r\n+WFJAP:0,NOT_FOUND\r\n").unwrap();
        let snap = drv.state();
        assert_eq!(snap.ap_connected, Tri::KnownFalse);
        assert_eq!(snap.ap_name.as_str(), "");
        assert_eq!(snap.ap_disconnect_reason.as_str(), "NOT_FOUND");
        assert_eq!(snap.rssi, RSSI_NOT_CONNECTED);
    }

    #[test]
    fn broker_connect_toggles_both_flags() {
        let (_pool, _fabric, drv) = setup();
        drv.ingest(b"\r\n+NWMQCL:1\r\n").unwrap();
        let snap = drv.state();
        assert_eq!(snap.mqtt_enabled, Tri::KnownTrue);
        assert_eq!(snap.mqtt_broker_connected, Tri::KnownTrue);

        drv.ingest(b"\r\n+NWMQCL:0\r\n").unwrap();
        let snap = drv.state();
        // Enable state is not implied by a broker drop.
        assert_eq!(snap.mqtt_enabled, Tri::KnownTrue);
        assert_eq!(snap.mqtt_broker_connected, Tri::KnownFalse);
    }

    #[test]
    fn init_done_with_dpm_report() {
        let (_pool, _fabric, drv) = setup();
        drv.ingest(b"\r\n+INIT:DONE,0,DPM=1\r\n").unwrap();
        let snap = drv.state();
        assert_eq!(snap.initialized, Tri::KnownTrue);
        assert_eq!(snap.dpm_mode, Tri::KnownTrue);
        assert_eq!(snap.is_sleeping, Tri::KnownFalse);
    }

    #[test]
    fn boot_init_reset_on_expected_restart() {
        let (_pool, _fabric, drv) = setup();
        drv.ingest(b"\r\n+WFJAP:1,'ProtoSorcery',10.1.91.148\r\n").unwrap();
        drv.ingest(b"\r\n+NWMQCL:1\r\n").unwrap();
        drv.flags.lock(|f| f.borrow_mut().rebooting = true);
        drv.ingest(b"\r\n+INIT:DONE,0,DPM=0\r\n").unwrap();
        let snap = drv.state();
        assert_eq!(snap.ap_connected, Tri::KnownFalse);
        assert_eq!(snap.mqtt_broker_connected, Tri::KnownFalse);
        assert_eq!(snap.reboot_cnt, 1);
        assert_eq!(snap.dpm_mode, Tri::KnownFalse);
    }

    #[test]
    fn wakeup_deauth_clears_association() {
        let (_pool, _fabric, drv) = setup();
        drv.ingest(b"\r\n+WFJAP:1,'ProtoSorcery',10.1.91.148\r\n").unwrap();
        drv.ingest(b"\r\n+INIT:WAKEUP,DEAUTH\r\n").unwrap();
        let snap = drv.state();
        assert_eq!(snap.ap_connected, Tri::KnownFalse);
        assert_eq!(snap.dpm_mode, Tri::KnownTrue);
        assert_eq!(snap.mqtt_broker_connected, Tri::KnownFalse);
    }

    #[test]
    fn sub_topic_report_replaces_list() {
        let (_pool, _fabric, drv) = setup();
        drv.ingest(b"\r\n+NWMQTS:2,\"da16k_sub\",\"da16k_sub2\"\r\n").unwrap();
        let snap = drv.state();
        assert_eq!(snap.mqtt_sub_topics.len(), 2);
        assert_eq!(snap.mqtt_sub_topics[0].as_str(), "da16k_sub");
        assert_eq!(snap.mqtt_sub_topics[1].as_str(), "da16k_sub2");
    }

    #[test]
    fn cloud_message_published_with_retained_handle() {
        let (pool, fabric, drv) = setup();
        let mut sub = fabric.cloud_messages();
        drv.ingest(b"\r\n+NWMQMSG:Hello world!,messages/1_DT00/5/abc,12\r\n").unwrap();
        let msg = sub.try_next_message_pure().expect("cloud message");
        assert_eq!(msg.topic.as_str(), "messages/1_DT00/5/abc");
        assert_eq!(msg.msg_type, 5);
        msg.with_payload(|p| assert_eq!(p, b"Hello world!"));
        // One ref held by the cloud message, one by the pending queue.
        assert_eq!(pool.live_refs(), 2);
        drop(msg);
        assert_eq!(pool.live_refs(), 1);
    }

    #[test]
    fn cloud_message_with_oversized_length_is_rejected() {
        let (pool, fabric, drv) = setup();
        let mut sub = fabric.cloud_messages();
        drv.ingest(b"\r\n+NWMQMSG:hi,messages/1_DT00/5/abc,9999\r\n").unwrap();
        assert!(sub.try_next_message_pure().is_none());
        // Only the pending-queue reference remains; nothing leaked.
        assert_eq!(pool.live_refs(), 1);
    }

    #[test]
    fn version_report_publishes_change() {
        let (_pool, fabric, drv) = setup();
        let mut sub = fabric.da_events();
        drv.ingest(b"\r\n+VER:FRTOS-GEN01-01-TDEVER_123-240601\r\n").unwrap();
        assert_eq!(drv.state().version, [1, 2, 3]);
        let evt = sub.try_next_message_pure().expect("version event");
        assert!(evt.bits.contains(DaBits::VERSION));
    }

    #[test]
    fn rssi_and_certs_reports() {
        let (_pool, _fabric, drv) = setup();
        drv.ingest(b"\r\n+RSSI:-44\r\n").unwrap();
        assert_eq!(drv.state().rssi, -44);
        drv.ingest(b"\r\n+NWCCRT:7\r\n").unwrap();
        assert_eq!(drv.state().mqtt_certs_installed, Tri::KnownTrue);
        drv.ingest(b"\r\n+NWCCRT:0\r\n").unwrap();
        assert_eq!(drv.state().mqtt_certs_installed, Tri::KnownFalse);
    }

    #[test]
    fn ota_start_result_latched_for_engine() {
        let (_pool, _fabric, drv) = setup();
        drv.ingest(b"\r\n+NWOTADWSTART:0x00\r\n").unwrap();
        let latched = drv.flags.lock(|f| f.borrow().ota_start_result.clone());
        assert_eq!(latched.as_deref(), Some("0x00"));
    }
}

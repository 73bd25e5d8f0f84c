//! MQTT session control on the Wi-Fi modem.
//!
//! The modem runs its own MQTT client; this module drives the enable /
//! auto-start / topic-list knobs and the publish path. Broker connectivity
//! itself is reported asynchronously through `+NWMQCL` events.

use core::fmt::Write as _;

use embassy_time::{Duration, Instant};
use heapless::{String, Vec};

use crate::error::Error;
use crate::fabric::{DaBits, MSG_CAP};
use crate::port::{WifiCtrl, WifiLink};
use crate::types::{MAX_SUB_TOPICS, MAX_TOPIC_LEN, Tri};

use super::pattern::{CapBuf, Pattern, WaitSet};
use super::{WifiAt, parse_modem_error};

/// Cloud message types carried in topic paths.
pub mod msg_type {
    pub const ONBOARDING: u16 = 1;
    pub const FOTA: u16 = 2;
    pub const REMOTE_FUNCTION: u16 = 3;
    pub const CONN_TEST: u16 = 4;
    pub const SHADOW_PROXY: u16 = 5;
    pub const SRF_NONCE: u16 = 6;
    pub const SRF_FUNC: u16 = 7;
    pub const CONFIG_HUB: u16 = 8;
}

/// Topic the cloud publishes to for this device and message type.
pub fn sub_topic(brand: i16, msg_type: u16, client_id: &str) -> String<MAX_TOPIC_LEN> {
    let mut t = String::new();
    let _ = write!(t, "messages/{}/{}/{}/c2d", brand, msg_type, client_id);
    t
}

/// Topic this device publishes to for a message type.
pub fn pub_topic(brand: i16, msg_type: u16, client_id: &str) -> String<MAX_TOPIC_LEN> {
    let mut t = String::new();
    let _ = write!(t, "messages/{}/{}/{}/d2c", brand, msg_type, client_id);
    t
}

impl<'p, L: WifiLink, C: WifiCtrl> WifiAt<'p, L, C> {
    /// Query whether the modem's MQTT client is up. Also re-syncs the
    /// shadow through the decoded `+NWMQCL` reply.
    pub async fn mqtt_state(&self, timeout: Duration) -> Result<bool, Error> {
        self.shadow().guard_powered_awake()?;
        let deadline = Instant::now() + timeout;
        let mut tx = self.begin("mqtt_state", timeout).await?;
        tx.flush();
        tx.send("AT+NWMQCL=?").await?;

        let mut result: Option<bool> = None;
        loop {
            let mut state = CapBuf::<1>::new();
            let mut err = CapBuf::<19>::new();
            let mut wait = WaitSet::new();
            wait.push(Pattern::new("\r\nOK\r\n").stop());
            wait.push(Pattern::new("+NWMQCL:%1s\r\n").stop().capture(&mut state));
            wait.push(Pattern::new("\r\nERROR:%19s\r\n").stop().capture(&mut err));
            let idx = tx.wait_until(&mut wait, deadline).await?;
            drop(wait);
            match idx {
                // The OK must be consumed lest it be taken as the answer
                // to the next command.
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

    /// Enable or disable the modem's MQTT client.
    ///
    /// Safe to call when already in the requested state: the driver then
    /// re-sends the state query so the shadow re-syncs when the reply
    /// arrives.
    pub async fn set_mqtt_state(&self, on: bool, timeout: Duration) -> Result<(), Error> {
        self.shadow().guard_powered_awake()?;
        let mut tx = self.begin("set_mqtt_state", timeout).await?;
        tx.set_mqtt_state(on, timeout).await
    }

    /// Query whether MQTT auto-starts at modem boot.
    pub async fn mqtt_boot_state(&self, timeout: Duration) -> Result<bool, Error> {
        self.shadow().guard_powered_awake()?;
        let deadline = Instant::now() + timeout;
        let mut tx = self.begin("mqtt_boot_state", timeout).await?;
        tx.flush();
        tx.send("AT+NWMQAUTO=?").await?;

        let mut result: Option<bool> = None;
        loop {
            let mut state = CapBuf::<1>::new();
            let mut err = CapBuf::<19>::new();
            let mut wait = WaitSet::new();
            wait.push(Pattern::new("\r\nOK\r\n").stop());
            wait.push(Pattern::new("+NWMQAUTO:%1s\r\n").stop().capture(&mut state));
            wait.push(Pattern::new("\r\nERROR:%19s\r\n").stop().capture(&mut err));
            let idx = tx.wait_until(&mut wait, deadline).await?;
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

    /// Set whether MQTT auto-starts at modem boot.
    pub async fn set_mqtt_boot_state(&self, on: bool, timeout: Duration) -> Result<(), Error> {
        self.shadow().guard_powered_awake()?;
        let mut cmd: String<20> = String::new();
        let _ = write!(cmd, "AT+NWMQAUTO={}", on as u8);
        self.send_ok_err(&cmd, timeout).await?;
        self.shadow()
            .set_tri(DaBits::BOOT_MQTT_STATE, |s| &mut s.mqtt_on_boot, Tri::from(on));
        Ok(())
    }

    /// Replace the modem's MQTT subscription list. No merging.
    pub async fn set_mqtt_sub_topics(&self, topics: &[&str], timeout: Duration) -> Result<(), Error> {
        self.shadow().guard_powered_awake()?;
        let mut tx = self.begin("set_sub_topics", timeout).await?;
        tx.set_sub_topics(topics, timeout).await
    }

    /// Make sure the subscription list includes `desired`, keeping existing
    /// unrelated topics while room remains.
    pub async fn ensure_mqtt_sub_topics(&self, desired: &[&str], timeout: Duration) -> Result<(), Error> {
        let existing = self.shadow().read(|s| s.mqtt_sub_topics.clone());
        let mut merged: Vec<String<MAX_TOPIC_LEN>, MAX_SUB_TOPICS> = Vec::new();
        for t in desired.iter().take(MAX_SUB_TOPICS) {
            let mut owned = String::new();
            let _ = owned.push_str(&t[..t.len().min(MAX_TOPIC_LEN)]);
            let _ = merged.push(owned);
        }
        for t in existing.iter() {
            if merged.is_full() {
                break;
            }
            if merged.iter().all(|m| m.as_str() != t.as_str()) {
                let _ = merged.push(t.clone());
            }
        }
        let mut refs: Vec<&str, MAX_SUB_TOPICS> = Vec::new();
        for t in merged.iter() {
            let _ = refs.push(t.as_str());
        }
        self.set_mqtt_sub_topics(&refs, timeout).await
    }

    /// Subscribe to the c2d topics for the given message types.
    pub async fn set_mqtt_sub_topics_by_type(&self, types: &[u16], timeout: Duration) -> Result<(), Error> {
        self.shadow().guard_powered_awake()?;
        let mut tx = self.begin("set_sub_topics_by_type", timeout).await?;
        tx.set_sub_topics_by_type(types, timeout).await
    }

    /// Publish one message to the broker.
    ///
    /// With `wait_for_send_conf` the call waits for the modem's delivery
    /// confirmation, which depends on QoS and can take a while.
    pub async fn mqtt_publish(
        &self,
        message_type: u16,
        body: &str,
        wait_for_send_conf: bool,
        timeout: Duration,
    ) -> Result<(), Error> {
        if message_type > 999 {
            return Err(Error::Invalid);
        }
        let precheck = self.shadow().read(|s| {
            if !s.mqtt_broker_connected.is_true() {
                return Err(Error::NotSupported);
            }
            if !s.mqtt_certs_installed.is_true() || !s.ntp_server_set.is_true() {
                return Err(Error::NotSupported);
            }
            Ok(s.mqtt_client_id.clone())
        });
        let client_id = precheck?;
        self.shadow().guard_powered_awake()?;
        if body.len() > MSG_CAP - 100 {
            error!("mqtt msg is too large to hand to the modem");
            return Err(Error::Invalid);
        }

        let topic = pub_topic(self.config().brand_id, message_type, client_id.as_str());
        let mut cmd: String<MSG_CAP> = String::new();
        let _ = write!(cmd, "AT+NWMQMSG='{}',{}", body, topic);

        let deadline = Instant::now() + timeout;
        let mut tx = self.begin("mqtt_publish", timeout).await?;
        tx.send(&cmd).await?;

        loop {
            let mut conf = CapBuf::<20>::new();
            let mut err = CapBuf::<19>::new();
            let mut wait = WaitSet::new();
            wait.push(Pattern::new("\r\nOK\r\n").stop());
            wait.push(Pattern::new("\r\nERROR:%19s\r\n").stop().capture(&mut err));
            wait.push(Pattern::new("+NWMQMSGSND:%20s").stop().capture(&mut conf));
            let idx = tx.wait_until(&mut wait, deadline).await?;
            drop(wait);
            match idx {
                0 => {
                    if !wait_for_send_conf {
                        return Ok(());
                    }
                }
                1 => return Err(parse_modem_error(err.as_str())),
                _ => {
                    // `1` is success; `0,<code>` carries the failure code.
                    let text = conf.as_str();
                    if text.starts_with('1') {
                        return Ok(());
                    }
                    let code = text
                        .strip_prefix("0,")
                        .and_then(|c| c.parse::<i16>().ok())
                        .unwrap_or(0);
                    return Err(if code != 0 { Error::ModemError(code) } else { Error::BadResponse });
                }
            }
        }
    }
}

impl<'t, 'p, L: WifiLink, C: WifiCtrl> super::Transaction<'t, 'p, L, C> {
    pub(crate) async fn set_mqtt_state(&mut self, on: bool, timeout: Duration) -> Result<(), Error> {
        let drv = self.drv();
        let broker = drv.shadow().read(|s| s.mqtt_broker_connected);
        let mut cmd: String<20> = String::new();
        if Tri::from(on) == broker {
            let _ = cmd.push_str("AT+NWMQCL=?");
        } else {
            let _ = write!(cmd, "AT+NWMQCL={}", on as u8);
        }
        self.send_ok_err(&cmd, timeout).await?;

        drv.shadow()
            .set_tri(DaBits::MQTT_ENABLED, |s| &mut s.mqtt_enabled, Tri::from(on));
        if !on {
            // Turning MQTT off is immediate; close the gap where the shadow
            // would still claim a broker session.
            drv.shadow().set_tri(
                DaBits::MQTT_BROKER_CONNECT,
                |s| &mut s.mqtt_broker_connected,
                Tri::KnownFalse,
            );
        }
        // Turning it on can take a while and may never finish; the shadow
        // flips when the async broker event lands.
        Ok(())
    }

    pub(crate) async fn set_sub_topics(&mut self, topics: &[&str], timeout: Duration) -> Result<(), Error> {
        let drv = self.drv();
        if topics.len() > MAX_SUB_TOPICS || topics.iter().any(|t| t.len() >= MAX_TOPIC_LEN) {
            return Err(Error::Invalid);
        }
        if drv.shadow().read(|s| s.mqtt_broker_connected.is_true()) {
            error!("can't set topics while connected to the broker");
            return Err(Error::Busy);
        }

        let mut cmd: String<{ 16 + MAX_SUB_TOPICS * (MAX_TOPIC_LEN + 1) }> = String::new();
        let _ = write!(cmd, "AT+NWMQTS={}", topics.len());
        for t in topics {
            let _ = write!(cmd, ",{}", t);
        }
        self.send_ok_err(&cmd, timeout).await?;
        drv.shadow().set_sub_topics(topics);
        Ok(())
    }

    /// Subscribe to the c2d topics for the given message types.
    pub(crate) async fn set_sub_topics_by_type(&mut self, types: &[u16], timeout: Duration) -> Result<(), Error> {
        let drv = self.drv();
        if types.len() > MAX_SUB_TOPICS || types.iter().any(|t| *t > 30) {
            return Err(Error::Invalid);
        }
        let brand = drv.config().brand_id;
        let client_id = drv.shadow().read(|s| s.mqtt_client_id.clone());
        let mut topics: Vec<String<MAX_TOPIC_LEN>, MAX_SUB_TOPICS> = Vec::new();
        for t in types {
            let _ = topics.push(sub_topic(brand, *t, client_id.as_str()));
        }
        let mut refs: Vec<&str, MAX_SUB_TOPICS> = Vec::new();
        for t in topics.iter() {
            let _ = refs.push(t.as_str());
        }
        self.set_sub_topics(&refs, timeout).await
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
        &'static Fabric<'static>,
        WifiAt<'static, &'static FakeLink, FakeCtrl>,
    ) {
        let pool = Box::leak(Box::new(MsgPool::new(Duration::from_secs(2))));
        let fabric = Box::leak(Box::new(Fabric::new()));
        let link: &'static FakeLink = Box::leak(Box::new(FakeLink::new()));
        let uicr = Box::leak(Box::new(FakeUicr::default()));
        let drv = WifiAt::new(link, FakeCtrl::default(), pool, fabric, uicr, Config::default());
        drv.shadow().set_powered(true);
        (link, fabric, drv)
    }

    #[test]
    fn topic_builders() {
        assert_eq!(sub_topic(1, 5, "1_DT00").as_str(), "messages/1/5/1_DT00/c2d");
        assert_eq!(pub_topic(1, 5, "1_DT00").as_str(), "messages/1/5/1_DT00/d2c");
    }

    #[test]
    fn mqtt_state_query_waits_for_ok() {
        let (link, _fabric, drv) = setup();
        let result = block_on(join(drv.mqtt_state(Duration::from_millis(200)), async {
            embassy_futures::yield_now().await;
            drv.ingest(b"\r\n+NWMQCL:1\r\n").unwrap();
            drv.ingest(b"\r\nOK\r\n").unwrap();
        }))
        .0;
        assert_eq!(result, Ok(true));
        assert_eq!(link.sent_at(0), "AT+NWMQCL=?");
        // The decoded reply also refreshed the shadow.
        assert_eq!(drv.state().mqtt_broker_connected, Tri::KnownTrue);
    }

    #[test]
    fn set_mqtt_state_matching_state_resends_query() {
        let (link, _fabric, drv) = setup();
        drv.ingest(b"\r\n+NWMQCL:1\r\n").unwrap();
        let result = block_on(join(
            drv.set_mqtt_state(true, Duration::from_millis(200)),
            async {
                embassy_futures::yield_now().await;
                drv.ingest(b"\r\nOK\r\n").unwrap();
            },
        ))
        .0;
        assert_eq!(result, Ok(()));
        // Broker already said connected, so the driver re-syncs instead of
        // re-enabling.
        assert_eq!(link.sent_at(0), "AT+NWMQCL=?");
    }

    #[test]
    fn set_mqtt_state_off_clears_broker_shadow() {
        let (link, _fabric, drv) = setup();
        drv.ingest(b"\r\n+NWMQCL:1\r\n").unwrap();
        let result = block_on(join(
            drv.set_mqtt_state(false, Duration::from_millis(200)),
            async {
                embassy_futures::yield_now().await;
                drv.ingest(b"\r\nOK\r\n").unwrap();
            },
        ))
        .0;
        assert_eq!(result, Ok(()));
        assert_eq!(link.sent_at(0), "AT+NWMQCL=0");
        let snap = drv.state();
        assert_eq!(snap.mqtt_enabled, Tri::KnownFalse);
        assert_eq!(snap.mqtt_broker_connected, Tri::KnownFalse);
    }

    #[test]
    fn sub_topics_rejected_while_broker_connected() {
        let (_link, _fabric, drv) = setup();
        drv.ingest(b"\r\n+NWMQCL:1\r\n").unwrap();
        let result = block_on(drv.set_mqtt_sub_topics(&["a"], Duration::from_millis(100)));
        assert_eq!(result, Err(Error::Busy));
    }

    #[test]
    fn set_sub_topics_builds_command_and_shadow() {
        let (link, _fabric, drv) = setup();
        let result = block_on(join(
            drv.set_mqtt_sub_topics(&["da16k_sub", "da16k_sub2"], Duration::from_millis(200)),
            async {
                embassy_futures::yield_now().await;
                drv.ingest(b"\r\nOK\r\n").unwrap();
            },
        ))
        .0;
        assert_eq!(result, Ok(()));
        assert_eq!(link.sent_at(0), "AT+NWMQTS=2,da16k_sub,da16k_sub2");
        let snap = drv.state();
        assert_eq!(snap.mqtt_sub_topics.len(), 2);
        assert_eq!(snap.mqtt_sub_topics[0].as_str(), "da16k_sub");
    }

    #[test]
    fn ensure_topics_merges_existing() {
        let (link, _fabric, drv) = setup();
        drv.shadow().set_sub_topics(&["keep_me", "and_me"]);
        let result = block_on(join(
            drv.ensure_mqtt_sub_topics(&["new_one", "keep_me"], Duration::from_millis(200)),
            async {
                embassy_futures::yield_now().await;
                drv.ingest(b"\r\nOK\r\n").unwrap();
            },
        ))
        .0;
        assert_eq!(result, Ok(()));
        assert_eq!(link.sent_at(0), "AT+NWMQTS=3,new_one,keep_me,and_me");
    }

    #[test]
    fn publish_requires_broker() {
        let (_link, _fabric, drv) = setup();
        let result = block_on(drv.mqtt_publish(5, "{}", false, Duration::from_millis(100)));
        assert_eq!(result, Err(Error::NotSupported));
    }

    #[test]
    fn publish_happy_path_without_confirmation() {
        let (link, _fabric, drv) = setup();
        drv.shadow().set_str_quiet(|s| &mut s.mqtt_client_id, "1_DT00");
        drv.ingest(b"\r\n+NWMQCL:1\r\n").unwrap();
        drv.ingest(b"\r\n+NWCCRT:7\r\n").unwrap();
        drv.shadow()
            .set_tri(DaBits::NTP_SERVER_SET, |s| &mut s.ntp_server_set, Tri::KnownTrue);
        let result = block_on(join(
            drv.mqtt_publish(5, "{\"k\":1}", false, Duration::from_millis(200)),
            async {
                embassy_futures::yield_now().await;
                drv.ingest(b"\r\nOK\r\n").unwrap();
            },
        ))
        .0;
        assert_eq!(result, Ok(()));
        assert_eq!(link.sent_at(0), "AT+NWMQMSG='{\"k\":1}',messages/1/5/1_DT00/d2c");
    }
}

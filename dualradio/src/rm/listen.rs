//! Radio-manager event plumbing.
//!
//! Subscribers run their real work here, on the manager's own tasks; the
//! fabric's listeners themselves never block. Also home to the association
//! worker, the USB/BT sleep override, and the periodic reconnect job.

use embassy_futures::select::{Either, select};
use embassy_time::{Duration, Instant, Timer};

use crate::error::Error;
use crate::fabric::{DaBits, DaEvent, LteStatus, LteStatusUpdate};
use crate::port::{WifiCtrl, WifiLink};
use crate::types::{Radio, Tri};

use super::{ConnectRequest, RadioMgr};

impl<'p, L: WifiLink, C: WifiCtrl> RadioMgr<'p, L, C> {
    /// Long-lived task reacting to Wi-Fi shadow deltas.
    pub async fn run_da_events(&self) -> ! {
        let mut events = self.fabric.da_events();
        loop {
            let evt = events.next_message_pure().await;
            self.handle_da_event(&evt).await;
        }
    }

    pub(crate) async fn handle_da_event(&self, evt: &DaEvent) {
        if !self.uicr.shipping_flag() {
            return;
        }

        if evt.bits.contains(DaBits::WAKE_UNICAST) {
            // The modem woke for a downlink; hold it awake long enough for
            // the payload to arrive, then let it sleep again.
            self.got_unicast_from_ap();
            Timer::after_millis(500).await;
            let _ = self.done(Radio::Wifi).await;
        }

        if !self.is_enabled() {
            debug!("radio mgmt off, skipping wifi status update");
            return;
        }

        if evt.bits.contains(DaBits::AP_CONNECT)
            && self.wifi.shadow().read(|s| s.ap_connected.is_false())
        {
            // Disconnected, or an association attempt failed. If Wi-Fi
            // carried (or was about to carry) MQTT, fall back to LTE.
            let affected = self.with_state(|s| {
                s.active_radio == Radio::Wifi || (s.switching && s.target == Radio::Wifi)
            });
            if affected {
                debug!("AP dropped or failed to connect, switching to LTE");
                if let Err(e) = self.switch_to(Radio::Lte, true, false) {
                    error!("failed to switch to LTE: {}", e);
                }
            }
            let _ = self.sleep_wifi().await;
        }

        if evt.bits.contains(DaBits::MQTT_ENABLED)
            && self.wifi.shadow().read(|s| s.mqtt_enabled.is_false())
            && self.get_active_mqtt_radio() == Radio::Wifi
        {
            debug!("wifi MQTT disabled under the active radio, switching to LTE");
            let _ = self.switch_to(Radio::Lte, false, false);
        }

        if evt.bits.contains(DaBits::MQTT_BROKER_CONNECT)
            && self.wifi.shadow().read(|s| s.mqtt_broker_connected.is_true())
            && self.get_active_mqtt_radio() == Radio::Lte
            && !self.wifi_is_connecting()
        {
            // Two broker sessions must never coexist.
            error!("wifi broker connected while LTE is active, rebooting wifi modem");
            self.wifi.reset().await;
        }
    }

    /// Long-lived task reacting to cellular status updates.
    pub async fn run_lte_events(&self) -> ! {
        let mut events = self.fabric.lte_events();
        loop {
            let update = events.next_message_pure().await;
            self.handle_lte_event(&update);
        }
    }

    pub(crate) fn handle_lte_event(&self, update: &LteStatusUpdate) {
        if !self.is_enabled() {
            debug!("radio mgmt off, skipping LTE status update");
            return;
        }
        // A dropped LTE link or broker session does not hand over to
        // Wi-Fi; LTE is retried until an AP actually appears. The enable
        // bit is the exception: the active radio must keep its client up.
        if update.changed.get(LteStatus::MQTT_ENABLED)
            && !update.status.get(LteStatus::MQTT_ENABLED)
            && self.get_active_mqtt_radio() == Radio::Lte
            && !self.is_switching()
        {
            warn!("LTE MQTT disabled under the active radio, turning it back on");
            let _ = self.switch_to(Radio::Lte, false, false);
        }
    }

    /// Long-lived task tracking USB power and BT connections for the sleep
    /// override.
    pub async fn run_usb_bt(&self) -> ! {
        let mut usb = self.fabric.usb_power_events();
        let mut bt = self.fabric.bt_conn_events();
        loop {
            match select(usb.next_message_pure(), bt.next_message_pure()).await {
                Either::First(connected) => {
                    debug!("USB connected is now {}", connected);
                    self.with_state(|s| s.usb_connected = connected);
                }
                Either::Second(connected) => {
                    debug!("BT connected is now {}", connected);
                    self.with_state(|s| s.bt_connected = connected);
                }
            }
            self.apply_usb_bt_override().await;
        }
    }

    /// While USB or BT is attached, sleep is forced off and the Wi-Fi modem
    /// is pre-prepared; on release the pre-override policy returns.
    pub(crate) async fn apply_usb_bt_override(&self) {
        let (any, prepped) = self.with_state(|s| (s.usb_connected || s.bt_connected, s.usb_bt_prepped));

        if any && !prepped {
            warn!("USB or BT connected, prepping radio");
            self.with_state(|s| {
                s.sleep_pre_override = Some(s.use_sleep);
                s.use_sleep = false;
            });
            // A DPM change while associated makes the modem fall over, and
            // it may be joined to an AP we failed to make it forget.
            if let Err(e) = self.wifi.disconnect_from_ap(Duration::from_secs(1)).await {
                error!("'{}' disconnecting from AP for override", e);
            }
            self.clear_association_shadow();
            let _ = self.ensure_wifi_awake().await;
            self.with_state(|s| s.usb_bt_prepped = true);
        } else if !any && prepped {
            warn!("USB and BT disconnected, releasing radio");
            self.with_state(|s| {
                s.use_sleep = s.sleep_pre_override.take().unwrap_or(true);
            });
            if let Err(e) = self.wifi.disconnect_from_ap(Duration::from_secs(1)).await {
                error!("'{}' disconnecting from AP after override", e);
            }
            self.clear_association_shadow();
            let _ = self.sleep_wifi().await;
            self.with_state(|s| s.usb_bt_prepped = false);
        }
    }

    fn clear_association_shadow(&self) {
        let shadow = self.wifi.shadow();
        shadow.set_tri(DaBits::AP_CONNECT, |s| &mut s.ap_connected, Tri::KnownFalse);
        shadow.set_str_quiet(|s| &mut s.ap_name, "");
        shadow.set_str_quiet(|s| &mut s.ip_address, "");
    }

    /// Long-lived association worker. Attempts arrive from
    /// [`RadioMgr::connect_to_ap`] / [`RadioMgr::connect_to_ap_by_index`].
    pub async fn run_connect(&self) -> ! {
        loop {
            let req = self.connect_req.receive().await;
            self.do_connect(req).await;
            self.with_state(|s| s.connecting_ap = false);
        }
    }

    async fn do_connect(&self, req: ConnectRequest) {
        // Could have been switched off after the request was queued.
        if !self.is_wifi_enabled() {
            error!("wifi is disabled, not connecting to AP");
            return;
        }
        let (target_ssid, disconnect_first) = match &req {
            ConnectRequest::Creds { creds, disconnect_first } => (creds.ssid.clone(), *disconnect_first),
            ConnectRequest::Index { ssid, disconnect_first, .. } => (ssid.clone(), *disconnect_first),
        };

        if disconnect_first {
            if let Err(e) = self.wifi.disconnect_from_ap(Duration::from_secs(2)).await {
                error!("'{}' disconnecting from AP", e);
                return;
            }
            // Give the modem a moment to actually drop the link.
            Timer::after_secs(1).await;
        }

        // Puts the modem in the DPM mode the policy wants before joining.
        if self.prepare(Radio::Wifi, false, Duration::from_secs(3)).await.is_err() {
            error!("failed to prepare wifi modem for AP connection");
            return;
        }

        let initiated = match req {
            ConnectRequest::Creds { creds, .. } => {
                warn!("connecting to AP");
                let ret = self.wifi.initiate_connect_to_ssid(&creds, Duration::from_secs(10)).await;
                if ret.is_ok() {
                    self.with_state(|s| s.last_conn = Some(creds));
                }
                ret
            }
            ConnectRequest::Index { idx, .. } => {
                warn!("connecting to saved AP index {}", idx);
                let ret = self.wifi.initiate_connect_by_index(idx, Duration::from_secs(10)).await;
                if matches!(ret, Err(Error::ModemError(821))) {
                    // Credential store crypto drift; only recovery is a wipe.
                    let _ = self.wifi.saved_ssids_del_all(Duration::from_secs(3)).await;
                }
                ret
            }
        };
        if let Err(e) = initiated {
            error!("'{}' connecting to AP", e);
            let _ = self.done(Radio::Wifi).await;
            return;
        }

        // The attempt is running; wrong credentials can take ~15 s to be
        // rejected. Association completion arrives as a shadow event.
        let deadline = Instant::now() + Duration::from_secs(25);
        loop {
            let joined = self
                .wifi
                .shadow()
                .read(|s| s.ap_connected.is_true() && s.ap_name == target_ssid);
            if joined {
                break;
            }
            if Instant::now() >= deadline {
                error!("timed out waiting for AP to connect");
                let _ = self.done(Radio::Wifi).await;
                return;
            }
            Timer::after_millis(100).await;
        }
        debug!("connect attempt succeeded");

        // First join on fresh credentials: persist them.
        self.wifi.commit_staged_ssid().await;

        // The broker state under the new AP is not yet known.
        let shadow = self.wifi.shadow();
        shadow.set_tri(DaBits::MQTT_ENABLED, |s| &mut s.mqtt_enabled, Tri::Unknown);
        shadow.set_tri(
            DaBits::MQTT_BROKER_CONNECT,
            |s| &mut s.mqtt_broker_connected,
            Tri::Unknown,
        );
        let _ = self.switch_to(Radio::Wifi, false, false);
        let _ = self.done(Radio::Wifi).await;
    }

    /// Long-lived reconnect job: while Wi-Fi is allowed but not active,
    /// periodically look for a known SSID and start a connect.
    pub async fn run_reconnect(&self) -> ! {
        loop {
            let period = self.with_state(|s| s.reconnect_period);
            Timer::after(period).await;

            let eligible = self.with_state(|s| {
                s.enabled && s.use_wifi && !s.switching && !s.connecting_ap && s.active_radio != Radio::Wifi
            });
            if !eligible {
                continue;
            }
            if self.prepare(Radio::Wifi, false, Duration::from_secs(3)).await.is_err() {
                continue;
            }
            let duration = self.with_state(|s| s.reconnect_duration);
            let _ = self.wifi.fetch_saved_ssids(Duration::from_secs(2)).await;
            let _ = self.wifi.refresh_ssid_list(true, period, duration).await;
            if let Some(idx) = self.wifi.best_known_ssid() {
                info!("reconnect: known SSID visible at slot {}", idx);
                let _ = self.connect_to_ap_by_index(idx).await;
            }
            let _ = self.done(Radio::Wifi).await;
        }
    }
}

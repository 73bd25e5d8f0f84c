//! One-time configuration after a modem power-up.
//!
//! Runs on the driver worker when the first `+INIT:DONE` of a power cycle
//! is decoded, entirely under one modem transaction. Verifies the UICR
//! backup held in modem NVRAM, aligns MAC/XTAL with provisioning, programs
//! identity and broker parameters, and arms the subscription set. The
//! sequence is single-shot: the flag is cleared on success and re-armed
//! only by a power cycle.

use core::fmt::Write as _;

use embassy_time::{Duration, Instant, Timer};
use heapless::String;

use crate::error::Error;
use crate::fabric::{DaBits, PowerCommand};
use crate::port::{UICR_BACKUP_LEN, UicrCompare, WifiCtrl, WifiLink};
use crate::types::{BackupStatus, Tri};

use super::mqtt::msg_type;
use super::{Transaction, WifiAt};

/// Base of the user region in the modem's NVRAM.
pub const USER_NVRAM_BASE: u32 = 0x003A_D000;
/// One byte, [`BACKUP_SENTINEL`] when a UICR backup exists.
pub const UICR_BACKUP_FLAG_ADDR: u32 = USER_NVRAM_BASE;
/// The UICR backup blob, immediately after the flag word.
pub const UICR_BACKUP_ADDR: u32 = USER_NVRAM_BASE + 4;
/// Base of persisted network state.
pub const NET_STATE_ADDR: u32 = USER_NVRAM_BASE + 300;
/// One byte, 0 or 1.
pub const ONBOARDED_ADDR: u32 = NET_STATE_ADDR;

const BACKUP_SENTINEL: u8 = 0xEA;

pub(crate) async fn run<L: WifiLink, C: WifiCtrl>(drv: &WifiAt<'_, L, C>) -> Result<(), Error> {
    debug!("modem booted, checking state");
    let mut tx = drv.begin("boot_config", Duration::from_secs(3)).await?;

    // A deliberate DPM flip reboots the modem; nothing else changed, so
    // only the hold-awake request needs re-asserting.
    let (recent_dpm_change, awake_on_boot) = drv.flags.lock(|f| {
        let f = f.borrow();
        let recent = f
            .last_dpm_change
            .map(|t| Instant::now() < t + Duration::from_secs(3))
            .unwrap_or(false);
        (recent, f.awake_on_boot)
    });
    if !drv.uicr().in_factory() && recent_dpm_change {
        if awake_on_boot {
            if let Err(e) = tx.send_ok_err("AT+CLRDPMSLPEXT", Duration::from_millis(150)).await {
                error!("'{}' holding modem awake after DPM change", e);
            }
        }
        debug!("boot work skipped after deliberate DPM change");
        return Ok(());
    }

    let uicr_valid = match drv.shadow().read(|s| s.uicr_bu_status) {
        BackupStatus::Unknown => ensure_uicr_backup(drv, &mut tx).await.unwrap_or(false),
        BackupStatus::Exists => true,
        _ => false,
    };

    if !drv.uicr().shipping_flag() {
        return Ok(());
    }

    if uicr_valid {
        configure_identity(drv, &mut tx).await?;
    }

    // DPM cadence defaults. Seen to take 80 ms over SPI, hence the margins.
    let mut cmd: String<24> = String::new();
    let _ = write!(cmd, "AT+DPMTIMWU={}", drv.config().dpm_wakeup_secs);
    if let Err(e) = tx.send_ok_err(&cmd, Duration::from_millis(250)).await {
        error!("'{}' setting DPM wake-up time", e);
    }
    cmd.clear();
    let _ = write!(cmd, "AT+DPMKA={}", drv.config().dpm_keepalive_ms);
    if let Err(e) = tx.send_ok_err(&cmd, Duration::from_millis(150)).await {
        error!("'{}' setting DPM keep-alive", e);
    }

    // State queries; the answers land through the decoder.
    for query in ["AT+NWMQAUTO=?", "AT+DPM=?", "AT+VER", "AT+WFDIS=?"] {
        if let Err(e) = tx.send_ok_err(query, Duration::from_millis(150)).await {
            error!("'{}' querying modem state at boot", e);
        }
    }

    // Restore persisted network state.
    let mut onboarded = [0u8; 1];
    tx.get_nvram(ONBOARDED_ADDR, &mut onboarded, Duration::from_millis(500)).await?;
    drv.shadow().set_tri(
        DaBits::ONBOARDED,
        |s| &mut s.onboarded,
        Tri::from(onboarded[0] == 1),
    );

    if drv.flags.lock(|f| f.borrow().needs_one_time_config) {
        configure_once(drv, &mut tx).await?;
        drv.flags.lock(|f| f.borrow_mut().needs_one_time_config = false);
    }

    debug!("modem boot work done");
    Ok(())
}

/// Align MAC, XTAL and hostname with UICR provisioning.
async fn configure_identity<L: WifiLink, C: WifiCtrl>(
    drv: &WifiAt<'_, L, C>,
    tx: &mut Transaction<'_, '_, L, C>,
) -> Result<(), Error> {
    let shadow = drv.shadow();

    if !shadow.read(|s| s.mac_set.is_known()) {
        match tx.get_mac(Duration::from_millis(500)).await {
            Err(e) => {
                shadow.set_tri(DaBits::MAC_SET, |s| &mut s.mac_set, Tri::KnownFalse);
                error!("'{}' getting MAC", e);
            }
            Ok((mac, _)) => {
                if macs_equal(mac.as_str(), drv.uicr().wifi_mac()) {
                    shadow.set_tri(DaBits::MAC_SET, |s| &mut s.mac_set, Tri::KnownTrue);
                } else {
                    let formatted = colon_mac(drv.uicr().wifi_mac());
                    match tx.set_mac(formatted.as_str(), Duration::from_millis(500)).await {
                        Ok(()) => {
                            shadow.set_tri(DaBits::MAC_SET, |s| &mut s.mac_set, Tri::KnownTrue);
                            warn!("restarting modem to apply provisioned MAC");
                            tx.restart_modem(Duration::from_millis(100)).await?;
                            // The restart re-runs this whole sequence.
                            return Ok(());
                        }
                        Err(e) => {
                            shadow.set_tri(DaBits::MAC_SET, |s| &mut s.mac_set, Tri::KnownFalse);
                            error!("'{}' setting MAC", e);
                        }
                    }
                }
            }
        }
    }

    if !shadow.read(|s| s.xtal_set.is_known()) {
        let trim = drv.uicr().xtal_trim();
        match tx.get_xtal(Duration::from_millis(200)).await {
            Ok(current) if current != trim => {
                let ret = tx.set_xtal(trim, Duration::from_millis(200)).await;
                if let Err(e) = &ret {
                    error!("'{}' setting XTAL", e);
                }
                shadow.set_tri(DaBits::XTAL_SET, |s| &mut s.xtal_set, Tri::from(ret.is_ok()));
            }
            Ok(_) => shadow.set_tri(DaBits::XTAL_SET, |s| &mut s.xtal_set, Tri::KnownTrue),
            Err(e) => error!("'{}' getting XTAL", e),
        }
    }

    if !shadow.read(|s| s.dhcp_client_name_set.is_true()) {
        let mut name: String<32> = String::new();
        let serial = drv.uicr().serial_number();
        let _ = write!(name, "{}{}", drv.config().dhcp_hostname_prefix, &serial[..serial.len().min(14)]);
        shadow.set_str_quiet(|s| &mut s.dhcp_client_name, name.as_str());
        let mut cmd: String<48> = String::new();
        let _ = write!(cmd, "AT+NWDHCHN={}", name);
        let ret = tx.send_ok_err(&cmd, Duration::from_millis(200)).await;
        if let Err(e) = &ret {
            error!("'{}' setting DHCP client name", e);
        }
        shadow.set_tri(
            DaBits::DHCP_CLIENT_NAME_SET,
            |s| &mut s.dhcp_client_name_set,
            Tri::from(ret.is_ok()),
        );
    }

    // The modem refuses to publish without a default topic even though
    // every message carries an explicit one.
    if let Err(e) = tx
        .send_ok_err("AT+NWMQTP=messages/0/0/0/0", Duration::from_millis(200))
        .await
    {
        error!("'{}' setting default publish topic", e);
    }
    Ok(())
}

/// The full once-per-power-cycle configuration.
async fn configure_once<L: WifiLink, C: WifiCtrl>(
    drv: &WifiAt<'_, L, C>,
    tx: &mut Transaction<'_, '_, L, C>,
) -> Result<(), Error> {
    let shadow = drv.shadow();
    let serial = drv.uicr().serial_number();
    if !serial.starts_with("DT") {
        error!("serial number is not valid, skipping MQTT configuration");
        return Ok(());
    }

    // MQTT must be down while its parameters change.
    tx.set_mqtt_state(false, Duration::from_millis(300)).await?;

    if shadow.read(|s| s.mqtt_client_id.is_empty()) {
        let mut id: String<17> = String::new();
        let _ = write!(id, "{}_{}", drv.config().brand_id, serial);
        shadow.set_str_quiet(|s| &mut s.mqtt_client_id, id.as_str());
    }

    // Never auto-join the previously used AP; association is always ours
    // to initiate.
    if let Err(e) = tx.send_ok_err("AT+WFDIS=1", Duration::from_millis(300)).await {
        error!("'{}' disabling the AP profile on boot", e);
    }

    match tx.fetch_saved_ssids(Duration::from_secs(3)).await {
        // A crypto change leaves the store unreadable; clear and retry.
        Err(Error::ModemError(821)) => {
            warn!("decrypt error reading saved SSIDs, deleting and retrying");
            if let Err(e) = tx.send_ok_err("AT+SSIDDELALL", Duration::from_secs(3)).await {
                error!("'{}' clearing the saved-SSID store", e);
            }
            if let Err(e) = tx.fetch_saved_ssids(Duration::from_secs(3)).await {
                error!("'{}' re-reading the saved-SSID store", e);
            }
        }
        Err(e) => error!("'{}' reading the saved-SSID store", e),
        Ok(()) => {}
    }

    let client_id = shadow.read(|s| s.mqtt_client_id.clone());
    let mut cmd: String<96> = String::new();
    let _ = write!(cmd, "AT+NWMQCID={}", client_id);
    if let Err(e) = tx.send_ok_err(&cmd, Duration::from_secs(1)).await {
        error!("'{}' setting the MQTT client id", e);
    }
    if let Err(e) = tx.send_ok_err("AT+NWMQCS=1", Duration::from_secs(1)).await {
        error!("'{}' setting the clean-session flag", e);
    }
    if let Err(e) = tx.send_ok_err("AT+NWMQTLS=1", Duration::from_millis(300)).await {
        error!("'{}' enabling MQTT TLS", e);
    }
    cmd.clear();
    let _ = write!(cmd, "AT+WFCC={}", drv.config().country_code);
    if let Err(e) = tx.send_ok_err(&cmd, Duration::from_millis(300)).await {
        error!("'{}' setting the country code", e);
    }
    cmd.clear();
    let _ = write!(cmd, "AT+NWMQBR={},{}", drv.config().broker_host, drv.config().broker_port);
    if let Err(e) = tx.send_ok_err(&cmd, Duration::from_millis(300)).await {
        error!("'{}' setting the MQTT broker", e);
    }

    // Onboarding-only topics before onboarding; the full set after.
    let onboarded = shadow.read(|s| s.onboarded.is_true());
    let types: &[u16] = if onboarded {
        &[
            msg_type::ONBOARDING,
            msg_type::FOTA,
            msg_type::REMOTE_FUNCTION,
            msg_type::CONN_TEST,
            msg_type::SHADOW_PROXY,
            msg_type::SRF_NONCE,
            msg_type::SRF_FUNC,
            msg_type::CONFIG_HUB,
        ]
    } else {
        &[msg_type::ONBOARDING]
    };
    if let Err(e) = tx.set_sub_topics_by_type(types, Duration::from_millis(500)).await {
        error!("'{}' setting MQTT sub topics", e);
    }

    if !shadow.read(|s| s.mqtt_certs_installed.is_known()) {
        // The reply reports cert status through the decoder.
        let _ = tx.send_ok_err("AT+NWCCRT", Duration::from_millis(300)).await;
    }

    if !shadow.read(|s| s.ntp_server_set.is_true()) {
        cmd.clear();
        let _ = write!(cmd, "AT+NWSNTP=1,{},86400", drv.config().ntp_server);
        let ret = tx.send_ok_err(&cmd, Duration::from_millis(300)).await;
        if let Err(e) = &ret {
            error!("'{}' setting the NTP server", e);
        }
        shadow.set_tri(
            DaBits::NTP_SERVER_SET,
            |s| &mut s.ntp_server_set,
            Tri::from(ret.is_ok()),
        );
        // Give the modem time to sync before anything puts it to sleep.
        Timer::after_millis(2_000).await;
    }
    Ok(())
}

/// Verify or create the UICR backup in modem NVRAM. Returns whether the
/// UICR can be trusted.
async fn ensure_uicr_backup<L: WifiLink, C: WifiCtrl>(
    drv: &WifiAt<'_, L, C>,
    tx: &mut Transaction<'_, '_, L, C>,
) -> Result<bool, Error> {
    let shadow = drv.shadow();
    let mut flag = [0u8; 1];
    tx.get_nvram(UICR_BACKUP_FLAG_ADDR, &mut flag, Duration::from_millis(500)).await?;

    if flag[0] == BACKUP_SENTINEL {
        let mut blob = [0u8; UICR_BACKUP_LEN];
        tx.get_nvram(UICR_BACKUP_ADDR, &mut blob, Duration::from_millis(500)).await?;
        shadow.set_bu_blob(&blob);

        let schema = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
        if schema != drv.uicr().version_word() {
            // Developer-only condition: schema drift requires intervention.
            error!("UICR backup does not match schema version");
            shadow.set_bu_status(BackupStatus::Mismatch);
            return Ok(false);
        }
        match drv.uicr().compare_restore(&blob) {
            UicrCompare::Match => {
                shadow.set_bu_status(BackupStatus::Exists);
                Ok(true)
            }
            UicrCompare::Restored => {
                // Restored fields only apply at boot.
                error!("UICR was corrected from backup, rebooting");
                drv.fabric().publish_power(PowerCommand::Reboot);
                Ok(false)
            }
            UicrCompare::Mismatch => {
                error!("UICR backup does not match and cannot be restored");
                shadow.set_bu_status(BackupStatus::Mismatch);
                Ok(false)
            }
        }
    } else {
        if !drv.uicr().verify() {
            if drv.uicr().shipping_flag() {
                error!("UICR is not valid, cannot back it up");
            }
            // Status deliberately left unknown so the next boot retries.
            return Ok(false);
        }
        let mut blob = [0u8; UICR_BACKUP_LEN];
        drv.uicr().export(&mut blob);
        tx.put_nvram(UICR_BACKUP_ADDR, &blob, Duration::from_millis(500)).await?;
        tx.put_nvram(UICR_BACKUP_FLAG_ADDR, &[BACKUP_SENTINEL], Duration::from_millis(500)).await?;
        shadow.set_bu_blob(&blob);
        shadow.set_bu_status(BackupStatus::Exists);
        Ok(true)
    }
}

impl<'p, L: WifiLink, C: WifiCtrl> WifiAt<'p, L, C> {
    /// Persist the onboarded flag in modem NVRAM and mirror it in the
    /// shadow.
    pub async fn set_onboarded(&self, onboarded: bool, timeout: Duration) -> Result<(), Error> {
        self.put_nvram(ONBOARDED_ADDR, &[onboarded as u8], timeout).await?;
        self.shadow()
            .set_tri(DaBits::ONBOARDED, |s| &mut s.onboarded, Tri::from(onboarded));
        Ok(())
    }

    /// Point the modem at the configured NTP pool.
    pub async fn set_ntp_server(&self, timeout: Duration) -> Result<(), Error> {
        let mut cmd: String<56> = String::new();
        let _ = write!(cmd, "AT+NWSNTP=1,{},86400", self.config().ntp_server);
        self.send_ok_err(&cmd, timeout).await?;
        self.shadow()
            .set_tri(DaBits::NTP_SERVER_SET, |s| &mut s.ntp_server_set, Tri::KnownTrue);
        Ok(())
    }
}

/// Compare `XX:YY:..` against `XXYY..`, case-insensitively.
fn macs_equal(colon_form: &str, bare_form: &str) -> bool {
    let mut bare = bare_form.bytes().map(|b| b.to_ascii_uppercase());
    for b in colon_form.bytes() {
        if b == b':' {
            continue;
        }
        if bare.next() != Some(b.to_ascii_uppercase()) {
            return false;
        }
    }
    bare.next().is_none()
}

fn colon_mac(bare: &str) -> String<20> {
    let mut out = String::new();
    for (i, b) in bare.bytes().enumerate() {
        if i > 0 && i % 2 == 0 {
            let _ = out.push(':');
        }
        let _ = out.push(b as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_comparison() {
        assert!(macs_equal("AA:BB:CC:DD:EE:FF", "aabbccddeeff"));
        assert!(!macs_equal("AA:BB:CC:DD:EE:FF", "aabbccddee00"));
        assert!(!macs_equal("AA:BB:CC", "aabbccdd"));
        assert_eq!(colon_mac("AABBCCDDEEFF").as_str(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn nvram_layout_offsets() {
        assert_eq!(UICR_BACKUP_FLAG_ADDR, 0x003A_D000);
        assert_eq!(UICR_BACKUP_ADDR, 0x003A_D004);
        assert_eq!(ONBOARDED_ADDR, 0x003A_D000 + 300);
    }
}

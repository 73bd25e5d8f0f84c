//! Firmware download and install on the Wi-Fi modem.
//!
//! A 1 Hz-ticked state machine: start the download, poll progress, issue
//! the renew (which reboots the modem into the new image), then wait for
//! the reboot counter to move and check the reported version. A `cancel`
//! flag is consulted at every transition.

use core::fmt::Write as _;

use embassy_time::{Duration, Timer};
use heapless::String;

use crate::error::Error;
use crate::port::{OtaStatus, WifiCtrl, WifiLink};
use crate::types::{OtaError, OtaProgress, Version};

use super::pattern::{CapBuf, Pattern, WaitSet};
use super::WifiAt;

/// Longest accepted download URL.
pub const MAX_OTA_URL_LEN: usize = 1900;

/// `OtaStatus.status` values.
pub const OTA_STATUS_DOWNLOADING: u8 = 1;
pub const OTA_STATUS_FAILED: u8 = 2;
pub const OTA_STATUS_INSTALLED: u8 = 3;

/// `OtaStatus.detail` causes on failure.
pub const OTA_CAUSE_DOWNLOAD_FAILED: i16 = -1;
pub const OTA_CAUSE_INVALID_UPDATE: i16 = -2;
pub const OTA_CAUSE_INTERNAL: i16 = -3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OtaState {
    Idle,
    Start,
    Downloading,
    Renew,
    AwaitReboot,
}

pub(crate) struct OtaInfo {
    state: OtaState,
    cancel: bool,
    url_cmd: String<{ MAX_OTA_URL_LEN + 24 }>,
    expected_version: Version,
    last_pct: u8,
    download_complete: bool,
    reboot_cnt_at_renew: i32,
}

impl OtaInfo {
    pub fn new() -> Self {
        Self {
            state: OtaState::Idle,
            cancel: false,
            url_cmd: String::new(),
            expected_version: [0; 3],
            last_pct: 0,
            download_complete: false,
            reboot_cnt_at_renew: 0,
        }
    }

    pub fn awaiting_reboot(&self) -> bool {
        self.state == OtaState::AwaitReboot
    }
}

impl<'p, L: WifiLink, C: WifiCtrl> WifiAt<'p, L, C> {
    /// Begin a firmware download and install.
    ///
    /// Progress is published as `ota_progress` shadow deltas and on the
    /// OTA status channel; success requires the post-reboot version to
    /// match `expected_version`.
    pub fn start_ota(&self, url: &str, expected_version: Version) -> Result<(), Error> {
        if url.len() > MAX_OTA_URL_LEN {
            error!("OTA URL too long");
            return Err(Error::Invalid);
        }
        self.ota.lock(|o| {
            let mut o = o.borrow_mut();
            if o.state != OtaState::Idle {
                error!("OTA already in progress");
                return Err(Error::Busy);
            }
            o.url_cmd.clear();
            let _ = write!(o.url_cmd, "AT+NWOTADWSTART=rtos,{}", url);
            o.expected_version = expected_version;
            o.last_pct = 0;
            o.download_complete = false;
            o.cancel = false;
            o.state = OtaState::Start;
            Ok(())
        })?;
        self.flags.lock(|f| f.borrow_mut().ota_start_result = None);
        debug!("starting OTA download");
        Ok(())
    }

    /// Request cancellation; honored at the next state transition.
    pub fn stop_ota(&self) {
        self.ota.lock(|o| {
            let mut o = o.borrow_mut();
            if o.state != OtaState::Idle {
                o.cancel = true;
            }
        });
    }

    pub fn ota_in_progress(&self) -> bool {
        self.ota.lock(|o| o.borrow().state != OtaState::Idle)
    }

    /// Long-lived task ticking the OTA engine once per second.
    pub async fn run_ota(&self) -> ! {
        loop {
            Timer::after_secs(1).await;
            if self.ota_in_progress() {
                self.ota_tick().await;
            }
        }
    }

    fn ota_fail(&self, cause: i16, kind: OtaError) {
        let expected = self.ota.lock(|o| {
            let mut o = o.borrow_mut();
            o.state = OtaState::Idle;
            o.cancel = false;
            o.expected_version
        });
        self.shadow().set_ota(OtaProgress::Err(kind));
        self.fabric().publish_fota(OtaStatus {
            status: OTA_STATUS_FAILED,
            detail: cause,
            version: expected,
        });
    }

    fn ota_report_progress(&self, pct: u8) {
        let expected = self.ota.lock(|o| o.borrow().expected_version);
        self.shadow().set_ota(OtaProgress::Downloading(pct));
        self.fabric().publish_fota(OtaStatus {
            status: OTA_STATUS_DOWNLOADING,
            detail: pct as i16,
            version: expected,
        });
    }

    pub(crate) async fn ota_tick(&self) {
        let state = self.ota.lock(|o| o.borrow().state);
        match state {
            OtaState::Idle => {}
            OtaState::Start => self.ota_tick_start().await,
            OtaState::Downloading => self.ota_tick_download().await,
            OtaState::Renew => self.ota_tick_renew().await,
            OtaState::AwaitReboot => self.ota_tick_await_reboot(),
        }
    }

    async fn ota_tick_start(&self) {
        if self.ota.lock(|o| o.borrow().cancel) {
            info!("OTA cancelled before it got started");
            self.ota.lock(|o| {
                let mut o = o.borrow_mut();
                o.state = OtaState::Idle;
                o.cancel = false;
            });
            return;
        }
        self.ota_report_progress(0);

        let cmd = self.ota.lock(|o| o.borrow().url_cmd.clone());
        match self.send_ok_err(cmd.as_str(), Duration::from_secs(2)).await {
            Ok(()) => {
                debug!("OTA start command accepted");
                self.ota.lock(|o| {
                    let mut o = o.borrow_mut();
                    o.last_pct = 0;
                    o.state = OtaState::Downloading;
                });
            }
            Err(e) => {
                error!("error starting OTA: {}", e);
                self.ota_fail(OTA_CAUSE_DOWNLOAD_FAILED, OtaError::StartFailed);
            }
        }
    }

    async fn ota_tick_download(&self) {
        // The async download-result report beats the progress poll when the
        // file is small.
        if let Some(result) = self.flags.lock(|f| f.borrow_mut().ota_start_result.take()) {
            if result.as_str() == "0x00" {
                debug!("OTA file finished downloading");
                self.ota.lock(|o| {
                    let mut o = o.borrow_mut();
                    o.download_complete = true;
                    o.state = OtaState::Renew;
                });
            } else {
                error!("modem reported OTA download failure");
                self.ota_fail(OTA_CAUSE_DOWNLOAD_FAILED, OtaError::StartFailed);
            }
            return;
        }

        if self.ota.lock(|o| o.borrow().cancel) {
            if let Err(e) = self.send_ok_err("AT+NWOTADWSTOP", Duration::from_secs(2)).await {
                // Not installing it, so it is practically stopped.
                error!("error stopping OTA: {}", e);
            }
            debug!("OTA cancelled during download");
            self.ota.lock(|o| {
                let mut o = o.borrow_mut();
                o.state = OtaState::Idle;
                o.cancel = false;
            });
            return;
        }

        let mut pct = CapBuf::<3>::new();
        let mut err = CapBuf::<19>::new();
        let mut wait = WaitSet::new();
        wait.push(Pattern::new("\r\nERROR:%19s").stop().capture(&mut err));
        wait.push(Pattern::new("\r\n+NWOTADWPROG:%3s").stop().capture(&mut pct));
        let ret = self
            .send_and_wait("AT+NWOTADWPROG=rtos", &mut wait, Duration::from_secs(15))
            .await;
        drop(wait);
        match ret {
            Err(_) => {
                error!("timed out getting OTA progress");
                self.ota_fail(OTA_CAUSE_DOWNLOAD_FAILED, OtaError::ProgressTimeout);
            }
            Ok(0) => {
                error!("error getting OTA progress");
                self.ota_fail(OTA_CAUSE_DOWNLOAD_FAILED, OtaError::ProgressError);
            }
            Ok(_) => {
                let Some(amount) = super::decode::parse_int(pct.as_str()) else {
                    error!("error parsing OTA progress");
                    self.ota_fail(OTA_CAUSE_INTERNAL, OtaError::ProgressParse);
                    return;
                };
                if amount >= 100 {
                    debug!("OTA file fully downloaded");
                    self.ota.lock(|o| {
                        let mut o = o.borrow_mut();
                        o.download_complete = true;
                        o.state = OtaState::Renew;
                    });
                    return;
                }
                let amount = amount.clamp(0, 99) as u8;
                let last = self.ota.lock(|o| o.borrow().last_pct);
                if amount > last + 2 {
                    debug!("OTA file {}% downloaded", amount);
                    self.ota_report_progress(amount);
                }
                self.ota.lock(|o| o.borrow_mut().last_pct = amount);
            }
        }
    }

    async fn ota_tick_renew(&self) {
        if self.ota.lock(|o| o.borrow().cancel) {
            debug!("OTA cancelled after download");
            self.ota.lock(|o| {
                let mut o = o.borrow_mut();
                o.state = OtaState::Idle;
                o.cancel = false;
            });
            return;
        }
        if !self.ota.lock(|o| o.borrow().download_complete) {
            error!("OTA download ended before completing");
            self.ota_fail(OTA_CAUSE_DOWNLOAD_FAILED, OtaError::Stalled);
            return;
        }

        info!("sending the modem an OTA renew");
        let reboot_cnt = self.shadow().read(|s| s.reboot_cnt);
        self.flags.lock(|f| f.borrow_mut().rebooting = true);
        // The modem reboots immediately on this command; a timeout is the
        // usual outcome.
        match self.send_ok_err("AT+NWOTARENEW", Duration::from_secs(1)).await {
            Ok(()) | Err(Error::Timeout) => {}
            Err(e) => {
                error!("'{}' when renewing", e);
                self.ota_fail(OTA_CAUSE_INVALID_UPDATE, OtaError::RenewFailed);
                return;
            }
        }
        let expected = self.ota.lock(|o| {
            let mut o = o.borrow_mut();
            o.reboot_cnt_at_renew = reboot_cnt;
            o.state = OtaState::AwaitReboot;
            o.expected_version
        });
        self.shadow().set_ota(OtaProgress::Rebooting);
        self.fabric().publish_fota(OtaStatus {
            status: OTA_STATUS_DOWNLOADING,
            detail: 100,
            version: expected,
        });
    }

    fn ota_tick_await_reboot(&self) {
        let (rebooted, version) = {
            let at_renew = self.ota.lock(|o| o.borrow().reboot_cnt_at_renew);
            self.shadow()
                .read(|s| (s.reboot_cnt > at_renew, s.version))
        };
        if !rebooted {
            return;
        }
        let expected = self.ota.lock(|o| o.borrow().expected_version);
        if version != expected {
            error!("OTA failed, version did not change");
            self.ota_fail(OTA_CAUSE_INVALID_UPDATE, OtaError::VersionMismatch);
            return;
        }
        info!("OTA succeeded, version matches after modem restart");
        self.ota.lock(|o| o.borrow_mut().state = OtaState::Idle);
        self.shadow().set_ota(OtaProgress::Complete);
        self.fabric().publish_fota(OtaStatus {
            status: OTA_STATUS_INSTALLED,
            detail: 0,
            version: expected,
        });
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
    fn start_rejects_concurrent_download() {
        let (_link, _fabric, drv) = setup();
        drv.start_ota("https://example/fw.bin", [1, 2, 3]).unwrap();
        assert_eq!(drv.start_ota("https://example/other.bin", [1, 2, 3]), Err(Error::Busy));
    }

    #[test]
    fn happy_path_through_version_check() {
        let (link, fabric, drv) = setup();
        let mut fota = fabric.fota_events();
        drv.start_ota("https://example/fw.bin", [1, 2, 3]).unwrap();

        // Start: command accepted.
        block_on(join(drv.ota_tick(), async {
            embassy_futures::yield_now().await;
            drv.ingest(b"\r\nOK\r\n").unwrap();
        }));
        assert_eq!(link.sent_at(0), "AT+NWOTADWSTART=rtos,https://example/fw.bin");
        assert!(drv.ota_in_progress());

        // Downloading: progress poll reports 47%.
        block_on(join(drv.ota_tick(), async {
            embassy_futures::yield_now().await;
            drv.ingest(b"\r\n+NWOTADWPROG:47\r\n").unwrap();
        }));
        assert_eq!(drv.state().ota_progress, OtaProgress::Downloading(47));

        // Downloading: complete.
        block_on(join(drv.ota_tick(), async {
            embassy_futures::yield_now().await;
            drv.ingest(b"\r\n+NWOTADWPROG:100\r\n").unwrap();
        }));

        // Renew: tolerated timeout, then await reboot.
        block_on(drv.ota_tick());
        assert_eq!(drv.state().ota_progress, OtaProgress::Rebooting);

        // The modem comes back with the expected version.
        drv.ingest(b"\r\n+INIT:DONE,0,DPM=0\r\n").unwrap();
        drv.ingest(b"\r\n+VER:FRTOS-GEN01-01-TDEVER_123-240601\r\n").unwrap();
        block_on(drv.ota_tick());
        assert_eq!(drv.state().ota_progress, OtaProgress::Complete);
        assert!(!drv.ota_in_progress());

        let mut saw_installed = false;
        while let Some(evt) = fota.try_next_message_pure() {
            if evt.status == OTA_STATUS_INSTALLED {
                saw_installed = true;
            }
        }
        assert!(saw_installed);
    }

    #[test]
    fn version_mismatch_fails_the_install() {
        let (_link, _fabric, drv) = setup();
        drv.start_ota("https://example/fw.bin", [9, 9, 9]).unwrap();
        block_on(join(drv.ota_tick(), async {
            embassy_futures::yield_now().await;
            drv.ingest(b"\r\nOK\r\n").unwrap();
        }));
        block_on(join(drv.ota_tick(), async {
            embassy_futures::yield_now().await;
            drv.ingest(b"\r\n+NWOTADWPROG:100\r\n").unwrap();
        }));
        block_on(drv.ota_tick());
        drv.ingest(b"\r\n+INIT:DONE,0,DPM=0\r\n").unwrap();
        drv.ingest(b"\r\n+VER:FRTOS-GEN01-01-TDEVER_123-240601\r\n").unwrap();
        block_on(drv.ota_tick());
        assert_eq!(drv.state().ota_progress, OtaProgress::Err(OtaError::VersionMismatch));
    }

    #[test]
    fn cancel_honored_between_states() {
        let (_link, _fabric, drv) = setup();
        drv.start_ota("https://example/fw.bin", [1, 2, 3]).unwrap();
        drv.stop_ota();
        block_on(drv.ota_tick());
        assert!(!drv.ota_in_progress());
    }
}

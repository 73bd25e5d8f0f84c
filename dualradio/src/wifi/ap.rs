//! Access-point management: scans, the modem's saved-SSID store, and
//! association.

use core::fmt::Write as _;

use embassy_time::{Duration, Instant};
use heapless::{String, Vec};

use crate::error::Error;
use crate::port::{WifiCtrl, WifiLink};
use crate::types::{ApCreds, MAX_SAVED_SSIDS, SavedSsid};

use super::pattern::{CapBuf, Pattern, WaitSet};
use super::{Transaction, WifiAt, parse_modem_error};

/// Max APs remembered from one scan.
pub const MAX_SCAN_ENTRIES: usize = 16;

/// One AP seen in the last scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScanEntry {
    pub ssid: String<32>,
    pub bssid: String<20>,
    pub rssi: i8,
    pub channel: u8,
    pub flags: String<40>,
}

/// Relation of requested credentials to the current association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CurrentAp {
    /// Connected to that SSID with those exact credentials.
    SameCreds,
    /// Connected to that SSID but with different credentials.
    SameSsidDifferentCreds,
    /// Connected to a different SSID, or not connected.
    Different,
}

/// Locally cached AP knowledge: the modem's saved-SSID store, the last
/// scan, and credentials staged for saving once a connect succeeds.
pub(crate) struct SsidCache {
    saved: [SavedSsid; MAX_SAVED_SSIDS],
    saved_valid: bool,
    scan: Vec<ScanEntry, MAX_SCAN_ENTRIES>,
    scan_at: Option<Instant>,
    last_ap_name: String<32>,
    staged: Option<ApCreds>,
}

impl SsidCache {
    pub fn new() -> Self {
        Self {
            saved: Default::default(),
            saved_valid: false,
            scan: Vec::new(),
            scan_at: None,
            last_ap_name: String::new(),
            staged: None,
        }
    }

    pub fn find_saved(&self, ssid: &str) -> Option<usize> {
        if !self.saved_valid {
            return None;
        }
        self.saved
            .iter()
            .position(|z| !z.ssid.is_empty() && z.ssid.as_str() == ssid)
    }

    pub fn saved_safe(&self, idx: usize) -> bool {
        self.saved.get(idx).map(|z| z.safe).unwrap_or(false)
    }

    pub fn saved_count(&self) -> usize {
        self.saved.iter().filter(|z| !z.ssid.is_empty()).count()
    }

    pub fn invalidate_saved(&mut self) {
        self.saved_valid = false;
    }

    pub fn stage(&mut self, creds: ApCreds) {
        self.staged = Some(creds);
    }

    pub fn unstage(&mut self) {
        self.staged = None;
    }

    pub fn take_staged(&mut self) -> Option<ApCreds> {
        self.staged.take()
    }

    pub fn remember_last_ap(&mut self, name: &str) {
        self.last_ap_name.clear();
        let _ = self.last_ap_name.push_str(&name[..name.len().min(32)]);
    }

    fn absorb_list_line(&mut self, line: &str) {
        // `<idx>,<ssid>,<sec>,<key>,<enc>,<hidden>,<safe>`
        let mut fields = line.trim_end_matches('\r').split(',');
        let Some(idx) = fields.next().and_then(|f| f.trim().parse::<usize>().ok()) else {
            return;
        };
        if idx >= MAX_SAVED_SSIDS {
            return;
        }
        let Some(ssid) = fields.next() else { return };
        let safe = fields.nth(4).map(|f| f.starts_with('1')).unwrap_or(false);
        let entry = &mut self.saved[idx];
        entry.ssid.clear();
        let _ = entry.ssid.push_str(&ssid[..ssid.len().min(32)]);
        entry.safe = safe;
        self.saved_valid = true;
    }
}

/// Absorb an unsolicited `+SSIDLIST:` frame into the cache.
pub(crate) fn handle_ssid_list<L: WifiLink, C: WifiCtrl>(drv: &WifiAt<'_, L, C>, text: &str) {
    let Some(pos) = text.find("+SSIDLIST:") else { return };
    drv.ssids.lock(|c| {
        let mut cache = c.borrow_mut();
        for line in text[pos..].lines().skip(1) {
            cache.absorb_list_line(line);
        }
    });
}

fn parse_scan_block(text: &str, skip_hidden: bool, out: &mut Vec<ScanEntry, MAX_SCAN_ENTRIES>) {
    out.clear();
    // Lines of `<bssid>\t<freq>\t<rssi>\t<flags>\t<ssid>`; a missing ssid
    // field is a hidden AP.
    for line in text.lines() {
        let mut fields = line.split('\t');
        let (Some(bssid), Some(freq), Some(rssi), Some(flags)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let Some(rssi) = super::decode::parse_int(rssi) else { continue };
        let Some(freq) = super::decode::parse_int(freq) else { continue };
        let ssid = fields.next().unwrap_or("");
        if ssid.is_empty() && skip_hidden {
            continue;
        }
        let mut entry = ScanEntry {
            rssi: rssi.clamp(-128, 127) as i8,
            channel: freq_to_channel(freq),
            ..Default::default()
        };
        let _ = entry.bssid.push_str(&bssid[..bssid.len().min(20)]);
        let _ = entry.ssid.push_str(&ssid[..ssid.len().min(32)]);
        let _ = entry.flags.push_str(&flags[..flags.len().min(40)]);
        if out.push(entry).is_err() {
            break;
        }
    }
}

fn freq_to_channel(freq: i32) -> u8 {
    match freq {
        2401..=2495 => (((freq - 2407) / 5).clamp(1, 14)) as u8,
        _ => 0,
    }
}

impl<'p, L: WifiLink, C: WifiCtrl> WifiAt<'p, L, C> {
    /// Refresh the cached scan list unless it is younger than `max_age`.
    pub async fn refresh_ssid_list(
        &self,
        skip_hidden: bool,
        max_age: Duration,
        timeout: Duration,
    ) -> Result<(), Error> {
        let fresh = self.ssids.lock(|c| {
            c.borrow()
                .scan_at
                .map(|at| Instant::now() < at + max_age)
                .unwrap_or(false)
        });
        if fresh {
            return Ok(());
        }
        self.shadow().guard_powered_awake()?;
        let mut tx = self.begin("wfscan", timeout).await?;
        tx.scan(skip_hidden, timeout).await
    }

    /// The last scan results.
    pub fn last_ssid_list(&self) -> Vec<ScanEntry, MAX_SCAN_ENTRIES> {
        self.ssids.lock(|c| c.borrow().scan.clone())
    }

    pub fn find_ssid_in_scan(&self, ssid: &str) -> Option<usize> {
        self.ssids.lock(|c| {
            c.borrow()
                .scan
                .iter()
                .position(|e| e.ssid.as_str() == ssid)
        })
    }

    /// The SSID we were last associated with.
    pub fn last_ap_name(&self) -> String<32> {
        self.ssids.lock(|c| c.borrow().last_ap_name.clone())
    }

    /// Number of credential slots in use on the modem. Requires the saved
    /// list to have been fetched.
    pub fn num_saved_ssids(&self) -> usize {
        self.ssids.lock(|c| c.borrow().saved_count())
    }

    pub fn saved_ssid_by_index(&self, idx: usize) -> Option<SavedSsid> {
        self.ssids.lock(|c| {
            c.borrow()
                .saved
                .get(idx)
                .filter(|z| !z.ssid.is_empty())
                .cloned()
        })
    }

    pub fn find_saved_ssid(&self, ssid: &str) -> Option<usize> {
        self.ssids.lock(|c| c.borrow().find_saved(ssid))
    }

    pub fn clear_local_ssid_list(&self) {
        self.ssids.lock(|c| {
            let mut cache = c.borrow_mut();
            cache.scan.clear();
            cache.scan_at = None;
        });
    }

    /// Fetch the modem's saved-SSID store into the cache (cached after the
    /// first call; the store only changes through us).
    pub async fn fetch_saved_ssids(&self, timeout: Duration) -> Result<(), Error> {
        if self.ssids.lock(|c| c.borrow().saved_valid) {
            return Ok(());
        }
        self.shadow().guard_powered_awake()?;
        let mut tx = self.begin("ssidlist", timeout).await?;
        tx.fetch_saved_ssids(timeout).await
    }

    /// Initiate association with explicit credentials.
    ///
    /// The timeout only covers command acknowledgement; association itself
    /// completes (or fails) through an async `+WFJAP` event.
    pub async fn initiate_connect_to_ssid(&self, creds: &ApCreds, timeout: Duration) -> Result<(), Error> {
        if creds.ssid.is_empty() || creds.sec > 7 || creds.keyidx > 3 || creds.enc > 2 {
            return Err(Error::Invalid);
        }
        self.shadow().guard_powered_awake()?;
        let mut cmd: String<160> = String::new();
        let _ = write!(
            cmd,
            "AT+WFJAP={},{},{},{},{},{}",
            creds.ssid,
            creds.password,
            creds.sec,
            creds.keyidx,
            creds.enc,
            creds.hidden as u8
        );
        self.send_ok_err(&cmd, timeout).await?;
        // Stage unknown credentials so a confirmed association can add them
        // to the saved store.
        let know_it = self.find_saved_ssid(creds.ssid.as_str()).is_some();
        if !know_it && self.num_saved_ssids() < MAX_SAVED_SSIDS {
            debug!("staging new AP credentials until the connect confirms");
            self.ssids.lock(|c| c.borrow_mut().stage(creds.clone()));
        }
        Ok(())
    }

    /// Initiate association with a saved-SSID slot.
    pub async fn initiate_connect_by_index(&self, idx: usize, timeout: Duration) -> Result<(), Error> {
        if idx >= MAX_SAVED_SSIDS {
            return Err(Error::Invalid);
        }
        self.shadow().guard_powered_awake()?;
        let mut cmd: String<24> = String::new();
        let _ = write!(cmd, "AT+SSIDIDX={}", idx);
        self.send_ok_err(&cmd, timeout).await
    }

    /// Disassociate from the current AP.
    pub async fn disconnect_from_ap(&self, timeout: Duration) -> Result<(), Error> {
        self.send_ok_err("AT+WFQAP", timeout).await
    }

    /// Enable or disable the modem's use of its stored AP profile.
    pub async fn set_ap_profile_use(&self, use_profile: bool, timeout: Duration) -> Result<(), Error> {
        let cmd = if use_profile { "AT+WFDIS=0" } else { "AT+WFDIS=1" };
        self.send_ok_err(cmd, timeout).await
    }

    /// Classify `creds` against the current association. `SameCreds` is
    /// verified through the modem's credential check without touching the
    /// association.
    pub async fn is_curr_ap(&self, creds: &ApCreds) -> Result<CurrentAp, Error> {
        let current = self.shadow().read(|s| s.ap_name.clone());
        if current.as_str() != creds.ssid.as_str() {
            return Ok(CurrentAp::Different);
        }
        if self.find_saved_ssid(creds.ssid.as_str()).is_none() {
            return Ok(CurrentAp::Different);
        }
        let mut cmd: String<160> = String::new();
        let _ = write!(
            cmd,
            "AT+SSIDCHECKCREDS={},{},{},{},{}",
            creds.ssid, creds.password, creds.sec, creds.keyidx, creds.enc
        );
        match self.send_ok_err(&cmd, Duration::from_millis(1_000)).await {
            Ok(()) => Ok(CurrentAp::SameCreds),
            Err(Error::MutexBusy) => Err(Error::MutexBusy),
            Err(_) => Ok(CurrentAp::SameSsidDifferentCreds),
        }
    }

    /// Add credentials to the modem's saved-SSID store.
    ///
    /// `idx` of `None` picks the first free slot.
    pub async fn saved_ssids_add(
        &self,
        idx: Option<usize>,
        creds: &ApCreds,
        safe: bool,
        timeout: Duration,
    ) -> Result<(), Error> {
        let slot = match idx {
            Some(i) if i >= MAX_SAVED_SSIDS => return Err(Error::Invalid),
            Some(i) => i as i32,
            None => -1,
        };
        let mut cmd: String<192> = String::new();
        let _ = write!(
            cmd,
            "AT+SSIDINSERT={},{},{},{},{},{},{},{}",
            slot,
            creds.ssid,
            creds.password,
            creds.sec,
            creds.keyidx,
            creds.enc,
            creds.hidden as u8,
            safe as u8
        );
        self.send_ok_err(&cmd, timeout).await?;
        self.ssids.lock(|c| c.borrow_mut().invalidate_saved());
        Ok(())
    }

    pub async fn saved_ssids_del(&self, idx: usize, timeout: Duration) -> Result<(), Error> {
        if idx >= MAX_SAVED_SSIDS {
            return Err(Error::Invalid);
        }
        let mut cmd: String<24> = String::new();
        let _ = write!(cmd, "AT+SSIDDELETE={}", idx);
        self.send_ok_err(&cmd, timeout).await?;
        self.ssids.lock(|c| c.borrow_mut().invalidate_saved());
        Ok(())
    }

    pub async fn saved_ssids_del_all(&self, timeout: Duration) -> Result<(), Error> {
        self.send_ok_err("AT+SSIDDELALL", timeout).await?;
        self.ssids.lock(|c| {
            let mut cache = c.borrow_mut();
            cache.saved = Default::default();
            cache.saved_valid = true;
        });
        Ok(())
    }

    pub async fn set_zone_safe(&self, idx: usize, safe: bool, timeout: Duration) -> Result<(), Error> {
        if idx >= MAX_SAVED_SSIDS {
            return Err(Error::Invalid);
        }
        let mut cmd: String<32> = String::new();
        let _ = write!(cmd, "AT+SSIDCHANGEFLAG={},{}", idx, safe as u8);
        self.send_ok_err(&cmd, timeout).await?;
        self.ssids.lock(|c| c.borrow_mut().invalidate_saved());
        Ok(())
    }

    /// Saved-SSID slot of the best candidate in the last scan: strongest
    /// RSSI, safe zones preferred.
    pub fn best_known_ssid(&self) -> Option<usize> {
        self.ssids.lock(|c| {
            let cache = c.borrow();
            if !cache.saved_valid {
                return None;
            }
            let mut best: Option<(usize, i32)> = None;
            for (idx, zone) in cache.saved.iter().enumerate() {
                if zone.ssid.is_empty() {
                    continue;
                }
                let Some(seen) = cache.scan.iter().find(|e| e.ssid == zone.ssid) else {
                    continue;
                };
                let mut score = seen.rssi as i32;
                if zone.safe {
                    score += 100;
                }
                if best.map(|(_, s)| score > s).unwrap_or(true) {
                    best = Some((idx, score));
                }
            }
            best.map(|(idx, _)| idx)
        })
    }

    /// Persist staged credentials after a confirmed association.
    pub(crate) async fn commit_staged_ssid(&self) {
        let Some(creds) = self.ssids.lock(|c| c.borrow_mut().take_staged()) else {
            return;
        };
        if self.find_saved_ssid(creds.ssid.as_str()).is_some() {
            return;
        }
        if self.num_saved_ssids() >= MAX_SAVED_SSIDS {
            error!("connected to a new AP but the saved-SSID store is full");
            return;
        }
        info!("adding newly confirmed AP to the saved-SSID store");
        if let Err(e) = self.saved_ssids_add(None, &creds, true, Duration::from_secs(2)).await {
            error!("failed to save new AP: {}", e);
        }
    }

    /// Deferred follow-up to an AP drop: keep the modem from silently
    /// rejoining through its stored profile.
    pub(crate) async fn disable_profile_after_disconnect(&self) -> Result<(), Error> {
        // The modem is awake right after it reported the disconnect even if
        // the shadow still says otherwise.
        let old = self.shadow().override_sleeping(crate::types::Tri::KnownFalse);
        let ret = self.send_ok_err("AT+WFDIS=1", Duration::from_secs(5)).await;
        self.shadow().override_sleeping(old);
        ret
    }
}

impl<'t, 'p, L: WifiLink, C: WifiCtrl> Transaction<'t, 'p, L, C> {
    /// Run a scan and absorb the results into the cache.
    pub(crate) async fn scan(&mut self, skip_hidden: bool, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        self.flush();
        self.send("AT+WFSCAN").await?;

        let mut got_ok = false;
        let mut got_scan = false;
        while !(got_ok && got_scan) {
            let mut err = CapBuf::<19>::new();
            let mut wait = WaitSet::new();
            wait.push(Pattern::new("\r\nOK\r\n").stop());
            wait.push(Pattern::new("\r\nERROR:%19s\r\n").stop().capture(&mut err));
            wait.push(Pattern::new("+WFSCAN:").stop());
            let (idx, msg) = self.wait_msg(&mut wait, remaining(deadline)?).await?;
            drop(wait);
            match idx {
                0 => got_ok = true,
                1 => return Err(parse_modem_error(err.as_str())),
                _ => {
                    let mut buf = [0u8; crate::fabric::MSG_CAP];
                    let len = msg.copy_to(&mut buf);
                    if let Ok(text) = core::str::from_utf8(&buf[..len]) {
                        if let Some(pos) = text.find("+WFSCAN:") {
                            self.drv().ssids.lock(|c| {
                                let mut cache = c.borrow_mut();
                                let scan_text = &text[pos + 8..];
                                let mut fresh = Vec::new();
                                parse_scan_block(scan_text, skip_hidden, &mut fresh);
                                cache.scan = fresh;
                                cache.scan_at = Some(Instant::now());
                            });
                            got_scan = true;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Fetch the saved-SSID store (`AT+SSIDLIST=`).
    pub(crate) async fn fetch_saved_ssids(&mut self, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        self.flush();
        self.send("AT+SSIDLIST=").await?;

        let mut got_ok = false;
        let mut got_list = false;
        while !(got_ok && got_list) {
            let mut err = CapBuf::<19>::new();
            let mut wait = WaitSet::new();
            wait.push(Pattern::new("\r\nOK\r\n").stop());
            wait.push(Pattern::new("\r\nERROR:%19s\r\n").stop().capture(&mut err));
            wait.push(Pattern::new("+SSIDLIST:").stop());
            let (idx, msg) = self.wait_msg(&mut wait, remaining(deadline)?).await?;
            drop(wait);
            match idx {
                0 => got_ok = true,
                1 => return Err(parse_modem_error(err.as_str())),
                _ => {
                    let mut buf = [0u8; crate::fabric::MSG_CAP];
                    let len = msg.copy_to(&mut buf);
                    if let Ok(text) = core::str::from_utf8(&buf[..len]) {
                        handle_ssid_list(self.drv(), text);
                        got_list = true;
                    }
                }
            }
        }
        Ok(())
    }
}

fn remaining(deadline: Instant) -> Result<Duration, Error> {
    let now = Instant::now();
    if now >= deadline {
        return Err(Error::Timeout);
    }
    Ok(deadline - now)
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
    fn ssid_list_lines_fill_cache() {
        let (_link, drv) = setup();
        handle_ssid_list(
            &drv,
            "\r\n+SSIDLIST:\r\n0,HomeNet,3,0,1,0,1\r\n2,CoffeeShop,3,0,1,0,0\r\n",
        );
        assert_eq!(drv.find_saved_ssid("HomeNet"), Some(0));
        assert_eq!(drv.find_saved_ssid("CoffeeShop"), Some(2));
        assert_eq!(drv.find_saved_ssid("Nope"), None);
        assert_eq!(drv.num_saved_ssids(), 2);
        assert!(drv.ssids.lock(|c| c.borrow().saved_safe(0)));
        assert!(!drv.ssids.lock(|c| c.borrow().saved_safe(2)));
    }

    #[test]
    fn scan_parse_and_best_known() {
        let (_link, drv) = setup();
        handle_ssid_list(
            &drv,
            "\r\n+SSIDLIST:\r\n0,HomeNet,3,0,1,0,0\r\n1,CoffeeShop,3,0,1,0,1\r\n",
        );
        drv.ssids.lock(|c| {
            let mut cache = c.borrow_mut();
            let mut scan = Vec::new();
            parse_scan_block(
                "aa:bb:cc:dd:ee:ff\t2437\t-40\t[WPA2-PSK-CCMP]\tHomeNet\n\
                 11:22:33:44:55:66\t2412\t-70\t[WPA2-PSK-CCMP]\tCoffeeShop\n\
                 77:88:99:aa:bb:cc\t2412\t-30\t[WPA2-PSK-CCMP]\tStranger\n",
                true,
                &mut scan,
            );
            cache.scan = scan;
        });
        // CoffeeShop is weaker but safe, so it wins.
        assert_eq!(drv.best_known_ssid(), Some(1));
    }

    #[test]
    fn hidden_ssids_skipped_on_request() {
        let mut out = Vec::new();
        parse_scan_block("aa:bb\t2412\t-50\t[ESS]\t\n", true, &mut out);
        assert!(out.is_empty());
        parse_scan_block("aa:bb\t2412\t-50\t[ESS]\t\n", false, &mut out);
        assert_eq!(out.len(), 1);
        assert!(out[0].ssid.is_empty());
    }

    #[test]
    fn connect_stages_unknown_credentials() {
        let (link, drv) = setup();
        let creds = ApCreds {
            ssid: String::try_from("ProtoSorcery").unwrap(),
            password: String::try_from("hunter22").unwrap(),
            sec: 4,
            keyidx: 0,
            enc: 2,
            hidden: false,
        };
        let result = block_on(join(
            drv.initiate_connect_to_ssid(&creds, Duration::from_millis(200)),
            async {
                embassy_futures::yield_now().await;
                drv.ingest(b"\r\nOK\r\n").unwrap();
            },
        ))
        .0;
        assert_eq!(result, Ok(()));
        assert_eq!(link.sent_at(0), "AT+WFJAP=ProtoSorcery,hunter22,4,0,2,0");
        assert!(drv.ssids.lock(|c| c.borrow().staged.is_some()));
        // A disconnect report unstages.
        drv.ingest(b"\r\n+WFJAP:0,TIMEOUT\r\n").unwrap();
        assert!(drv.ssids.lock(|c| c.borrow().staged.is_none()));
    }

    #[test]
    fn invalid_creds_rejected_without_wire_traffic() {
        let (link, drv) = setup();
        let creds = ApCreds {
            sec: 9,
            ..Default::default()
        };
        let result = block_on(drv.initiate_connect_to_ssid(&creds, Duration::from_millis(100)));
        assert_eq!(result, Err(Error::Invalid));
        assert_eq!(link.sent_count(), 0);
    }

    #[test]
    fn is_curr_ap_distinguishes_ssids() {
        let (_link, drv) = setup();
        let creds = ApCreds {
            ssid: String::try_from("Elsewhere").unwrap(),
            ..Default::default()
        };
        // Not associated at all.
        assert_eq!(block_on(drv.is_curr_ap(&creds)), Ok(CurrentAp::Different));
    }
}

use core::fmt;

/// The two physical radios, plus "no radio selected".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Radio {
    #[default]
    None,
    Wifi,
    Lte,
}

impl Radio {
    pub const fn as_str(self) -> &'static str {
        match self {
            Radio::None => "none",
            Radio::Wifi => "wifi",
            Radio::Lte => "lte",
        }
    }

    /// Index into per-radio bookkeeping arrays. `None` has no slot.
    pub(crate) const fn slot(self) -> Option<usize> {
        match self {
            Radio::Wifi => Some(0),
            Radio::Lte => Some(1),
            Radio::None => None,
        }
    }
}

impl fmt::Display for Radio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Three-valued state of a modem attribute.
///
/// `Unknown` is the post-reset value until the modem has either reported the
/// attribute or been queried for it. Readers must handle `Unknown` explicitly;
/// only transitions to a `Known*` variant are authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Tri {
    #[default]
    Unknown,
    KnownFalse,
    KnownTrue,
}

impl Tri {
    pub const fn is_true(self) -> bool {
        matches!(self, Tri::KnownTrue)
    }

    pub const fn is_false(self) -> bool {
        matches!(self, Tri::KnownFalse)
    }

    pub const fn is_known(self) -> bool {
        !matches!(self, Tri::Unknown)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Tri::Unknown => "unknown",
            Tri::KnownFalse => "false",
            Tri::KnownTrue => "true",
        }
    }
}

impl From<bool> for Tri {
    fn from(b: bool) -> Self {
        if b { Tri::KnownTrue } else { Tri::KnownFalse }
    }
}

/// State of the UICR backup blob held in the Wi-Fi modem's NVRAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BackupStatus {
    #[default]
    Unknown,
    /// No backup has been written yet.
    None,
    /// A backup exists and matches the on-chip UICR.
    Exists,
    /// A backup exists but disagrees with the on-chip UICR. Developer
    /// intervention required.
    Mismatch,
}

/// Progress of a Wi-Fi modem firmware download, mirrored into the shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OtaProgress {
    #[default]
    None,
    Downloading(u8),
    Complete,
    Rebooting,
    Err(OtaError),
}

/// Terminal OTA failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OtaError {
    StartFailed,
    ProgressTimeout,
    ProgressError,
    ProgressParse,
    Stalled,
    StopFailed,
    RenewFailed,
    VersionMismatch,
}

impl OtaError {
    pub const fn as_str(self) -> &'static str {
        match self {
            OtaError::StartFailed => "error starting download",
            OtaError::ProgressTimeout => "timeout getting progress",
            OtaError::ProgressError => "error getting progress",
            OtaError::ProgressParse => "error parsing progress",
            OtaError::Stalled => "download stalled",
            OtaError::StopFailed => "error stopping download",
            OtaError::RenewFailed => "error renewing firmware",
            OtaError::VersionMismatch => "version mismatch after reboot",
        }
    }
}

/// Firmware version triple as reported by `+VER:`.
pub type Version = [u8; 3];

/// Sleep state targets accepted by [`crate::WifiAt::set_sleep_mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SleepMode {
    /// DPM off, not sleeping.
    None,
    /// DPM on and asleep.
    DpmAsleep,
    /// DPM on but held awake.
    DpmAwake,
    /// RTC sleep for the given duration.
    RtcAsleep(embassy_time::Duration),
}

/// RSSI sentinel reported while not associated to an AP.
pub const RSSI_NOT_CONNECTED: i8 = 100;

/// Max subscription topics the modem tracks.
pub const MAX_SUB_TOPICS: usize = 8;
/// Max length of one subscription topic.
pub const MAX_TOPIC_LEN: usize = 64;
/// Saved-SSID slots in the modem's credential store.
pub const MAX_SAVED_SSIDS: usize = 5;

/// Credentials and radio parameters for one access point.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ApCreds {
    pub ssid: heapless::String<32>,
    pub password: heapless::String<64>,
    /// Security protocol, 0 (open) ..= 7 (WPA2 RSN & WPA3 SAE).
    pub sec: u16,
    /// WEP key index, 0..=3. Ignored unless `sec == 1`.
    pub keyidx: u16,
    /// Encryption, 0 (TKIP), 1 (AES), 2 (TKIP+AES).
    pub enc: u16,
    pub hidden: bool,
}

/// One entry of the modem's saved-SSID store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SavedSsid {
    pub ssid: heapless::String<32>,
    /// The AP lives in a zone the application marked safe.
    pub safe: bool,
}

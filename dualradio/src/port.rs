use embedded_io_async::Write;

use crate::error::Error;
use crate::types::Version;

/// Byte-level data link to the Wi-Fi modem.
///
/// The physical transport (SPI or UART framing) is out of scope for this
/// crate; integrations implement this trait, or use [`SerialLink`] over an
/// `embedded-io-async` writer. Inbound frames travel the other way: the
/// transport glue hands each received frame to [`crate::WifiAt::ingest`].
pub trait WifiLink {
    /// Transmit one framed command to the modem.
    async fn write_frame(&mut self, bytes: &[u8]) -> Result<(), Error>;
}

/// Power and wake control lines of the Wi-Fi modem.
///
/// Kept separate from the data link so rails can be toggled while a
/// transaction is wedged on the modem mutex.
pub trait WifiCtrl {
    /// Assert or drop the modem power rails / enable lines.
    fn set_power(&mut self, on: bool);

    /// Pulse the RTC wake line once. The modem wakes on the falling edge.
    async fn wake_pulse(&mut self);
}

/// [`WifiLink`] over any `embedded-io-async` byte sink.
pub struct SerialLink<W: Write> {
    tx: W,
}

impl<W: Write> SerialLink<W> {
    pub fn new(tx: W) -> Self {
        Self { tx }
    }
}

impl<W: Write> WifiLink for SerialLink<W> {
    async fn write_frame(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.tx.write_all(bytes).await.map_err(|_| Error::Timeout)?;
        self.tx.flush().await.map_err(|_| Error::Timeout)
    }
}

/// Power-management collaborator: system reboot and rail-level modem power.
pub trait Pmic {
    /// Request a system reboot. On hardware this does not return; fakes
    /// record the request.
    fn reboot(&self, reason: &str);

    /// Hard power-off of the cellular modem at the rail level.
    fn modem_power_off(&self, force: bool) -> Result<(), Error>;

    /// Rail-level power-on of the cellular modem.
    fn modem_power_on(&self) -> Result<(), Error>;
}

/// Outcome of comparing the stored UICR backup with the live UICR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UicrCompare {
    /// Backup and UICR agree.
    Match,
    /// The UICR was corrected from the backup; a reboot is required.
    Restored,
    /// Disagreement that cannot be repaired.
    Mismatch,
}

/// Size of the exported UICR backup blob.
pub const UICR_BACKUP_LEN: usize = 128;

/// Read-only access to the device's UICR provisioning data.
pub trait Uicr {
    /// Device serial number, e.g. `DT0123456789AB`.
    fn serial_number(&self) -> &str;

    /// Wi-Fi MAC as provisioned, `XXYYZZAABBCC` (no separators).
    fn wifi_mac(&self) -> &str;

    /// XTAL tuning value for the Wi-Fi modem.
    fn xtal_trim(&self) -> i32;

    /// UICR schema version word.
    fn version_word(&self) -> u32;

    /// Whether the UICR content passes validation.
    fn verify(&self) -> bool;

    /// Export the UICR content into `out` (exactly [`UICR_BACKUP_LEN`] bytes).
    fn export(&self, out: &mut [u8; UICR_BACKUP_LEN]);

    /// Compare a stored backup against the live UICR, restoring fields
    /// where possible.
    fn compare_restore(&self, backup: &[u8; UICR_BACKUP_LEN]) -> UicrCompare;

    /// The unit has been through factory ship-out.
    fn shipping_flag(&self) -> bool;

    /// The unit is still on the factory line.
    fn in_factory(&self) -> bool;
}

/// Application notifications from the radio manager.
///
/// Each completed switch fires exactly one callback.
pub trait RadioNotify {
    fn switched_to_wifi(&self);
    fn switched_to_lte(&self);

    /// A firmware-download progress report for either radio.
    fn ota_status(&self, _status: OtaStatus) {}
}

/// Download status pushed to [`RadioNotify::ota_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OtaStatus {
    /// 1 = downloading, 2 = failed, 3 = installed.
    pub status: u8,
    /// Percent downloaded, or an error cause code on failure.
    pub detail: i16,
    /// Expected firmware version for this download.
    pub version: Version,
}

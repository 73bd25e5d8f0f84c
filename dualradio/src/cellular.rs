//! Seam to the cellular LTE modem.
//!
//! The cellular side has its own driver elsewhere in the firmware; this
//! crate only needs power and MQTT control plus the observable status
//! shadow. Status *changes* additionally arrive on the fabric's
//! `lte_status_update` channel.

use crate::error::Error;
use crate::fabric::LteStatus;

/// Control and observation of the cellular modem.
///
/// Implementations are expected to be cheap to call; the radio manager
/// polls [`CellularModem::status`] while driving switches.
pub trait CellularModem {
    /// Power the modem on (graceful, through its driver).
    fn power_on(&self) -> Result<(), Error>;

    /// Power the modem off (graceful, through its driver).
    fn power_off(&self) -> Result<(), Error>;

    fn is_powered(&self) -> bool;

    /// Start the modem's MQTT client.
    fn start_mqtt(&self) -> Result<(), Error>;

    /// Stop the modem's MQTT client.
    fn stop_mqtt(&self) -> Result<(), Error>;

    /// Current status shadow.
    fn status(&self) -> LteStatus;
}

/// Convenience reads over the status shadow.
pub trait CellularStatusExt {
    fn lte_connected(&self) -> bool;
    fn lte_has_worked(&self) -> bool;
    fn mqtt_enabled(&self) -> bool;
    fn mqtt_connected(&self) -> bool;
}

impl<T: CellularModem + ?Sized> CellularStatusExt for T {
    fn lte_connected(&self) -> bool {
        self.status().get(LteStatus::LTE_CONNECTED)
    }

    fn lte_has_worked(&self) -> bool {
        self.status().get(LteStatus::LTE_WORKING)
    }

    fn mqtt_enabled(&self) -> bool {
        self.status().get(LteStatus::MQTT_ENABLED)
    }

    fn mqtt_connected(&self) -> bool {
        self.status().get(LteStatus::MQTT_CONNECTED)
    }
}

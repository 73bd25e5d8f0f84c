use core::fmt;

/// Error taxonomy shared by the driver and the radio manager.
///
/// One variant per failure kind, never a naked integer. Transient kinds
/// (`Timeout`, `MutexBusy`, `Asleep`, `NotPowered`) are retried by the radio
/// manager's step machine; `ModemError` decrements the retry budget
/// immediately; `Fatal` requests a system reboot through the power channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// A bounded wait elapsed.
    Timeout,
    /// The modem mutex could not be acquired within the deadline.
    MutexBusy,
    /// Rejected because the modem shadow says it is sleeping.
    Asleep,
    /// Rejected because the modem is powered off.
    NotPowered,
    /// The modem returned `ERROR` with an unparseable or unexpected payload.
    BadResponse,
    /// The modem returned `ERROR:<code>`.
    ModemError(i16),
    /// Arguments failed precondition validation.
    Invalid,
    /// Message pool exhausted and no evictable message found.
    OutOfMemory,
    /// A conflicting operation is already in flight.
    Busy,
    /// An invariant was violated; the caller must reboot.
    Fatal,
    /// A wake was requested within the minimum inter-wake window.
    TooSoon,
    /// `done()` called with a prep refcount of zero.
    TooManyReleases,
    /// Already associated to the requested AP with identical credentials.
    AlreadyConnected,
    /// The operation is disabled by policy (e.g. Wi-Fi use switched off).
    NotSupported,
}

impl Error {
    /// Human description, including the modem's SSID/crypto error table.
    pub fn describe(&self) -> &'static str {
        match self {
            Error::Timeout => "timeout",
            Error::MutexBusy => "mutex busy",
            Error::Asleep => "modem is sleeping",
            Error::NotPowered => "modem is powered off",
            Error::BadResponse => "error response",
            Error::ModemError(code) => modem_error_str(*code),
            Error::Invalid => "invalid argument",
            Error::OutOfMemory => "out of memory",
            Error::Busy => "operation already in flight",
            Error::Fatal => "fatal: invariant violated",
            Error::TooSoon => "too soon to wake modem",
            Error::TooManyReleases => "radio released more times than prepared",
            Error::AlreadyConnected => "already connected to that AP",
            Error::NotSupported => "disabled by policy",
        }
    }

    /// Whether the radio-manager step machine should retry this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::MutexBusy | Error::Asleep | Error::NotPowered | Error::Busy
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

impl From<embassy_time::TimeoutError> for Error {
    fn from(_: embassy_time::TimeoutError) -> Self {
        Error::Timeout
    }
}

/// Map the modem's numeric `ERROR:-<code>` payloads to human strings.
///
/// Codes 801..=824 are the saved-SSID / credential-store errors.
pub fn modem_error_str(code: i16) -> &'static str {
    match code {
        801 => "SSID invalid",
        802 => "SSID bad PW",
        803 => "SSID bad Sec",
        804 => "SSID bad KeyIdx",
        805 => "SSID bad Enc",
        806 => "SSID bad Hidden",
        807 => "SSID bad Safe",
        808 => "SSID bad WPA type",
        809 => "SSID bad WPA rng",
        810 => "SSID bad Enc rng",
        811 => "SSID bad Safe rng",
        812 => "SSID Idx empty",
        813 => "SSID bad Idx",
        814 => "SSID Idx in use",
        815 => "SSID Hid save err",
        816 => "SSID Key save err",
        817 => "SSID Enc save err",
        818 => "SSID Aut save err",
        819 => "SSIDLIST save err",
        820 => "SSIDLIST Mem err",
        821 => "SSIDLIST Decry err",
        822 => "SSIDLIST Encry err",
        823 => "SSIDLIST Crypto mismatch",
        824 => "SSIDLIST Crypto verify err",
        _ => "modem error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Timeout.is_transient());
        assert!(Error::MutexBusy.is_transient());
        assert!(Error::Asleep.is_transient());
        assert!(Error::NotPowered.is_transient());
        assert!(!Error::ModemError(801).is_transient());
        assert!(!Error::BadResponse.is_transient());
        assert!(!Error::Fatal.is_transient());
    }

    #[test]
    fn ssid_error_table() {
        assert_eq!(Error::ModemError(821).describe(), "SSIDLIST Decry err");
        assert_eq!(Error::ModemError(5).describe(), "modem error");
    }

    #[test]
    fn timeout_conversion() {
        let e: Error = embassy_time::TimeoutError.into();
        assert_eq!(e, Error::Timeout);
    }
}

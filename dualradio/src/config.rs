use embassy_time::Duration;
use heapless::String;

/// Static configuration for the coordination core.
///
/// Everything here is plain data resolved at integration time; the driver and
/// radio manager never reach for ambient globals.
#[derive(Clone)]
pub struct Config {
    /// MQTT broker host name, programmed into the modem at boot.
    pub broker_host: String<64>,
    /// MQTT broker TLS port.
    pub broker_port: u16,
    /// Brand id prefixed to the serial number to form the MQTT client id.
    pub brand_id: i16,
    /// Prefix for the DHCP client hostname; the device serial is appended.
    pub dhcp_hostname_prefix: String<20>,
    /// NTP pool the modem synchronizes against.
    pub ntp_server: String<32>,
    /// Wi-Fi country code.
    pub country_code: String<4>,
    /// DPM wakeup interval programmed at boot, seconds.
    pub dpm_wakeup_secs: u16,
    /// DPM keep-alive programmed at boot, milliseconds.
    pub dpm_keepalive_ms: u32,
    /// The modem drops wake pulses issued within this window of a prior
    /// sleep; wakes inside it are refused with `TooSoon`.
    pub after_sleep_wait: Duration,
    /// Pending incoming messages older than this are evictable when the
    /// pool is exhausted.
    pub flush_age: Duration,
    /// Radio switching is deferred this long after boot.
    pub boot_grace: Duration,
    /// Default duration/period for the reconnect job.
    pub reconnect_duration: Duration,
    pub reconnect_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_host: String::try_from("mqtt.collar.example.com").unwrap(),
            broker_port: 8883,
            brand_id: 1,
            dhcp_hostname_prefix: String::try_from("Collar-Tracker-").unwrap(),
            ntp_server: String::try_from("pool.ntp.org").unwrap(),
            country_code: String::try_from("US").unwrap(),
            dpm_wakeup_secs: 30,
            dpm_keepalive_ms: 30_000,
            after_sleep_wait: Duration::from_millis(1_000),
            flush_age: Duration::from_millis(2_000),
            boot_grace: Duration::from_millis(8_000),
            reconnect_duration: Duration::from_secs(10),
            reconnect_period: Duration::from_secs(60),
        }
    }
}

use mac_address::MacAddress;
use serde_derive::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub backend: Backend,
    pub scan: Option<ScanConfig>,
    pub connect: Option<ConnectConfig>,
    pub simulation: Option<SimulationConfig>,
    pub mqtt: Option<MqttConfig>,
}

#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Ble,
    Simulated,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    /// How often the current device list is reported.
    pub interval_seconds: Option<u64>,
    /// BLE backend only: advertised local name prefix identifying a beacon.
    pub name_prefix: Option<String>,
    /// BLE backend only: manufacturer id identifying a beacon.
    pub company_id: Option<u16>,
}

impl ScanConfig {
    pub fn interval_seconds(&self) -> u64 {
        self.interval_seconds.unwrap_or(2)
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ConnectConfig {
    pub max_attempts: Option<u32>,
}

impl ConnectConfig {
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(1).max(1)
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct SimulationConfig {
    pub ranging_interval_ms: Option<u64>,
    /// Number of connect calls that fail before one succeeds.
    pub fail_connects: Option<u32>,
    #[serde(default)]
    pub beacons: Vec<SimulatedBeacon>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SimulatedBeacon {
    pub address: MacAddress,
    pub name: Option<String>,
    pub distance_meters: Option<f64>,
}

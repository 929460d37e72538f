//! Device configuration
//!
//! `DeviceConnectionConfig` mirrors the persisted device record verbatim;
//! `settings()` validates it once into a `TransportSettings` tagged union.
//! `DeviceProfile` bundles a device, its register map and polling defaults
//! and is loaded with figment from YAML, TOML or JSON plus `MODBUS_` env
//! overrides.

use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use voltage_comlink::error::{ComLinkError, Result};

use super::constants::{
    DEFAULT_BAUD_RATE, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_POLL_INTERVAL_MS,
    DEFAULT_RECONNECT_DELAY_MS, DEFAULT_STOP_BITS, DEFAULT_TCP_PORT, DEFAULT_TIMEOUT_MS,
};
use super::register_map::{RegisterMap, RegisterMapEntry};
use super::transport::ModbusMode;

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    #[serde(alias = "None")]
    None,
    #[serde(alias = "Even")]
    Even,
    #[serde(alias = "Odd")]
    Odd,
}

/// Device connection record as persisted by configuration tooling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConnectionConfig {
    pub name: String,
    pub protocol: ModbusMode,
    #[serde(default, alias = "ip", skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baud_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_bits: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_bits: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parity: Option<Parity>,
    #[serde(alias = "unit_id", alias = "slaveId")]
    pub unit_id: u8,
    /// Response timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub auto_reconnect: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_reconnect_attempts: Option<u32>,
}

impl DeviceConnectionConfig {
    /// TCP device with default timeout and reconnect policy
    pub fn tcp(name: impl Into<String>, host: impl Into<String>, port: u16, unit_id: u8) -> Self {
        Self {
            name: name.into(),
            protocol: ModbusMode::Tcp,
            host: Some(host.into()),
            port: Some(port),
            serial_port: None,
            baud_rate: None,
            data_bits: None,
            stop_bits: None,
            parity: None,
            unit_id,
            timeout: None,
            auto_reconnect: false,
            reconnect_delay_ms: None,
            max_reconnect_attempts: None,
        }
    }

    /// Serial (RTU or ASCII) device with default line parameters
    pub fn serial(
        name: impl Into<String>,
        protocol: ModbusMode,
        serial_port: impl Into<String>,
        baud_rate: u32,
        unit_id: u8,
    ) -> Self {
        Self {
            protocol,
            host: None,
            port: None,
            serial_port: Some(serial_port.into()),
            baud_rate: Some(baud_rate),
            ..Self::tcp(name, String::new(), 0, unit_id)
        }
    }

    /// Validate the record into transport settings
    pub fn settings(&self) -> Result<TransportSettings> {
        if self.timeout == Some(0) {
            return Err(ComLinkError::config(format!(
                "{}: timeout must be greater than 0",
                self.name
            )));
        }

        match self.protocol {
            ModbusMode::Tcp => {
                let host = self
                    .host
                    .as_deref()
                    .map(str::trim)
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| {
                        ComLinkError::config(format!("{}: TCP device requires a host", self.name))
                    })?;
                Ok(TransportSettings::Tcp {
                    host: host.to_string(),
                    port: self.port.unwrap_or(DEFAULT_TCP_PORT),
                })
            },
            ModbusMode::Rtu | ModbusMode::Ascii => {
                let framing = if self.protocol == ModbusMode::Rtu {
                    SerialFraming::Rtu
                } else {
                    SerialFraming::Ascii
                };
                let path = self
                    .serial_port
                    .as_deref()
                    .filter(|p| !p.trim().is_empty())
                    .ok_or_else(|| {
                        ComLinkError::config(format!(
                            "{}: {} device requires a serialPort",
                            self.name, self.protocol
                        ))
                    })?;

                let baud_rate = self.baud_rate.unwrap_or(DEFAULT_BAUD_RATE);
                if baud_rate == 0 {
                    return Err(ComLinkError::config(format!(
                        "{}: baudRate must be greater than 0",
                        self.name
                    )));
                }
                let data_bits = self.data_bits.unwrap_or(framing.default_data_bits());
                if !(5..=8).contains(&data_bits) {
                    return Err(ComLinkError::config(format!(
                        "{}: dataBits must be 5-8, got {}",
                        self.name, data_bits
                    )));
                }
                let stop_bits = self.stop_bits.unwrap_or(DEFAULT_STOP_BITS);
                if !(1..=2).contains(&stop_bits) {
                    return Err(ComLinkError::config(format!(
                        "{}: stopBits must be 1 or 2, got {}",
                        self.name, stop_bits
                    )));
                }

                Ok(TransportSettings::Serial {
                    framing,
                    line: SerialLine {
                        path: path.to_string(),
                        baud_rate,
                        data_bits,
                        stop_bits,
                        parity: self.parity.unwrap_or(framing.default_parity()),
                    },
                })
            },
        }
    }

    /// Response timeout, also used for connect/open
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout.unwrap_or(DEFAULT_TIMEOUT_MS))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: self.auto_reconnect,
            delay: Duration::from_millis(
                self.reconnect_delay_ms.unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
            ),
            max_attempts: self
                .max_reconnect_attempts
                .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS),
        }
    }
}

/// Serial framing flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialFraming {
    Rtu,
    Ascii,
}

impl SerialFraming {
    fn default_data_bits(self) -> u8 {
        match self {
            SerialFraming::Rtu => 8,
            SerialFraming::Ascii => 7,
        }
    }

    fn default_parity(self) -> Parity {
        match self {
            SerialFraming::Rtu => Parity::None,
            SerialFraming::Ascii => Parity::Even,
        }
    }
}

/// Serial line parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialLine {
    pub path: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

/// Validated transport parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSettings {
    Tcp { host: String, port: u16 },
    Serial { framing: SerialFraming, line: SerialLine },
}

impl TransportSettings {
    pub fn mode(&self) -> ModbusMode {
        match self {
            TransportSettings::Tcp { .. } => ModbusMode::Tcp,
            TransportSettings::Serial {
                framing: SerialFraming::Rtu,
                ..
            } => ModbusMode::Rtu,
            TransportSettings::Serial {
                framing: SerialFraming::Ascii,
                ..
            } => ModbusMode::Ascii,
        }
    }

    /// Human-readable target (`host:port` or serial path)
    pub fn target(&self) -> String {
        match self {
            TransportSettings::Tcp { host, port } => format!("{host}:{port}"),
            TransportSettings::Serial { line, .. } => format!(
                "{} @{} {}{}{}",
                line.path,
                line.baud_rate,
                line.data_bits,
                match line.parity {
                    Parity::None => 'N',
                    Parity::Even => 'E',
                    Parity::Odd => 'O',
                },
                line.stop_bits
            ),
        }
    }
}

/// Bounded automatic reconnection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Polling defaults of a profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_ms", alias = "pollingInterval")]
    pub interval_ms: u64,
    /// Points to poll; empty means every point in the map
    #[serde(default)]
    pub points: Vec<String>,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
            points: Vec::new(),
        }
    }
}

/// Device, register map and polling defaults in one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub device: DeviceConnectionConfig,
    #[serde(default)]
    pub registers: BTreeMap<String, RegisterMapEntry>,
    #[serde(default)]
    pub polling: PollingConfig,
}

impl DeviceProfile {
    /// Load a profile file, then apply `MODBUS_` environment overrides
    /// (`MODBUS_DEVICE__HOST=10.0.0.5`)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ComLinkError::config(format!(
                "Profile not found: {}",
                path.display()
            )));
        }
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ComLinkError::config("Profile file must have an extension"))?;

        let figment = match extension {
            "toml" => Figment::new().merge(Toml::file(path)),
            "yaml" | "yml" => Figment::new().merge(Yaml::file(path)),
            "json" => Figment::new().merge(Json::file(path)),
            _ => {
                return Err(ComLinkError::config(format!(
                    "Unsupported profile format: {}",
                    extension
                )))
            },
        };

        Self::from_figment(figment.merge(Env::prefixed("MODBUS_").split("__")))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let profile: Self = figment
            .extract()
            .map_err(|e| ComLinkError::config(format!("Failed to load profile: {}", e)))?;
        profile.device.settings()?;
        Ok(profile)
    }

    /// Validate the register entries into a resolver map
    pub fn register_map(&self) -> Result<RegisterMap> {
        RegisterMap::from_entries(self.registers.clone())
    }

    /// Points selected for polling (all points when none are listed)
    pub fn polling_points(&self) -> Vec<String> {
        if self.polling.points.is_empty() {
            self.registers.keys().cloned().collect()
        } else {
            self.polling.points.clone()
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_device_record_deserialization() {
        let json = r#"{
            "name": "bms-1",
            "protocol": "TCP",
            "ip": "192.168.1.20",
            "unit_id": 3,
            "timeout": 1500,
            "autoReconnect": true
        }"#;
        let config: DeviceConnectionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.host.as_deref(), Some("192.168.1.20"));
        assert_eq!(config.unit_id, 3);
        assert_eq!(config.response_timeout(), Duration::from_millis(1500));

        assert_eq!(
            config.settings().unwrap(),
            TransportSettings::Tcp {
                host: "192.168.1.20".into(),
                port: 502
            }
        );

        let policy = config.reconnect_policy();
        assert!(policy.enabled);
        assert_eq!(policy.delay, Duration::from_secs(5));
        assert_eq!(policy.max_attempts, 5);
    }

    #[test]
    fn test_serial_defaults() {
        let rtu = DeviceConnectionConfig::serial("meter", ModbusMode::Rtu, "/dev/ttyUSB0", 19200, 1);
        let TransportSettings::Serial { framing, line } = rtu.settings().unwrap() else {
            panic!("expected serial settings");
        };
        assert_eq!(framing, SerialFraming::Rtu);
        assert_eq!((line.data_bits, line.stop_bits, line.parity), (8, 1, Parity::None));

        let ascii =
            DeviceConnectionConfig::serial("meter", ModbusMode::Ascii, "/dev/ttyUSB0", 9600, 1);
        let settings = ascii.settings().unwrap();
        assert_eq!(settings.mode(), ModbusMode::Ascii);
        assert_eq!(settings.target(), "/dev/ttyUSB0 @9600 7E1");
    }

    #[test]
    fn test_parity_aliases() {
        let p: Parity = serde_json::from_str("\"Even\"").unwrap();
        assert_eq!(p, Parity::Even);
        let p: Parity = serde_json::from_str("\"odd\"").unwrap();
        assert_eq!(p, Parity::Odd);
    }

    #[test]
    fn test_settings_validation() {
        let mut config = DeviceConnectionConfig::tcp("pcs", "  ", 502, 1);
        assert!(matches!(config.settings(), Err(ComLinkError::Config(_))));

        config.host = Some("10.0.0.1".into());
        config.timeout = Some(0);
        assert!(config.settings().is_err());

        let mut serial =
            DeviceConnectionConfig::serial("meter", ModbusMode::Rtu, "/dev/ttyS1", 9600, 1);
        serial.serial_port = None;
        assert!(serial.settings().is_err());

        let mut serial =
            DeviceConnectionConfig::serial("meter", ModbusMode::Rtu, "/dev/ttyS1", 9600, 1);
        serial.data_bits = Some(9);
        assert!(serial.settings().is_err());
        serial.data_bits = None;
        serial.stop_bits = Some(3);
        assert!(serial.settings().is_err());
        serial.stop_bits = None;
        serial.baud_rate = Some(0);
        assert!(serial.settings().is_err());
    }

    #[test]
    fn test_profile_load_yaml() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
device:
  name: bms-1
  protocol: TCP
  host: 127.0.0.1
  port: 1502
  unitId: 1
registers:
  soc:
    address: 10
    type: holdingRegister
    dataType: uint16
    scale: 1
    units: "%"
  voltage:
    address: 20
    type: input_register
    dataType: float32
polling:
  intervalMs: 1000
"#
        )
        .unwrap();

        let profile = DeviceProfile::load(file.path()).unwrap();
        assert_eq!(profile.device.port, Some(1502));
        assert_eq!(profile.registers.len(), 2);
        assert_eq!(profile.polling.interval_ms, 1000);
        assert_eq!(profile.polling_points(), vec!["soc", "voltage"]);

        let map = profile.register_map().unwrap();
        assert!(map.get("voltage").is_ok());
    }

    #[test]
    fn test_profile_load_json_invalid_device() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"device": {{"name": "x", "protocol": "RTU", "unitId": 1}}}}"#
        )
        .unwrap();
        assert!(matches!(
            DeviceProfile::load(file.path()),
            Err(ComLinkError::Config(_))
        ));
    }

    #[test]
    fn test_serial_profile_written_by_tooling() {
        let mut device =
            DeviceConnectionConfig::serial("meter", ModbusMode::Ascii, "/dev/ttyS2", 4800, 9);
        device.parity = Some(Parity::Odd);
        let profile = DeviceProfile {
            device,
            registers: BTreeMap::new(),
            polling: PollingConfig::default(),
        };

        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        file.write_all(serde_yaml::to_string(&profile).unwrap().as_bytes())
            .unwrap();

        let loaded = DeviceProfile::load(file.path()).unwrap();
        assert_eq!(loaded, profile);
        assert_eq!(
            loaded.device.settings().unwrap().target(),
            "/dev/ttyS2 @4800 7O1"
        );
    }

    #[test]
    fn test_profile_missing_or_unsupported() {
        assert!(DeviceProfile::load("/nonexistent/profile.yaml").is_err());
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(DeviceProfile::load(file.path()).is_err());
    }
}

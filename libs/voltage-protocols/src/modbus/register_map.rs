//! Register map resolver
//!
//! Maps data-point names to validated register specs. Entries are checked
//! once when the map is built, so a malformed map fails at load time instead
//! of producing wrong decodes later. The map is immutable afterwards and
//! shared read-only between concurrent readers and the poller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use voltage_comlink::error::{ComLinkError, Result};
use voltage_comlink::DecodedValue;

use super::client::ModbusClient;
use super::constants::DEFAULT_STRING_REGISTERS;
use super::types::{DataType, PointSpec, Region, ValueCodec};

/// Register-map record as persisted by configuration tooling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMapEntry {
    pub address: u16,
    #[serde(rename = "type")]
    pub region: Region,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
    #[serde(default, alias = "scaleFactor", skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<f64>,
    #[serde(default, alias = "unit", skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Number of values; register count for `string` points
    #[serde(default, alias = "stringLength", skip_serializing_if = "Option::is_none")]
    pub length: Option<u16>,
}

impl RegisterMapEntry {
    pub fn new(region: Region, address: u16) -> Self {
        Self {
            address,
            region,
            data_type: None,
            scale: None,
            offset: None,
            units: None,
            description: None,
            length: None,
        }
    }

    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = Some(data_type);
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    fn resolve(&self) -> Result<PointSpec> {
        let quantity = self.length.unwrap_or(match self.data_type {
            Some(DataType::Text) => DEFAULT_STRING_REGISTERS,
            _ => 1,
        });
        PointSpec::new(
            self.region,
            self.address,
            quantity,
            ValueCodec::new(self.data_type, self.scale, self.offset),
        )
    }
}

/// Resolved data point
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterPoint {
    name: String,
    spec: PointSpec,
    units: Option<String>,
    description: Option<String>,
}

impl RegisterPoint {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &PointSpec {
        &self.spec
    }

    pub fn units(&self) -> Option<&str> {
        self.units.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn is_writable(&self) -> bool {
        self.spec.region().is_writable()
    }
}

/// Validated name -> point table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterMap {
    points: BTreeMap<String, RegisterPoint>,
}

impl RegisterMap {
    /// Validate every entry; the first bad entry fails the whole map
    pub fn from_entries<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, RegisterMapEntry)>,
    {
        let mut points = BTreeMap::new();
        for (name, entry) in entries {
            if name.trim().is_empty() {
                return Err(ComLinkError::config("Data point name must not be empty"));
            }
            let spec = entry
                .resolve()
                .map_err(|e| ComLinkError::config(format!("point '{}': {}", name, e)))?;
            let point = RegisterPoint {
                name: name.clone(),
                spec,
                units: entry.units,
                description: entry.description,
            };
            if points.insert(name.clone(), point).is_some() {
                return Err(ComLinkError::config(format!(
                    "Duplicate data point '{}'",
                    name
                )));
            }
        }
        Ok(Self { points })
    }

    pub fn get(&self, name: &str) -> Result<&RegisterPoint> {
        self.points
            .get(name)
            .ok_or_else(|| ComLinkError::UnknownDataPoint(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.points.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisterPoint> {
        self.points.values()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// One decoded sample of a named point
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointReading {
    pub value: DecodedValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Readings of a set of points; failed points are listed under `errors`,
/// never filled with a default value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub metrics: BTreeMap<String, PointReading>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, ComLinkError>,
}

impl DeviceSnapshot {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: Utc::now(),
            metrics: BTreeMap::new(),
            errors: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, name: &str, result: Result<PointReading>) {
        match result {
            Ok(reading) => {
                self.metrics.insert(name.to_string(), reading);
            },
            Err(e) => {
                self.errors.insert(name.to_string(), e);
            },
        }
    }

    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Named-point access to one device
#[derive(Debug, Clone)]
pub struct PointResolver {
    client: ModbusClient,
    map: Arc<RegisterMap>,
}

impl PointResolver {
    pub fn new(client: ModbusClient, map: Arc<RegisterMap>) -> Self {
        Self { client, map }
    }

    pub fn client(&self) -> &ModbusClient {
        &self.client
    }

    pub fn map(&self) -> &RegisterMap {
        &self.map
    }

    pub async fn read_by_name(&self, name: &str) -> Result<DecodedValue> {
        let point = self.map.get(name)?;
        self.client.read_point(point.spec()).await
    }

    /// Read a point together with its units and the read time
    pub async fn read_reading(&self, name: &str) -> Result<PointReading> {
        let point = self.map.get(name)?;
        let value = self.client.read_point(point.spec()).await?;
        Ok(PointReading {
            value,
            units: point.units.clone(),
            timestamp: Utc::now(),
        })
    }

    /// Write an engineering value. Read-only points fail before any I/O.
    pub async fn write_by_name(&self, name: &str, value: &DecodedValue) -> Result<()> {
        let point = self.map.get(name)?;
        if !point.is_writable() {
            return Err(ComLinkError::ReadOnlyDataPoint(format!(
                "{} ({})",
                name,
                point.spec().region()
            )));
        }
        self.client.write_point(point.spec(), value).await
    }

    /// Read `names` one after another into a snapshot
    pub async fn read_all<S: AsRef<str>>(&self, names: &[S]) -> DeviceSnapshot {
        let mut snapshot = DeviceSnapshot::new(self.client.status().device);
        for name in names {
            let name = name.as_ref();
            snapshot.record(name, self.read_reading(name).await);
        }
        snapshot
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::modbus::config::DeviceConnectionConfig;
    use crate::modbus::mock::{MockConnector, SimulatedDevice};
    use crate::modbus::transport::ModbusMode;
    use voltage_comlink::ProtocolValue;

    fn entries() -> Vec<(String, RegisterMapEntry)> {
        vec![
            (
                "soc".into(),
                RegisterMapEntry::new(Region::HoldingRegister, 10)
                    .with_data_type(DataType::Uint16)
                    .with_scale(1.0)
                    .with_units("%"),
            ),
            (
                "voltage".into(),
                RegisterMapEntry::new(Region::InputRegister, 20)
                    .with_data_type(DataType::Float32),
            ),
            ("alarm".into(), RegisterMapEntry::new(Region::DiscreteInput, 0)),
            ("run".into(), RegisterMapEntry::new(Region::Coil, 0)),
        ]
    }

    async fn resolver(device: &SimulatedDevice) -> PointResolver {
        let client = ModbusClient::with_connector(Arc::new(MockConnector::new(device.clone())));
        client
            .connect(DeviceConnectionConfig::tcp("bms-1", "127.0.0.1", 502, 1))
            .await
            .unwrap();
        let map = RegisterMap::from_entries(entries()).unwrap();
        PointResolver::new(client, Arc::new(map))
    }

    #[test]
    fn test_entry_deserialization_aliases() {
        let json = r#"{
            "address": 100,
            "type": "holding_register",
            "dataType": "string",
            "scaleFactor": 1,
            "unit": "V",
            "stringLength": 8
        }"#;
        let entry: RegisterMapEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.region, Region::HoldingRegister);
        assert_eq!(entry.data_type, Some(DataType::Text));
        assert_eq!(entry.units.as_deref(), Some("V"));
        assert_eq!(entry.length, Some(8));
    }

    #[test]
    fn test_map_validation_fails_fast() {
        let bad = vec![(
            "temp".to_string(),
            RegisterMapEntry::new(Region::Coil, 0).with_data_type(DataType::Float32),
        )];
        let err = RegisterMap::from_entries(bad).unwrap_err();
        assert!(matches!(&err, ComLinkError::Config(msg) if msg.contains("temp")));

        let overflow = vec![(
            "tail".to_string(),
            RegisterMapEntry::new(Region::HoldingRegister, 65535).with_data_type(DataType::Int32),
        )];
        assert!(RegisterMap::from_entries(overflow).is_err());

        let zero_scale = vec![(
            "z".to_string(),
            RegisterMapEntry::new(Region::HoldingRegister, 0).with_scale(0.0),
        )];
        assert!(RegisterMap::from_entries(zero_scale).is_err());
    }

    #[test]
    fn test_string_point_defaults_to_sixteen_registers() {
        let map = RegisterMap::from_entries(vec![(
            "serial".to_string(),
            RegisterMapEntry::new(Region::HoldingRegister, 0).with_data_type(DataType::Text),
        )])
        .unwrap();
        assert_eq!(map.get("serial").unwrap().spec().register_count(), 16);
    }

    #[tokio::test]
    async fn test_read_by_name() {
        let device = SimulatedDevice::new(ModbusMode::Tcp, 1);
        device.set_holding(10, &[750]);
        let resolver = resolver(&device).await;

        let soc = resolver.read_by_name("soc").await.unwrap();
        assert_eq!(soc, DecodedValue::Single(ProtocolValue::Integer(750)));
    }

    #[tokio::test]
    async fn test_unknown_point() {
        let device = SimulatedDevice::new(ModbusMode::Tcp, 1);
        let resolver = resolver(&device).await;
        assert_eq!(
            resolver.read_by_name("nope").await,
            Err(ComLinkError::UnknownDataPoint("nope".into()))
        );
        assert!(device.requests().is_empty());
    }

    #[tokio::test]
    async fn test_read_only_points_no_io() {
        let device = SimulatedDevice::new(ModbusMode::Tcp, 1);
        let resolver = resolver(&device).await;

        for name in ["voltage", "alarm"] {
            let err = resolver.write_by_name(name, &1i64.into()).await.unwrap_err();
            assert!(matches!(err, ComLinkError::ReadOnlyDataPoint(_)), "{name}");
        }
        assert!(device.requests().is_empty());
    }

    #[tokio::test]
    async fn test_write_by_name() {
        let device = SimulatedDevice::new(ModbusMode::Tcp, 1);
        let resolver = resolver(&device).await;

        resolver.write_by_name("run", &true.into()).await.unwrap();
        resolver.write_by_name("soc", &80i64.into()).await.unwrap();
        assert!(device.coil(0));
        assert_eq!(device.holding(10), 80);
    }

    #[tokio::test]
    async fn test_read_all_partial_failure() {
        let device = SimulatedDevice::new(ModbusMode::Tcp, 1);
        device.set_holding(10, &[42]);
        device.limit_addresses(15);
        let resolver = resolver(&device).await;

        let snapshot = resolver.read_all(&["soc", "voltage", "missing"]).await;
        assert_eq!(snapshot.device_id, "bms-1");
        assert_eq!(snapshot.metrics["soc"].value, DecodedValue::Single(42i64.into()));
        assert_eq!(snapshot.metrics["soc"].units.as_deref(), Some("%"));
        assert!(matches!(
            snapshot.errors["voltage"],
            ComLinkError::DeviceException { code: 0x02, .. }
        ));
        assert!(matches!(snapshot.errors["missing"], ComLinkError::UnknownDataPoint(_)));
        assert!(!snapshot.is_complete());

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["deviceId"], "bms-1");
        assert_eq!(json["metrics"]["soc"]["value"], 42);
    }
}

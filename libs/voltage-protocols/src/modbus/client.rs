//! Modbus client
//!
//! By-type reads and writes on top of the connection manager: build the
//! request PDU, run one serialized exchange, validate the response and
//! decode (or encode) register values.

use std::sync::Arc;
use voltage_comlink::error::{ComLinkError, Result};
use voltage_comlink::{DecodedValue, LinkStatus, ProtocolValue};

use super::codec::ModbusCodec;
use super::config::DeviceConnectionConfig;
use super::connection::Connector;
use super::decoder;
use super::manager::ModbusConnectionManager;
use super::pdu::ModbusPdu;
use super::types::{DataType, PointSpec, RawData, RawReadResult, Region, ValueCodec};

/// Cheap-to-clone handle to one device link
#[derive(Debug, Clone)]
pub struct ModbusClient {
    manager: Arc<ModbusConnectionManager>,
}

impl ModbusClient {
    pub fn new(manager: ModbusConnectionManager) -> Self {
        Self {
            manager: Arc::new(manager),
        }
    }

    /// Client for real sockets and serial ports
    pub fn system() -> Self {
        Self::new(ModbusConnectionManager::default())
    }

    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self::new(ModbusConnectionManager::new(connector))
    }

    pub fn manager(&self) -> &ModbusConnectionManager {
        &self.manager
    }

    pub async fn connect(&self, config: DeviceConnectionConfig) -> Result<()> {
        self.manager.connect(config).await
    }

    pub async fn disconnect(&self) {
        self.manager.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn status(&self) -> LinkStatus {
        self.manager.status()
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Read `quantity` raw registers or bits without decoding
    pub async fn read_raw(&self, region: Region, address: u16, quantity: u16) -> Result<RawReadResult> {
        let spec = self.checked(PointSpec::new(region, address, quantity, ValueCodec::default()))?;
        let data = self.fetch(&spec).await?;
        Ok(RawReadResult {
            region,
            address,
            data,
        })
    }

    /// Read `quantity` values of the codec's data type starting at `address`
    pub async fn read_by_type(
        &self,
        region: Region,
        address: u16,
        quantity: u16,
        codec: ValueCodec,
    ) -> Result<DecodedValue> {
        let spec = self.checked(PointSpec::new(region, address, quantity, codec))?;
        self.read_point(&spec).await
    }

    /// Read and decode one validated point
    pub async fn read_point(&self, spec: &PointSpec) -> Result<DecodedValue> {
        let raw = self.fetch(spec).await?;
        self.checked(decoder::decode(&raw, spec.codec()))
    }

    async fn fetch(&self, spec: &PointSpec) -> Result<RawData> {
        let count = spec.register_count();
        let request = self.checked(ModbusCodec::build_read_pdu(spec.region(), spec.address(), count))?;
        let response = self.execute(&request, spec.address(), count).await?;
        self.checked(ModbusCodec::parse_read_response(&response, spec.region(), count))
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Write one or more values starting at `address`.
    ///
    /// Values go through the inverse transform of `codec`. The function code
    /// follows the payload: FC05/FC06 for a single coil or register, FC15/FC16
    /// otherwise.
    pub async fn write_by_type(
        &self,
        region: Region,
        address: u16,
        value: &DecodedValue,
        codec: ValueCodec,
    ) -> Result<()> {
        let quantity = match codec.data_type {
            Some(DataType::Text) => text_registers(value),
            _ => value.values().len() as u16,
        };
        let spec = self.checked(PointSpec::new(region, address, quantity.max(1), codec))?;
        self.write_point(&spec, value).await
    }

    /// Encode and write one validated point
    pub async fn write_point(&self, spec: &PointSpec, value: &DecodedValue) -> Result<()> {
        let request = self.checked(build_write_request(spec, value))?;
        let response = self
            .execute(&request, spec.address(), spec.register_count())
            .await?;
        self.checked(ModbusCodec::parse_write_response(&request, &response))
    }

    async fn execute(&self, request: &ModbusPdu, address: u16, count: u16) -> Result<ModbusPdu> {
        let logger = self.manager.logger();
        let unit_id = self.manager.config().map_or(0, |c| c.unit_id);
        logger.log_exchange(unit_id, request.function_code().unwrap_or(0), address, count);
        self.manager.execute(request).await
    }

    /// Record local failures as the link's last error
    fn checked<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.manager.record_error(e);
        }
        result
    }
}

/// Build the write PDU for `value`; all validation happens here, before any
/// wire I/O
fn build_write_request(spec: &PointSpec, value: &DecodedValue) -> Result<ModbusPdu> {
    let region = spec.region();
    if !region.is_writable() {
        return Err(ComLinkError::invalid_request(format!(
            "{} region is read-only",
            region
        )));
    }

    let values = value.values();
    if values.is_empty() {
        return Err(ComLinkError::invalid_request("No values to write"));
    }

    let text = spec.codec().data_type == Some(DataType::Text);
    if !text && values.len() != spec.quantity() as usize {
        return Err(ComLinkError::invalid_request(format!(
            "Expected {} value(s), got {}",
            spec.quantity(),
            values.len()
        )));
    }

    if region.is_bit() {
        let bits = decoder::encode_bits(values)?;
        return match bits.as_slice() {
            [single] => ModbusCodec::build_write_fc05_single_coil_pdu(spec.address(), *single),
            _ => ModbusCodec::build_write_fc15_multiple_coils_pdu(spec.address(), &bits),
        };
    }

    let mut words = decoder::encode_words(values, spec.codec())?;
    if text {
        let capacity = spec.register_count() as usize;
        if words.len() > capacity {
            return Err(ComLinkError::invalid_request(format!(
                "String needs {} registers, point holds {}",
                words.len(),
                capacity
            )));
        }
        // clear the remainder of the previous string
        words.resize(capacity, 0);
    }

    match words.as_slice() {
        [single] => ModbusCodec::build_write_fc06_single_register_pdu(spec.address(), *single),
        _ => ModbusCodec::build_write_fc16_multiple_registers_pdu(spec.address(), &words),
    }
}

fn text_registers(value: &DecodedValue) -> u16 {
    match value.as_single() {
        Some(ProtocolValue::Text(text)) => text.len().div_ceil(2) as u16,
        _ => 1,
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::modbus::mock::{MockConnector, RecordedRequest, SimulatedDevice};
    use crate::modbus::transport::ModbusMode;

    async fn connected(device: &SimulatedDevice) -> ModbusClient {
        let client = ModbusClient::with_connector(Arc::new(MockConnector::new(device.clone())));
        let config = match device.mode() {
            ModbusMode::Tcp => DeviceConnectionConfig::tcp("dev", "127.0.0.1", 502, 1),
            mode => DeviceConnectionConfig::serial("dev", mode, "/dev/ttySIM", 9600, 1),
        };
        client.connect(config).await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_read_by_type_all_transports() {
        for mode in [ModbusMode::Tcp, ModbusMode::Rtu, ModbusMode::Ascii] {
            let device = SimulatedDevice::new(mode, 1);
            device.set_holding(100, &[0x3FC0, 0x0000]);
            let client = connected(&device).await;

            let value = client
                .read_by_type(
                    Region::HoldingRegister,
                    100,
                    1,
                    ValueCodec::typed(DataType::Float32),
                )
                .await
                .unwrap();
            assert_eq!(value, DecodedValue::Single(1.5.into()), "{mode}");
            assert_eq!(device.requests()[0].quantity, 2, "{mode}");
        }
    }

    #[tokio::test]
    async fn test_read_raw_bits() {
        let device = SimulatedDevice::new(ModbusMode::Tcp, 1);
        device.set_discrete_inputs(3, &[true, false, true]);
        let client = connected(&device).await;

        let raw = client.read_raw(Region::DiscreteInput, 3, 3).await.unwrap();
        assert_eq!(raw.data, RawData::Bits(vec![true, false, true]));
        assert_eq!(raw.address, 3);
    }

    #[tokio::test]
    async fn test_device_exception_surfaces() {
        let device = SimulatedDevice::new(ModbusMode::Rtu, 1);
        device.limit_addresses(100);
        let client = connected(&device).await;

        let err = client
            .read_by_type(Region::InputRegister, 200, 1, ValueCodec::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ComLinkError::DeviceException {
                function: 0x04,
                code: 0x02
            }
        );
        assert!(client.is_connected());
        assert_eq!(client.status().last_error, Some(err));
    }

    #[tokio::test]
    async fn test_invalid_request_no_io() {
        let device = SimulatedDevice::new(ModbusMode::Tcp, 1);
        let client = connected(&device).await;

        let err = client
            .read_by_type(Region::HoldingRegister, 65535, 2, ValueCodec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ComLinkError::InvalidRequest(_)));
        let err = client
            .read_by_type(Region::HoldingRegister, 0, 126, ValueCodec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ComLinkError::InvalidRequest(_)));
        assert!(device.requests().is_empty());
    }

    #[tokio::test]
    async fn test_write_function_selection() {
        let device = SimulatedDevice::new(ModbusMode::Tcp, 1);
        let client = connected(&device).await;

        client
            .write_by_type(Region::Coil, 1, &true.into(), ValueCodec::default())
            .await
            .unwrap();
        client
            .write_by_type(
                Region::Coil,
                4,
                &DecodedValue::Many(vec![true.into(), false.into(), true.into()]),
                ValueCodec::default(),
            )
            .await
            .unwrap();
        client
            .write_by_type(
                Region::HoldingRegister,
                10,
                &ProtocolValue::from(25.0).into(),
                ValueCodec::new(Some(DataType::Uint16), Some(0.1), None),
            )
            .await
            .unwrap();
        client
            .write_by_type(
                Region::HoldingRegister,
                20,
                &ProtocolValue::from(1.5).into(),
                ValueCodec::typed(DataType::Float32),
            )
            .await
            .unwrap();

        let functions: Vec<u8> = device.requests().iter().map(|r| r.function).collect();
        assert_eq!(functions, vec![0x05, 0x0F, 0x06, 0x10]);
        assert!(device.coil(1));
        assert!(device.coil(6));
        assert!(!device.coil(5));
        assert_eq!(device.holding(10), 250);
        assert_eq!((device.holding(20), device.holding(21)), (0x3FC0, 0x0000));
    }

    #[tokio::test]
    async fn test_write_rejections_before_io() {
        let device = SimulatedDevice::new(ModbusMode::Tcp, 1);
        let client = connected(&device).await;

        let err = client
            .write_by_type(Region::InputRegister, 0, &1i64.into(), ValueCodec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ComLinkError::InvalidRequest(_)));

        let err = client
            .write_by_type(
                Region::HoldingRegister,
                0,
                &70000i64.into(),
                ValueCodec::typed(DataType::Uint16),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ComLinkError::InvalidRequest(_)));
        assert_eq!(device.requests(), Vec::<RecordedRequest>::new());
    }

    #[tokio::test]
    async fn test_text_roundtrip() {
        let device = SimulatedDevice::new(ModbusMode::Tcp, 1);
        device.set_holding(50, &[0x4141, 0x4141, 0x4141]);
        let client = connected(&device).await;
        let spec = PointSpec::new(
            Region::HoldingRegister,
            50,
            3,
            ValueCodec::typed(DataType::Text),
        )
        .unwrap();

        client.write_point(&spec, &"SN-1".into()).await.unwrap();
        let value = client.read_point(&spec).await.unwrap();
        assert_eq!(value, DecodedValue::Single("SN-1".into()));
        // stale characters were cleared
        assert_eq!(device.holding(52), 0);
    }

    #[tokio::test]
    async fn test_not_connected() {
        let device = SimulatedDevice::new(ModbusMode::Tcp, 1);
        let client = ModbusClient::with_connector(Arc::new(MockConnector::new(device.clone())));
        let err = client
            .read_by_type(Region::Coil, 0, 1, ValueCodec::default())
            .await
            .unwrap_err();
        assert_eq!(err, ComLinkError::NotConnected);
    }
}

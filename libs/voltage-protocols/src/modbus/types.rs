//! Modbus protocol data types
//!
//! Function codes, address regions, register data types and the validated
//! description of one read (`PointSpec`).

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use voltage_comlink::error::{ComLinkError, Result};

use super::constants::{
    MODBUS_ADDRESS_SPACE, MODBUS_MAX_READ_COILS, MODBUS_MAX_READ_REGISTERS,
};

/// Supported Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    pub fn from_u8(fc: u8) -> Option<Self> {
        match fc {
            0x01 => Some(Self::ReadCoils),
            0x02 => Some(Self::ReadDiscreteInputs),
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x05 => Some(Self::WriteSingleCoil),
            0x06 => Some(Self::WriteSingleRegister),
            0x0F => Some(Self::WriteMultipleCoils),
            0x10 => Some(Self::WriteMultipleRegisters),
            _ => None,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::ReadCoils => "Read Coils",
            Self::ReadDiscreteInputs => "Read Discrete Inputs",
            Self::ReadHoldingRegisters => "Read Holding Registers",
            Self::ReadInputRegisters => "Read Input Registers",
            Self::WriteSingleCoil => "Write Single Coil",
            Self::WriteSingleRegister => "Write Single Register",
            Self::WriteMultipleCoils => "Write Multiple Coils",
            Self::WriteMultipleRegisters => "Write Multiple Registers",
        }
    }
}

/// Modbus address region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Region {
    #[serde(alias = "coils")]
    Coil,
    #[serde(alias = "discrete_input")]
    DiscreteInput,
    #[serde(alias = "holding_register", alias = "holding")]
    HoldingRegister,
    #[serde(alias = "input_register", alias = "input")]
    InputRegister,
}

impl Region {
    /// Function code used to read this region
    pub fn read_function(self) -> FunctionCode {
        match self {
            Region::Coil => FunctionCode::ReadCoils,
            Region::DiscreteInput => FunctionCode::ReadDiscreteInputs,
            Region::HoldingRegister => FunctionCode::ReadHoldingRegisters,
            Region::InputRegister => FunctionCode::ReadInputRegisters,
        }
    }

    /// Single-bit regions (coils, discrete inputs)
    pub fn is_bit(self) -> bool {
        matches!(self, Region::Coil | Region::DiscreteInput)
    }

    /// Only coils and holding registers accept writes
    pub fn is_writable(self) -> bool {
        matches!(self, Region::Coil | Region::HoldingRegister)
    }

    /// Protocol limit for one read request
    pub fn max_read_quantity(self) -> u16 {
        if self.is_bit() {
            MODBUS_MAX_READ_COILS
        } else {
            MODBUS_MAX_READ_REGISTERS
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Region::Coil => "coil",
            Region::DiscreteInput => "discreteInput",
            Region::HoldingRegister => "holdingRegister",
            Region::InputRegister => "inputRegister",
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Region {
    type Err = ComLinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "coil" | "coils" => Ok(Region::Coil),
            "discreteinput" | "discrete" => Ok(Region::DiscreteInput),
            "holdingregister" | "holding" => Ok(Region::HoldingRegister),
            "inputregister" | "input" => Ok(Region::InputRegister),
            other => Err(ComLinkError::invalid_request(format!(
                "Unknown region: {}",
                other
            ))),
        }
    }
}

/// Register data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
    #[serde(alias = "bool")]
    Boolean,
    /// ASCII text, two characters per register, one value per block
    #[serde(rename = "string")]
    Text,
}

impl DataType {
    /// Words consumed per decoded value; `None` when the whole block is one value
    pub fn word_width(self) -> Option<usize> {
        match self {
            DataType::Int16 | DataType::Uint16 | DataType::Boolean => Some(1),
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => Some(2),
            DataType::Float64 => Some(4),
            DataType::Text => None,
        }
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, DataType::Boolean | DataType::Text)
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::Int16 => "int16",
            DataType::Uint16 => "uint16",
            DataType::Int32 => "int32",
            DataType::Uint32 => "uint32",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::Boolean => "boolean",
            DataType::Text => "string",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataType {
    type Err = ComLinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "int16" => Ok(DataType::Int16),
            "uint16" => Ok(DataType::Uint16),
            "int32" => Ok(DataType::Int32),
            "uint32" => Ok(DataType::Uint32),
            "float32" => Ok(DataType::Float32),
            "float64" => Ok(DataType::Float64),
            "boolean" | "bool" => Ok(DataType::Boolean),
            "string" => Ok(DataType::Text),
            other => Err(ComLinkError::invalid_request(format!(
                "Unknown data type: {}",
                other
            ))),
        }
    }
}

/// Decode parameters: optional data type plus linear transform
/// (`engineering = raw * scale + offset`)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueCodec {
    pub data_type: Option<DataType>,
    pub scale: f64,
    pub offset: f64,
}

impl Default for ValueCodec {
    fn default() -> Self {
        Self {
            data_type: None,
            scale: 1.0,
            offset: 0.0,
        }
    }
}

impl ValueCodec {
    pub fn new(data_type: Option<DataType>, scale: Option<f64>, offset: Option<f64>) -> Self {
        Self {
            data_type,
            scale: scale.unwrap_or(1.0),
            offset: offset.unwrap_or(0.0),
        }
    }

    pub fn typed(data_type: DataType) -> Self {
        Self {
            data_type: Some(data_type),
            ..Self::default()
        }
    }

    /// Scale 1 and offset 0 leave raw integers untouched
    pub fn is_identity(&self) -> bool {
        self.scale == 1.0 && self.offset == 0.0
    }

    fn validate(&self) -> Result<()> {
        if !self.scale.is_finite() || self.scale == 0.0 {
            return Err(ComLinkError::invalid_request(format!(
                "Scale must be finite and non-zero, got {}",
                self.scale
            )));
        }
        if !self.offset.is_finite() {
            return Err(ComLinkError::invalid_request(format!(
                "Offset must be finite, got {}",
                self.offset
            )));
        }
        Ok(())
    }
}

/// Validated description of one read: region, start address, value count
/// and decode parameters.
///
/// For register regions `quantity` counts decoded values (a `string` point
/// counts registers); for bit regions it counts bits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointSpec {
    region: Region,
    address: u16,
    quantity: u16,
    codec: ValueCodec,
}

impl PointSpec {
    pub fn new(region: Region, address: u16, quantity: u16, codec: ValueCodec) -> Result<Self> {
        codec.validate()?;

        if quantity == 0 {
            return Err(ComLinkError::invalid_request("Quantity must be at least 1"));
        }

        if region.is_bit() && !matches!(codec.data_type, None | Some(DataType::Boolean)) {
            return Err(ComLinkError::invalid_request(format!(
                "Data type {} not valid for {} region",
                codec.data_type.map_or("none", DataType::name),
                region
            )));
        }

        let spec = Self {
            region,
            address,
            quantity,
            codec,
        };

        let count = spec.wire_count();
        if count > u32::from(region.max_read_quantity()) {
            return Err(ComLinkError::invalid_request(format!(
                "{} {} exceed protocol limit of {} per request",
                count,
                if region.is_bit() { "bits" } else { "registers" },
                region.max_read_quantity()
            )));
        }
        if u32::from(address) + count > MODBUS_ADDRESS_SPACE {
            return Err(ComLinkError::invalid_request(format!(
                "Address range {}+{} exceeds addressable space",
                address, count
            )));
        }

        Ok(spec)
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn quantity(&self) -> u16 {
        self.quantity
    }

    pub fn codec(&self) -> &ValueCodec {
        &self.codec
    }

    /// Number of registers (or bits) to request on the wire
    pub fn register_count(&self) -> u16 {
        self.wire_count() as u16
    }

    fn wire_count(&self) -> u32 {
        let width = self
            .codec
            .data_type
            .filter(|_| !self.region.is_bit())
            .and_then(DataType::word_width)
            .unwrap_or(1);
        width as u32 * u32::from(self.quantity)
    }
}

/// Raw payload of a read response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawData {
    Words(Vec<u16>),
    Bits(Vec<bool>),
}

impl RawData {
    pub fn len(&self) -> usize {
        match self {
            RawData::Words(w) => w.len(),
            RawData::Bits(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Raw read result tagged with its origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReadResult {
    pub region: Region,
    pub address: u16,
    pub data: RawData,
}

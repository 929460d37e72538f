//! Modbus Protocol Implementation
//!
//! Modbus client for VoltageEMS devices over TCP, RTU and ASCII framing.
//! The implementation supports:
//! - Read and write function codes (FC01-04, FC05-06, FC15-16)
//! - MBAP, CRC-16 and LRC framing over any byte stream
//! - Typed decoding with scale and offset (int/uint 16/32, float32/64, text)
//! - Supervised connections with bounded automatic reconnection
//! - Named register maps and interval polling
//!
//! # Architecture
//!
//! ```text
//! voltage-protocols/modbus
//!     ├── PollingDriver            (interval reads into DeviceSnapshot)
//!     ├── PointResolver            (point name -> PointSpec via RegisterMap)
//!     ├── ModbusClient             (raw / typed / point reads and writes)
//!     ├── ModbusConnectionManager  (state machine, FIFO exchange lock, reconnect)
//!     │     └── Connector / Transport  (TCP, serial RTU, serial ASCII)
//!     ├── ModbusFrameProcessor     (MBAP header / CRC / LRC framing)
//!     ├── ModbusCodec              (request PDUs, response parsing)
//!     └── decoder                  (words <-> engineering values)
//! ```

mod client;
mod codec;
mod config;
mod connection;
mod constants;
mod decoder;
mod manager;
mod pdu;
mod polling;
mod register_map;
mod state;
mod transport;
mod types;

pub mod mock;

// ============================================================================
// Client surface
// ============================================================================

pub use client::ModbusClient;
pub use manager::ModbusConnectionManager;
pub use polling::{PollHandle, PollState, PollingDriver};
pub use register_map::{
    DeviceSnapshot, PointReading, PointResolver, RegisterMap, RegisterMapEntry, RegisterPoint,
};

// ============================================================================
// Configuration
// ============================================================================

pub use config::{
    DeviceConnectionConfig, DeviceProfile, Parity, PollingConfig, ReconnectPolicy, SerialFraming,
    SerialLine, TransportSettings,
};

// ============================================================================
// Wire level
// ============================================================================

pub use codec::ModbusCodec;
pub use connection::{
    read_request, read_response, Connector, ResponseShape, StreamTransport, SystemConnector,
    Transport,
};
pub use pdu::{function_code_description, ModbusPdu, PduBuilder};
pub use transport::{
    assemble_frame, calculate_crc16, calculate_lrc, split_frame, FrameParts, MbapHeader,
    ModbusFrameProcessor, ModbusMode,
};

// ============================================================================
// Values and state
// ============================================================================

pub use decoder::{decode, decode_words, encode_bits, encode_words};
pub use state::{next as next_state, LinkCommand, LinkEvent, Transition};
pub use types::{DataType, FunctionCode, PointSpec, RawData, RawReadResult, Region, ValueCodec};

pub use constants::*;

//! VoltageEMS Protocol Implementations
//!
//! Device protocol clients built on the `voltage-comlink` link primitives.
//! Protocols are feature-gated for selective compilation.
//!
//! # Features
//!
//! - `modbus` - Modbus TCP client and framing
//! - `modbus-serial` - RTU and ASCII over serial lines (`tokio-serial`)

#[cfg(feature = "modbus")]
pub mod modbus;

// Re-export common types for convenience
pub use voltage_comlink::{
    ChannelLogger, ComLinkError, ConnectionState, DecodedValue, LinkStatus, ProtocolValue, Result,
    StateChange,
};

//! Communication Link Error Types
//!
//! Core error taxonomy shared by every link. Only transport-level errors
//! (`Transport`, `Timeout`) are allowed to move a connection out of the
//! `Connected` state; everything else is local to one operation.

use serde::{Serialize, Serializer};
use thiserror::Error;

/// Result type for voltage-comlink operations
pub type Result<T> = std::result::Result<T, ComLinkError>;

/// Communication link errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ComLinkError {
    /// Socket/serial level failure (refused, reset, unplugged)
    #[error("Transport error: {0}")]
    Transport(String),

    /// No complete response within the configured timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed frame, checksum mismatch, or echo mismatch
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote device answered with a Modbus exception response
    #[error("Device exception: FC={function:02X} code={code:02X} ({})", describe_exception(.code))]
    DeviceException { function: u8, code: u8 },

    /// Address/quantity out of range, or a value that cannot be encoded
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Word count inconsistent with the declared data type
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Data point name not present in the register map
    #[error("Unknown data point: {0}")]
    UnknownDataPoint(String),

    /// Write attempted on a discrete input or input register point
    #[error("Read-only data point: {0}")]
    ReadOnlyDataPoint(String),

    /// Operation attempted outside the `Connected` state
    #[error("Not connected")]
    NotConnected,

    /// Configuration errors (device record, register map, profile)
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for ComLinkError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => ComLinkError::Timeout(err.to_string()),
            _ => ComLinkError::Transport(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ComLinkError {
    fn from(err: serde_json::Error) -> Self {
        ComLinkError::Config(format!("JSON error: {}", err))
    }
}

/// Errors serialize as their display string (status snapshots, CLI JSON output)
impl Serialize for ComLinkError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

// Helper methods for creating errors
impl ComLinkError {
    pub fn transport(msg: impl Into<String>) -> Self {
        ComLinkError::Transport(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        ComLinkError::Timeout(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        ComLinkError::Protocol(msg.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        ComLinkError::InvalidRequest(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        ComLinkError::MalformedPayload(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ComLinkError::Config(msg.into())
    }

    pub fn exception(function: u8, code: u8) -> Self {
        ComLinkError::DeviceException {
            function: function & 0x7F,
            code,
        }
    }

    /// Check if this error is a transport-level failure.
    ///
    /// Transport failures during an active session move the link to `Failed`
    /// and may schedule a reconnect.
    pub fn is_transport(&self) -> bool {
        matches!(self, ComLinkError::Transport(_) | ComLinkError::Timeout(_))
    }

    /// Short machine-readable kind, used in status output and logs
    pub fn kind(&self) -> &'static str {
        match self {
            ComLinkError::Transport(_) => "transport",
            ComLinkError::Timeout(_) => "timeout",
            ComLinkError::Protocol(_) => "protocol",
            ComLinkError::DeviceException { .. } => "device_exception",
            ComLinkError::InvalidRequest(_) => "invalid_request",
            ComLinkError::MalformedPayload(_) => "malformed_payload",
            ComLinkError::UnknownDataPoint(_) => "unknown_data_point",
            ComLinkError::ReadOnlyDataPoint(_) => "read_only_data_point",
            ComLinkError::NotConnected => "not_connected",
            ComLinkError::Config(_) => "config",
        }
    }
}

fn describe_exception(code: &u8) -> &'static str {
    exception_description(*code)
}

/// Standard Modbus exception code descriptions
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Server Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Server Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}

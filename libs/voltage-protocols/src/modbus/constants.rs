//! Modbus protocol constants
//!
//! Frame sizes, per-request quantity limits and connection defaults.

/// MBAP header length excluding the unit identifier
/// (transaction id 2 + protocol id 2 + length 2)
pub const MBAP_HEADER_LEN: usize = 6;

/// Maximum PDU size (function code + data)
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum value of the MBAP length field: unit id (1) + PDU (253)
pub const MAX_MBAP_LENGTH: usize = 254;

/// Maximum RTU frame: unit id (1) + PDU (253) + CRC (2)
pub const MAX_RTU_FRAME: usize = 256;

/// Maximum ASCII frame: ':' + hex(unit id + PDU + LRC) + CR LF
pub const MAX_ASCII_FRAME: usize = 1 + 2 * (1 + MAX_PDU_SIZE + 1) + 2;

/// Registers per read (FC03/FC04): 1 + 1 + 2*125 = 252 bytes of PDU
pub const MODBUS_MAX_READ_REGISTERS: u16 = 125;

/// Registers per write (FC16): 1 + 2 + 2 + 1 + 2*123 = 252 bytes of PDU
pub const MODBUS_MAX_WRITE_REGISTERS: u16 = 123;

/// Bits per read (FC01/FC02): ceil(2000/8) = 250 data bytes
pub const MODBUS_MAX_READ_COILS: u16 = 2000;

/// Bits per write (FC15): ceil(1968/8) = 246 data bytes
pub const MODBUS_MAX_WRITE_COILS: u16 = 1968;

/// Size of the addressable space of each region
pub const MODBUS_ADDRESS_SPACE: u32 = 0x1_0000;

/// Default TCP port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Default serial line parameters
pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_STOP_BITS: u8 = 1;

/// Default response timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// Fixed delay between automatic reconnect attempts
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5000;

/// Automatic reconnect attempts before the link stays `Failed`
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default register count for `string` points
pub const DEFAULT_STRING_REGISTERS: u16 = 16;

/// Default polling interval
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;

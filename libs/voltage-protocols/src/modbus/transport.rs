//! Modbus transport framing
//!
//! Wraps PDUs in the per-transport application framing and validates frames
//! coming back:
//!
//! ```text
//! TCP   : [tid:2][proto=0:2][len:2][unit:1][PDU]          (len = PDU + 1)
//! RTU   : [unit:1][PDU][crc16:2 little-endian]
//! ASCII : ':' HEX([unit][PDU][lrc]) CR LF
//! ```

use crc::{Crc, CRC_16_MODBUS};
use serde::{Deserialize, Serialize};
use tracing::debug;
use voltage_comlink::error::{ComLinkError, Result};

use super::constants::{MBAP_HEADER_LEN, MAX_MBAP_LENGTH};
use super::pdu::ModbusPdu;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Modbus transport mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModbusMode {
    /// TCP mode (MBAP header)
    #[serde(alias = "tcp")]
    Tcp,
    /// Serial RTU mode (binary, CRC-16)
    #[serde(alias = "rtu")]
    Rtu,
    /// Serial ASCII mode (hex text, LRC)
    #[serde(alias = "ascii")]
    Ascii,
}

impl std::fmt::Display for ModbusMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ModbusMode::Tcp => "TCP",
            ModbusMode::Rtu => "RTU",
            ModbusMode::Ascii => "ASCII",
        })
    }
}

/// Modbus TCP MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    /// Protocol identifier (fixed to 0)
    pub protocol_id: u16,
    /// Remaining bytes: unit id + PDU
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MBAP_HEADER_LEN + 1 {
            return Err(ComLinkError::protocol("MBAP header too short"));
        }
        Ok(Self {
            transaction_id: u16::from_be_bytes([data[0], data[1]]),
            protocol_id: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            unit_id: data[6],
        })
    }
}

/// Frame decomposed into addressing and PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameParts {
    /// Present for TCP frames only
    pub transaction_id: Option<u16>,
    pub unit_id: u8,
    pub pdu: ModbusPdu,
}

/// The one request awaiting its response on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingRequest {
    transaction_id: u16,
    function_code: u8,
    unit_id: u8,
}

/// Modbus frame processor.
///
/// A link carries at most one outstanding request, so only the last built
/// frame is tracked and a response must match it exactly.
#[derive(Debug)]
pub struct ModbusFrameProcessor {
    mode: ModbusMode,
    pending: Option<PendingRequest>,
    next_transaction_id: u16,
}

impl ModbusFrameProcessor {
    pub fn new(mode: ModbusMode) -> Self {
        Self {
            mode,
            pending: None,
            next_transaction_id: 1,
        }
    }

    pub fn mode(&self) -> ModbusMode {
        self.mode
    }

    /// Get next transaction ID; wraps from 0xFFFF to 0x0000
    pub fn next_transaction_id(&mut self) -> u16 {
        let id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        id
    }

    /// Forget the outstanding request (after a failed exchange)
    pub fn clear_pending(&mut self) {
        self.pending = None;
    }

    /// Build complete frame and remember it as the outstanding request
    pub fn build_frame(&mut self, unit_id: u8, pdu: &ModbusPdu) -> Vec<u8> {
        let transaction_id = match self.mode {
            ModbusMode::Tcp => self.next_transaction_id(),
            ModbusMode::Rtu | ModbusMode::Ascii => 0,
        };
        self.pending = Some(PendingRequest {
            transaction_id,
            function_code: pdu.function_code().unwrap_or(0),
            unit_id,
        });
        assemble_frame(self.mode, transaction_id, unit_id, pdu)
    }

    /// Parse a received frame and match it against the outstanding request
    pub fn parse_frame(&mut self, data: &[u8]) -> Result<(u8, ModbusPdu)> {
        let parts = split_frame(self.mode, data)?;
        self.accept(parts)
    }

    /// Match an already framed response against the outstanding request
    pub fn accept(&mut self, parts: FrameParts) -> Result<(u8, ModbusPdu)> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| ComLinkError::protocol("Response received with no pending request"))?;

        if let Some(tid) = parts.transaction_id {
            if tid != pending.transaction_id {
                return Err(ComLinkError::protocol(format!(
                    "Transaction ID mismatch: expected {:04X}, got {:04X}",
                    pending.transaction_id, tid
                )));
            }
        }
        if parts.unit_id != pending.unit_id {
            return Err(ComLinkError::protocol(format!(
                "Unit ID mismatch: expected {}, got {}",
                pending.unit_id, parts.unit_id
            )));
        }
        let response_fc = parts.pdu.function_code().unwrap_or(0) & 0x7F;
        if response_fc != pending.function_code {
            return Err(ComLinkError::protocol(format!(
                "Function code mismatch: expected {:02X}, got {:02X}",
                pending.function_code, response_fc
            )));
        }

        debug!(
            "Validated {} response: unit_id={}, FC={:02X}",
            self.mode, parts.unit_id, response_fc
        );
        Ok((parts.unit_id, parts.pdu))
    }
}

/// Wrap a PDU in the framing for `mode`. `transaction_id` is ignored for
/// serial modes.
pub fn assemble_frame(mode: ModbusMode, transaction_id: u16, unit_id: u8, pdu: &ModbusPdu) -> Vec<u8> {
    let function_code = pdu.function_code().unwrap_or(0);
    match mode {
        ModbusMode::Tcp => {
            let length = (pdu.len() + 1) as u16;
            let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
            frame.extend_from_slice(&transaction_id.to_be_bytes());
            frame.extend_from_slice(&0u16.to_be_bytes());
            frame.extend_from_slice(&length.to_be_bytes());
            frame.push(unit_id);
            frame.extend_from_slice(pdu.as_slice());
            debug!(
                "Building TCP frame: trans_id={:04X}, unit_id={}, FC={:02X}, PDU_len={}",
                transaction_id,
                unit_id,
                function_code,
                pdu.len()
            );
            frame
        },
        ModbusMode::Rtu => {
            let mut frame = Vec::with_capacity(1 + pdu.len() + 2);
            frame.push(unit_id);
            frame.extend_from_slice(pdu.as_slice());
            let crc = calculate_crc16(&frame);
            frame.extend_from_slice(&crc.to_le_bytes());
            debug!(
                "Building RTU frame: unit_id={}, FC={:02X}, PDU_len={}, CRC={:04X}",
                unit_id,
                function_code,
                pdu.len(),
                crc
            );
            frame
        },
        ModbusMode::Ascii => {
            let mut body = Vec::with_capacity(1 + pdu.len() + 1);
            body.push(unit_id);
            body.extend_from_slice(pdu.as_slice());
            let lrc = calculate_lrc(&body);
            body.push(lrc);

            let mut frame = Vec::with_capacity(1 + body.len() * 2 + 2);
            frame.push(b':');
            frame.extend_from_slice(hex::encode_upper(&body).as_bytes());
            frame.extend_from_slice(b"\r\n");
            debug!(
                "Building ASCII frame: unit_id={}, FC={:02X}, PDU_len={}, LRC={:02X}",
                unit_id,
                function_code,
                pdu.len(),
                lrc
            );
            frame
        },
    }
}

/// Validate framing and checksums, then split a frame into its parts
pub fn split_frame(mode: ModbusMode, data: &[u8]) -> Result<FrameParts> {
    match mode {
        ModbusMode::Tcp => split_tcp_frame(data),
        ModbusMode::Rtu => split_rtu_frame(data),
        ModbusMode::Ascii => split_ascii_frame(data),
    }
}

fn split_tcp_frame(data: &[u8]) -> Result<FrameParts> {
    if data.len() < MBAP_HEADER_LEN + 2 {
        return Err(ComLinkError::protocol("TCP frame too short"));
    }
    let header = MbapHeader::parse(data)?;

    if header.protocol_id != 0 {
        return Err(ComLinkError::protocol(format!(
            "Invalid protocol ID: expected 0, got {}",
            header.protocol_id
        )));
    }
    let length = header.length as usize;
    if length < 2 || length > MAX_MBAP_LENGTH {
        return Err(ComLinkError::protocol(format!(
            "Invalid MBAP length: {}",
            length
        )));
    }
    if data.len() != MBAP_HEADER_LEN + length {
        return Err(ComLinkError::protocol(format!(
            "Invalid TCP frame length: expected {}, got {}",
            MBAP_HEADER_LEN + length,
            data.len()
        )));
    }

    Ok(FrameParts {
        transaction_id: Some(header.transaction_id),
        unit_id: header.unit_id,
        pdu: ModbusPdu::from_slice(&data[MBAP_HEADER_LEN + 1..])?,
    })
}

fn split_rtu_frame(data: &[u8]) -> Result<FrameParts> {
    if data.len() < 4 {
        return Err(ComLinkError::protocol("RTU frame too short"));
    }
    let (body, crc_bytes) = data.split_at(data.len() - 2);
    let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let calculated = calculate_crc16(body);
    if received != calculated {
        return Err(ComLinkError::protocol(format!(
            "CRC mismatch: expected 0x{calculated:04X}, got 0x{received:04X}"
        )));
    }

    Ok(FrameParts {
        transaction_id: None,
        unit_id: body[0],
        pdu: ModbusPdu::from_slice(&body[1..])?,
    })
}

fn split_ascii_frame(data: &[u8]) -> Result<FrameParts> {
    // ':' + unit(2) + fc(2) + lrc(2) + CRLF
    if data.len() < 9 {
        return Err(ComLinkError::protocol("ASCII frame too short"));
    }
    if data[0] != b':' {
        return Err(ComLinkError::protocol(format!(
            "ASCII frame must start with ':', got 0x{:02X}",
            data[0]
        )));
    }
    if !data.ends_with(b"\r\n") {
        return Err(ComLinkError::protocol("ASCII frame must end with CR LF"));
    }

    let hex_body = &data[1..data.len() - 2];
    let body = hex::decode(hex_body)
        .map_err(|e| ComLinkError::protocol(format!("Invalid ASCII hex: {e}")))?;

    let (payload, lrc) = body.split_at(body.len() - 1);
    let calculated = calculate_lrc(payload);
    if lrc[0] != calculated {
        return Err(ComLinkError::protocol(format!(
            "LRC mismatch: expected 0x{calculated:02X}, got 0x{:02X}",
            lrc[0]
        )));
    }

    Ok(FrameParts {
        transaction_id: None,
        unit_id: payload[0],
        pdu: ModbusPdu::from_slice(&payload[1..])?,
    })
}

/// True when `response` answers an earlier TCP request than `request`,
/// i.e. a duplicate or late reply still queued on the socket
pub fn is_stale_reply(request: &[u8], response: &[u8]) -> bool {
    if request.len() < 2 || response.len() < 2 {
        return false;
    }
    let expected = u16::from_be_bytes([request[0], request[1]]);
    let received = u16::from_be_bytes([response[0], response[1]]);
    let behind = expected.wrapping_sub(received);
    behind != 0 && behind < 0x8000
}

/// CRC-16/MODBUS (poly 0xA001 reflected, init 0xFFFF)
pub fn calculate_crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// LRC: two's complement of the 8-bit sum
pub fn calculate_lrc(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

//! Modbus PDU codec
//!
//! Builds request PDUs for FC01-06/15/16 with protocol-limit validation and
//! parses the matching responses into raw words or bits. Response parsing is
//! strict: a declared byte count that disagrees with the payload, or an echo
//! that differs from the request, is a `Protocol` error.

use tracing::debug;
use voltage_comlink::error::{ComLinkError, Result};

use super::constants::{
    MODBUS_ADDRESS_SPACE, MODBUS_MAX_WRITE_COILS, MODBUS_MAX_WRITE_REGISTERS,
};
use super::pdu::{ModbusPdu, PduBuilder};
use super::types::{FunctionCode, RawData, Region};

/// Stateless PDU codec
pub struct ModbusCodec;

impl ModbusCodec {
    /// Build a read request PDU (FC01-04) for `quantity` bits or registers
    pub fn build_read_pdu(region: Region, address: u16, quantity: u16) -> Result<ModbusPdu> {
        let max = region.max_read_quantity();
        if quantity == 0 || quantity > max {
            return Err(ComLinkError::invalid_request(format!(
                "Read quantity {} out of range 1..={} for {}",
                quantity, max, region
            )));
        }
        check_address_range(address, quantity)?;

        let fc = region.read_function();
        debug!(
            "Read request: FC={:02X}, addr={}, qty={}",
            fc as u8, address, quantity
        );
        Ok(PduBuilder::new()
            .function_code(fc)?
            .address(address)?
            .quantity(quantity)?
            .build())
    }

    /// FC05: coil value is 0xFF00 for ON, 0x0000 for OFF
    pub fn build_write_fc05_single_coil_pdu(address: u16, value: bool) -> Result<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(FunctionCode::WriteSingleCoil)?
            .address(address)?
            .quantity(if value { 0xFF00 } else { 0x0000 })?
            .build())
    }

    pub fn build_write_fc06_single_register_pdu(address: u16, value: u16) -> Result<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(FunctionCode::WriteSingleRegister)?
            .address(address)?
            .quantity(value)?
            .build())
    }

    pub fn build_write_fc15_multiple_coils_pdu(
        start_address: u16,
        values: &[bool],
    ) -> Result<ModbusPdu> {
        if values.is_empty() || values.len() > MODBUS_MAX_WRITE_COILS as usize {
            return Err(ComLinkError::invalid_request(format!(
                "Invalid coil count for FC15: {}",
                values.len()
            )));
        }
        let quantity = values.len() as u16;
        check_address_range(start_address, quantity)?;

        let packed = pack_bits(values);
        Ok(PduBuilder::new()
            .function_code(FunctionCode::WriteMultipleCoils)?
            .address(start_address)?
            .quantity(quantity)?
            .byte(packed.len() as u8)?
            .data(&packed)?
            .build())
    }

    pub fn build_write_fc16_multiple_registers_pdu(
        start_address: u16,
        values: &[u16],
    ) -> Result<ModbusPdu> {
        if values.is_empty() || values.len() > MODBUS_MAX_WRITE_REGISTERS as usize {
            return Err(ComLinkError::invalid_request(format!(
                "Invalid register count for FC16: {}",
                values.len()
            )));
        }
        let quantity = values.len() as u16;
        check_address_range(start_address, quantity)?;

        let mut builder = PduBuilder::new()
            .function_code(FunctionCode::WriteMultipleRegisters)?
            .address(start_address)?
            .quantity(quantity)?
            .byte((values.len() * 2) as u8)?;
        for value in values {
            builder = builder.data(&value.to_be_bytes())?;
        }
        Ok(builder.build())
    }

    /// Parse a read response (FC01-04) into `quantity` bits or registers
    pub fn parse_read_response(pdu: &ModbusPdu, region: Region, quantity: u16) -> Result<RawData> {
        let fc = region.read_function() as u8;
        check_function(pdu, fc)?;

        let payload = pdu.payload();
        let Some((&byte_count, data)) = payload.split_first() else {
            return Err(ComLinkError::protocol(format!(
                "FC{:02X} response missing byte count",
                fc
            )));
        };

        let expected = expected_byte_count(region, quantity);
        if byte_count as usize != data.len() {
            return Err(ComLinkError::protocol(format!(
                "Byte count mismatch: declared {}, payload {}",
                byte_count,
                data.len()
            )));
        }
        if data.len() != expected {
            return Err(ComLinkError::protocol(format!(
                "FC{:02X} response carries {} bytes, expected {} for quantity {}",
                fc,
                data.len(),
                expected,
                quantity
            )));
        }

        let raw = if region.is_bit() {
            RawData::Bits(unpack_bits(data, quantity as usize))
        } else {
            RawData::Words(
                data.chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect(),
            )
        };
        debug!("FC{:02X} response: {} values", fc, raw.len());
        Ok(raw)
    }

    /// Validate a write response against its request.
    ///
    /// FC05/06 echo the whole request; FC15/16 echo address and quantity.
    pub fn parse_write_response(request: &ModbusPdu, response: &ModbusPdu) -> Result<()> {
        let fc = request
            .function_code()
            .ok_or_else(|| ComLinkError::invalid_request("Empty request PDU"))?;
        check_function(response, fc)?;

        let echo_len = match FunctionCode::from_u8(fc) {
            Some(FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister) => {
                request.len()
            },
            Some(FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters) => 5,
            _ => {
                return Err(ComLinkError::invalid_request(format!(
                    "FC{:02X} is not a write function",
                    fc
                )))
            },
        };

        if response.len() != echo_len || response.as_slice() != &request.as_slice()[..echo_len] {
            return Err(ComLinkError::protocol(format!(
                "FC{:02X} echo mismatch: sent {:02X?}, got {:02X?}",
                fc,
                &request.as_slice()[..echo_len],
                response.as_slice()
            )));
        }
        Ok(())
    }

    /// Expected PDU length of a normal response to `request`
    pub fn expected_response_len(request: &ModbusPdu) -> Option<usize> {
        let payload = request.payload();
        match FunctionCode::from_u8(request.function_code()?)? {
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
                let quantity = u16::from_be_bytes([*payload.get(2)?, *payload.get(3)?]);
                Some(2 + (quantity as usize).div_ceil(8))
            },
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                let quantity = u16::from_be_bytes([*payload.get(2)?, *payload.get(3)?]);
                Some(2 + quantity as usize * 2)
            },
            _ => Some(5),
        }
    }

    /// Build a read response PDU (device side)
    pub fn build_read_response(region: Region, data: &RawData) -> Result<ModbusPdu> {
        let bytes = match (region.is_bit(), data) {
            (true, RawData::Bits(bits)) => pack_bits(bits),
            (false, RawData::Words(words)) => words.iter().flat_map(|w| w.to_be_bytes()).collect(),
            _ => {
                return Err(ComLinkError::invalid_request(format!(
                    "Payload shape does not match {} region",
                    region
                )))
            },
        };
        if bytes.len() > u8::MAX as usize {
            return Err(ComLinkError::invalid_request("Response payload too large"));
        }
        Ok(PduBuilder::new()
            .function_code(region.read_function())?
            .byte(bytes.len() as u8)?
            .data(&bytes)?
            .build())
    }

    /// Build an exception response PDU (device side)
    pub fn build_exception_pdu(function_code: u8, exception_code: u8) -> Result<ModbusPdu> {
        ModbusPdu::from_slice(&[function_code | 0x80, exception_code])
    }
}

/// Exception responses become `DeviceException`; other function codes must
/// echo the request
fn check_function(pdu: &ModbusPdu, expected_fc: u8) -> Result<()> {
    let fc = pdu
        .function_code()
        .ok_or_else(|| ComLinkError::protocol("Empty response PDU"))?;

    if fc == expected_fc | 0x80 {
        let code = pdu
            .exception_code()
            .ok_or_else(|| ComLinkError::protocol("Exception response missing code"))?;
        return Err(ComLinkError::exception(fc, code));
    }
    if fc != expected_fc {
        return Err(ComLinkError::protocol(format!(
            "Function code mismatch: expected {:02X}, got {:02X}",
            expected_fc, fc
        )));
    }
    Ok(())
}

fn check_address_range(address: u16, quantity: u16) -> Result<()> {
    if u32::from(address) + u32::from(quantity) > MODBUS_ADDRESS_SPACE {
        return Err(ComLinkError::invalid_request(format!(
            "Address range {}+{} exceeds addressable space",
            address, quantity
        )));
    }
    Ok(())
}

fn expected_byte_count(region: Region, quantity: u16) -> usize {
    if region.is_bit() {
        (quantity as usize).div_ceil(8)
    } else {
        quantity as usize * 2
    }
}

/// Pack bits LSB-first, as FC01/02/15 carry them
fn pack_bits(values: &[bool]) -> Vec<u8> {
    values
        .chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, &on)| if on { acc | (1 << i) } else { acc })
        })
        .collect()
}

fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
        .collect()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    // ========================================================================
    // Request building
    // ========================================================================

    #[test]
    fn test_build_read_holding_registers() {
        let pdu = ModbusCodec::build_read_pdu(Region::HoldingRegister, 0x006B, 3).unwrap();
        assert_eq!(pdu.as_slice(), &[0x03, 0x00, 0x6B, 0x00, 0x03]);
    }

    #[test]
    fn test_build_read_quantity_limits() {
        assert!(ModbusCodec::build_read_pdu(Region::InputRegister, 0, 125).is_ok());
        assert!(matches!(
            ModbusCodec::build_read_pdu(Region::InputRegister, 0, 126),
            Err(ComLinkError::InvalidRequest(_))
        ));
        assert!(ModbusCodec::build_read_pdu(Region::Coil, 0, 2000).is_ok());
        assert!(ModbusCodec::build_read_pdu(Region::Coil, 0, 2001).is_err());
        assert!(ModbusCodec::build_read_pdu(Region::DiscreteInput, 0, 0).is_err());
        assert!(ModbusCodec::build_read_pdu(Region::HoldingRegister, 65530, 7).is_err());
        assert!(ModbusCodec::build_read_pdu(Region::HoldingRegister, 65530, 6).is_ok());
    }

    #[test]
    fn test_build_fc05_write_true() {
        let pdu = ModbusCodec::build_write_fc05_single_coil_pdu(0x0100, true).unwrap();
        assert_eq!(pdu.as_slice(), &[0x05, 0x01, 0x00, 0xFF, 0x00]);
    }

    #[test]
    fn test_build_fc05_write_false() {
        let pdu = ModbusCodec::build_write_fc05_single_coil_pdu(0x0100, false).unwrap();
        assert_eq!(pdu.as_slice(), &[0x05, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_build_fc06_typical_value() {
        let pdu = ModbusCodec::build_write_fc06_single_register_pdu(0x0001, 0x0003).unwrap();
        assert_eq!(pdu.as_slice(), &[0x06, 0x00, 0x01, 0x00, 0x03]);
    }

    #[test]
    fn test_build_fc15_bit_packing() {
        // 10 coils: 1,0,1,1,0,0,1,1 | 1,0 => 0xCD 0x01
        let coils = [
            true, false, true, true, false, false, true, true, true, false,
        ];
        let pdu = ModbusCodec::build_write_fc15_multiple_coils_pdu(0x0013, &coils).unwrap();
        assert_eq!(
            pdu.as_slice(),
            &[0x0F, 0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01]
        );
    }

    #[test]
    fn test_build_fc15_empty_array_error() {
        assert!(ModbusCodec::build_write_fc15_multiple_coils_pdu(0, &[]).is_err());
    }

    #[test]
    fn test_build_fc16_single_register() {
        let pdu = ModbusCodec::build_write_fc16_multiple_registers_pdu(0x0100, &[0x1234]).unwrap();
        assert_eq!(
            pdu.as_slice(),
            &[0x10, 0x01, 0x00, 0x00, 0x01, 0x02, 0x12, 0x34]
        );
    }

    #[test]
    fn test_build_fc16_count_limit() {
        assert!(ModbusCodec::build_write_fc16_multiple_registers_pdu(0, &[0; 123]).is_ok());
        assert!(ModbusCodec::build_write_fc16_multiple_registers_pdu(0, &[0; 124]).is_err());
        assert!(ModbusCodec::build_write_fc16_multiple_registers_pdu(0, &[]).is_err());
    }

    // ========================================================================
    // Response parsing
    // ========================================================================

    #[test]
    fn test_parse_holding_registers_response() {
        let pdu = ModbusPdu::from_slice(&[0x03, 0x04, 0x02, 0xEE, 0x80, 0x00]).unwrap();
        let raw = ModbusCodec::parse_read_response(&pdu, Region::HoldingRegister, 2).unwrap();
        assert_eq!(raw, RawData::Words(vec![750, 0x8000]));
    }

    #[test]
    fn test_parse_coils_response_truncates_padding() {
        let pdu = ModbusPdu::from_slice(&[0x01, 0x02, 0xCD, 0x01]).unwrap();
        let raw = ModbusCodec::parse_read_response(&pdu, Region::Coil, 10).unwrap();
        assert_eq!(
            raw,
            RawData::Bits(vec![
                true, false, true, true, false, false, true, true, true, false
            ])
        );
    }

    #[test]
    fn test_parse_byte_count_mismatch() {
        // declares 4 bytes, carries 2
        let pdu = ModbusPdu::from_slice(&[0x03, 0x04, 0x00, 0x01]).unwrap();
        assert!(matches!(
            ModbusCodec::parse_read_response(&pdu, Region::HoldingRegister, 2),
            Err(ComLinkError::Protocol(_))
        ));

        // consistent byte count, but not what was requested
        let pdu = ModbusPdu::from_slice(&[0x03, 0x02, 0x00, 0x01]).unwrap();
        assert!(matches!(
            ModbusCodec::parse_read_response(&pdu, Region::HoldingRegister, 2),
            Err(ComLinkError::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_function_code_mismatch() {
        let pdu = ModbusPdu::from_slice(&[0x04, 0x02, 0x00, 0x01]).unwrap();
        assert!(matches!(
            ModbusCodec::parse_read_response(&pdu, Region::HoldingRegister, 1),
            Err(ComLinkError::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_exception_response() {
        let pdu = ModbusPdu::from_slice(&[0x83, 0x02]).unwrap();
        assert_eq!(
            ModbusCodec::parse_read_response(&pdu, Region::HoldingRegister, 1).unwrap_err(),
            ComLinkError::DeviceException {
                function: 0x03,
                code: 0x02
            }
        );
    }

    #[test]
    fn test_parse_write_response_echo() {
        let request = ModbusCodec::build_write_fc06_single_register_pdu(10, 750).unwrap();
        assert!(ModbusCodec::parse_write_response(&request, &request.clone()).is_ok());

        let wrong = ModbusCodec::build_write_fc06_single_register_pdu(10, 751).unwrap();
        assert!(matches!(
            ModbusCodec::parse_write_response(&request, &wrong),
            Err(ComLinkError::Protocol(_))
        ));

        let request = ModbusCodec::build_write_fc16_multiple_registers_pdu(10, &[1, 2]).unwrap();
        let echo = ModbusPdu::from_slice(&[0x10, 0x00, 0x0A, 0x00, 0x02]).unwrap();
        assert!(ModbusCodec::parse_write_response(&request, &echo).is_ok());

        let exception = ModbusCodec::build_exception_pdu(0x10, 0x04).unwrap();
        assert!(matches!(
            ModbusCodec::parse_write_response(&request, &exception),
            Err(ComLinkError::DeviceException { function: 0x10, code: 0x04 })
        ));
    }

    #[test]
    fn test_expected_response_len() {
        let read = ModbusCodec::build_read_pdu(Region::HoldingRegister, 0, 10).unwrap();
        assert_eq!(ModbusCodec::expected_response_len(&read), Some(22));
        let coils = ModbusCodec::build_read_pdu(Region::Coil, 0, 10).unwrap();
        assert_eq!(ModbusCodec::expected_response_len(&coils), Some(4));
        let write = ModbusCodec::build_write_fc05_single_coil_pdu(0, true).unwrap();
        assert_eq!(ModbusCodec::expected_response_len(&write), Some(5));
    }

    #[test]
    fn test_read_roundtrip_across_regions() {
        let cases = [
            (Region::HoldingRegister, RawData::Words(vec![0, 1, 0x7FFF, 0xFFFF])),
            (Region::InputRegister, RawData::Words((0..125).collect())),
            (Region::Coil, RawData::Bits(vec![true; 2000])),
            (
                Region::DiscreteInput,
                RawData::Bits((0..13).map(|i| i % 3 == 0).collect()),
            ),
        ];
        for (region, data) in cases {
            let quantity = data.len() as u16;
            let response = ModbusCodec::build_read_response(region, &data).unwrap();
            let parsed = ModbusCodec::parse_read_response(&response, region, quantity).unwrap();
            assert_eq!(parsed, data, "{region}");
        }
    }
}

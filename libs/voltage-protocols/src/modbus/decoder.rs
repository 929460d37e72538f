//! Register value decoding
//!
//! Raw 16-bit words are big-endian with the high word first for multi-word
//! types. Decoding is deterministic: a word count that is not a multiple of
//! the type's width is rejected, never truncated.
//!
//! Engineering value = raw * scale + offset. Booleans and strings are never
//! scaled. Integer types keep exact integers under the identity transform.

use tracing::trace;
use voltage_comlink::error::{ComLinkError, Result};
use voltage_comlink::{DecodedValue, ProtocolValue};

use super::types::{DataType, RawData, ValueCodec};

/// Decode a raw read result, unwrapping a single decoded value
pub fn decode(raw: &RawData, codec: &ValueCodec) -> Result<DecodedValue> {
    let values = match raw {
        RawData::Bits(bits) => bits.iter().map(|&b| ProtocolValue::Bool(b)).collect(),
        RawData::Words(words) => decode_words(words, codec)?,
    };
    Ok(DecodedValue::from_values(values))
}

/// Decode a flat word sequence according to `codec`
pub fn decode_words(words: &[u16], codec: &ValueCodec) -> Result<Vec<ProtocolValue>> {
    let data_type = match codec.data_type {
        Some(dt) => dt,
        // Untyped reads return raw words unless a transform was requested
        None if codec.is_identity() => {
            return Ok(words.iter().map(|&w| ProtocolValue::from(w)).collect())
        },
        None => DataType::Uint16,
    };

    let Some(width) = data_type.word_width() else {
        return Ok(vec![ProtocolValue::Text(decode_text(words))]);
    };

    if words.len() % width != 0 {
        return Err(ComLinkError::malformed(format!(
            "{} words is not a multiple of {} width {}",
            words.len(),
            data_type,
            width
        )));
    }

    let values = words
        .chunks_exact(width)
        .map(|chunk| decode_one(chunk, data_type, codec))
        .collect::<Vec<_>>();
    trace!(
        "Decoded {} words as {} x{}: {:?}",
        words.len(),
        data_type,
        values.len(),
        values
    );
    Ok(values)
}

fn decode_one(chunk: &[u16], data_type: DataType, codec: &ValueCodec) -> ProtocolValue {
    match data_type {
        DataType::Int16 => integer(chunk[0] as i16 as i64, codec),
        DataType::Uint16 => integer(chunk[0] as i64, codec),
        DataType::Int32 => integer(join_u32(chunk) as i32 as i64, codec),
        DataType::Uint32 => integer(join_u32(chunk) as i64, codec),
        DataType::Float32 => float(f32::from_bits(join_u32(chunk)) as f64, codec),
        DataType::Float64 => float(f64::from_bits(join_u64(chunk)), codec),
        DataType::Boolean => ProtocolValue::Bool(chunk[0] != 0),
        DataType::Text => ProtocolValue::Text(decode_text(chunk)),
    }
}

fn integer(raw: i64, codec: &ValueCodec) -> ProtocolValue {
    if codec.is_identity() {
        ProtocolValue::Integer(raw)
    } else {
        ProtocolValue::Float(raw as f64 * codec.scale + codec.offset)
    }
}

fn float(raw: f64, codec: &ValueCodec) -> ProtocolValue {
    ProtocolValue::Float(raw * codec.scale + codec.offset)
}

fn join_u32(chunk: &[u16]) -> u32 {
    (u32::from(chunk[0]) << 16) | u32::from(chunk[1])
}

fn join_u64(chunk: &[u16]) -> u64 {
    chunk
        .iter()
        .fold(0u64, |acc, &w| (acc << 16) | u64::from(w))
}

/// Two characters per register, high byte first; trailing NULs and
/// whitespace are trimmed
fn decode_text(words: &[u16]) -> String {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    String::from_utf8_lossy(&bytes)
        .trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

/// Encode engineering values into register words.
///
/// Numeric values go through the inverse transform `(value - offset) / scale`;
/// integer types round to the nearest integer and must fit the type's range.
pub fn encode_words(values: &[ProtocolValue], codec: &ValueCodec) -> Result<Vec<u16>> {
    let data_type = codec.data_type.unwrap_or(DataType::Uint16);
    let mut words = Vec::with_capacity(values.len() * data_type.word_width().unwrap_or(1));
    for value in values {
        encode_one(value, data_type, codec, &mut words)?;
    }
    Ok(words)
}

fn encode_one(
    value: &ProtocolValue,
    data_type: DataType,
    codec: &ValueCodec,
    out: &mut Vec<u16>,
) -> Result<()> {
    match data_type {
        DataType::Boolean => {
            let on = value.as_bool().ok_or_else(|| {
                ComLinkError::invalid_request(format!("Cannot write {} as boolean", value))
            })?;
            out.push(u16::from(on));
        },
        DataType::Text => {
            let ProtocolValue::Text(text) = value else {
                return Err(ComLinkError::invalid_request(format!(
                    "Cannot write {} as string",
                    value
                )));
            };
            if !text.is_ascii() {
                return Err(ComLinkError::invalid_request("String value must be ASCII"));
            }
            out.extend(
                text.as_bytes()
                    .chunks(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair.get(1).copied().unwrap_or(0)])),
            );
        },
        DataType::Float32 => {
            let raw = inverse(value, codec)?;
            if raw.abs() > f32::MAX as f64 {
                return Err(out_of_range(raw, data_type));
            }
            split_u32((raw as f32).to_bits(), out);
        },
        DataType::Float64 => {
            let bits = inverse(value, codec)?.to_bits();
            out.extend((0..4).rev().map(|i| (bits >> (i * 16)) as u16));
        },
        DataType::Int16 => {
            let raw = rounded(value, codec, i16::MIN as f64, i16::MAX as f64, data_type)?;
            out.push(raw as i16 as u16);
        },
        DataType::Uint16 => {
            let raw = rounded(value, codec, 0.0, u16::MAX as f64, data_type)?;
            out.push(raw as u16);
        },
        DataType::Int32 => {
            let raw = rounded(value, codec, i32::MIN as f64, i32::MAX as f64, data_type)?;
            split_u32(raw as i32 as u32, out);
        },
        DataType::Uint32 => {
            let raw = rounded(value, codec, 0.0, u32::MAX as f64, data_type)?;
            split_u32(raw as u32, out);
        },
    }
    Ok(())
}

/// Encode coil values: booleans, or numbers 0/1
pub fn encode_bits(values: &[ProtocolValue]) -> Result<Vec<bool>> {
    values
        .iter()
        .map(|value| match value {
            ProtocolValue::Bool(b) => Ok(*b),
            ProtocolValue::Integer(0) => Ok(false),
            ProtocolValue::Integer(1) => Ok(true),
            ProtocolValue::Float(f) if *f == 0.0 => Ok(false),
            ProtocolValue::Float(f) if *f == 1.0 => Ok(true),
            other => Err(ComLinkError::invalid_request(format!(
                "Coil value must be boolean or 0/1, got {}",
                other
            ))),
        })
        .collect()
}

fn inverse(value: &ProtocolValue, codec: &ValueCodec) -> Result<f64> {
    let engineering = match value {
        ProtocolValue::Text(_) => None,
        other => other.as_f64(),
    }
    .ok_or_else(|| ComLinkError::invalid_request(format!("Cannot write {} as a number", value)))?;

    let raw = (engineering - codec.offset) / codec.scale;
    if !raw.is_finite() {
        return Err(ComLinkError::invalid_request(format!(
            "Value {} is not finite after scaling",
            engineering
        )));
    }
    Ok(raw)
}

fn rounded(
    value: &ProtocolValue,
    codec: &ValueCodec,
    min: f64,
    max: f64,
    data_type: DataType,
) -> Result<f64> {
    let raw = inverse(value, codec)?.round();
    if raw < min || raw > max {
        return Err(out_of_range(raw, data_type));
    }
    Ok(raw)
}

fn out_of_range(raw: f64, data_type: DataType) -> ComLinkError {
    ComLinkError::invalid_request(format!("Raw value {} out of range for {}", raw, data_type))
}

fn split_u32(value: u32, out: &mut Vec<u16>) {
    out.push((value >> 16) as u16);
    out.push(value as u16);
}

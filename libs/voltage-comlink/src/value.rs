//! Decoded values
//!
//! Terminal output of a register read after decoding and scaling.

use serde::{Deserialize, Serialize};

/// A single decoded engineering value
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ProtocolValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl From<f64> for ProtocolValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for ProtocolValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for ProtocolValue {
    fn from(v: i32) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<u16> for ProtocolValue {
    fn from(v: u16) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<u32> for ProtocolValue {
    fn from(v: u32) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<bool> for ProtocolValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ProtocolValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ProtocolValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl ProtocolValue {
    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Text(_) => None,
        }
    }

    /// Try to convert to i64 (floats must be integral)
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Try to convert to bool (numbers: non-zero is true)
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Integer(i) => Some(*i != 0),
            Self::Float(f) => Some(*f != 0.0),
            Self::Text(_) => None,
        }
    }

    /// Parse operator input: `true`/`false`, integers, then floats
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "true" | "on" => return Some(Self::Bool(true)),
            "false" | "off" => return Some(Self::Bool(false)),
            _ => {},
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Some(Self::Integer(i));
        }
        trimmed.parse::<f64>().ok().map(Self::Float)
    }
}

impl std::fmt::Display for ProtocolValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(s) => write!(f, "{:?}", s),
        }
    }
}

/// Result of one decoded read: a single value, or an ordered sequence when
/// more than one value was decoded
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DecodedValue {
    Single(ProtocolValue),
    Many(Vec<ProtocolValue>),
}

impl DecodedValue {
    /// Unwrap a decoded sequence of exactly one value
    pub fn from_values(mut values: Vec<ProtocolValue>) -> Self {
        if values.len() == 1 {
            if let Some(value) = values.pop() {
                return DecodedValue::Single(value);
            }
        }
        DecodedValue::Many(values)
    }

    pub fn as_single(&self) -> Option<&ProtocolValue> {
        match self {
            DecodedValue::Single(v) => Some(v),
            DecodedValue::Many(_) => None,
        }
    }

    /// All values in order, regardless of shape
    pub fn values(&self) -> &[ProtocolValue] {
        match self {
            DecodedValue::Single(v) => std::slice::from_ref(v),
            DecodedValue::Many(vs) => vs,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_single().and_then(ProtocolValue::as_f64)
    }
}

impl From<ProtocolValue> for DecodedValue {
    fn from(v: ProtocolValue) -> Self {
        DecodedValue::Single(v)
    }
}

macro_rules! impl_single_from {
    ($($t:ty),*) => {
        $(
            impl From<$t> for DecodedValue {
                fn from(v: $t) -> Self {
                    DecodedValue::Single(ProtocolValue::from(v))
                }
            }
        )*
    };
}

impl_single_from!(bool, i64, f64, &str, String);

impl From<Vec<ProtocolValue>> for DecodedValue {
    fn from(values: Vec<ProtocolValue>) -> Self {
        DecodedValue::from_values(values)
    }
}

impl std::fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodedValue::Single(v) => write!(f, "{}", v),
            DecodedValue::Many(vs) => {
                f.write_str("[")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                f.write_str("]")
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_value_conversions() {
        let v = ProtocolValue::from(42i64);
        assert_eq!(v.as_i64(), Some(42));
        assert_eq!(v.as_f64(), Some(42.0));

        let v = ProtocolValue::from(2.5f64);
        assert_eq!(v.as_f64(), Some(2.5));
        assert_eq!(v.as_i64(), None);

        let v = ProtocolValue::from(true);
        assert_eq!(v.as_bool(), Some(true));
        assert_eq!(v.as_i64(), Some(1));

        assert_eq!(ProtocolValue::from("SN-01").as_f64(), None);
    }

    #[test]
    fn test_parse_operator_input() {
        assert_eq!(ProtocolValue::parse("true"), Some(ProtocolValue::Bool(true)));
        assert_eq!(ProtocolValue::parse(" OFF "), Some(ProtocolValue::Bool(false)));
        assert_eq!(ProtocolValue::parse("-12"), Some(ProtocolValue::Integer(-12)));
        assert_eq!(ProtocolValue::parse("48.5"), Some(ProtocolValue::Float(48.5)));
        assert_eq!(ProtocolValue::parse("abc"), None);
    }

    #[test]
    fn test_decoded_value_unwrap() {
        let single = DecodedValue::from_values(vec![ProtocolValue::Integer(750)]);
        assert_eq!(single, DecodedValue::Single(ProtocolValue::Integer(750)));
        assert_eq!(single.as_f64(), Some(750.0));

        let many = DecodedValue::from_values(vec![
            ProtocolValue::Bool(true),
            ProtocolValue::Bool(false),
        ]);
        assert_eq!(many.values().len(), 2);
        assert!(many.as_single().is_none());
        assert_eq!(many.to_string(), "[true, false]");
    }

    #[test]
    fn test_decoded_value_json_shape() {
        let single = DecodedValue::Single(ProtocolValue::Float(1.5));
        assert_eq!(serde_json::to_string(&single).unwrap(), "1.5");

        let many = DecodedValue::Many(vec![1i64.into(), 2i64.into()]);
        assert_eq!(serde_json::to_string(&many).unwrap(), "[1,2]");
    }
}

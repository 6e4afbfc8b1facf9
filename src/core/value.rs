//! Decoded value model shared by the codec boundary, validation and the
//! user-facing read/write surface.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A decoded controller value.
///
/// Unsigned 64-bit reads come back from the transport as `Int` (the wire
/// layer reports signed); the numeric binding masks them into `UInt`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Struct(IndexMap<String, Value>),
}

impl Value {
    /// Structural kind name used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view of the value, if it is an integer.
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Int(n) => Some(*n as i128),
            Value::UInt(n) => Some(*n as i128),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            Value::UInt(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Struct(map) => Some(map),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_json_reads_naturally() {
        let mut fields = IndexMap::new();
        fields.insert("realValue".to_string(), Value::Float(0.0));
        fields.insert("stringValue".to_string(), Value::from("hello world"));
        let value = Value::Struct(fields);

        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"realValue":0.0,"stringValue":"hello world"}"#);
    }

    #[test]
    fn integer_views_cover_both_signs() {
        assert_eq!(Value::Int(-5).as_i128(), Some(-5));
        assert_eq!(Value::UInt(u64::MAX).as_i128(), Some(u64::MAX as i128));
        assert_eq!(Value::Float(1.5).as_i128(), None);
        assert_eq!(Value::Int(2).as_f64(), Some(2.0));
    }
}

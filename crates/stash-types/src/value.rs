use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// An application value as seen by the cache.
///
/// Integers are kept apart from everything else so that backends can apply
/// `incr`/`decr` natively. Any other value is an opaque byte string; use
/// [`Value::from_json`] / [`Value::to_json`] to carry structured data.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
}

impl Value {
    /// Serialize any `Serialize` type into a `Bytes` value (JSON encoded).
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, TypeError> {
        serde_json::to_vec(value)
            .map(Self::Bytes)
            .map_err(|e| TypeError::Serialization(e.to_string()))
    }

    /// Decode a value previously built with [`Value::from_json`].
    pub fn to_json<T: DeserializeOwned>(&self) -> Result<T, TypeError> {
        match self {
            Self::Bytes(bytes) => {
                serde_json::from_slice(bytes).map_err(|e| TypeError::Serialization(e.to_string()))
            }
            Self::Int(n) => serde_json::from_value(serde_json::Value::from(*n))
                .map_err(|e| TypeError::Serialization(e.to_string())),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            Self::Int(_) => None,
        }
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Self::Int(_))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Bytes(s.into_bytes())
    }
}

impl TryFrom<Value> for i64 {
    type Error = TypeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_int().ok_or(TypeError::NotAnInteger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn json_round_trip() {
        let mut map = BTreeMap::new();
        map.insert("views".to_string(), 10u32);
        let value = Value::from_json(&map).unwrap();
        assert!(!value.is_int());
        let back: BTreeMap<String, u32> = value.to_json().unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn int_decodes_as_json_number() {
        let n: u64 = Value::Int(7).to_json().unwrap();
        assert_eq!(n, 7);
    }

    #[test]
    fn conversions() {
        assert_eq!(Value::from(5i64), Value::Int(5));
        assert_eq!(Value::from("abc"), Value::Bytes(b"abc".to_vec()));
        assert_eq!(Value::from("abc").as_bytes(), Some(&b"abc"[..]));
        assert_eq!(i64::try_from(Value::Int(3)), Ok(3));
        assert_eq!(i64::try_from(Value::from("3")), Err(TypeError::NotAnInteger));
    }

    #[test]
    fn bad_json_is_an_error() {
        let value = Value::from("not json");
        assert!(matches!(
            value.to_json::<u32>(),
            Err(TypeError::Serialization(_))
        ));
    }
}

//! Value serialization strategies for typed cache access.
//!
//! Raw bytes and strings never go through here.

use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, Result};

// == Serializer Kind ==
/// Configured choice of serializer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SerializerKind {
    /// bincode
    CompactBinary,
    /// serde_json
    #[default]
    TextualJson,
}

impl FromStr for SerializerKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" | "textualjson" => Ok(Self::TextualJson),
            "binary" | "bincode" | "compactbinary" => Ok(Self::CompactBinary),
            other => Err(format!("unknown serializer '{other}'")),
        }
    }
}

// == Value Serializer Trait ==
pub trait ValueSerializer: Send + Sync {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl ValueSerializer for JsonSerializer {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Deserialization(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeSerializer;

impl ValueSerializer for BincodeSerializer {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|e| CacheError::Deserialization(e.to_string()))
    }
}

// == Serializer ==
/// Strategy resolved once from a [`SerializerKind`].
#[derive(Debug, Clone, Copy)]
pub enum Serializer {
    Json(JsonSerializer),
    Bincode(BincodeSerializer),
}

impl From<SerializerKind> for Serializer {
    fn from(kind: SerializerKind) -> Self {
        match kind {
            SerializerKind::TextualJson => Self::Json(JsonSerializer),
            SerializerKind::CompactBinary => Self::Bincode(BincodeSerializer),
        }
    }
}

impl ValueSerializer for Serializer {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::Json(inner) => inner.serialize(value),
            Self::Bincode(inner) => inner.serialize(value),
        }
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Json(inner) => inner.deserialize(bytes),
            Self::Bincode(inner) => inner.deserialize(bytes),
        }
    }
}

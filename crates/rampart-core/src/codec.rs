//! Byte encoding boundary.
//!
//! Identifiers and payloads arrive from outside as hex, base64 or raw bytes.
//! This module is the only place that converts between those forms; the rest
//! of the crate works with `Vec<u8>`.

use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};

pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

pub fn from_hex(s: &str) -> Result<Vec<u8>> {
    hex::decode(s).map_err(|e| Error::Codec(format!("hex: {e}")))
}

pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn from_base64(s: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(s)
        .map_err(|e| Error::Codec(format!("base64: {e}")))
}

/// Externally supplied bytes in whatever form the caller had them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ByteInput<'a> {
    Raw(&'a [u8]),
    Hex(&'a str),
    Base64(&'a str),
    /// Unknown textual encoding, resolved by [`decode_flexible`].
    Text(&'a str),
}

impl ByteInput<'_> {
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            ByteInput::Raw(bytes) => Ok(bytes.to_vec()),
            ByteInput::Hex(s) => from_hex(s),
            ByteInput::Base64(s) => from_base64(s),
            ByteInput::Text(s) => decode_flexible(s),
        }
    }
}

/// Decode a string that may be hex or base64.
///
/// Even-length strings made only of hex digits are read as hex. Anything else
/// must be valid standard base64.
pub fn decode_flexible(s: &str) -> Result<Vec<u8>> {
    let trimmed = s.trim();
    let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    if !trimmed.is_empty()
        && trimmed.len() % 2 == 0
        && trimmed.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return from_hex(trimmed);
    }
    from_base64(trimmed)
}

/// Serde helper for base64 encoded byte vectors.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde helper for optional base64 encoded byte vectors.
pub mod base64_opt {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| STANDARD.decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

//! Setup payload
//!
//! A payload is the value a leader-only setup step hands to every node. It is
//! an opaque byte sequence: each node decodes its own copy, and nothing can
//! mutate a payload once it exists.

use anyhow::{Context, Result};
use serde::de::{self, DeserializeOwned, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Opaque bytes produced by a leader-only setup step
///
/// Serialized as a byte string (MessagePack `bin`), one byte per byte.
#[derive(Clone, PartialEq, Eq)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Encode any serializable value as a MessagePack payload
    pub fn encode<T: Serialize>(value: &T) -> Result<Self> {
        let bytes = rmp_serde::to_vec(value).context("Failed to encode payload")?;
        Ok(Self(bytes))
    }

    /// Decode a payload produced by [`Payload::encode`]
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        rmp_serde::from_slice(&self.0).context("Failed to decode payload")
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The payload as UTF-8 text, if it is valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(text) if text.len() <= 64 => write!(f, "Payload({:?})", text),
            _ => write!(f, "Payload({} bytes)", self.0.len()),
        }
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct PayloadVisitor;

impl<'de> Visitor<'de> for PayloadVisitor {
    type Value = Payload;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a byte string")
    }

    fn visit_bytes<E: de::Error>(self, bytes: &[u8]) -> Result<Payload, E> {
        Ok(Payload(bytes.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, bytes: Vec<u8>) -> Result<Payload, E> {
        Ok(Payload(bytes))
    }

    // Self-describing formats without a byte type (JSON) hand over a sequence
    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Payload, A::Error> {
        let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(4096));
        while let Some(byte) = seq.next_element::<u8>()? {
            bytes.push(byte);
        }
        Ok(Payload(bytes))
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_byte_buf(PayloadVisitor)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self(text.into_bytes())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_text_payload() {
        let payload = Payload::from("DATA");
        assert_eq!(payload.as_str(), Some("DATA"));
        assert_eq!(payload.len(), 4);
        assert_eq!(format!("{:?}", payload), "Payload(\"DATA\")");
    }

    #[test]
    fn test_binary_payload_is_not_text() {
        let payload = Payload::from_bytes(vec![0xff, 0xfe, 0x00]);
        assert!(payload.as_str().is_none());
        assert_eq!(format!("{:?}", payload), "Payload(3 bytes)");
    }

    #[test]
    fn test_structured_payload() {
        let mut ports = BTreeMap::new();
        ports.insert("db".to_string(), 5432u16);
        ports.insert("cache".to_string(), 6379u16);

        let payload = Payload::encode(&ports).unwrap();
        let decoded: BTreeMap<String, u16> = payload.decode().unwrap();
        assert_eq!(decoded, ports);
    }

    #[test]
    fn test_wire_encoding_is_one_byte_per_byte() {
        let payload = Payload::from_bytes(vec![0xff; 1000]);
        let encoded = rmp_serde::to_vec(&payload).unwrap();
        // bin16 marker plus a two-byte length
        assert_eq!(encoded.len(), 1000 + 3);

        let decoded: Payload = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_json_encoding_reads_back() {
        let payload = Payload::from_bytes(vec![1, 2, 250]);
        let json = serde_json::to_string(&payload).unwrap();
        let decoded: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_decode_wrong_shape_fails() {
        let payload = Payload::from("not msgpack for a map");
        assert!(payload.decode::<BTreeMap<String, u16>>().is_err());
    }
}

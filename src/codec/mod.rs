//! Wire format of realtime mutation messages.
//!
//! A message body is standard base64 text wrapping one MessagePack map with
//! named fields:
//!
//! ```text
//! { "key": bin, "value": bin | nil, "mutation_type": 0 (UPDATE) | 1 (DELETE),
//!   "logical_commit_time": i64 }
//! ```
//!
//! The record is verified in full before any field is exposed: unknown fields,
//! trailing bytes, wrong field types, an empty key, an unknown mutation type or
//! an UPDATE without a value are all rejected.

use crate::core::{KvError, LogicalTime, MutationKind, MutationRecord};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("payload is empty")]
    Empty,

    #[error("body is not a base64 encoded string: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("record failed schema verification: {0}")]
    Schema(#[from] rmp_serde::decode::Error),

    #[error("{0} unexpected trailing bytes after record")]
    TrailingBytes(usize),

    #[error("invalid record: {0}")]
    Invalid(String),
}

impl From<DecodeError> for KvError {
    fn from(err: DecodeError) -> Self {
        KvError::MalformedMessage(err.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireMutation {
    #[serde(with = "wire_bytes")]
    key: Vec<u8>,
    #[serde(default, with = "wire_optional_bytes")]
    value: Option<Vec<u8>>,
    mutation_type: u8,
    logical_commit_time: LogicalTime,
}

/// Encodes byte fields as MessagePack `bin` instead of integer arrays.
mod wire_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Ok(super::ByteBuf::deserialize(deserializer)?.0)
    }
}

mod wire_optional_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_bytes(bytes),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Ok(Option::<super::ByteBuf>::deserialize(deserializer)?.map(|buf| buf.0))
    }
}

/// Accepts MessagePack `bin`/`str` (and integer arrays from older producers).
struct ByteBuf(Vec<u8>);

impl<'de> Deserialize<'de> for ByteBuf {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ByteBufVisitor;

        impl<'de> serde::de::Visitor<'de> for ByteBufVisitor {
            type Value = ByteBuf;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a byte string")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<ByteBuf, E> {
                Ok(ByteBuf(v.to_vec()))
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<ByteBuf, E> {
                Ok(ByteBuf(v))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<ByteBuf, E> {
                Ok(ByteBuf(v.as_bytes().to_vec()))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<ByteBuf, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(byte) = seq.next_element::<u8>()? {
                    bytes.push(byte);
                }
                Ok(ByteBuf(bytes))
            }
        }

        deserializer.deserialize_bytes(ByteBufVisitor)
    }
}

pub struct MutationCodec;

impl MutationCodec {
    /// Decodes and verifies a base64 message body.
    pub fn decode(payload: &[u8]) -> Result<MutationRecord, DecodeError> {
        let binary = Self::unwrap_envelope(payload)?;
        Self::decode_binary(&binary)
    }

    /// Strips the base64 envelope and verifies the record, returning the
    /// verified binary record bytes.
    pub fn verify_payload(payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
        let binary = Self::unwrap_envelope(payload)?;
        Self::decode_binary(&binary)?;
        Ok(binary)
    }

    /// Decodes and verifies a binary record (no base64 envelope).
    pub fn decode_binary(bytes: &[u8]) -> Result<MutationRecord, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }

        let mut cursor = Cursor::new(bytes);
        let wire: WireMutation = {
            let mut deserializer = rmp_serde::Deserializer::new(&mut cursor);
            WireMutation::deserialize(&mut deserializer)?
        };

        let consumed = cursor.position() as usize;
        if consumed != bytes.len() {
            return Err(DecodeError::TrailingBytes(bytes.len() - consumed));
        }

        Self::validate(wire)
    }

    pub fn encode(record: &MutationRecord) -> Result<String, KvError> {
        Ok(STANDARD.encode(Self::encode_binary(record)?))
    }

    pub fn encode_binary(record: &MutationRecord) -> Result<Vec<u8>, KvError> {
        let wire = WireMutation {
            key: record.key.clone(),
            value: match record.kind {
                MutationKind::Update => record.value.clone(),
                MutationKind::Delete => None,
            },
            mutation_type: record.kind.wire_value(),
            logical_commit_time: record.logical_commit_time,
        };
        rmp_serde::to_vec_named(&wire)
            .map_err(|err| KvError::Execution(format!("encode mutation record: {}", err)))
    }

    fn unwrap_envelope(payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
        let trimmed = payload.trim_ascii();
        if trimmed.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(STANDARD.decode(trimmed)?)
    }

    fn validate(wire: WireMutation) -> Result<MutationRecord, DecodeError> {
        if wire.key.is_empty() {
            return Err(DecodeError::Invalid("key must not be empty".to_string()));
        }

        let kind = MutationKind::from_wire(wire.mutation_type).ok_or_else(|| {
            DecodeError::Invalid(format!("unknown mutation_type {}", wire.mutation_type))
        })?;

        let value = match kind {
            MutationKind::Update => Some(wire.value.ok_or_else(|| {
                DecodeError::Invalid("UPDATE record is missing its value".to_string())
            })?),
            MutationKind::Delete => None,
        };

        Ok(MutationRecord {
            key: wire.key,
            value,
            kind,
            logical_commit_time: wire.logical_commit_time,
        })
    }
}

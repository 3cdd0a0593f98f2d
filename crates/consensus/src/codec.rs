//! Wire codec for consensus envelopes.
//!
//! ```text
//! +-------+---------+------+---------------------+----------+----------------+
//! | magic | version | kind | body length (u32 BE)| checksum | bincode body   |
//! | DBFT  | 1 byte  | 1 B  | 4 bytes             | 4 bytes  | `length` bytes |
//! +-------+---------+------+---------------------+----------+----------------+
//! ```
//!
//! The body is the bincode encoding of the whole [`Envelope`] using fixed
//! width little-endian integers. The checksum is the first four bytes of the
//! SHA-256 of the body. Decoding never panics: every malformed input maps to
//! a [`DecodeError`].

use bincode::Options;
use dbft_crypto::hash_data;
use dbft_types::{ConsensusError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::messages::{Envelope, PayloadKind};

pub const MAGIC: [u8; 4] = *b"DBFT";
pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 14;
const CHECKSUM_LEN: usize = 4;

/// Maximum encoded envelope size (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("bad magic bytes")]
    BadMagic,

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown payload kind 0x{0:02x}")]
    UnknownKind(u8),

    #[error("message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("declared body length {declared} does not match actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("body checksum mismatch")]
    ChecksumMismatch,

    #[error("payload kind mismatch: header says {header}, body holds {body}")]
    KindMismatch { header: PayloadKind, body: PayloadKind },

    #[error("malformed body: {0}")]
    Malformed(String),
}

impl From<DecodeError> for ConsensusError {
    fn from(e: DecodeError) -> Self {
        ConsensusError::MalformedMessage(e.to_string())
    }
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_MESSAGE_SIZE as u64)
        .reject_trailing_bytes()
}

pub(crate) fn serialize_body<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    options()
        .serialize(value)
        .map_err(|e| ConsensusError::MalformedMessage(format!("Failed to serialize: {}", e)))
}

fn checksum(body: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = hash_data(body);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest.as_bytes()[..CHECKSUM_LEN]);
    out
}

fn deserialize_body<T: DeserializeOwned>(bytes: &[u8]) -> std::result::Result<T, DecodeError> {
    options()
        .deserialize(bytes)
        .map_err(|e| DecodeError::Malformed(e.to_string()))
}

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    let body = serialize_body(envelope)?;

    if HEADER_LEN + body.len() > MAX_MESSAGE_SIZE {
        return Err(ConsensusError::MalformedMessage(format!(
            "message too large: {} bytes (max {})",
            HEADER_LEN + body.len(),
            MAX_MESSAGE_SIZE
        )));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(&MAGIC);
    buf.push(PROTOCOL_VERSION);
    buf.push(envelope.kind().tag());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&checksum(&body));
    buf.extend_from_slice(&body);
    Ok(buf)
}

pub fn decode(bytes: &[u8]) -> std::result::Result<Envelope, DecodeError> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(DecodeError::TooLarge {
            size: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::Truncated {
            needed: HEADER_LEN,
            available: bytes.len(),
        });
    }

    if bytes[..4] != MAGIC {
        return Err(DecodeError::BadMagic);
    }

    let version = bytes[4];
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let kind = PayloadKind::from_tag(bytes[5]).ok_or(DecodeError::UnknownKind(bytes[5]))?;

    let declared = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
    let body = &bytes[HEADER_LEN..];
    if declared > body.len() {
        return Err(DecodeError::Truncated {
            needed: HEADER_LEN + declared,
            available: bytes.len(),
        });
    }
    if declared != body.len() {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }
    if bytes[HEADER_LEN - CHECKSUM_LEN..HEADER_LEN] != checksum(body) {
        return Err(DecodeError::ChecksumMismatch);
    }

    let envelope: Envelope = deserialize_body(body)?;

    if envelope.kind() != kind {
        return Err(DecodeError::KindMismatch {
            header: kind,
            body: envelope.kind(),
        });
    }

    Ok(envelope)
}

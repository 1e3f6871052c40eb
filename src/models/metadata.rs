//! `Upload-Metadata` codec.
//!
//! The wire form is a comma-separated list of `key base64(value)` pairs. A pair
//! may omit the value, which decodes to an empty byte string. Pairs keep the
//! order the client sent them in, and encoding reproduces that order.

use base64::{
    Engine as _,
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig, general_purpose},
};
use std::fmt;
use thiserror::Error;

/// Decoder that tolerates clients which strip base64 padding.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

const MAX_KEY_LEN: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("empty metadata pair at position {0}")]
    EmptyPair(usize),
    #[error("metadata pair `{0}` has more than one space")]
    MalformedPair(String),
    #[error("metadata key `{0}` is invalid")]
    InvalidKey(String),
    #[error("metadata key `{0}` appears more than once")]
    DuplicateKey(String),
    #[error("metadata value for `{0}` is not valid base64")]
    InvalidValue(String),
}

/// Ordered key/value metadata attached to an upload.
///
/// A parsed header keeps the exact text the client sent, and that text is what
/// gets echoed back. Equality only looks at the decoded pairs.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    entries: Vec<(String, Vec<u8>)>,
    wire: Option<String>,
}

impl PartialEq for Metadata {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for Metadata {}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode an `Upload-Metadata` header value.
    ///
    /// An empty (or all-whitespace) header yields empty metadata. Keys must be
    /// non-empty printable ASCII without spaces or commas and must be unique.
    pub fn parse(header: &str) -> Result<Self, MetadataError> {
        let mut metadata = Self::new();
        if header.trim().is_empty() {
            return Ok(metadata);
        }

        for (position, pair) in header.split(',').enumerate() {
            let pair = pair.trim();
            if pair.is_empty() {
                return Err(MetadataError::EmptyPair(position));
            }

            let mut parts = pair.split(' ');
            let key = parts.next().unwrap_or_default();
            let encoded = parts.next();
            if parts.next().is_some() {
                return Err(MetadataError::MalformedPair(pair.to_string()));
            }

            let value = match encoded {
                Some(encoded) => LENIENT
                    .decode(encoded)
                    .map_err(|_| MetadataError::InvalidValue(key.to_string()))?,
                None => Vec::new(),
            };
            metadata.insert(key, value)?;
        }

        metadata.wire = Some(header.to_string());
        Ok(metadata)
    }

    /// Append a pair, keeping insertion order.
    pub fn insert(&mut self, key: &str, value: impl Into<Vec<u8>>) -> Result<(), MetadataError> {
        if !is_valid_key(key) {
            return Err(MetadataError::InvalidKey(key.to_string()));
        }
        if self.get(key).is_some() {
            return Err(MetadataError::DuplicateKey(key.to_string()));
        }
        self.entries.push((key.to_string(), value.into()));
        self.wire = None;
        Ok(())
    }

    /// Wire format: the header as received, or a canonical encoding in
    /// insertion order for metadata built in code.
    pub fn encode(&self) -> String {
        if let Some(wire) = &self.wire {
            return wire.clone();
        }
        self.entries
            .iter()
            .map(|(key, value)| {
                if value.is_empty() {
                    key.clone()
                } else {
                    format!("{} {}", key, general_purpose::STANDARD.encode(value))
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Value for `key` if it is valid UTF-8.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key.bytes().all(|b| b.is_ascii_graphic() && b != b',')
}

//! `Upload-Checksum` parsing and incremental digest verification.

use base64::{Engine as _, engine::general_purpose};
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    pub const SUPPORTED: [ChecksumAlgorithm; 2] = [ChecksumAlgorithm::Md5, ChecksumAlgorithm::Sha256];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Sha256 => "sha256",
        }
    }

    fn digest_len(&self) -> usize {
        match self {
            ChecksumAlgorithm::Md5 => 16,
            ChecksumAlgorithm::Sha256 => 32,
        }
    }

    /// Value for the `Tus-Checksum-Algorithm` header.
    pub fn header_value() -> String {
        Self::SUPPORTED
            .iter()
            .map(ChecksumAlgorithm::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChecksumError {
    #[error("checksum header must be `<algorithm> <base64 digest>`")]
    Malformed,
    #[error("checksum algorithm `{0}` is not supported")]
    UnsupportedAlgorithm(String),
    #[error("checksum digest is not valid base64 of the right length")]
    InvalidDigest,
}

/// Expected digest of a single PATCH body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub digest: Vec<u8>,
}

impl FromStr for Checksum {
    type Err = ChecksumError;

    fn from_str(header: &str) -> Result<Self, Self::Err> {
        let (name, encoded) = header
            .trim()
            .split_once(' ')
            .ok_or(ChecksumError::Malformed)?;

        let algorithm = ChecksumAlgorithm::SUPPORTED
            .into_iter()
            .find(|algo| algo.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| ChecksumError::UnsupportedAlgorithm(name.to_string()))?;

        let digest = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| ChecksumError::InvalidDigest)?;
        if digest.len() != algorithm.digest_len() {
            return Err(ChecksumError::InvalidDigest);
        }

        Ok(Self { algorithm, digest })
    }
}

/// Running digest fed chunk by chunk while the body streams to storage.
pub struct ChecksumVerifier {
    expected: Vec<u8>,
    state: DigestState,
}

enum DigestState {
    Md5(md5::Context),
    Sha256(Sha256),
}

impl ChecksumVerifier {
    pub fn new(checksum: Checksum) -> Self {
        let state = match checksum.algorithm {
            ChecksumAlgorithm::Md5 => DigestState::Md5(md5::Context::new()),
            ChecksumAlgorithm::Sha256 => DigestState::Sha256(Sha256::new()),
        };
        Self {
            expected: checksum.digest,
            state,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        match &mut self.state {
            DigestState::Md5(ctx) => ctx.consume(chunk),
            DigestState::Sha256(hasher) => hasher.update(chunk),
        }
    }

    pub fn matches(self) -> bool {
        let actual = match self.state {
            DigestState::Md5(ctx) => ctx.compute().0.to_vec(),
            DigestState::Sha256(hasher) => hasher.finalize().to_vec(),
        };
        actual == self.expected
    }
}

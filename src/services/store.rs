//! Storage abstraction every upload backend implements.
//!
//! The protocol handlers only ever talk to a [`DataStore`]; offsets, lengths and
//! payload bytes are owned by the backend. Synchronisation is per upload id and
//! lives here, not in the handlers.

use crate::models::{
    checksum::{Checksum, ChecksumVerifier},
    upload::{NewUpload, Upload},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream::BoxStream};
use serde::Serialize;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Body bytes as they arrive from the client.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("upload `{0}` not found")]
    NotFound(String),
    #[error("upload `{id}` is in an invalid state: {reason}")]
    InvalidState { id: String, reason: String },
    #[error("offset mismatch: client sent {expected}, stored offset is {actual}")]
    OffsetMismatch { expected: u64, actual: u64 },
    #[error("upload `{0}` already has a write in progress")]
    ConcurrentWrite(String),
    #[error("write would exceed the declared upload length of {length} bytes")]
    SizeExceeded { length: u64 },
    #[error("checksum of the uploaded chunk does not match")]
    ChecksumMismatch,
    #[error("request body interrupted at offset {offset}: {source}")]
    BodyInterrupted {
        offset: u64,
        #[source]
        source: io::Error,
    },
    #[error("could not allocate upload: {0}")]
    Allocation(String),
    #[error("stored record for `{id}` is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of one readiness probe.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub name: &'static str,
    pub ok: bool,
    pub error: Option<String>,
}

impl HealthCheck {
    pub fn passed(name: &'static str) -> Self {
        Self {
            name,
            ok: true,
            error: None,
        }
    }

    pub fn failed(name: &'static str, error: impl Into<String>) -> Self {
        Self {
            name,
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// Capability interface for upload storage.
///
/// Contract shared by all backends:
/// - `append` admits one writer per id; a second concurrent call fails with
///   [`StoreError::ConcurrentWrite`] instead of waiting.
/// - The stored offset never runs ahead of durably written bytes. When an
///   append fails part way, the offset covers exactly the prefix that was
///   persisted (or nothing, when a checksum was supplied).
/// - `remove` is idempotent.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Allocate a new upload at offset zero.
    async fn create(&self, new_upload: NewUpload) -> StoreResult<Upload>;

    /// Current record for `id`, including its durable offset.
    async fn get_offset(&self, id: &str) -> StoreResult<Upload>;

    /// Fix the length of a deferred upload. Only valid once.
    async fn declare_length(&self, id: &str, length: u64) -> StoreResult<Upload>;

    /// Append `body` at `expected_offset` and return the new offset.
    async fn append(
        &self,
        id: &str,
        expected_offset: u64,
        body: ByteStream,
        checksum: Option<Checksum>,
    ) -> StoreResult<u64>;

    /// Delete payload and record. Unknown ids are not an error.
    async fn remove(&self, id: &str) -> StoreResult<()>;

    /// Stream the bytes stored so far.
    async fn read(&self, id: &str) -> StoreResult<(Upload, ByteStream)>;

    /// Remove incomplete uploads created before `cutoff`; returns how many.
    async fn remove_expired(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;

    async fn health_checks(&self) -> Vec<HealthCheck> {
        vec![HealthCheck::passed("store")]
    }
}

/// Why a body copy stopped early.
#[derive(Debug)]
pub(crate) enum CopyFailure {
    /// The next chunk would have crossed the limit; it was not written.
    Overflow,
    /// The client stream failed (usually a disconnect).
    Body(io::Error),
    /// Writing to the sink failed.
    Sink(io::Error),
}

#[derive(Debug)]
pub(crate) struct BodyCopy {
    /// Bytes handed to the sink successfully.
    pub written: u64,
    pub failure: Option<CopyFailure>,
    /// `Some(false)` when a checksum was requested and did not match.
    pub checksum_ok: Option<bool>,
}

impl BodyCopy {
    /// Whether the written bytes may be committed.
    pub fn keep_written(&self) -> bool {
        match self.checksum_ok {
            // A verified append is all-or-nothing.
            Some(ok) => ok && self.failure.is_none(),
            None => true,
        }
    }
}

/// Pull chunks from `body` into `sink` until the stream ends, a chunk would pass
/// `limit`, or an error occurs. One chunk is in memory at a time.
///
/// A chunk that would cross `limit` is dropped whole, including any part of it
/// that would still have fit. Backends must not expect the copy to fill up to
/// `limit`.
pub(crate) async fn copy_body<W>(
    body: &mut ByteStream,
    sink: &mut W,
    limit: u64,
    checksum: Option<Checksum>,
) -> BodyCopy
where
    W: AsyncWrite + Unpin,
{
    let mut verifier = checksum.map(ChecksumVerifier::new);
    let mut written: u64 = 0;
    let mut failure = None;

    while let Some(chunk_res) = body.next().await {
        let chunk = match chunk_res {
            Ok(chunk) => chunk,
            Err(err) => {
                failure = Some(CopyFailure::Body(err));
                break;
            }
        };
        if chunk.is_empty() {
            continue;
        }
        if written + chunk.len() as u64 > limit {
            failure = Some(CopyFailure::Overflow);
            break;
        }
        if let Err(err) = sink.write_all(&chunk).await {
            failure = Some(CopyFailure::Sink(err));
            break;
        }
        if let Some(verifier) = verifier.as_mut() {
            verifier.update(&chunk);
        }
        written += chunk.len() as u64;
    }

    BodyCopy {
        written,
        failure,
        checksum_ok: verifier.map(ChecksumVerifier::matches),
    }
}

/// Translate a copy outcome into the append result once the kept bytes are
/// committed at `committed_offset`.
pub(crate) fn finish_append(
    upload: &Upload,
    copy: BodyCopy,
    committed_offset: u64,
) -> StoreResult<u64> {
    match copy.failure {
        Some(CopyFailure::Overflow) => match upload.length {
            Some(length) => Err(StoreError::SizeExceeded { length }),
            None => Err(StoreError::InvalidState {
                id: upload.id.clone(),
                reason: "upload length must be declared before appending bytes".into(),
            }),
        },
        Some(CopyFailure::Body(source)) => Err(StoreError::BodyInterrupted {
            offset: committed_offset,
            source,
        }),
        Some(CopyFailure::Sink(err)) => Err(StoreError::Io(err)),
        None if copy.checksum_ok == Some(false) => Err(StoreError::ChecksumMismatch),
        None => Ok(committed_offset),
    }
}

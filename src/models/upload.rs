//! Represents a single resumable upload and its derived lifecycle state.

use crate::models::metadata::Metadata;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// Persisted state of one upload.
///
/// The `Upload` carries bookkeeping only; the payload bytes live in the store.
/// Completion is never stored, it is derived from `offset` and `length`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    /// Opaque identifier used as the final path segment of the resource.
    pub id: String,

    /// Total length declared by the client, `None` while deferred.
    pub length: Option<u64>,

    /// Whether the upload was created with `Upload-Defer-Length: 1`.
    pub defer_length: bool,

    /// Number of bytes durably stored so far.
    pub offset: u64,

    /// Client metadata, immutable after creation.
    pub metadata: Metadata,

    /// When the upload was created.
    pub created_at: DateTime<Utc>,
}

/// Parameters for a new upload.
#[derive(Debug, Clone, Default)]
pub struct NewUpload {
    /// Declared length; `None` defers it to a later PATCH.
    pub length: Option<u64>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Created,
    PartiallyUploaded,
    Completed,
}

impl Upload {
    /// Build a fresh record at offset zero with a newly generated id.
    pub fn new(new_upload: NewUpload) -> Self {
        Self {
            id: generate_id(),
            defer_length: new_upload.length.is_none(),
            length: new_upload.length,
            offset: 0,
            metadata: new_upload.metadata,
            created_at: Utc::now(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.length == Some(self.offset)
    }

    /// Bytes still accepted before the declared length is reached.
    pub fn remaining(&self) -> Option<u64> {
        self.length.map(|len| len.saturating_sub(self.offset))
    }

    pub fn state(&self) -> UploadState {
        if self.is_complete() {
            UploadState::Completed
        } else if self.offset == 0 {
            UploadState::Created
        } else {
            UploadState::PartiallyUploaded
        }
    }

    /// Expiry instant for an incomplete upload under the given retention period.
    pub fn expires_at(&self, retention: Duration) -> Option<DateTime<Utc>> {
        if self.is_complete() {
            None
        } else {
            Some(self.created_at + retention)
        }
    }

    pub fn is_expired(&self, retention: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at(retention).is_some_and(|at| at <= now)
    }
}

/// 32 lowercase hex characters.
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Ids are generated by [`generate_id`], but anything addressing a resource
/// arrives from a URL. Only short ASCII alphanumeric (plus `-`/`_`) ids are
/// considered well-formed.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

//! In-memory upload backend.
//!
//! Keeps records and payloads in a `HashMap` behind an async `RwLock`. Nothing
//! survives a restart; useful for tests and throwaway deployments.

use crate::{
    models::{
        checksum::Checksum,
        upload::{NewUpload, Upload},
    },
    services::{
        locks::UploadLocks,
        store::{ByteStream, DataStore, StoreError, StoreResult, copy_body, finish_append},
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use std::{collections::HashMap, io, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, info};

struct StoredUpload {
    upload: Upload,
    data: Vec<u8>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    uploads: Arc<RwLock<HashMap<String, StoredUpload>>>,
    locks: UploadLocks,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.uploads.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.uploads.read().await.is_empty()
    }

    /// Whether an append currently holds the write lock for `id`.
    pub fn is_writing(&self, id: &str) -> bool {
        self.locks.is_locked(id)
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn create(&self, new_upload: NewUpload) -> StoreResult<Upload> {
        let upload = Upload::new(new_upload);
        let mut uploads = self.uploads.write().await;
        if uploads.contains_key(&upload.id) {
            return Err(StoreError::Allocation(format!(
                "upload id `{}` already in use",
                upload.id
            )));
        }
        uploads.insert(
            upload.id.clone(),
            StoredUpload {
                upload: upload.clone(),
                data: Vec::new(),
            },
        );

        info!(upload_id = %upload.id, length = ?upload.length, "Created upload");
        Ok(upload)
    }

    async fn get_offset(&self, id: &str) -> StoreResult<Upload> {
        let uploads = self.uploads.read().await;
        uploads
            .get(id)
            .map(|stored| stored.upload.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn declare_length(&self, id: &str, length: u64) -> StoreResult<Upload> {
        let mut uploads = self.uploads.write().await;
        let stored = uploads
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let upload = &mut stored.upload;

        let reason = if !upload.defer_length {
            Some("length was not deferred at creation".to_string())
        } else if upload.length.is_some() {
            Some("length has already been declared".to_string())
        } else if length < upload.offset {
            Some(format!(
                "length {} is below the current offset {}",
                length, upload.offset
            ))
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(StoreError::InvalidState {
                id: id.to_string(),
                reason,
            });
        }

        upload.length = Some(length);
        info!(upload_id = %id, length, "Declared deferred upload length");
        Ok(upload.clone())
    }

    async fn append(
        &self,
        id: &str,
        expected_offset: u64,
        mut body: ByteStream,
        checksum: Option<Checksum>,
    ) -> StoreResult<u64> {
        let _guard = self
            .locks
            .try_acquire(id)
            .ok_or_else(|| StoreError::ConcurrentWrite(id.to_string()))?;

        let upload = self.get_offset(id).await?;
        if upload.offset != expected_offset {
            return Err(StoreError::OffsetMismatch {
                expected: expected_offset,
                actual: upload.offset,
            });
        }

        // Stream into a private buffer; the map is only locked to commit.
        let mut buffer = Vec::new();
        let limit = upload.remaining().unwrap_or(0);
        let copy = copy_body(&mut body, &mut buffer, limit, checksum).await;

        let kept = if copy.keep_written() {
            copy.written
        } else {
            0
        };
        let new_offset = expected_offset + kept;
        if kept > 0 {
            let mut uploads = self.uploads.write().await;
            let stored = uploads
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            stored.data.truncate(expected_offset as usize);
            stored.data.extend_from_slice(&buffer);
            stored.upload.offset = new_offset;
        }

        debug!(upload_id = %id, kept, offset = new_offset, "Appended to upload");
        finish_append(&upload, copy, new_offset)
    }

    async fn remove(&self, id: &str) -> StoreResult<()> {
        if self.uploads.write().await.remove(id).is_some() {
            info!(upload_id = %id, "Removed upload");
        }
        Ok(())
    }

    async fn read(&self, id: &str) -> StoreResult<(Upload, ByteStream)> {
        let uploads = self.uploads.read().await;
        let stored = uploads
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let data = Bytes::copy_from_slice(&stored.data);
        let body = stream::once(async move { Ok::<_, io::Error>(data) }).boxed();
        Ok((stored.upload.clone(), body))
    }

    async fn remove_expired(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut uploads = self.uploads.write().await;
        let before = uploads.len();
        uploads.retain(|id, stored| {
            stored.upload.is_complete()
                || stored.upload.created_at >= cutoff
                || self.locks.is_locked(id)
        });
        Ok(before - uploads.len())
    }
}

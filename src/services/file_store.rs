//! src/services/file_store.rs
//!
//! FileStore is the reference upload backend. Payload bytes go to one raw file
//! per upload on local disk, sharded beneath `base_path/{shard}/{shard}/{id}`.
//! Offset, length and metadata live in a SQLite "configstore" which is the only
//! source of truth for them; payload files are never parsed.

use crate::{
    models::{
        checksum::Checksum,
        metadata::Metadata,
        upload::{NewUpload, Upload, is_valid_id},
    },
    services::{
        locks::UploadLocks,
        store::{
            ByteStream, DataStore, HealthCheck, StoreError, StoreResult, copy_body, finish_append,
        },
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::{
    FromRow, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Open the configstore at `database_url`, creating the file if needed, and
/// apply the schema.
pub async fn connect_configstore(database_url: &str) -> StoreResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).await?;
            info!("Created configstore directory {:?}", parent);
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    apply_schema(&pool).await?;
    Ok(pool)
}

/// Run the embedded schema statements. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> StoreResult<()> {
    let statements = schema_statements(SCHEMA);

    debug!("Applying {} configstore schema statements", statements.len());
    for stmt in statements {
        sqlx::query(&stmt).execute(pool).await?;
    }
    Ok(())
}

/// Split a SQL script into statements. `--` comment lines are dropped first so
/// punctuation inside them never splits a statement.
fn schema_statements(script: &str) -> Vec<String> {
    script
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n")
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(FromRow)]
struct UploadRow {
    id: String,
    upload_length: Option<i64>,
    defer_length: bool,
    upload_offset: i64,
    metadata: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<UploadRow> for Upload {
    type Error = StoreError;

    fn try_from(row: UploadRow) -> StoreResult<Self> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: row.id.clone(),
            reason,
        };
        let length = row
            .upload_length
            .map(u64::try_from)
            .transpose()
            .map_err(|_| corrupt("negative upload length".into()))?;
        let offset =
            u64::try_from(row.upload_offset).map_err(|_| corrupt("negative offset".into()))?;
        let metadata = Metadata::parse(&row.metadata).map_err(|err| corrupt(err.to_string()))?;

        Ok(Upload {
            id: row.id,
            length,
            defer_length: row.defer_length,
            offset,
            metadata,
            created_at: row.created_at,
        })
    }
}

/// FileStore provides the upload operations on local disk + SQLite:
/// - create (allocates an empty payload file and inserts the record)
/// - get_offset / declare_length (configstore reads and guarded updates)
/// - append (streams into the payload file, then advances the offset)
/// - remove (deletes record and payload, prunes empty shard directories)
#[derive(Clone)]
pub struct FileStore {
    /// Shared SQLite connection pool used as the configstore.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where payload files are stored.
    pub base_path: PathBuf,

    locks: UploadLocks,
}

impl FileStore {
    /// Create a FileStore backed by the provided configstore pool and using
    /// `base_path` as the root directory for payload files.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            locks: UploadLocks::new(),
        }
    }

    /// Close the configstore pool. Further operations fail.
    pub async fn close(&self) {
        self.db.close().await;
    }

    /// Reject ids that could not have been generated by this store.
    fn ensure_id_safe(&self, id: &str) -> StoreResult<()> {
        if is_valid_id(id) {
            Ok(())
        } else {
            Err(StoreError::NotFound(id.to_string()))
        }
    }

    /// Two-level shard directories from MD5(id), as lowercase hex (00–ff).
    fn upload_shards(id: &str) -> (String, String) {
        let digest = md5::compute(id);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// `base_path/{shard}/{shard}/{id}`. Parent directories may not exist yet.
    pub fn upload_path(&self, id: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::upload_shards(id);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(id);
        path
    }

    async fn fetch_upload(&self, id: &str) -> StoreResult<Upload> {
        let row = sqlx::query_as::<_, UploadRow>(
            "SELECT id, upload_length, defer_length, upload_offset, metadata, created_at
             FROM uploads WHERE id = ?",
        )
        .bind(id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::NotFound(id.to_string()),
            other => StoreError::Sqlx(other),
        })?;
        Upload::try_from(row)
    }

    /// Compare-and-set the durable offset.
    async fn commit_offset(&self, id: &str, from: u64, to: u64) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE uploads SET upload_offset = ? WHERE id = ? AND upload_offset = ?",
        )
        .bind(to as i64)
        .bind(id)
        .bind(from as i64)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            // Removed while we were writing.
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Open the payload file positioned at `offset`, dropping any bytes past it
    /// left behind by an earlier write whose offset was never committed.
    async fn open_at(&self, id: &str, offset: u64) -> StoreResult<File> {
        let path = self.upload_path(id);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    StoreError::NotFound(id.to_string())
                } else {
                    StoreError::Io(err)
                }
            })?;
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(file)
    }

    /// Recursively remove empty directories up to the store root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    async fn disk_check(&self) -> HealthCheck {
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        let result = match fs::write(&tmp_path, b"readyz").await {
            Ok(_) => match fs::read(&tmp_path).await {
                Ok(bytes) if bytes == b"readyz" => HealthCheck::passed("disk"),
                Ok(_) => HealthCheck::failed("disk", "file content mismatch"),
                Err(e) => HealthCheck::failed("disk", format!("could not read tmp file: {}", e)),
            },
            Err(e) => return HealthCheck::failed("disk", format!("could not write tmp file: {}", e)),
        };
        // best-effort cleanup
        let _ = fs::remove_file(&tmp_path).await;
        result
    }
}

#[async_trait]
impl DataStore for FileStore {
    async fn create(&self, new_upload: NewUpload) -> StoreResult<Upload> {
        let upload = Upload::new(new_upload);
        let file_path = self.upload_path(&upload.id);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Allocation("upload path missing parent directory".into())
        })?;
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| StoreError::Allocation(format!("creating {}: {}", parent.display(), err)))?;

        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&file_path)
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::AlreadyExists => {
                    StoreError::Allocation(format!("upload id `{}` already in use", upload.id))
                }
                _ => StoreError::Allocation(format!("creating {}: {}", file_path.display(), err)),
            })?;

        let insert_result = sqlx::query(
            "INSERT INTO uploads (id, upload_length, defer_length, upload_offset, metadata, created_at)
             VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(&upload.id)
        .bind(upload.length.map(|len| len as i64))
        .bind(upload.defer_length)
        .bind(upload.metadata.encode())
        .bind(upload.created_at)
        .execute(&*self.db)
        .await;

        match insert_result {
            Ok(_) => {
                info!(
                    upload_id = %upload.id,
                    length = ?upload.length,
                    "Created upload"
                );
                Ok(upload)
            }
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                if is_unique_violation(&err) {
                    Err(StoreError::Allocation(format!(
                        "upload id `{}` already in use",
                        upload.id
                    )))
                } else {
                    Err(StoreError::Sqlx(err))
                }
            }
        }
    }

    async fn get_offset(&self, id: &str) -> StoreResult<Upload> {
        self.ensure_id_safe(id)?;
        self.fetch_upload(id).await
    }

    async fn declare_length(&self, id: &str, length: u64) -> StoreResult<Upload> {
        self.ensure_id_safe(id)?;
        let result = sqlx::query(
            "UPDATE uploads SET upload_length = ?
             WHERE id = ? AND defer_length = 1 AND upload_length IS NULL AND upload_offset <= ?",
        )
        .bind(length as i64)
        .bind(id)
        .bind(length as i64)
        .execute(&*self.db)
        .await?;

        let upload = self.fetch_upload(id).await?;
        if result.rows_affected() == 0 {
            let reason = if !upload.defer_length {
                "length was not deferred at creation".to_string()
            } else if upload.length.is_some() {
                "length has already been declared".to_string()
            } else {
                format!("length {} is below the current offset {}", length, upload.offset)
            };
            return Err(StoreError::InvalidState {
                id: id.to_string(),
                reason,
            });
        }

        info!(upload_id = %id, length, "Declared deferred upload length");
        Ok(upload)
    }

    async fn append(
        &self,
        id: &str,
        expected_offset: u64,
        mut body: ByteStream,
        checksum: Option<Checksum>,
    ) -> StoreResult<u64> {
        self.ensure_id_safe(id)?;
        let _guard = self
            .locks
            .try_acquire(id)
            .ok_or_else(|| StoreError::ConcurrentWrite(id.to_string()))?;

        let upload = self.fetch_upload(id).await?;
        if upload.offset != expected_offset {
            return Err(StoreError::OffsetMismatch {
                expected: expected_offset,
                actual: upload.offset,
            });
        }

        let mut file = self.open_at(id, expected_offset).await?;
        let limit = upload.remaining().unwrap_or(0);
        let copy = copy_body(&mut body, &mut file, limit, checksum).await;

        file.flush().await?;
        let kept = if copy.keep_written() {
            copy.written
        } else {
            file.set_len(expected_offset).await?;
            0
        };
        file.sync_all().await?;

        let new_offset = expected_offset + kept;
        if kept > 0 {
            self.commit_offset(id, expected_offset, new_offset).await?;
        }

        debug!(
            upload_id = %id,
            written = copy.written,
            kept,
            offset = new_offset,
            "Appended to upload"
        );
        if let Some(failure) = &copy.failure {
            warn!(upload_id = %id, offset = new_offset, ?failure, "Append stopped early");
        }

        finish_append(&upload, copy, new_offset)
    }

    async fn remove(&self, id: &str) -> StoreResult<()> {
        if !is_valid_id(id) {
            return Ok(());
        }

        let result = sqlx::query("DELETE FROM uploads WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;

        let file_path = self.upload_path(id);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed payload file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("payload file {} already missing", file_path.display());
            }
            Err(err) => return Err(StoreError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.base_path).await;
        }

        if result.rows_affected() > 0 {
            info!(upload_id = %id, "Removed upload");
        }
        Ok(())
    }

    async fn read(&self, id: &str) -> StoreResult<(Upload, ByteStream)> {
        self.ensure_id_safe(id)?;
        let upload = self.fetch_upload(id).await?;

        let file = File::open(self.upload_path(id)).await.map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound(id.to_string())
            } else {
                StoreError::Io(err)
            }
        })?;
        // Bytes past the committed offset are not part of the upload.
        let stream = ReaderStream::new(file.take(upload.offset)).boxed();

        Ok((upload, stream))
    }

    async fn remove_expired(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM uploads
             WHERE created_at < ?
               AND (upload_length IS NULL OR upload_offset < upload_length)",
        )
        .bind(cutoff)
        .fetch_all(&*self.db)
        .await?;

        let mut removed = 0;
        for id in ids {
            if self.locks.is_locked(&id) {
                debug!(upload_id = %id, "Skipping expired upload with a write in flight");
                continue;
            }
            self.remove(&id).await?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn health_checks(&self) -> Vec<HealthCheck> {
        let sqlite = match sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await
        {
            Ok(1) => HealthCheck::passed("sqlite"),
            Ok(v) => HealthCheck::failed("sqlite", format!("unexpected result: {}", v)),
            Err(e) => HealthCheck::failed("sqlite", format!("error: {}", e)),
        };
        vec![sqlite, self.disk_check().await]
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

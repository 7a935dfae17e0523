//! Listing record persistence + immutable completion archive for flattrack.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use flattrack_core::{AttributeMapping, NewRecord, PersistedRecord};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "flattrack-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Persistence gateway for listing records.
///
/// Every call is durable on return; nothing is buffered across calls.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert all records in one committed unit and return how many were written.
    async fn append(&self, records: &[NewRecord]) -> Result<u64, StoreError>;

    /// Look up the record whose raw text matches exactly. Lowest id wins on duplicates.
    async fn find_by_text(&self, text: &str) -> Result<Option<PersistedRecord>, StoreError>;

    /// Returns the affected row count, 0 when `id` does not exist.
    async fn update_timestamp(&self, id: i64, timestamp: NaiveDateTime) -> Result<u64, StoreError>;

    async fn update_attributes(
        &self,
        id: i64,
        attributes: &AttributeMapping,
    ) -> Result<u64, StoreError>;

    /// All records, newest timestamp first with undated records last.
    async fn list_all(&self) -> Result<Vec<PersistedRecord>, StoreError>;
}

const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS listing_records (
    id          BIGSERIAL PRIMARY KEY,
    raw_text    TEXT      NOT NULL,
    text_hash   TEXT      NOT NULL,
    posted_at   TIMESTAMP NULL,
    author      TEXT      NOT NULL DEFAULT '',
    attributes  JSONB     NOT NULL DEFAULT '{}'::jsonb
)
"#;

const CREATE_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS listing_records_text_hash_idx ON listing_records (text_hash)";

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the records table and lookup index when missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE_SQL).execute(&self.pool).await?;
        sqlx::query(CREATE_INDEX_SQL).execute(&self.pool).await?;
        info!("listing_records table ready");
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> Result<PersistedRecord, sqlx::Error> {
    let attributes: Json<AttributeMapping> = row.try_get("attributes")?;
    Ok(PersistedRecord {
        id: row.try_get("id")?,
        raw_text: row.try_get("raw_text")?,
        timestamp: row.try_get("posted_at")?,
        author: row.try_get("author")?,
        attributes: attributes.0,
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[instrument(skip(self, records), fields(records = records.len()))]
    async fn append(&self, records: &[NewRecord]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for record in records {
            let result = sqlx::query(
                r#"
                INSERT INTO listing_records (raw_text, text_hash, posted_at, author, attributes)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&record.raw_text)
            .bind(sha256_hex(record.raw_text.as_bytes()))
            .bind(record.timestamp)
            .bind(&record.author)
            .bind(Json(&record.attributes))
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        info!(inserted, "stored listing records");
        Ok(inserted)
    }

    #[instrument(skip(self, text))]
    async fn find_by_text(&self, text: &str) -> Result<Option<PersistedRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, raw_text, posted_at, author, attributes
              FROM listing_records
             WHERE text_hash = $1
               AND raw_text = $2
             ORDER BY id
             LIMIT 1
            "#,
        )
        .bind(sha256_hex(text.as_bytes()))
        .bind(text)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    #[instrument(skip(self))]
    async fn update_timestamp(&self, id: i64, timestamp: NaiveDateTime) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE listing_records SET posted_at = $1 WHERE id = $2")
            .bind(timestamp)
            .bind(id)
            .execute(&self.pool)
            .await?;
        debug!(rows = result.rows_affected(), "updated record timestamp");
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, attributes))]
    async fn update_attributes(
        &self,
        id: i64,
        attributes: &AttributeMapping,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE listing_records SET attributes = $1 WHERE id = $2")
            .bind(Json(attributes))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn list_all(&self) -> Result<Vec<PersistedRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, raw_text, posted_at, author, attributes
              FROM listing_records
             ORDER BY posted_at DESC NULLS LAST, id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(record_from_row(row)?);
        }
        Ok(out)
    }
}

/// Process-local store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    records: Vec<PersistedRecord>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<PersistedRecord> {
        self.state.lock().await.records.clone()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn append(&self, records: &[NewRecord]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        for record in records {
            state.next_id += 1;
            let id = state.next_id;
            state.records.push(PersistedRecord::from_new(id, record.clone()));
        }
        Ok(records.len() as u64)
    }

    async fn find_by_text(&self, text: &str) -> Result<Option<PersistedRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .iter()
            .filter(|r| r.raw_text == text)
            .min_by_key(|r| r.id)
            .cloned())
    }

    async fn update_timestamp(&self, id: i64, timestamp: NaiveDateTime) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        match state.records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.timestamp = Some(timestamp);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn update_attributes(
        &self,
        id: i64,
        attributes: &AttributeMapping,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        match state.records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.attributes = attributes.clone();
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn list_all(&self) -> Result<Vec<PersistedRecord>, StoreError> {
        let mut records = self.state.lock().await.records.clone();
        // None sorts below Some, so a descending sort leaves undated records last.
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        Ok(records)
    }
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive for raw model completions.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_relative_path(
        &self,
        captured_at: DateTime<Utc>,
        scope: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = captured_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(scope)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Archive the raw completion the model returned for one message.
    pub async fn store_completion(
        &self,
        captured_at: DateTime<Utc>,
        message_id: i64,
        completion: &str,
    ) -> anyhow::Result<StoredArtifact> {
        self.store_bytes(captured_at, &message_id.to_string(), "txt", completion.as_bytes())
            .await
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    pub async fn store_bytes(
        &self,
        captured_at: DateTime<Utc>,
        scope: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(captured_at, scope, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .with_context(|| format!("artifact path {} has no parent", absolute_path.display()))?
            .to_path_buf();

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let artifact = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(artifact(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(artifact(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(artifact(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

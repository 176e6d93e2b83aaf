//! Persistence gateway for resume tokens
//!
//! The engine only talks to [`PersistenceGateway`]. [`SqliteStore`] keeps
//! downloads and segments in a relational database with transactional
//! upserts; [`MemoryStore`] keeps tokens in process.

use crate::error::PersistError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fluxdm_types::{DownloadId, ResumeToken, Segment, RESUME_TOKEN_VERSION, UNKNOWN_END};
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Durable storage of resume tokens
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn save(&self, id: DownloadId, token: &ResumeToken) -> Result<(), PersistError>;

    async fn load(&self, id: DownloadId) -> Result<Option<ResumeToken>, PersistError>;

    /// Ids of every stored token
    async fn list(&self) -> Result<Vec<DownloadId>, PersistError>;

    async fn delete(&self, id: DownloadId) -> Result<(), PersistError>;
}

/// Reject tokens whose segments do not partition the resource
pub fn validate_token(token: &ResumeToken) -> Result<(), PersistError> {
    if token.version > RESUME_TOKEN_VERSION {
        return Err(PersistError::Corrupt(format!(
            "unsupported token version {}",
            token.version
        )));
    }

    // Not planned yet
    if token.segments.is_empty() {
        return Ok(());
    }

    let mut expected_start = 0u64;
    for (i, segment) in token.segments.iter().enumerate() {
        if segment.index as usize != i {
            return Err(PersistError::Corrupt(format!(
                "segment {} stored at position {}",
                segment.index, i
            )));
        }
        if segment.start != expected_start || segment.end < segment.start {
            return Err(PersistError::Corrupt(format!(
                "segment {} range {}-{} leaves a gap or overlap",
                segment.index, segment.start, segment.end
            )));
        }
        if !segment.is_unknown_size() && segment.bytes_written > segment.size() {
            return Err(PersistError::Corrupt(format!(
                "segment {} claims {} bytes of {}",
                segment.index,
                segment.bytes_written,
                segment.size()
            )));
        }
        expected_start = segment.end.saturating_add(1);
    }

    let last_end = token.segments.last().map(|s| s.end).unwrap_or(UNKNOWN_END);
    let covers = match token.total_size {
        Some(total) => last_end.checked_add(1) == Some(total),
        None => token.segments.len() == 1 && last_end == UNKNOWN_END,
    };
    if !covers {
        return Err(PersistError::Corrupt(format!(
            "segments end at {} for size {:?}",
            last_end, token.total_size
        )));
    }

    Ok(())
}

// ============================================================================
// In-memory store
// ============================================================================

/// Process-local store, for tests and ephemeral engines
#[derive(Debug, Default)]
pub struct MemoryStore {
    tokens: Mutex<HashMap<DownloadId, ResumeToken>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryStore {
    async fn save(&self, id: DownloadId, token: &ResumeToken) -> Result<(), PersistError> {
        self.tokens.lock().insert(id, token.clone());
        Ok(())
    }

    async fn load(&self, id: DownloadId) -> Result<Option<ResumeToken>, PersistError> {
        let token = self.tokens.lock().get(&id).cloned();
        if let Some(token) = &token {
            validate_token(token)?;
        }
        Ok(token)
    }

    async fn list(&self) -> Result<Vec<DownloadId>, PersistError> {
        Ok(self.tokens.lock().keys().copied().collect())
    }

    async fn delete(&self, id: DownloadId) -> Result<(), PersistError> {
        self.tokens.lock().remove(&id);
        Ok(())
    }
}

// ============================================================================
// SQLite store
// ============================================================================

/// Database connection pool for token persistence
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path`
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, PersistError> {
        let path = db_path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
                id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                url TEXT NOT NULL,
                destination TEXT NOT NULL,
                total_size INTEGER,
                supports_ranges INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL,
                options TEXT NOT NULL,
                failure_reasons TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS segments (
                download_id TEXT NOT NULL,
                segment_index INTEGER NOT NULL,
                start_byte INTEGER NOT NULL,
                end_byte INTEGER NOT NULL,
                bytes_written INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                PRIMARY KEY (download_id, segment_index),
                FOREIGN KEY (download_id) REFERENCES downloads(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_downloads_state ON downloads(state);
            CREATE INDEX IF NOT EXISTS idx_segments_download ON segments(download_id);
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Load segments for a download
    async fn load_segments(&self, id: DownloadId) -> Result<Vec<Segment>, PersistError> {
        let rows = sqlx::query("SELECT * FROM segments WHERE download_id = ? ORDER BY segment_index")
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_segment).collect()
    }
}

#[async_trait]
impl PersistenceGateway for SqliteStore {
    async fn save(&self, id: DownloadId, token: &ResumeToken) -> Result<(), PersistError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO downloads (
                id, version, url, destination, total_size, supports_ranges,
                state, options, failure_reasons, created_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                version = excluded.version,
                url = excluded.url,
                destination = excluded.destination,
                total_size = excluded.total_size,
                supports_ranges = excluded.supports_ranges,
                state = excluded.state,
                options = excluded.options,
                failure_reasons = excluded.failure_reasons,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(id.to_string())
        .bind(token.version as i64)
        .bind(&token.url)
        .bind(token.destination.to_string_lossy().to_string())
        .bind(token.total_size.map(|s| s as i64))
        .bind(if token.supports_ranges { 1i64 } else { 0i64 })
        .bind(token.state.to_string())
        .bind(serde_json::to_string(&token.options)?)
        .bind(serde_json::to_string(&token.failure_reasons)?)
        .bind(token.created_at.to_rfc3339())
        .bind(token.completed_at.map(|d| d.to_rfc3339()))
        .execute(&mut *tx)
        .await?;

        // Segments are rewritten as a whole
        sqlx::query("DELETE FROM segments WHERE download_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        for segment in &token.segments {
            sqlx::query(
                r#"
                INSERT INTO segments (
                    download_id, segment_index, start_byte, end_byte,
                    bytes_written, state, retry_count, last_error
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(id.to_string())
            .bind(segment.index as i64)
            .bind(segment.start as i64)
            // UNKNOWN_END round-trips through the i64 bit pattern
            .bind(segment.end as i64)
            .bind(segment.bytes_written as i64)
            .bind(segment.state.to_string())
            .bind(segment.retry_count as i64)
            .bind(segment.last_error.as_ref())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load(&self, id: DownloadId) -> Result<Option<ResumeToken>, PersistError> {
        let row = sqlx::query("SELECT * FROM downloads WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let segments = self.load_segments(id).await?;
        let token = row_to_token(row, segments)?;
        validate_token(&token)?;
        Ok(Some(token))
    }

    async fn list(&self) -> Result<Vec<DownloadId>, PersistError> {
        let rows = sqlx::query("SELECT id FROM downloads ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| parse_uuid(row.get::<String, _>("id").as_str()))
            .collect()
    }

    async fn delete(&self, id: DownloadId) -> Result<(), PersistError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM segments WHERE download_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM downloads WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, PersistError> {
    Uuid::parse_str(s).map_err(|e| PersistError::Corrupt(e.to_string()))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, PersistError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PersistError::Corrupt(e.to_string()))
}

fn row_to_segment(row: SqliteRow) -> Result<Segment, PersistError> {
    Ok(Segment {
        index: row.get::<i64, _>("segment_index") as u32,
        start: row.get::<i64, _>("start_byte") as u64,
        end: row.get::<i64, _>("end_byte") as u64,
        bytes_written: row.get::<i64, _>("bytes_written") as u64,
        state: row
            .get::<String, _>("state")
            .parse()
            .map_err(PersistError::Corrupt)?,
        retry_count: row.get::<i64, _>("retry_count") as u32,
        last_error: row.get("last_error"),
    })
}

/// Convert a database row to a ResumeToken
fn row_to_token(row: SqliteRow, segments: Vec<Segment>) -> Result<ResumeToken, PersistError> {
    Ok(ResumeToken {
        version: row.get::<i64, _>("version") as u32,
        id: parse_uuid(row.get::<String, _>("id").as_str())?,
        url: row.get("url"),
        destination: PathBuf::from(row.get::<String, _>("destination")),
        total_size: row.get::<Option<i64>, _>("total_size").map(|s| s as u64),
        supports_ranges: row.get::<i64, _>("supports_ranges") != 0,
        state: row
            .get::<String, _>("state")
            .parse()
            .map_err(PersistError::Corrupt)?,
        options: serde_json::from_str(row.get::<String, _>("options").as_str())?,
        failure_reasons: serde_json::from_str(row.get::<String, _>("failure_reasons").as_str())?,
        created_at: parse_time(row.get::<String, _>("created_at").as_str())?,
        completed_at: row
            .get::<Option<String>, _>("completed_at")
            .map(|s| parse_time(&s))
            .transpose()?,
        segments,
    })
}

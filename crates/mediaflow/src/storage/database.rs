//! SQLite job store for media items and frame previews
//!
//! The `media` table is the single source of truth for queue order and job status. Every
//! state transition is one guarded `UPDATE`, so two writers racing on the same row cannot
//! both succeed.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rand::Rng;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::settings::RuntimeSettings;
use crate::types::{
    AnalysisResult, Frame, JobError, JobKind, JobStatus, MediaItem, MediaPreviews, MediaType,
    MetadataResult, MetadataStatus, NewSubmission, Source, Submission,
};

/// Length of generated media ids
pub const ID_LENGTH: usize = 11;

const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

const MAX_ID_ATTEMPTS: usize = 8;

/// Columns read into a [`MediaItem`], blobs excluded
const MEDIA_COLUMNS: &str = "id, source, uri, media_type, title, status, metadata_status, \
     submitted_at, started_at, finished_at, error, metadata_error, result, metadata, \
     content_hash, file_created_at, force_raw_stream, processing_secs, \
     thumbnail IS NOT NULL, frames_available, seconds_per_frame";

/// Terminal output written by [`MediaStore::complete`]
#[derive(Debug, Clone)]
pub enum JobOutput {
    /// Analysis result of the processing pipeline
    Processing {
        result: AnalysisResult,
        processing_secs: f64,
    },
    /// Descriptive info gathered by the metadata pipeline
    Metadata(MetadataResult),
}

impl JobOutput {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Processing { .. } => JobKind::Processing,
            Self::Metadata(_) => JobKind::Metadata,
        }
    }
}

/// SQLite-backed media job store
#[derive(Clone)]
pub struct MediaStore {
    conn: Arc<Mutex<Connection>>,
}

impl MediaStore {
    /// Create or open the database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| Error::Internal(format!("Failed to open database: {}", e)))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.migrate()?;
        tracing::info!("Opened media store at {}", path.display());
        Ok(store)
    }

    /// Create an in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Internal(format!("Failed to open in-memory database: {}", e)))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        // journal_mode answers with a row, so it cannot go through execute_batch
        let _mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(|e| Error::Internal(format!("Failed to set journal mode: {}", e)))?;

        conn.execute_batch(
            r#"
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
            PRAGMA temp_store=MEMORY;
        "#,
        )
        .map_err(|e| Error::Internal(format!("Failed to set pragmas: {}", e)))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS media (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                uri TEXT NOT NULL,
                media_type TEXT NOT NULL,
                title TEXT,
                status TEXT NOT NULL,
                metadata_status TEXT NOT NULL,
                submitted_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                error TEXT,
                metadata_error TEXT,
                result TEXT,
                metadata TEXT,
                content_hash TEXT,
                file_created_at TEXT,
                force_raw_stream INTEGER NOT NULL DEFAULT 0,
                processing_secs REAL,
                thumbnail BLOB,
                thumbnail_low_res BLOB,
                frames_available INTEGER NOT NULL DEFAULT 0,
                seconds_per_frame INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_media_status ON media(status, submitted_at);
            CREATE INDEX IF NOT EXISTS idx_media_metadata_status ON media(metadata_status, submitted_at);
            CREATE INDEX IF NOT EXISTS idx_media_uri ON media(source, uri);
            CREATE INDEX IF NOT EXISTS idx_media_content_hash ON media(content_hash);

            CREATE TABLE IF NOT EXISTS frames (
                media_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                image BLOB NOT NULL,
                PRIMARY KEY (media_id, timestamp),
                FOREIGN KEY (media_id) REFERENCES media(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
        "#,
        )
        .map_err(|e| Error::Internal(format!("Failed to run migrations: {}", e)))?;

        tracing::debug!("Media store migrations complete");
        Ok(())
    }

    // ==================== Submission ====================

    /// Insert a new queued item, or return the id of an existing equivalent one
    pub fn submit(&self, submission: NewSubmission) -> Result<Submission> {
        let conn = self.conn.lock();

        let existing = match submission.source {
            Source::Remote => find_remote_id(&conn, &submission.uri)?,
            Source::Local => match &submission.content_hash {
                Some(hash) => conn
                    .query_row(
                        "SELECT id FROM media WHERE source = 'local' AND content_hash = ?1
                         ORDER BY submitted_at DESC LIMIT 1",
                        params![hash],
                        |row| row.get(0),
                    )
                    .optional()?,
                None => None,
            },
        };

        if let Some(id) = existing {
            tracing::debug!("Submission of {} matches existing item {}", submission.uri, id);
            return Ok(Submission { id, created: false });
        }

        let submitted_at = timestamp(Utc::now());
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = generate_short_id();
            let inserted = conn.execute(
                r#"
                INSERT INTO media (
                    id, source, uri, media_type, title, status, metadata_status,
                    submitted_at, content_hash, file_created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, 'queued', 'pending', ?6, ?7, ?8)
                "#,
                params![
                    id,
                    submission.source.as_str(),
                    submission.uri,
                    submission.media_type.as_str(),
                    submission.title,
                    submitted_at,
                    submission.content_hash,
                    submission.file_created_at.map(timestamp),
                ],
            );

            match inserted {
                Ok(_) => return Ok(Submission { id, created: true }),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    tracing::debug!("Generated id {} already taken, regenerating", id);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::Internal(format!(
            "Failed to allocate a unique id after {} attempts",
            MAX_ID_ATTEMPTS
        )))
    }

    // ==================== Claim & Transitions ====================

    /// Oldest item eligible for the given pipeline
    pub fn claim_next(&self, kind: JobKind) -> Result<Option<MediaItem>> {
        let conn = self.conn.lock();

        let filter = match kind {
            JobKind::Processing => "status = 'queued'",
            JobKind::Metadata => "metadata_status = 'pending'",
        };
        let sql = format!(
            "SELECT {} FROM media WHERE {} ORDER BY submitted_at ASC, rowid ASC LIMIT 1",
            MEDIA_COLUMNS, filter
        );

        let item = conn.query_row(&sql, [], row_to_media_item).optional()?;
        Ok(item)
    }

    /// Move a queued item to `processing`. Returns false when it was not queued.
    pub fn mark_processing(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();

        let count = conn.execute(
            "UPDATE media SET status = 'processing', started_at = ?2
             WHERE id = ?1 AND status = 'queued'",
            params![id, timestamp(Utc::now())],
        )?;

        Ok(count > 0)
    }

    /// Write a successful terminal state. Returns false when the item is not in flight.
    pub fn complete(&self, id: &str, output: &JobOutput) -> Result<bool> {
        let conn = self.conn.lock();

        let count = match output {
            JobOutput::Processing {
                result,
                processing_secs,
            } => conn.execute(
                "UPDATE media SET status = 'success', result = ?2, processing_secs = ?3,
                     error = NULL, finished_at = ?4
                 WHERE id = ?1 AND status IN ('processing', 'success')",
                params![
                    id,
                    serde_json::to_string(result)?,
                    processing_secs,
                    timestamp(Utc::now())
                ],
            )?,
            JobOutput::Metadata(metadata) => conn.execute(
                "UPDATE media SET metadata_status = 'success', metadata = ?2,
                     metadata_error = NULL, title = COALESCE(?3, title)
                 WHERE id = ?1 AND metadata_status IN ('pending', 'success')",
                params![id, serde_json::to_string(metadata)?, metadata.title],
            )?,
        };

        Ok(count > 0)
    }

    /// Write a failed terminal state. Returns false when the item is not in flight.
    pub fn fail(&self, kind: JobKind, id: &str, error: &JobError) -> Result<bool> {
        let conn = self.conn.lock();
        let error_json = serde_json::to_string(error)?;

        let count = match kind {
            JobKind::Processing => conn.execute(
                "UPDATE media SET status = 'failed', error = ?2, result = NULL, finished_at = ?3
                 WHERE id = ?1 AND status IN ('processing', 'failed')",
                params![id, error_json, timestamp(Utc::now())],
            )?,
            JobKind::Metadata => conn.execute(
                "UPDATE media SET metadata_status = 'failed', metadata_error = ?2, metadata = NULL
                 WHERE id = ?1 AND metadata_status IN ('pending', 'failed')",
                params![id, error_json],
            )?,
        };

        Ok(count > 0)
    }

    /// Fail every item left in `processing` by a previous run
    pub fn recover_interrupted(&self) -> Result<usize> {
        let conn = self.conn.lock();

        let count = conn.execute(
            "UPDATE media SET status = 'failed', error = ?1, result = NULL, finished_at = ?2
             WHERE status = 'processing'",
            params![
                serde_json::to_string(&JobError::interrupted())?,
                timestamp(Utc::now())
            ],
        )?;

        if count > 0 {
            tracing::warn!("Marked {} interrupted item(s) as failed", count);
        }
        Ok(count)
    }

    /// Put a terminal item back at the end of the processing queue
    pub fn retry_processing(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();

        let count = conn.execute(
            "UPDATE media SET status = 'queued', submitted_at = ?2, error = NULL, result = NULL,
                 started_at = NULL, finished_at = NULL, processing_secs = NULL
             WHERE id = ?1 AND status IN ('success', 'failed')",
            params![id, timestamp(Utc::now())],
        )?;

        Ok(count > 0)
    }

    /// Reset the metadata pipeline of a finished item
    pub fn refetch_metadata(&self, id: &str, force_raw_stream: bool) -> Result<bool> {
        let conn = self.conn.lock();

        let count = conn.execute(
            "UPDATE media SET metadata_status = 'pending', metadata_error = NULL, metadata = NULL,
                 force_raw_stream = ?2
             WHERE id = ?1 AND metadata_status IN ('success', 'failed')",
            params![id, force_raw_stream],
        )?;

        Ok(count > 0)
    }

    /// Delete items and their frames. Returns the number of items removed.
    pub fn delete(&self, ids: &[String]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut deleted = 0;
        {
            let mut delete_frames = tx.prepare("DELETE FROM frames WHERE media_id = ?1")?;
            let mut delete_media = tx.prepare("DELETE FROM media WHERE id = ?1")?;
            for id in ids {
                delete_frames.execute(params![id])?;
                deleted += delete_media.execute(params![id])?;
            }
        }
        tx.commit()?;

        tracing::info!("Deleted {} media item(s)", deleted);
        Ok(deleted)
    }

    // ==================== Queries ====================

    /// Get one item by id
    pub fn get(&self, id: &str) -> Result<Option<MediaItem>> {
        let conn = self.conn.lock();

        let sql = format!("SELECT {} FROM media WHERE id = ?1", MEDIA_COLUMNS);
        let item = conn
            .query_row(&sql, params![id], row_to_media_item)
            .optional()?;

        Ok(item)
    }

    /// All items grouped by processing status
    pub fn list_previews(&self) -> Result<MediaPreviews> {
        let conn = self.conn.lock();

        let list = |status: JobStatus, order: &str| -> Result<Vec<MediaItem>> {
            let sql = format!(
                "SELECT {} FROM media WHERE status = ?1 ORDER BY {}",
                MEDIA_COLUMNS, order
            );
            let mut stmt = conn.prepare(&sql)?;
            let items = stmt
                .query_map(params![status.as_str()], row_to_media_item)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(items)
        };

        Ok(MediaPreviews {
            processing: list(JobStatus::Processing, "started_at ASC, rowid ASC")?,
            queued: list(JobStatus::Queued, "submitted_at ASC, rowid ASC")?,
            failed: list(JobStatus::Failed, "finished_at DESC, rowid DESC")?,
            success: list(JobStatus::Success, "finished_at DESC, rowid DESC")?,
        })
    }

    /// Id of a non-failed item for the given remote resource
    pub fn find_remote(&self, uri: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        find_remote_id(&conn, uri)
    }

    /// Stored thumbnail bytes
    pub fn thumbnail(&self, id: &str, low_res: bool) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();

        let column = if low_res {
            "thumbnail_low_res"
        } else {
            "thumbnail"
        };
        let sql = format!("SELECT {} FROM media WHERE id = ?1", column);
        let image: Option<Option<Vec<u8>>> = conn
            .query_row(&sql, params![id], |row| row.get(0))
            .optional()?;

        Ok(image.flatten())
    }

    /// One preview frame
    pub fn frame(&self, id: &str, timestamp: u32) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();

        let image = conn
            .query_row(
                "SELECT image FROM frames WHERE media_id = ?1 AND timestamp = ?2",
                params![id, timestamp],
                |row| row.get(0),
            )
            .optional()?;

        Ok(image)
    }

    /// Timestamps of all stored frames, ascending
    pub fn frame_timestamps(&self, id: &str) -> Result<Vec<u32>> {
        let conn = self.conn.lock();

        let mut stmt =
            conn.prepare("SELECT timestamp FROM frames WHERE media_id = ?1 ORDER BY timestamp")?;
        let timestamps = stmt
            .query_map(params![id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<u32>>>()?;

        Ok(timestamps)
    }

    // ==================== Metadata Writers ====================

    /// Store full and low resolution thumbnails
    pub fn store_thumbnails(&self, id: &str, full: &[u8], low_res: &[u8]) -> Result<bool> {
        let conn = self.conn.lock();

        let count = conn.execute(
            "UPDATE media SET thumbnail = ?2, thumbnail_low_res = ?3 WHERE id = ?1",
            params![id, full, low_res],
        )?;

        Ok(count > 0)
    }

    /// Insert a batch of frames. Writes nothing when the item does not exist.
    pub fn insert_frames(&self, id: &str, frames: &[Frame]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM media WHERE id = ?1)",
            params![id],
            |row| row.get(0),
        )?;
        if !exists {
            return Ok(0);
        }

        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO frames (media_id, timestamp, image) VALUES (?1, ?2, ?3)",
            )?;
            for frame in frames {
                inserted += stmt.execute(params![id, frame.timestamp, frame.image])?;
            }
        }
        tx.commit()?;

        Ok(inserted)
    }

    /// Flag frame previews as available
    pub fn set_frames_available(
        &self,
        id: &str,
        available: bool,
        seconds_per_frame: Option<u32>,
    ) -> Result<bool> {
        let conn = self.conn.lock();

        let count = conn.execute(
            "UPDATE media SET frames_available = ?2, seconds_per_frame = ?3 WHERE id = ?1",
            params![id, available, seconds_per_frame],
        )?;

        Ok(count > 0)
    }

    // ==================== Settings ====================

    /// Stored settings laid over `defaults`. Unknown keys are ignored.
    pub fn load_settings(&self, defaults: &RuntimeSettings) -> Result<RuntimeSettings> {
        let conn = self.conn.lock();

        let mut merged = match serde_json::to_value(defaults)? {
            serde_json::Value::Object(map) => map,
            _ => return Err(Error::internal("settings must serialize to an object")),
        };

        let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (key, value) = row?;
            if merged.contains_key(&key) {
                merged.insert(key, serde_json::from_str(&value)?);
            }
        }

        Ok(serde_json::from_value(serde_json::Value::Object(merged))?)
    }

    /// Persist every setting in one transaction
    pub fn save_settings(&self, settings: &RuntimeSettings) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if let serde_json::Value::Object(map) = serde_json::to_value(settings)? {
            let mut stmt = tx.prepare(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )?;
            for (key, value) in map {
                stmt.execute(params![key, value.to_string()])?;
            }
        }
        tx.commit()?;

        Ok(())
    }

    /// Reclaim free pages
    pub fn vacuum(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch("VACUUM")
            .map_err(|e| Error::Internal(format!("Failed to vacuum database: {}", e)))?;
        Ok(())
    }
}

fn find_remote_id(conn: &Connection, uri: &str) -> Result<Option<String>> {
    let id = conn
        .query_row(
            "SELECT id FROM media WHERE source = 'remote' AND uri = ?1 AND status != 'failed'
             ORDER BY submitted_at DESC LIMIT 1",
            params![uri],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Random 11-character id over `[A-Za-z0-9_-]`
pub fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ID_LENGTH)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Fixed-width RFC 3339 text, so that string order equals time order
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("invalid timestamp {}: {}", value, e)))
}

fn parse_json<T: serde::de::DeserializeOwned>(
    idx: usize,
    value: Option<String>,
) -> rusqlite::Result<Option<T>> {
    value
        .map(|json| {
            serde_json::from_str(&json)
                .map_err(|e| conversion_error(idx, format!("invalid json: {}", e)))
        })
        .transpose()
}

fn row_to_media_item(row: &rusqlite::Row) -> rusqlite::Result<MediaItem> {
    let source: String = row.get(1)?;
    let media_type: String = row.get(3)?;
    let status: String = row.get(5)?;
    let metadata_status: String = row.get(6)?;
    let submitted_at: String = row.get(7)?;
    let started_at: Option<String> = row.get(8)?;
    let finished_at: Option<String> = row.get(9)?;
    let file_created_at: Option<String> = row.get(15)?;

    Ok(MediaItem {
        id: row.get(0)?,
        source: Source::parse(&source)
            .ok_or_else(|| conversion_error(1, format!("unknown source {}", source)))?,
        uri: row.get(2)?,
        media_type: MediaType::parse(&media_type)
            .ok_or_else(|| conversion_error(3, format!("unknown media type {}", media_type)))?,
        title: row.get(4)?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| conversion_error(5, format!("unknown status {}", status)))?,
        metadata_status: MetadataStatus::parse(&metadata_status).ok_or_else(|| {
            conversion_error(6, format!("unknown metadata status {}", metadata_status))
        })?,
        submitted_at: parse_timestamp(7, &submitted_at)?,
        started_at: started_at.map(|s| parse_timestamp(8, &s)).transpose()?,
        finished_at: finished_at.map(|s| parse_timestamp(9, &s)).transpose()?,
        error: parse_json(10, row.get(10)?)?,
        metadata_error: parse_json(11, row.get(11)?)?,
        result: parse_json(12, row.get(12)?)?,
        metadata: parse_json(13, row.get(13)?)?,
        content_hash: row.get(14)?,
        file_created_at: file_created_at
            .map(|s| parse_timestamp(15, &s))
            .transpose()?,
        force_raw_stream: row.get(16)?,
        processing_secs: row.get(17)?,
        thumbnail_available: row.get(18)?,
        frames_available: row.get(19)?,
        seconds_per_frame: row.get(20)?,
    })
}

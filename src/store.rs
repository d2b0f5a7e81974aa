//! SQLite-backed durable store.
//!
//! Narrow repository over four tables: `images`, `watched_folders`,
//! `settings`, `audit_log`. Connections are opened per call and every
//! method is its own short transaction; WAL keeps readers and the single
//! ingest writer out of each other's way.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, Row};

use crate::error::{Error, Result};

const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Well-known settings keys.
pub mod keys {
    /// Sealed remote-repository credential.
    pub const HF_TOKEN: &str = "hf_token_encrypted";
    /// Override for the encoder-weights repository.
    pub const HF_REPO: &str = "hf_repo";
    pub const EXIF_ENABLED: &str = "exif_enabled";
    pub const EXIF_VISIBLE: &str = "exif_visible";
    pub const MAP_VISIBLE: &str = "map_visible";
    pub const AUTO_INDEXING: &str = "auto_indexing_enabled";
    /// Default similarity cutoff, float in [0, 1].
    pub const SEARCH_THRESHOLD: &str = "search_threshold";
}

/// Lifecycle status of an image record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Pending,
    Indexed,
    Error,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Indexed => "indexed",
            Self::Error => "error",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "indexed" => Self::Indexed,
            "error" => Self::Error,
            _ => Self::Pending,
        }
    }
}

/// An indexed image row. `id == 0` marks a record not yet saved.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub id: i64,
    pub file_path: String,
    pub thumb_path: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub file_size: i64,
    pub file_hash: Option<String>,
    pub last_modified: Option<NaiveDateTime>,
    pub indexed_at: Option<NaiveDateTime>,
    /// Raw little-endian float32 embedding bytes (D·4).
    pub embedding: Option<Vec<u8>>,
    /// Opaque JSON blob: user tags, parsed camera metadata, `exif_parsed` flag.
    pub extra_json: Option<String>,
    pub status: RecordStatus,
    pub is_favorite: bool,
    pub is_blurred: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl ImageRecord {
    /// Fresh unsaved record for a newly discovered path.
    pub fn new(file_path: String) -> Self {
        Self {
            id: 0,
            file_path,
            thumb_path: None,
            width: None,
            height: None,
            file_size: 0,
            file_hash: None,
            last_modified: None,
            indexed_at: None,
            embedding: None,
            extra_json: None,
            status: RecordStatus::Pending,
            is_favorite: false,
            is_blurred: false,
            latitude: None,
            longitude: None,
        }
    }

    /// True once a metadata pass has stamped `exif_parsed` into the blob.
    pub fn exif_parsed(&self) -> bool {
        self.extra_json
            .as_deref()
            .and_then(|j| serde_json::from_str::<serde_json::Value>(j).ok())
            .and_then(|v| v.get("exif_parsed").and_then(|b| b.as_bool()))
            .unwrap_or(false)
    }
}

/// A watched directory root.
#[derive(Debug, Clone)]
pub struct WatchedFolder {
    pub id: i64,
    pub folder_path: String,
    pub active: bool,
    pub added_at: Option<NaiveDateTime>,
}

/// Outcome of one per-file ingest, recorded in the audit log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestStatus {
    Success,
    Skipped,
    Error(String),
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Error(_) => "error",
        }
    }
}

/// One audit-log line for a processed file.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub file_path: String,
    pub image_id: Option<i64>,
    pub status: IngestStatus,
    pub duration_ms: i64,
}

pub struct Database {
    db_path: PathBuf,
}

impl Database {
    /// Opens (creating if needed) the database and applies the schema.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Self {
            db_path: db_path.to_path_buf(),
        };
        db.initialize()?;
        Ok(db)
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(conn)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS images (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_path TEXT NOT NULL UNIQUE,
                thumb_path TEXT,
                width INTEGER,
                height INTEGER,
                file_size INTEGER NOT NULL DEFAULT 0,
                file_hash TEXT,
                last_modified TEXT,
                indexed_at TEXT,
                embedding BLOB,
                extra_json TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                is_favorite INTEGER NOT NULL DEFAULT 0,
                is_blurred INTEGER NOT NULL DEFAULT 0,
                latitude REAL,
                longitude REAL
            );
            CREATE INDEX IF NOT EXISTS idx_images_hash ON images(file_hash);
            CREATE INDEX IF NOT EXISTS idx_images_modified ON images(last_modified);

            CREATE TABLE IF NOT EXISTS watched_folders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                folder_path TEXT NOT NULL UNIQUE,
                active INTEGER NOT NULL DEFAULT 1,
                added_at TEXT
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_path TEXT NOT NULL,
                image_id INTEGER,
                status TEXT NOT NULL,
                error_message TEXT,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                processed_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ---- images ----

    pub fn find_by_path(&self, file_path: &str) -> Result<Option<ImageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{} WHERE file_path = ?1", SELECT_IMAGE))?;
        let mut rows = stmt.query_map(params![file_path], map_image)?;
        Ok(rows.next().transpose()?)
    }

    pub fn find_by_id(&self, id: i64) -> Result<Option<ImageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_IMAGE))?;
        let mut rows = stmt.query_map(params![id], map_image)?;
        Ok(rows.next().transpose()?)
    }

    pub fn find_by_ids(&self, ids: &[i64]) -> Result<Vec<ImageRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!("{} WHERE id IN ({})", SELECT_IMAGE, placeholders);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), map_image)?;
        collect(rows)
    }

    /// Every (id, embedding bytes) pair with a non-null embedding, for bulk
    /// index loads.
    pub fn find_all_embeddings(&self) -> Result<Vec<(i64, Vec<u8>)>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, embedding FROM images WHERE embedding IS NOT NULL")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        collect(rows)
    }

    /// Inserts or updates a record; returns it with the assigned id.
    pub fn save(&self, mut record: ImageRecord) -> Result<ImageRecord> {
        let conn = self.conn()?;
        if record.id == 0 {
            conn.execute(
                "INSERT INTO images (file_path, thumb_path, width, height, file_size,
                     file_hash, last_modified, indexed_at, embedding, extra_json,
                     status, is_favorite, is_blurred, latitude, longitude)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    record.file_path,
                    record.thumb_path,
                    record.width,
                    record.height,
                    record.file_size,
                    record.file_hash,
                    record.last_modified.map(fmt_ts),
                    record.indexed_at.map(fmt_ts),
                    record.embedding,
                    record.extra_json,
                    record.status.as_str(),
                    record.is_favorite,
                    record.is_blurred,
                    record.latitude,
                    record.longitude,
                ],
            )?;
            record.id = conn.last_insert_rowid();
        } else {
            conn.execute(
                "UPDATE images SET file_path=?1, thumb_path=?2, width=?3, height=?4,
                     file_size=?5, file_hash=?6, last_modified=?7, indexed_at=?8,
                     embedding=?9, extra_json=?10, status=?11, is_favorite=?12,
                     is_blurred=?13, latitude=?14, longitude=?15
                 WHERE id=?16",
                params![
                    record.file_path,
                    record.thumb_path,
                    record.width,
                    record.height,
                    record.file_size,
                    record.file_hash,
                    record.last_modified.map(fmt_ts),
                    record.indexed_at.map(fmt_ts),
                    record.embedding,
                    record.extra_json,
                    record.status.as_str(),
                    record.is_favorite,
                    record.is_blurred,
                    record.latitude,
                    record.longitude,
                    record.id,
                ],
            )?;
        }
        Ok(record)
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM images WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(Error::NotFound(format!("image {}", id)));
        }
        Ok(())
    }

    pub fn count_indexed(&self) -> Result<i64> {
        self.scalar("SELECT COUNT(*) FROM images WHERE status = 'indexed'")
    }

    pub fn count_with_embedding(&self) -> Result<i64> {
        self.scalar("SELECT COUNT(*) FROM images WHERE embedding IS NOT NULL")
    }

    pub fn count_favorites(&self) -> Result<i64> {
        self.scalar("SELECT COUNT(*) FROM images WHERE is_favorite = 1")
    }

    pub fn find_favorites(&self, limit: usize) -> Result<Vec<ImageRecord>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare(&format!("{} WHERE is_favorite = 1 LIMIT ?1", SELECT_IMAGE))?;
        let rows = stmt.query_map(params![limit as i64], map_image)?;
        collect(rows)
    }

    /// Substring match on the tag array inside the JSON blob. The pattern
    /// matches the quoted form so `beach` does not hit `beachhouse` notes.
    pub fn find_by_tag_substring(&self, tag: &str, limit: usize) -> Result<Vec<ImageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE extra_json LIKE ?1 LIMIT ?2",
            SELECT_IMAGE
        ))?;
        let pattern = format!("%\"{}\"%", tag);
        let rows = stmt.query_map(params![pattern, limit as i64], map_image)?;
        collect(rows)
    }

    pub fn find_by_filename_substring(&self, needle: &str) -> Result<Vec<ImageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE LOWER(file_path) LIKE ?1 ORDER BY indexed_at DESC",
            SELECT_IMAGE
        ))?;
        let pattern = format!("%{}%", needle.to_lowercase());
        let rows = stmt.query_map(params![pattern], map_image)?;
        collect(rows)
    }

    pub fn find_by_folder_substring(&self, folder: &str, limit: usize) -> Result<Vec<ImageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE file_path LIKE ?1 LIMIT ?2",
            SELECT_IMAGE
        ))?;
        let pattern = format!("%{}%", folder);
        let rows = stmt.query_map(params![pattern, limit as i64], map_image)?;
        collect(rows)
    }

    /// Most recently indexed records, paginated (empty-query fallback).
    pub fn find_recent(&self, limit: usize, offset: usize) -> Result<Vec<ImageRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{} ORDER BY indexed_at DESC LIMIT ?1 OFFSET ?2",
            SELECT_IMAGE
        ))?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], map_image)?;
        collect(rows)
    }

    /// Paths of records whose blob has not been through a metadata pass.
    pub fn find_paths_missing_exif(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT file_path FROM images
             WHERE extra_json IS NULL OR extra_json NOT LIKE '%\"exif_parsed\":true%'",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        collect(rows)
    }

    pub fn count_images_under(&self, folder_prefix: &str) -> Result<i64> {
        let conn = self.conn()?;
        let n = conn.query_row(
            "SELECT COUNT(*) FROM images WHERE file_path LIKE ?1",
            params![format!("{}%", folder_prefix)],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    // ---- watched folders ----

    pub fn list_folders(&self) -> Result<Vec<WatchedFolder>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, folder_path, active, added_at FROM watched_folders")?;
        let rows = stmt.query_map([], map_folder)?;
        collect(rows)
    }

    pub fn list_active_folders(&self) -> Result<Vec<WatchedFolder>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, folder_path, active, added_at FROM watched_folders WHERE active = 1",
        )?;
        let rows = stmt.query_map([], map_folder)?;
        collect(rows)
    }

    pub fn find_folder_by_id(&self, id: i64) -> Result<Option<WatchedFolder>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, folder_path, active, added_at FROM watched_folders WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], map_folder)?;
        Ok(rows.next().transpose()?)
    }

    pub fn find_folder_by_path(&self, folder_path: &str) -> Result<Option<WatchedFolder>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, folder_path, active, added_at FROM watched_folders WHERE folder_path = ?1",
        )?;
        let mut rows = stmt.query_map(params![folder_path], map_folder)?;
        Ok(rows.next().transpose()?)
    }

    /// Idempotent insert: an existing path is re-activated instead of
    /// duplicated.
    pub fn upsert_folder(&self, folder_path: &str) -> Result<WatchedFolder> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO watched_folders (folder_path, active, added_at) VALUES (?1, 1, ?2)
             ON CONFLICT(folder_path) DO UPDATE SET active = 1",
            params![folder_path, fmt_ts(chrono::Local::now().naive_local())],
        )?;
        self.find_folder_by_path(folder_path)?
            .ok_or_else(|| Error::NotFound(format!("folder {}", folder_path)))
    }

    pub fn deactivate_folder(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE watched_folders SET active = 0 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    // ---- settings ----

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = ?1")?;
        let mut rows = stmt.query_map(params![key], |row| row.get(0))?;
        Ok(rows.next().transpose()?)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }

    pub fn has_setting(&self, key: &str) -> Result<bool> {
        Ok(self.get_setting(key)?.is_some())
    }

    // ---- audit log ----

    pub fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let conn = self.conn()?;
        let error_message = match &entry.status {
            IngestStatus::Error(msg) => Some(msg.as_str()),
            _ => None,
        };
        conn.execute(
            "INSERT INTO audit_log (file_path, image_id, status, error_message, duration_ms, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.file_path,
                entry.image_id,
                entry.status.as_str(),
                error_message,
                entry.duration_ms,
                fmt_ts(chrono::Local::now().naive_local()),
            ],
        )?;
        Ok(())
    }

    pub fn last_audit_status(&self, file_path: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status FROM audit_log WHERE file_path = ?1 ORDER BY id DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![file_path], |row| row.get(0))?;
        Ok(rows.next().transpose()?)
    }

    fn scalar(&self, sql: &str) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row(sql, [], |row| row.get(0))?)
    }
}

const SELECT_IMAGE: &str = "SELECT id, file_path, thumb_path, width, height, file_size, \
     file_hash, last_modified, indexed_at, embedding, extra_json, status, \
     is_favorite, is_blurred, latitude, longitude FROM images";

fn map_image(row: &Row<'_>) -> rusqlite::Result<ImageRecord> {
    Ok(ImageRecord {
        id: row.get(0)?,
        file_path: row.get(1)?,
        thumb_path: row.get(2)?,
        width: row.get(3)?,
        height: row.get(4)?,
        file_size: row.get(5)?,
        file_hash: row.get(6)?,
        last_modified: row.get::<_, Option<String>>(7)?.and_then(|s| parse_ts(&s)),
        indexed_at: row.get::<_, Option<String>>(8)?.and_then(|s| parse_ts(&s)),
        embedding: row.get(9)?,
        extra_json: row.get(10)?,
        status: RecordStatus::from_str(&row.get::<_, String>(11)?),
        is_favorite: row.get(12)?,
        is_blurred: row.get(13)?,
        latitude: row.get(14)?,
        longitude: row.get(15)?,
    })
}

fn map_folder(row: &Row<'_>) -> rusqlite::Result<WatchedFolder> {
    Ok(WatchedFolder {
        id: row.get(0)?,
        folder_path: row.get(1)?,
        active: row.get(2)?,
        added_at: row.get::<_, Option<String>>(3)?.and_then(|s| parse_ts(&s)),
    })
}

fn collect<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn fmt_ts(ts: NaiveDateTime) -> String {
    ts.format(TS_FORMAT).to_string()
}

pub fn parse_ts(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TS_FORMAT).ok()
}

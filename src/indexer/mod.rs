//! Ingestion pipeline.
//!
//! One worker task drains a bounded job queue and runs the per-file
//! pipeline: hash, thumbnail, dimensions, metadata, embedding, durable
//! record, vector upsert, audit entry. Single-writer by design — the
//! inference sessions are not reentrant and serialization makes the audit
//! log totally ordered per path.

pub mod exif;
pub mod thumbs;
pub mod watcher;

use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::clip::EmbeddingService;
use crate::error::Result;
use crate::index::VectorIndex;
use crate::store::{keys, AuditEntry, Database, ImageRecord, IngestStatus, RecordStatus};
use crate::vecmath::vector_to_bytes;
use thumbs::ThumbnailService;

/// Bounded depth for recursive directory walks.
const MAX_WALK_DEPTH: u32 = 16;

/// Work items handed to the single ingest worker.
#[derive(Debug, Clone)]
pub enum IngestJob {
    /// Index (or re-index) one file.
    Index(PathBuf),
    /// A watched file disappeared from disk.
    Remove(PathBuf),
    /// Full walk of the given roots, then a clean vector reload.
    Reindex(Vec<PathBuf>),
}

pub struct Indexer {
    db: Arc<Database>,
    embedder: Arc<EmbeddingService>,
    index: Arc<VectorIndex>,
    thumbs: ThumbnailService,
    processed_count: AtomicU32,
    error_count: AtomicU32,
    /// Epoch millis of the last bulk reindex start.
    last_run_time: AtomicI64,
    current_file: Mutex<String>,
}

impl Indexer {
    pub fn new(
        db: Arc<Database>,
        embedder: Arc<EmbeddingService>,
        index: Arc<VectorIndex>,
        thumbs: ThumbnailService,
    ) -> Self {
        Self {
            db,
            embedder,
            index,
            thumbs,
            processed_count: AtomicU32::new(0),
            error_count: AtomicU32::new(0),
            last_run_time: AtomicI64::new(0),
            current_file: Mutex::new(String::new()),
        }
    }

    /// Loads all persisted embeddings into the vector index (startup).
    pub fn load_existing_embeddings(&self) {
        match self.db.find_all_embeddings() {
            Ok(rows) => self.index.load_all(rows),
            Err(e) => tracing::error!("Failed to load embeddings at startup: {}", e),
        }
    }

    /// Runs the ingest worker until the job channel closes.
    ///
    /// Each job executes on the blocking pool but is awaited before the
    /// next one starts, preserving the single-writer discipline.
    pub fn spawn_worker(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<IngestJob>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Ingest worker started");
            while let Some(job) = rx.recv().await {
                let indexer = Arc::clone(&self);
                let result = tokio::task::spawn_blocking(move || indexer.handle(job)).await;
                if let Err(e) = result {
                    tracing::error!("Ingest job panicked: {}", e);
                }
            }
            tracing::info!("Ingest worker stopped");
        })
    }

    fn handle(&self, job: IngestJob) {
        match job {
            IngestJob::Index(path) => self.index_single_file(&path),
            IngestJob::Remove(path) => self.remove_deleted(&path),
            IngestJob::Reindex(roots) => self.reindex_all(&roots),
        }
    }

    /// Full per-file pipeline. Never propagates errors: failures become an
    /// audit entry and a log line, and the batch continues.
    pub fn index_single_file(&self, path: &Path) {
        let path = normalize_path(path);
        let path_str = path.to_string_lossy().to_string();
        *self.current_file.lock() = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let start = Instant::now();
        let (status, image_id) = match self.ingest_inner(&path, &path_str) {
            Ok((status, id)) => {
                self.processed_count.fetch_add(1, Ordering::SeqCst);
                (status, id)
            }
            Err(e) => {
                tracing::error!("Failed to index {:?}: {}", path.file_name(), e);
                self.error_count.fetch_add(1, Ordering::SeqCst);
                (IngestStatus::Error(e.to_string()), None)
            }
        };

        let entry = AuditEntry {
            file_path: path_str,
            image_id,
            status,
            duration_ms: start.elapsed().as_millis() as i64,
        };
        if let Err(e) = self.db.append_audit(&entry) {
            tracing::warn!("Failed to write audit entry: {}", e);
        }
        self.current_file.lock().clear();
    }

    fn ingest_inner(&self, path: &Path, path_str: &str) -> Result<(IngestStatus, Option<i64>)> {
        let new_hash = compute_sha256(path)?;
        let meta = std::fs::metadata(path)?;
        let file_size = meta.len() as i64;
        let last_modified = meta
            .modified()
            .ok()
            .map(|t| chrono::DateTime::<chrono::Local>::from(t).naive_local());

        let existing = self.db.find_by_path(path_str)?;

        let exif_enabled = self.setting_enabled(keys::EXIF_ENABLED);
        let exif_needed =
            exif_enabled && !existing.as_ref().map(|r| r.exif_parsed()).unwrap_or(false);
        let embed_needed = match &existing {
            None => true,
            Some(r) => r.embedding.is_none() || r.file_hash.as_deref() != Some(new_hash.as_str()),
        };

        if !exif_needed && !embed_needed {
            tracing::debug!("Skipped unchanged file: {:?}", path.file_name());
            return Ok((IngestStatus::Skipped, existing.map(|r| r.id)));
        }

        let mut record = existing.unwrap_or_else(|| ImageRecord::new(path_str.to_string()));

        if embed_needed {
            record.thumb_path = self
                .thumbs
                .create(path)
                .map(|p| p.to_string_lossy().to_string());
            // Dimensions are best effort; a header we cannot parse leaves them null.
            match image::image_dimensions(path) {
                Ok((w, h)) => {
                    record.width = Some(w);
                    record.height = Some(h);
                }
                Err(_) => {
                    record.width = None;
                    record.height = None;
                }
            }
        }

        if exif_needed {
            let camera = exif::extract(path);
            merge_metadata(&mut record, &camera);
        }

        let mut embedding_vec = None;
        if embed_needed && self.embedder.is_ready() {
            if let Some(vec) = self.embedder.embed_image(path) {
                record.embedding = Some(vector_to_bytes(&vec));
                embedding_vec = Some(vec);
            }
        }

        record.file_hash = Some(new_hash);
        record.file_size = file_size;
        record.last_modified = last_modified;
        record.indexed_at = Some(chrono::Local::now().naive_local());
        record.status = RecordStatus::Indexed;

        let saved = self.db.save(record)?;

        // Synchronous upsert so the new item is queryable immediately.
        if let Some(vec) = embedding_vec {
            self.index.upsert(saved.id, vec);
        }

        Ok((IngestStatus::Success, Some(saved.id)))
    }

    /// Walks every root, indexes supported files, then reloads the vector
    /// index from the durable store for a clean set.
    pub fn reindex_all(&self, roots: &[PathBuf]) {
        self.processed_count.store(0, Ordering::SeqCst);
        self.error_count.store(0, Ordering::SeqCst);
        self.last_run_time
            .store(chrono::Local::now().timestamp_millis(), Ordering::SeqCst);
        tracing::info!("Starting full reindex of {} folders...", roots.len());

        let mut files = Vec::new();
        for root in roots {
            let root = normalize_path(root);
            if !root.is_dir() {
                tracing::warn!("Skipping non-existent folder: {:?}", root);
                continue;
            }
            collect_images_recursive(&root, &mut files, MAX_WALK_DEPTH);
        }

        for file in &files {
            self.index_single_file(file);
        }

        match self.db.find_all_embeddings() {
            Ok(rows) => self.index.load_all(rows),
            Err(e) => tracing::error!("Failed to reload vector index after reindex: {}", e),
        }

        tracing::info!(
            "Reindex complete. Processed: {}, Errors: {}",
            self.processed_count.load(Ordering::SeqCst),
            self.error_count.load(Ordering::SeqCst)
        );
    }

    /// Removes a deleted file from thumbnail storage, the vector index, and
    /// the durable store.
    pub fn remove_deleted(&self, path: &Path) {
        let path = normalize_path(path);
        let path_str = path.to_string_lossy().to_string();

        self.thumbs.delete(&path);
        match self.db.find_by_path(&path_str) {
            Ok(Some(record)) => {
                self.index.remove(record.id);
                if let Err(e) = self.db.delete(record.id) {
                    tracing::error!("Failed to delete record for {:?}: {}", path, e);
                    return;
                }
                tracing::info!("Removed deleted image from index: {:?}", path.file_name());
            }
            Ok(None) => {}
            Err(e) => tracing::error!("Lookup failed for deleted file {:?}: {}", path, e),
        }
    }

    fn setting_enabled(&self, key: &str) -> bool {
        self.db
            .get_setting(key)
            .ok()
            .flatten()
            .map(|v| v == "true")
            .unwrap_or(true)
    }

    // ---- status accessors ----

    pub fn processed_count(&self) -> u32 {
        self.processed_count.load(Ordering::SeqCst)
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::SeqCst)
    }

    pub fn last_run_time(&self) -> i64 {
        self.last_run_time.load(Ordering::SeqCst)
    }

    pub fn current_file(&self) -> String {
        self.current_file.lock().clone()
    }
}

/// Folds the metadata map into the record's JSON blob and copies GPS into
/// the dedicated columns. Always stamps `exif_parsed` so later passes can
/// detect already-parsed records.
fn merge_metadata(record: &mut ImageRecord, meta: &exif::ImageMetadata) {
    let mut blob: serde_json::Map<String, serde_json::Value> = record
        .extra_json
        .as_deref()
        .and_then(|j| serde_json::from_str(j).ok())
        .unwrap_or_default();

    if !meta.fields.is_empty() {
        let exif_obj: serde_json::Map<String, serde_json::Value> = meta
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        blob.insert("exif".to_string(), serde_json::Value::Object(exif_obj));
    }
    blob.insert("exif_parsed".to_string(), serde_json::Value::Bool(true));

    record.extra_json = serde_json::to_string(&blob).ok();
    if meta.latitude.is_some() {
        record.latitude = meta.latitude;
    }
    if meta.longitude.is_some() {
        record.longitude = meta.longitude;
    }
}

/// Lexically normalizes a path to absolute form without touching the
/// filesystem, so deleted files can still be normalized.
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// SHA-256 over the file contents in 64 KiB chunks.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Collects supported image files under a directory, bounded by depth.
pub fn collect_images_recursive(dir: &Path, out: &mut Vec<PathBuf>, depth: u32) {
    if depth == 0 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_images_recursive(&path, out, depth - 1);
        } else if ThumbnailService::is_supported(&path) {
            out.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn setup(tmp: &Path) -> (Arc<Database>, Arc<Indexer>) {
        let db = Arc::new(Database::open(&tmp.join("t.db")).unwrap());
        let index = Arc::new(VectorIndex::new());
        let indexer = Arc::new(Indexer::new(
            Arc::clone(&db),
            Arc::new(EmbeddingService::new()),
            index,
            ThumbnailService::new(tmp.join("thumbs"), 300),
        ));
        (db, indexer)
    }

    fn write_image(path: &Path, color: [u8; 3]) {
        RgbImage::from_pixel(8, 8, Rgb(color)).save(path).unwrap();
    }

    #[test]
    fn test_first_sight_creates_record_with_thumbnail() {
        let tmp = tempfile::tempdir().unwrap();
        let (db, indexer) = setup(tmp.path());
        let img = tmp.path().join("a.png");
        write_image(&img, [255, 0, 0]);

        indexer.index_single_file(&img);

        let rec = db
            .find_by_path(&normalize_path(&img).to_string_lossy())
            .unwrap()
            .expect("record should exist");
        assert_eq!(rec.status, RecordStatus::Indexed);
        assert_eq!(rec.width, Some(8));
        assert_eq!(rec.height, Some(8));
        assert!(rec.file_hash.is_some());
        assert!(rec.thumb_path.is_some());
        assert!(rec.exif_parsed(), "metadata pass must stamp the blob");
        // No models loaded, so no embedding yet.
        assert!(rec.embedding.is_none());
        assert_eq!(indexer.processed_count(), 1);
        assert_eq!(indexer.error_count(), 0);
    }

    #[test]
    fn test_unchanged_file_with_embedding_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let (db, indexer) = setup(tmp.path());
        let img = tmp.path().join("a.png");
        write_image(&img, [0, 255, 0]);
        let path_str = normalize_path(&img).to_string_lossy().to_string();

        indexer.index_single_file(&img);

        // Give the record an embedding, as if the encoders had been loaded.
        let mut rec = db.find_by_path(&path_str).unwrap().unwrap();
        rec.embedding = Some(vector_to_bytes(&[1.0, 0.0]));
        let rec = db.save(rec).unwrap();
        let indexed_at = rec.indexed_at;

        indexer.index_single_file(&img);

        assert_eq!(db.last_audit_status(&path_str).unwrap().as_deref(), Some("skipped"));
        let after = db.find_by_path(&path_str).unwrap().unwrap();
        assert_eq!(after.indexed_at, indexed_at, "skip must not touch indexed_at");
    }

    #[test]
    fn test_content_change_reindexes() {
        let tmp = tempfile::tempdir().unwrap();
        let (db, indexer) = setup(tmp.path());
        let img = tmp.path().join("a.png");
        write_image(&img, [0, 255, 0]);
        let path_str = normalize_path(&img).to_string_lossy().to_string();

        indexer.index_single_file(&img);
        let mut rec = db.find_by_path(&path_str).unwrap().unwrap();
        rec.embedding = Some(vector_to_bytes(&[1.0, 0.0]));
        db.save(rec).unwrap();
        let old_hash = db.find_by_path(&path_str).unwrap().unwrap().file_hash;

        write_image(&img, [0, 0, 255]);
        indexer.index_single_file(&img);

        let after = db.find_by_path(&path_str).unwrap().unwrap();
        assert_ne!(after.file_hash, old_hash);
        assert_eq!(db.last_audit_status(&path_str).unwrap().as_deref(), Some("success"));
    }

    #[test]
    fn test_missing_file_audits_error_and_continues() {
        let tmp = tempfile::tempdir().unwrap();
        let (db, indexer) = setup(tmp.path());
        let ghost = tmp.path().join("ghost.jpg");

        indexer.index_single_file(&ghost);
        assert_eq!(indexer.error_count(), 1);
        let path_str = normalize_path(&ghost).to_string_lossy().to_string();
        assert_eq!(db.last_audit_status(&path_str).unwrap().as_deref(), Some("error"));
    }

    #[test]
    fn test_reindex_walks_only_supported_files() {
        let tmp = tempfile::tempdir().unwrap();
        let (db, indexer) = setup(tmp.path());
        let root = tmp.path().join("lib");
        std::fs::create_dir_all(root.join("sub")).unwrap();
        write_image(&root.join("a.png"), [1, 2, 3]);
        write_image(&root.join("sub/b.jpg"), [4, 5, 6]);
        std::fs::write(root.join("notes.txt"), b"not an image").unwrap();

        indexer.reindex_all(&[root]);

        assert_eq!(db.count_indexed().unwrap(), 2);
        assert_eq!(indexer.processed_count(), 2);
        assert!(indexer.last_run_time() > 0);
    }

    #[test]
    fn test_remove_deleted_clears_row_vector_and_thumb() {
        let tmp = tempfile::tempdir().unwrap();
        let (db, indexer) = setup(tmp.path());
        let img = tmp.path().join("gone.png");
        write_image(&img, [9, 9, 9]);
        let path_str = normalize_path(&img).to_string_lossy().to_string();

        indexer.index_single_file(&img);
        let rec = db.find_by_path(&path_str).unwrap().unwrap();
        indexer.index.upsert(rec.id, vec![1.0, 0.0]);
        let thumb = rec.thumb_path.clone().unwrap();
        assert!(Path::new(&thumb).exists());

        std::fs::remove_file(&img).unwrap();
        indexer.remove_deleted(&img);

        assert!(db.find_by_path(&path_str).unwrap().is_none());
        assert_eq!(indexer.index.len(), 0);
        assert!(!Path::new(&thumb).exists());
    }

    #[test]
    fn test_normalize_path_folds_dots() {
        let n = normalize_path(Path::new("/a/b/../c/./d.jpg"));
        assert_eq!(n, PathBuf::from("/a/c/d.jpg"));
        // Relative paths become absolute.
        assert!(normalize_path(Path::new("x.jpg")).is_absolute());
    }

    #[test]
    fn test_compute_sha256_known_value() {
        let tmp = tempfile::tempdir().unwrap();
        let f = tmp.path().join("x");
        std::fs::write(&f, b"abc").unwrap();
        assert_eq!(
            compute_sha256(&f).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}

//! Filesystem watcher.
//!
//! Watches every active root recursively and feeds the ingest queue.
//! Create/modify events for supported images land in a pending map keyed by
//! path — repeated events overwrite the timestamp, so a burst of writes
//! coalesces into one ingest once the file has been quiet for the debounce
//! window. Deletes bypass the debounce so the index tracks disk promptly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::thumbs::ThumbnailService;
use crate::error::{Error, Result};
use crate::indexer::{normalize_path, IngestJob};
use crate::store::{keys, Database, WatchedFolder};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Raw change forwarded from the notify callback to the watch loop.
#[derive(Debug)]
enum FileChange {
    Touched(PathBuf),
    Removed(PathBuf),
}

pub struct FolderWatcher {
    db: Arc<Database>,
    jobs: mpsc::Sender<IngestJob>,
    debounce: Duration,
    watcher: Mutex<RecommendedWatcher>,
    running: Arc<AtomicBool>,
}

impl FolderWatcher {
    /// Creates the watcher, registers default and persisted roots, and
    /// spawns the long-lived watch loop.
    pub fn start(
        db: Arc<Database>,
        jobs: mpsc::Sender<IngestJob>,
        default_roots: &[PathBuf],
        debounce_ms: u64,
    ) -> Result<Arc<Self>> {
        let (tx, rx) = mpsc::unbounded_channel();

        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let Ok(event) = res else { return };
            let make: fn(PathBuf) -> FileChange = match event.kind {
                EventKind::Create(_) | EventKind::Modify(_) => FileChange::Touched,
                EventKind::Remove(_) => FileChange::Removed,
                // OVERFLOW and access/other kinds are ignored.
                _ => return,
            };
            for path in event.paths {
                let _ = tx.send(make(path));
            }
        })
        .map_err(|e| Error::Internal(format!("Failed to create watcher: {}", e)))?;

        let this = Arc::new(Self {
            db,
            jobs,
            debounce: Duration::from_millis(debounce_ms),
            watcher: Mutex::new(watcher),
            running: Arc::new(AtomicBool::new(true)),
        });

        // Default roots are created if missing and persisted idempotently.
        for root in default_roots {
            let root = normalize_path(root);
            if let Err(e) = std::fs::create_dir_all(&root) {
                tracing::warn!("Could not create default folder {:?}: {}", root, e);
                continue;
            }
            if let Err(e) = this.db.upsert_folder(&root.to_string_lossy()) {
                tracing::warn!("Could not register default folder {:?}: {}", root, e);
                continue;
            }
            this.watch_tree(&root);
        }

        // Re-register every active folder from the durable store.
        match this.db.list_active_folders() {
            Ok(folders) => {
                for folder in folders {
                    this.watch_tree(Path::new(&folder.folder_path));
                }
            }
            Err(e) => tracing::warn!("Could not load watched folders: {}", e),
        }

        let loop_handle = Arc::clone(&this);
        tokio::spawn(async move {
            loop_handle.run_watch_loop(rx).await;
        });
        tracing::info!("File system watcher started");

        Ok(this)
    }

    /// Watch loop: 1-second poll, flushing due pending entries on every
    /// iteration (including idle polls).
    async fn run_watch_loop(&self, mut rx: mpsc::UnboundedReceiver<FileChange>) {
        tracing::info!("File watcher loop started");
        let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

        while self.running.load(Ordering::SeqCst) {
            match tokio::time::timeout(POLL_INTERVAL, rx.recv()).await {
                Ok(Some(change)) => self.handle_change(change, &mut pending),
                Ok(None) => break,
                Err(_) => {} // idle poll
            }

            for path in drain_due(&mut pending, self.debounce, Instant::now()) {
                tracing::debug!("Auto-indexing changed file: {:?}", path.file_name());
                if let Err(e) = self.jobs.try_send(IngestJob::Index(path.clone())) {
                    match e {
                        mpsc::error::TrySendError::Full(_) => {
                            // Queue overflow: keep the event pending and
                            // retry on a later flush.
                            pending.insert(path, Instant::now());
                        }
                        mpsc::error::TrySendError::Closed(_) => return,
                    }
                }
            }
        }
        tracing::info!("File watcher loop stopped");
    }

    fn handle_change(&self, change: FileChange, pending: &mut HashMap<PathBuf, Instant>) {
        match change {
            FileChange::Removed(path) => {
                let path = normalize_path(&path);
                pending.remove(&path);
                // Deletes flow even with auto-indexing off, to keep the
                // index consistent with disk.
                if ThumbnailService::is_supported(&path) {
                    let _ = self.jobs.try_send(IngestJob::Remove(path));
                }
            }
            FileChange::Touched(path) => {
                let path = normalize_path(&path);
                // New subdirectories are registered by the recursive watch
                // itself; only files enter the debounce map.
                if !path.is_file() || !ThumbnailService::is_supported(&path) {
                    return;
                }
                if !self.auto_indexing_enabled() {
                    return;
                }
                pending.insert(path, Instant::now());
            }
        }
    }

    /// Adds a folder: persists it (idempotent) and registers the tree.
    pub fn add_folder(&self, folder_path: &str) -> Result<WatchedFolder> {
        if folder_path.trim().is_empty() {
            return Err(Error::InvalidInput("folderPath is required".to_string()));
        }
        let dir = normalize_path(Path::new(folder_path));
        if !dir.is_dir() {
            return Err(Error::InvalidInput(format!(
                "Path is not a directory: {}",
                dir.display()
            )));
        }
        let folder = self.db.upsert_folder(&dir.to_string_lossy())?;
        self.watch_tree(&dir);
        tracing::info!("Added watched folder: {:?}", dir);
        Ok(folder)
    }

    /// Stops watching a folder and marks it inactive. Image records under
    /// it are kept.
    pub fn remove_folder(&self, id: i64) -> Result<WatchedFolder> {
        let folder = self
            .db
            .find_folder_by_id(id)?
            .ok_or_else(|| Error::NotFound(format!("folder {}", id)))?;
        self.db.deactivate_folder(id)?;
        if let Err(e) = self.watcher.lock().unwatch(Path::new(&folder.folder_path)) {
            tracing::debug!("Unwatch {:?}: {}", folder.folder_path, e);
        }
        tracing::info!("Removed watched folder: {}", folder.folder_path);
        Ok(folder)
    }

    /// Flips the stop flag; the loop exits on its next poll and dropping
    /// the watcher closes the OS notification handles.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn watch_tree(&self, root: &Path) {
        if !root.is_dir() {
            return;
        }
        if let Err(e) = self.watcher.lock().watch(root, RecursiveMode::Recursive) {
            tracing::warn!("Cannot watch {:?}: {}", root, e);
        } else {
            tracing::info!("Watching directory: {:?}", root);
        }
    }

    fn auto_indexing_enabled(&self) -> bool {
        self.db
            .get_setting(keys::AUTO_INDEXING)
            .ok()
            .flatten()
            .map(|v| v == "true")
            .unwrap_or(true)
    }
}

/// Removes and returns every pending path whose last event is older than
/// the debounce window.
fn drain_due(
    pending: &mut HashMap<PathBuf, Instant>,
    debounce: Duration,
    now: Instant,
) -> Vec<PathBuf> {
    let due: Vec<PathBuf> = pending
        .iter()
        .filter(|(_, &t)| now.duration_since(t) >= debounce)
        .map(|(p, _)| p.clone())
        .collect();
    for path in &due {
        pending.remove(path);
    }
    due
}

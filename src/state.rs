//! Application state wiring.
//!
//! All long-lived services are constructed once, Arc-owned here, and
//! passed by reference — no ambient singletons. Ownership is layered: the
//! embedding service owns the inference sessions, the fetcher only holds a
//! load capability through it, and the index and pipeline are siblings.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::clip::EmbeddingService;
use crate::config::AppConfig;
use crate::error::Result;
use crate::index::VectorIndex;
use crate::indexer::thumbs::ThumbnailService;
use crate::indexer::watcher::FolderWatcher;
use crate::indexer::{normalize_path, IngestJob, Indexer};
use crate::models::ModelFetcher;
use crate::search::SearchService;
use crate::store::Database;

/// Capacity of the ingest work queue.
const INGEST_QUEUE_CAPACITY: usize = 1024;

pub struct AppState {
    pub config: AppConfig,
    pub db: Arc<Database>,
    pub embedder: Arc<EmbeddingService>,
    pub index: Arc<VectorIndex>,
    pub indexer: Arc<Indexer>,
    pub search: SearchService,
    pub fetcher: Arc<ModelFetcher>,
    pub watcher: Arc<FolderWatcher>,
    /// Producer side of the ingest queue (the watcher holds a clone too).
    pub jobs: mpsc::Sender<IngestJob>,
}

impl AppState {
    /// Builds every service, loads persisted embeddings, and spawns the
    /// ingest worker and the filesystem watcher.
    pub fn new(config: AppConfig) -> Result<Arc<Self>> {
        let db = Arc::new(Database::open(&config.db_path())?);
        let embedder = Arc::new(EmbeddingService::new());
        let index = Arc::new(VectorIndex::new());

        let indexer = Arc::new(Indexer::new(
            Arc::clone(&db),
            Arc::clone(&embedder),
            Arc::clone(&index),
            ThumbnailService::new(config.thumb_dir.clone(), config.thumb_size),
        ));

        let fetcher = Arc::new(ModelFetcher::new(
            config.model_dir.clone(),
            config.model_repo.clone(),
            Arc::clone(&db),
            Arc::clone(&embedder),
        ));

        // Models downloaded in a previous run load straight from disk.
        fetcher.try_load_existing();

        // The vector index always reboots from the durable store.
        indexer.load_existing_embeddings();

        let (jobs, job_rx) = mpsc::channel(INGEST_QUEUE_CAPACITY);
        Arc::clone(&indexer).spawn_worker(job_rx);

        let watcher = FolderWatcher::start(
            Arc::clone(&db),
            jobs.clone(),
            &config.image_dirs,
            config.debounce_ms,
        )?;

        let search = SearchService::new(
            Arc::clone(&db),
            Arc::clone(&embedder),
            Arc::clone(&index),
        );

        Ok(Arc::new(Self {
            config,
            db,
            embedder,
            index,
            indexer,
            search,
            fetcher,
            watcher,
            jobs,
        }))
    }

    /// Roots for a bulk reindex: active watched folders plus the configured
    /// defaults, normalized and deduplicated.
    pub fn reindex_roots(&self) -> Vec<PathBuf> {
        let mut seen = std::collections::HashSet::new();
        let mut roots = Vec::new();

        if let Ok(folders) = self.db.list_active_folders() {
            for folder in folders {
                let norm = normalize_path(std::path::Path::new(&folder.folder_path));
                if seen.insert(norm.clone()) {
                    roots.push(norm);
                }
            }
        }
        for dir in &self.config.image_dirs {
            let norm = normalize_path(dir);
            if seen.insert(norm.clone()) {
                roots.push(norm);
            }
        }
        roots
    }

    /// Flips the watcher stop flag; the ingest queue drains on drop.
    pub fn shutdown(&self) {
        self.watcher.shutdown();
    }
}

//! Application configuration.
//!
//! Defaults keep everything under `./data`; every knob can be overridden
//! through a `LUMINA_*` environment variable.

use std::path::PathBuf;

/// Static configuration resolved once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Base data directory (database, thumbnails, models).
    pub data_dir: PathBuf,
    /// Directory where encoder model files are stored.
    pub model_dir: PathBuf,
    /// Directory where generated thumbnails are stored.
    pub thumb_dir: PathBuf,
    /// Default image directories to watch and index.
    pub image_dirs: Vec<PathBuf>,
    /// Remote repository for the CLIP ONNX models.
    pub model_repo: String,
    /// Thumbnail bounding-box size in pixels (square).
    pub thumb_size: u32,
    /// Watcher debounce delay in milliseconds.
    pub debounce_ms: u64,
    /// Hard cap on search results per request.
    pub search_limit: usize,
    /// HTTP listen port.
    pub port: u16,
}

impl AppConfig {
    /// Resolve configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let data_dir = env_path("LUMINA_DATA_DIR").unwrap_or_else(|| PathBuf::from("./data"));
        let model_dir =
            env_path("LUMINA_MODEL_DIR").unwrap_or_else(|| data_dir.join("models"));
        let thumb_dir =
            env_path("LUMINA_THUMB_DIR").unwrap_or_else(|| data_dir.join("thumbs"));

        let image_dirs = std::env::var("LUMINA_IMAGE_DIRS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_else(|_| vec![data_dir.join("images")]);

        Self {
            data_dir,
            model_dir,
            thumb_dir,
            image_dirs,
            model_repo: std::env::var("LUMINA_MODEL_REPO")
                .unwrap_or_else(|_| "Xenova/clip-vit-base-patch32".to_string()),
            thumb_size: env_parse("LUMINA_THUMB_SIZE").unwrap_or(300),
            debounce_ms: env_parse("LUMINA_DEBOUNCE_MS").unwrap_or(1500),
            search_limit: env_parse("LUMINA_SEARCH_LIMIT").unwrap_or(100),
            port: env_parse("LUMINA_PORT").unwrap_or(8080),
        }
    }

    /// Path of the SQLite database file.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("lumina.db")
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

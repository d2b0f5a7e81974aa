//! Encoder-weights acquisition.
//!
//! Downloads the two ONNX encoder files and the tokenizer spec from a
//! Hugging Face style repository, streaming each body into a temp sibling
//! that is atomically renamed into place. Progress is fanned out over a
//! broadcast channel so any number of SSE subscribers can follow along;
//! slow subscribers lag and drop, they never block the download.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use crate::clip::EmbeddingService;
use crate::error::{Error, Result};
use crate::store::{keys, Database};
use crate::vault::TokenVault;

const RESOLVE_BASE_URL: &str = "https://huggingface.co";
/// Streaming buffer: 512 KiB.
const BUFFER_SIZE: usize = 512 * 1024;
/// Progress event at least every 5 MiB of payload.
const PROGRESS_INTERVAL: u64 = 5 * 1024 * 1024;
const MAX_RETRIES: u32 = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Files to fetch: (remote path, local filename, display name).
const MODEL_FILES: [(&str, &str, &str); 3] = [
    (
        "onnx/vision_model.onnx",
        "vision_model.onnx",
        "Image Encoder (vision_model.onnx)",
    ),
    (
        "onnx/text_model.onnx",
        "text_model.onnx",
        "Text Encoder (text_model.onnx)",
    ),
    ("tokenizer.json", "tokenizer.json", "Tokenizer (tokenizer.json)"),
];

/// Download session phase, serialized as a kebab-case string at the HTTP
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressStatus {
    Started,
    Downloading,
    Retrying,
    FileComplete,
    Loading,
    Ready,
    Error,
    Skipped,
}

/// One observable progress event. Events are append-only: once published
/// they are never retroactively modified.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub status: ProgressStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(rename = "bytesDownloaded")]
    pub bytes_downloaded: u64,
    #[serde(rename = "totalBytes")]
    pub total_bytes: u64,
    pub message: String,
}

/// Aggregate on-disk model state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    NotDownloaded,
    Partial,
    Downloading,
    Ready,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelFileInfo {
    pub name: String,
    pub exists: bool,
    #[serde(rename = "sizeBytes")]
    pub size_bytes: u64,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelStatusReport {
    pub status: ModelState,
    pub message: String,
    pub files: Vec<ModelFileInfo>,
}

/// Authenticated, resumable, verifying downloader for the encoder weights.
pub struct ModelFetcher {
    model_dir: PathBuf,
    default_repo: String,
    db: Arc<Database>,
    vault: TokenVault,
    embedder: Arc<EmbeddingService>,
    downloading: AtomicBool,
    last_error: Mutex<Option<String>>,
    progress: broadcast::Sender<ProgressEvent>,
}

impl ModelFetcher {
    pub fn new(
        model_dir: PathBuf,
        default_repo: String,
        db: Arc<Database>,
        embedder: Arc<EmbeddingService>,
    ) -> Self {
        let (progress, _) = broadcast::channel(256);
        Self {
            model_dir,
            default_repo,
            db,
            vault: TokenVault::new(),
            embedder,
            downloading: AtomicBool::new(false),
            last_error: Mutex::new(None),
            progress,
        }
    }

    pub fn is_running(&self) -> bool {
        self.downloading.load(Ordering::SeqCst)
    }

    /// Subscribes to the progress stream of the current (and any future)
    /// session.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    /// Starts a download session on a background task.
    ///
    /// Non-reentrant: a second call while a session is in flight fails with
    /// a conflict.
    pub fn start(self: &Arc<Self>, repo_override: Option<String>) -> Result<()> {
        if self
            .downloading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Conflict("Download is already in progress".to_string()));
        }
        *self.last_error.lock() = None;

        let repo = repo_override
            .filter(|r| !r.trim().is_empty())
            .map(|r| r.trim().to_string())
            .or_else(|| self.db.get_setting(keys::HF_REPO).ok().flatten())
            .unwrap_or_else(|| self.default_repo.clone());

        let fetcher = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = fetcher.run_session(&repo).await {
                let msg = e.to_string();
                tracing::error!("Model download failed: {}", msg);
                *fetcher.last_error.lock() = Some(msg.clone());
                fetcher.publish(
                    ProgressStatus::Error,
                    None,
                    0,
                    0,
                    format!("Download failed: {}", msg),
                );
            }
            fetcher.downloading.store(false, Ordering::SeqCst);
        });
        Ok(())
    }

    async fn run_session(&self, repo: &str) -> Result<()> {
        tracing::info!("Starting model download from repo: {}", repo);
        self.publish(
            ProgressStatus::Started,
            None,
            0,
            0,
            format!("Starting download from {}", repo),
        );

        let token = self.stored_token()?.ok_or_else(|| {
            Error::InvalidInput(
                "No access token set. Please save your token in Settings first.".to_string(),
            )
        })?;

        std::fs::create_dir_all(&self.model_dir)?;

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("HTTP client error: {}", e)))?;

        for (remote_path, local_name, _) in MODEL_FILES {
            let local_path = self.model_dir.join(local_name);
            self.download_with_retry(&client, repo, remote_path, &local_path, &token)
                .await?;
        }

        self.publish(
            ProgressStatus::Loading,
            None,
            0,
            0,
            "Loading models into memory...".to_string(),
        );
        self.embedder.load_models(
            &self.model_dir.join("vision_model.onnx"),
            &self.model_dir.join("text_model.onnx"),
            &self.model_dir.join("tokenizer.json"),
        )?;

        self.publish(
            ProgressStatus::Ready,
            None,
            0,
            0,
            "All models downloaded and loaded.".to_string(),
        );
        tracing::info!("Model download complete, encoders are ready");
        Ok(())
    }

    /// Up to [`MAX_RETRIES`] attempts with exponential backoff. Auth and
    /// missing-file failures are terminal on the first occurrence.
    async fn download_with_retry(
        &self,
        client: &reqwest::Client,
        repo: &str,
        remote_path: &str,
        local_path: &Path,
        token: &str,
    ) -> Result<()> {
        let mut delay = Duration::from_secs(2);
        let mut last_err = None;

        for attempt in 1..=MAX_RETRIES {
            match self
                .download_file(client, repo, remote_path, local_path, token)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e @ (Error::AuthFailed | Error::MissingRemoteFile(_))) => return Err(e),
                Err(e) => {
                    if attempt < MAX_RETRIES {
                        tracing::warn!(
                            "Download attempt {}/{} failed for {}: {}. Retrying in {:?}...",
                            attempt,
                            MAX_RETRIES,
                            remote_path,
                            e,
                            delay
                        );
                        self.publish(
                            ProgressStatus::Retrying,
                            Some(remote_path.to_string()),
                            0,
                            0,
                            format!(
                                "Retrying {} (attempt {}/{})...",
                                remote_path,
                                attempt + 1,
                                MAX_RETRIES
                            ),
                        );
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(MAX_BACKOFF);
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            Error::Internal(format!("Failed to download {}", remote_path))
        }))
    }

    async fn download_file(
        &self,
        client: &reqwest::Client,
        repo: &str,
        remote_path: &str,
        local_path: &Path,
        token: &str,
    ) -> Result<()> {
        // Skip files that are already present with content.
        if let Ok(meta) = std::fs::metadata(local_path) {
            if meta.len() > 0 {
                tracing::info!(
                    "File already exists ({} bytes), skipping: {:?}",
                    meta.len(),
                    local_path.file_name()
                );
                self.publish(
                    ProgressStatus::Skipped,
                    Some(remote_path.to_string()),
                    meta.len(),
                    meta.len(),
                    format!("Already downloaded: {}", file_name(local_path)),
                );
                return Ok(());
            }
        }

        let url = format!("{}/{}/resolve/main/{}", RESOLVE_BASE_URL, repo, remote_path);
        tracing::info!("Downloading {} -> {:?}", url, local_path);

        let resp = client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("Request failed: {}", e)))?;

        match resp.status().as_u16() {
            401 => return Err(Error::AuthFailed),
            404 => return Err(Error::MissingRemoteFile(remote_path.to_string())),
            code if !resp.status().is_success() => {
                return Err(Error::Internal(format!(
                    "Unexpected HTTP response {} for: {}",
                    code, remote_path
                )));
            }
            _ => {}
        }

        let total_bytes = resp.content_length().unwrap_or(0);
        let name = file_name(local_path);
        self.publish(
            ProgressStatus::Downloading,
            Some(remote_path.to_string()),
            0,
            total_bytes,
            format!("Downloading {}...", name),
        );

        // Stream to a temp sibling, hashing as we go, then rename into place.
        let temp_path = local_path.with_file_name(format!("{}.tmp", name));
        let result = self
            .stream_to_file(resp, &temp_path, remote_path, &name, total_bytes)
            .await;
        if let Err(e) = result {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }

        std::fs::rename(&temp_path, local_path)?;

        let final_size = std::fs::metadata(local_path).map(|m| m.len()).unwrap_or(0);
        self.publish(
            ProgressStatus::FileComplete,
            Some(remote_path.to_string()),
            final_size,
            final_size,
            format!("Completed: {}", name),
        );
        Ok(())
    }

    async fn stream_to_file(
        &self,
        resp: reqwest::Response,
        temp_path: &Path,
        remote_path: &str,
        name: &str,
        total_bytes: u64,
    ) -> Result<()> {
        use std::io::Write;

        let mut out = std::fs::File::create(temp_path)?;
        let mut hasher = Sha256::new();
        let mut buffer: Vec<u8> = Vec::with_capacity(BUFFER_SIZE);
        let mut bytes_read: u64 = 0;
        let mut last_reported: u64 = 0;

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Internal(format!("Stream error: {}", e)))?;
            buffer.extend_from_slice(&chunk);
            bytes_read += chunk.len() as u64;

            if buffer.len() >= BUFFER_SIZE {
                hasher.update(&buffer);
                out.write_all(&buffer)?;
                buffer.clear();
            }

            if bytes_read - last_reported >= PROGRESS_INTERVAL
                || (total_bytes > 0 && bytes_read == total_bytes)
            {
                self.publish(
                    ProgressStatus::Downloading,
                    Some(remote_path.to_string()),
                    bytes_read,
                    total_bytes,
                    name.to_string(),
                );
                last_reported = bytes_read;
            }
        }
        if !buffer.is_empty() {
            hasher.update(&buffer);
            out.write_all(&buffer)?;
        }
        out.flush()?;

        if total_bytes > 0 && bytes_read != total_bytes {
            return Err(Error::Internal(format!(
                "Download incomplete: expected {} bytes but got {}",
                total_bytes, bytes_read
            )));
        }

        tracing::info!(
            "Downloaded {} ({} bytes, SHA-256: {})",
            name,
            bytes_read,
            hex::encode(hasher.finalize())
        );
        Ok(())
    }

    /// Decrypts the stored credential, if any. A credential sealed on a
    /// different host surfaces as a distinct decrypt failure.
    pub fn stored_token(&self) -> Result<Option<String>> {
        match self.db.get_setting(keys::HF_TOKEN)? {
            Some(sealed) => self.vault.decrypt(&sealed).map(Some),
            None => Ok(None),
        }
    }

    /// Seals and stores a credential.
    pub fn store_token(&self, plain: &str) -> Result<()> {
        if plain.trim().is_empty() {
            return Err(Error::InvalidInput("Token cannot be empty".to_string()));
        }
        let sealed = self.vault.encrypt(plain)?;
        self.db.set_setting(keys::HF_TOKEN, &sealed)?;
        tracing::info!("Access token saved (encrypted)");
        Ok(())
    }

    pub fn clear_token(&self) -> Result<()> {
        self.db.delete_setting(keys::HF_TOKEN)?;
        tracing::info!("Access token cleared");
        Ok(())
    }

    pub fn has_token(&self) -> bool {
        self.db.has_setting(keys::HF_TOKEN).unwrap_or(false)
    }

    /// Reports the on-disk model file state plus inference readiness.
    pub fn status(&self) -> ModelStatusReport {
        let mut files = Vec::with_capacity(MODEL_FILES.len());
        let mut present = 0usize;

        if self.is_running() {
            return ModelStatusReport {
                status: ModelState::Downloading,
                message: "Download in progress...".to_string(),
                files,
            };
        }

        for (_, local_name, display) in MODEL_FILES {
            let path = self.model_dir.join(local_name);
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let exists = path.exists();
            if exists {
                present += 1;
            }
            files.push(ModelFileInfo {
                name: display.to_string(),
                exists,
                size_bytes: size,
                path: path.to_string_lossy().to_string(),
            });
        }

        let (status, message) = if present == 0 {
            (
                ModelState::NotDownloaded,
                "No model files found. Please enter an access token and start the download."
                    .to_string(),
            )
        } else if present < MODEL_FILES.len() {
            (
                ModelState::Partial,
                "Some model files are missing. Please re-run the download.".to_string(),
            )
        } else if self.embedder.is_ready() {
            (
                ModelState::Ready,
                "All models loaded and ready for inference.".to_string(),
            )
        } else if let Some(err) = self.last_error.lock().clone() {
            (ModelState::Error, format!("Error: {}", err))
        } else {
            (
                ModelState::Partial,
                "Model files present but not loaded. Restart may be needed.".to_string(),
            )
        };

        ModelStatusReport {
            status,
            message,
            files,
        }
    }

    /// Loads the models from disk if all three files are already present.
    /// Used at startup so a prior download survives restarts.
    pub fn try_load_existing(&self) {
        let all_present = MODEL_FILES.iter().all(|(_, local, _)| {
            std::fs::metadata(self.model_dir.join(local))
                .map(|m| m.len() > 0)
                .unwrap_or(false)
        });
        if !all_present {
            tracing::info!(
                "Encoder models not found at {:?}. Use settings to download them.",
                self.model_dir
            );
            return;
        }
        if let Err(e) = self.embedder.load_models(
            &self.model_dir.join("vision_model.onnx"),
            &self.model_dir.join("text_model.onnx"),
            &self.model_dir.join("tokenizer.json"),
        ) {
            tracing::error!("Failed to load encoder models at startup: {}", e);
        }
    }

    fn publish(
        &self,
        status: ProgressStatus,
        file: Option<String>,
        bytes_downloaded: u64,
        total_bytes: u64,
        message: String,
    ) {
        // No subscribers is fine; events are not buffered for later joiners.
        let _ = self.progress.send(ProgressEvent {
            status,
            file,
            bytes_downloaded,
            total_bytes,
            message,
        });
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher(dir: &Path) -> Arc<ModelFetcher> {
        let db = Arc::new(Database::open(&dir.join("t.db")).unwrap());
        Arc::new(ModelFetcher::new(
            dir.join("models"),
            "example/clip".to_string(),
            db,
            Arc::new(EmbeddingService::new()),
        ))
    }

    #[test]
    fn test_status_reports_missing_then_partial() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fetcher(tmp.path());
        assert_eq!(f.status().status, ModelState::NotDownloaded);

        std::fs::create_dir_all(tmp.path().join("models")).unwrap();
        std::fs::write(tmp.path().join("models/tokenizer.json"), b"{}").unwrap();
        let report = f.status();
        assert_eq!(report.status, ModelState::Partial);
        assert_eq!(report.files.len(), 3);
        assert_eq!(report.files.iter().filter(|f| f.exists).count(), 1);
    }

    #[test]
    fn test_token_seal_unseal_and_clear() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fetcher(tmp.path());
        assert!(!f.has_token());
        assert!(f.stored_token().unwrap().is_none());

        f.store_token("hf_test_token").unwrap();
        assert!(f.has_token());
        assert_eq!(f.stored_token().unwrap().as_deref(), Some("hf_test_token"));
        // The stored value is sealed, not plaintext.
        let raw = f.db.get_setting(keys::HF_TOKEN).unwrap().unwrap();
        assert!(!raw.contains("hf_test_token"));

        f.clear_token().unwrap();
        assert!(!f.has_token());
    }

    #[test]
    fn test_empty_token_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fetcher(tmp.path());
        assert!(matches!(f.store_token("  "), Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_second_start_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fetcher(tmp.path());
        f.downloading.store(true, Ordering::SeqCst);
        assert!(matches!(f.start(None), Err(Error::Conflict(_))));
    }

    #[test]
    fn test_progress_event_serializes_kebab_case() {
        let event = ProgressEvent {
            status: ProgressStatus::FileComplete,
            file: Some("onnx/vision_model.onnx".to_string()),
            bytes_downloaded: 10,
            total_bytes: 10,
            message: "done".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "file-complete");
        assert_eq!(json["bytesDownloaded"], 10);
    }
}

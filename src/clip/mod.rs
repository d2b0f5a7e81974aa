//! CLIP embedding service.
//!
//! Wraps the two ONNX encoder sessions (vision + text) and the BPE
//! tokenizer, turning image files and query strings into unit-norm
//! embeddings. The output dimension is whatever the loaded models produce
//! (512 for the reference checkpoints).
//!
//! Both sessions live behind one mutex: inference is single-threaded by
//! configuration, and `load_models` replaces the pair atomically without
//! racing an in-flight inference call.

pub mod preprocess;
pub mod tokenizer;

use std::path::Path;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::vecmath::l2_normalize;
use tokenizer::{ClipTokenizer, MAX_LENGTH};

struct ClipSessions {
    visual: ort::session::Session,
    text: ort::session::Session,
    tokenizer: ClipTokenizer,
}

/// Owns the encoder sessions; everything else borrows this service.
pub struct EmbeddingService {
    sessions: Mutex<Option<ClipSessions>>,
}

impl EmbeddingService {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(None),
        }
    }

    /// Loads (or reloads) both encoder sessions and the tokenizer.
    ///
    /// Idempotent: an existing pair is dropped and replaced under the lock,
    /// so no inference call ever observes a half-loaded state.
    pub fn load_models(
        &self,
        visual_path: &Path,
        text_path: &Path,
        tokenizer_path: &Path,
    ) -> Result<()> {
        tracing::info!("Loading encoder models...");

        let visual = load_session(visual_path)?;
        tracing::info!("Visual encoder loaded: {:?}", visual_path.file_name());

        let text = load_session(text_path)?;
        tracing::info!("Text encoder loaded: {:?}", text_path.file_name());

        let tokenizer = ClipTokenizer::load(tokenizer_path)?;

        *self.sessions.lock() = Some(ClipSessions {
            visual,
            text,
            tokenizer,
        });
        tracing::info!("Encoder models and tokenizer ready");
        Ok(())
    }

    /// True once both sessions and the tokenizer are loaded.
    pub fn is_ready(&self) -> bool {
        self.sessions.lock().is_some()
    }

    /// Computes a unit-norm image embedding, or `None` if the models are
    /// not loaded or the image cannot be processed. Failures are logged,
    /// never propagated — a bad file must not take down ingestion.
    pub fn embed_image(&self, path: &Path) -> Option<Vec<f32>> {
        let mut guard = self.sessions.lock();
        let Some(sessions) = guard.as_mut() else {
            tracing::warn!("Cannot embed image — encoder models not loaded");
            return None;
        };

        let img = match image::open(path) {
            Ok(img) => img,
            Err(e) => {
                tracing::warn!("Could not read image {:?}: {}", path, e);
                return None;
            }
        };
        let pixels = preprocess::image_to_tensor(&img);

        let result: std::result::Result<Vec<f32>, String> = (|| {
            let tensor = ort::value::Tensor::from_array(pixels)
                .map_err(|e| format!("pixel_values tensor error: {}", e))?;
            let outputs = sessions
                .visual
                .run(ort::inputs!["pixel_values" => tensor])
                .map_err(|e| format!("inference failed: {}", e))?;

            let output = outputs
                .get("image_embeds")
                .ok_or("model has no 'image_embeds' output")?;
            let (shape, data) = output
                .try_extract_tensor::<f32>()
                .map_err(|e| format!("failed to extract output tensor: {}", e))?;
            let dim = shape.last().copied().unwrap_or(0) as usize;
            embedding_row(dim, data)
        })();

        match result {
            Ok(vec) => Some(vec),
            Err(e) => {
                tracing::error!("Failed to embed image {:?}: {}", path, e);
                None
            }
        }
    }

    /// Computes a unit-norm text embedding, or `None` for empty input or
    /// when the models are not loaded.
    pub fn embed_text(&self, text: &str) -> Option<Vec<f32>> {
        if text.trim().is_empty() {
            return None;
        }
        let mut guard = self.sessions.lock();
        let Some(sessions) = guard.as_mut() else {
            tracing::warn!("Cannot embed text — encoder models not loaded");
            return None;
        };

        let tokens = sessions.tokenizer.tokenize(text);

        let result: std::result::Result<Vec<f32>, String> = (|| {
            let input_ids = ndarray::Array2::from_shape_vec((1, MAX_LENGTH), tokens.input_ids)
                .map_err(|e| format!("input_ids shape error: {}", e))?;
            let tensor = ort::value::Tensor::from_array(input_ids)
                .map_err(|e| format!("input_ids tensor error: {}", e))?;
            let outputs = sessions
                .text
                .run(ort::inputs!["input_ids" => tensor])
                .map_err(|e| format!("inference failed: {}", e))?;

            let output = outputs
                .get("text_embeds")
                .ok_or("model has no 'text_embeds' output")?;
            let (shape, data) = output
                .try_extract_tensor::<f32>()
                .map_err(|e| format!("failed to extract output tensor: {}", e))?;
            let dim = shape.last().copied().unwrap_or(0) as usize;
            embedding_row(dim, data)
        })();

        match result {
            Ok(vec) => Some(vec),
            Err(e) => {
                tracing::error!("Failed to embed text '{}': {}", text, e);
                None
            }
        }
    }
}

impl Default for EmbeddingService {
    fn default() -> Self {
        Self::new()
    }
}

fn load_session(path: &Path) -> Result<ort::session::Session> {
    let threads = std::thread::available_parallelism()
        .map(|n| (n.get() / 2).max(1))
        .unwrap_or(1);
    ort::session::Session::builder()
        .map_err(|e| Error::Internal(format!("Failed to create session builder: {}", e)))?
        .with_intra_threads(threads)
        .map_err(|e| Error::Internal(format!("Failed to set threads: {}", e)))?
        .commit_from_file(path)
        .map_err(|e| Error::Internal(format!("Failed to load model {:?}: {}", path, e)))
}

/// First row of a `[1, D]` output, L2-normalized.
fn embedding_row(dim: usize, data: &[f32]) -> std::result::Result<Vec<f32>, String> {
    if dim == 0 || data.len() < dim {
        return Err(format!("unexpected output size {} (dim {})", data.len(), dim));
    }
    let mut embedding = data[..dim].to_vec();
    l2_normalize(&mut embedding);
    Ok(embedding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_before_load() {
        let svc = EmbeddingService::new();
        assert!(!svc.is_ready());
        assert!(svc.embed_text("anything").is_none());
        assert!(svc.embed_image(Path::new("/nope.jpg")).is_none());
    }

    #[test]
    fn test_empty_text_is_none_even_when_loaded() {
        // Empty input short-circuits before touching the sessions.
        let svc = EmbeddingService::new();
        assert!(svc.embed_text("").is_none());
        assert!(svc.embed_text("   ").is_none());
    }

    #[test]
    fn test_load_models_rejects_missing_files() {
        let svc = EmbeddingService::new();
        let err = svc.load_models(
            Path::new("/missing/vision.onnx"),
            Path::new("/missing/text.onnx"),
            Path::new("/missing/tokenizer.json"),
        );
        assert!(err.is_err());
        assert!(!svc.is_ready());
    }

    #[test]
    fn test_embedding_row_normalizes() {
        let row = embedding_row(3, &[3.0, 0.0, 4.0]).unwrap();
        let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(embedding_row(0, &[]).is_err());
        assert!(embedding_row(4, &[1.0]).is_err());
    }
}

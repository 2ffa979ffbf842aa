//! fastembed-backed [`Embedder`](super::Embedder) implementation.
//!
//! Grounded on `embeddings/local.rs`: lazy global model init behind a
//! `OnceLock`, `directories`-resolved cache directory, batch embedding, and
//! optional Matryoshka truncation. Generalized to the async + retry-with-
//! backoff contract this component's spec requires (the teacher's version
//! is synchronous and does not retry).

use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use crate::graph::SimilarityMetric;

use super::{retry_with_backoff, Embedder, EmbedderError};

/// Maximum input length per text before truncation.
pub const MAX_TEXT_LENGTH: usize = 8192;

/// Batch size used when embedding multiple texts in one model call.
pub const BATCH_SIZE: usize = 32;

static MODEL: OnceLock<Result<Mutex<TextEmbedding>, String>> = OnceLock::new();

fn cache_dir() -> std::path::PathBuf {
    if let Ok(path) = std::env::var("MEMEX_EMBEDDING_CACHE_PATH") {
        return std::path::PathBuf::from(path);
    }
    if let Some(proj_dirs) = directories::ProjectDirs::from("dev", "memex", "core") {
        return proj_dirs.cache_dir().join("fastembed");
    }
    if let Some(base_dirs) = directories::BaseDirs::new() {
        return base_dirs.home_dir().join(".cache/memex/fastembed");
    }
    std::path::PathBuf::from(".fastembed_cache")
}

fn model(model_name: EmbeddingModel) -> Result<std::sync::MutexGuard<'static, TextEmbedding>, EmbedderError> {
    let result = MODEL.get_or_init(|| {
        let dir = cache_dir();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(?dir, error = %e, "failed to create embedding cache directory");
        }
        let options = InitOptions::new(model_name).with_cache_dir(dir);
        TextEmbedding::try_new(options)
            .map(Mutex::new)
            .map_err(|e| format!("failed to initialize embedding model: {e}"))
    });
    match result {
        Ok(guard) => guard
            .lock()
            .map_err(|e| EmbedderError::ModelInit(format!("lock poisoned: {e}"))),
        Err(e) => Err(EmbedderError::ModelInit(e.clone())),
    }
}

/// Truncate a vector to `dimensions` and L2-renormalize (Matryoshka
/// representation learning: the leading N dims of a larger embedding are
/// themselves a valid N-dim embedding).
pub fn matryoshka_truncate(mut vector: Vec<f32>, dimensions: usize) -> Vec<f32> {
    if vector.len() > dimensions {
        vector.truncate(dimensions);
    }
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut vector {
            *x /= norm;
        }
    }
    vector
}

/// fastembed-backed embedder using Nomic Embed Text v1.5 (768d, 8192-token
/// context, Matryoshka-truncated to `dimensions`).
pub struct FastEmbedEmbedder {
    dimensions: usize,
}

impl FastEmbedEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut model = model(EmbeddingModel::NomicEmbedTextV15)?;
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(BATCH_SIZE) {
            let truncated: Vec<&str> = chunk
                .iter()
                .map(|t| if t.len() > MAX_TEXT_LENGTH { &t[..MAX_TEXT_LENGTH] } else { t.as_str() })
                .collect();
            let embeddings = model
                .embed(truncated, None)
                .map_err(|e| EmbedderError::RequestFailed(e.to_string()))?;
            for emb in embeddings {
                out.push(matryoshka_truncate(emb, self.dimensions));
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Embedder for FastEmbedEmbedder {
    async fn ingest_embed(
        &self,
        inputs: &[String],
        max_attempts: u32,
    ) -> Result<Vec<Vec<f32>>, EmbedderError> {
        let inputs = inputs.to_vec();
        retry_with_backoff(
            max_attempts,
            std::time::Duration::from_millis(200),
            std::time::Duration::from_secs(5),
            || {
                let inputs = inputs.clone();
                async move {
                    let this_dimensions = self.dimensions;
                    tokio::task::spawn_blocking(move || {
                        FastEmbedEmbedder { dimensions: this_dimensions }.embed_texts(&inputs)
                    })
                    .await
                    .map_err(|e| EmbedderError::RequestFailed(e.to_string()))?
                }
            },
        )
        .await
    }

    async fn search_embed(
        &self,
        queries: &[String],
        max_attempts: u32,
    ) -> Result<Vec<Vec<f32>>, EmbedderError> {
        // Nomic's instruction-tuned variants distinguish document/query
        // prefixes; v1.5 does not require one, so this delegates directly.
        self.ingest_embed(queries, max_attempts).await
    }

    fn model_id(&self) -> &str {
        "nomic-ai/nomic-embed-text-v1.5"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn similarity_metric(&self) -> SimilarityMetric {
        SimilarityMetric::Cosine
    }
}

//! Embedder: turns text into vectors for similarity search.
//!
//! Trait grounded verbatim on the original's `Embedder` abstract base class
//! (`ingest_embed`/`search_embed`, `model_id`/`dimensions`/`similarity_metric`
//! properties); concrete implementation in [`fastembed_embedder`] generalizes
//! the teacher's synchronous, non-retrying `embeddings/local.rs` to the
//! async, retry-with-backoff contract this component's spec calls for.

#[cfg(feature = "embeddings")]
pub mod fastembed_embedder;

use async_trait::async_trait;

use crate::graph::SimilarityMetric;

#[cfg(feature = "embeddings")]
pub use fastembed_embedder::FastEmbedEmbedder;

/// Error surface for [`Embedder`] implementations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EmbedderError {
    #[error("model initialization failed: {0}")]
    ModelInit(String),

    #[error("embedding request failed: {0}")]
    RequestFailed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("exhausted {attempts} attempt(s): {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl EmbedderError {
    /// Transient failures (anything that looks like a request/model hiccup,
    /// not a caller mistake) are retryable; `InvalidInput` never is.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, EmbedderError::InvalidInput(_))
    }
}

/// Converts text into dense vectors for ingestion and query-time search.
///
/// The original keeps `ingest_embed` and `search_embed` as distinct methods
/// because some embedding models use different instruction prefixes for
/// documents vs. queries (e.g. Nomic's `search_document:`/`search_query:`).
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed content being stored (episodes, derivatives).
    async fn ingest_embed(
        &self,
        inputs: &[String],
        max_attempts: u32,
    ) -> Result<Vec<Vec<f32>>, EmbedderError>;

    /// Embed a query for similarity search.
    async fn search_embed(
        &self,
        queries: &[String],
        max_attempts: u32,
    ) -> Result<Vec<Vec<f32>>, EmbedderError>;

    /// Stable identifier for the embedding model in use, used as part of the
    /// embedding property name so mixing models doesn't silently corrupt an
    /// existing index.
    fn model_id(&self) -> &str;

    /// Output vector width.
    fn dimensions(&self) -> usize;

    /// Similarity metric the model's vectors were trained/tuned for.
    fn similarity_metric(&self) -> SimilarityMetric;
}

/// Run `f` with exponential backoff, retrying while the error is retryable
/// and attempts remain. Mirrors the retry/backoff prose for C2/C4 external
/// calls: attempt 1 fires immediately, each subsequent attempt waits
/// `base_delay * 2^(attempt-1)`, capped at `max_delay`.
pub async fn retry_with_backoff<T, E, F, Fut>(
    max_attempts: u32,
    base_delay: std::time::Duration,
    max_delay: std::time::Duration,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: RetryableError,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts.max(1) && err.is_retryable() => {
                let delay = base_delay.saturating_mul(1 << (attempt - 1)).min(max_delay);
                tracing::warn!(attempt, ?delay, "retrying after transient error: {err}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Trait implemented by component error types so [`retry_with_backoff`] can
/// classify them without depending on any one concrete error enum.
pub trait RetryableError: std::fmt::Display {
    fn is_retryable(&self) -> bool;
}

impl RetryableError for EmbedderError {
    fn is_retryable(&self) -> bool {
        EmbedderError::is_retryable(self)
    }
}

/// Compute cosine similarity between two vectors.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = (norm_a * norm_b).sqrt();
    if denom > 0.0 { dot / denom } else { 0.0 }
}

/// Compute Euclidean distance between two vectors.
#[inline]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::MAX;
    }
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum::<f32>().sqrt()
}

/// Compute dot product between two vectors.
#[inline]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Compute Manhattan (L1) distance between two vectors.
#[inline]
pub fn manhattan_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::MAX;
    }
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum()
}

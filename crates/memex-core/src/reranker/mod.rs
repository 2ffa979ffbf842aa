//! Reranker: re-scores a candidate set against a query after initial
//! retrieval, the second stage of the two-stage retrieval pipeline.
//!
//! Trait shaped after `search/reranker.rs`'s `Reranker` struct, generalized
//! to an object-safe async trait (candidates keyed by an opaque string id
//! rather than a generic item, so a caller can box heterogeneous rerankers
//! for [`RrfHybridReranker`]) with several interchangeable strategies:
//! passthrough (identity), lexical (BM25-like term overlap, the teacher's
//! fallback scorer), cross-encoder (the teacher's Jina Reranker v1 Turbo
//! path), embedding-based (cosine similarity against a pre-computed query
//! vector), model-hosted (an HTTP cross-encoder endpoint), and an RRF
//! hybrid that fuses rankings from several of the above.

pub mod cross_encoder;
pub mod embedding_based;
pub mod lexical;
pub mod model_hosted;
pub mod rrf_hybrid;

use async_trait::async_trait;

pub use cross_encoder::CrossEncoderReranker;
pub use embedding_based::EmbeddingBasedReranker;
pub use lexical::LexicalReranker;
pub use model_hosted::ModelHostedReranker;
pub use rrf_hybrid::RrfHybridReranker;

/// Error surface for [`Reranker`] implementations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum RerankerError {
    #[error("reranker model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("reranking request failed: {0}")]
    RequestFailed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// A candidate rescored by a [`Reranker`], identified by the opaque key the
/// caller supplied alongside its text.
#[derive(Debug, Clone)]
pub struct RerankedItem {
    pub key: String,
    pub score: f32,
    pub original_rank: usize,
}

/// Re-scores `(key, text)` candidates against `query`, returning them
/// sorted by descending relevance. `key` is caller-defined (typically a
/// node uuid) and is only ever echoed back, never interpreted.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<(String, String)>,
        top_k: Option<usize>,
    ) -> Result<Vec<RerankedItem>, RerankerError>;

    /// Scores every candidate against `query` without truncating or
    /// reordering, returning one score per input candidate in input order.
    /// Default implementation reranks with no `top_k` cap and looks each
    /// candidate's score back up by key; implementations whose scoring is
    /// cheaper without the full sort/truncate path can override this.
    async fn score(
        &self,
        query: &str,
        candidates: Vec<(String, String)>,
    ) -> Result<Vec<f32>, RerankerError> {
        let keys: Vec<String> = candidates.iter().map(|(key, _)| key.clone()).collect();
        let reranked = self.rerank(query, candidates, None).await?;
        let scores: std::collections::HashMap<String, f32> =
            reranked.into_iter().map(|item| (item.key, item.score)).collect();
        Ok(keys.iter().map(|key| scores.get(key).copied().unwrap_or(0.0)).collect())
    }
}

/// Passthrough reranker: preserves retrieval order, truncating to `top_k`.
/// Used as a no-op stage when a caller wants to skip reranking entirely.
pub struct PassthroughReranker;

#[async_trait]
impl Reranker for PassthroughReranker {
    async fn rerank(
        &self,
        _query: &str,
        candidates: Vec<(String, String)>,
        top_k: Option<usize>,
    ) -> Result<Vec<RerankedItem>, RerankerError> {
        let limit = top_k.unwrap_or(candidates.len());
        Ok(candidates
            .into_iter()
            .enumerate()
            .take(limit)
            .map(|(rank, (key, _))| RerankedItem {
                key,
                score: 1.0 - (rank as f32 * 1e-6),
                original_rank: rank,
            })
            .collect())
    }
}

//! Embedding-based reranker: scores each candidate's pre-computed embedding
//! against the query embedding under a configurable metric, grounded on
//! `embeddings/local.rs`'s `cosine_similarity`/`euclidean_distance`/
//! `dot_product` free functions and spec.md §4.3's
//! "embedding-based (cosine/dot/euclidean/manhattan)" reranker.

use async_trait::async_trait;

use crate::embedder::{cosine_similarity, dot_product, euclidean_distance, manhattan_distance};
use crate::graph::SimilarityMetric;

use super::{RerankedItem, Reranker, RerankerError};

/// Reranks candidates by scoring a query embedding supplied by the caller
/// against each candidate's embedding, supplied via the `text` slot encoded
/// as a pipe-separated list of floats, under the configured
/// [`SimilarityMetric`]. Distance metrics (Euclidean, Manhattan) are negated
/// so higher is always better, matching Cosine/DotProduct's ordering.
///
/// Declarative memory, which already has both embeddings in hand at rerank
/// time, calls [`EmbeddingBasedReranker::rerank_embeddings`] directly rather
/// than going through the string-encoded [`Reranker::rerank`] path.
pub struct EmbeddingBasedReranker {
    query_embedding: Vec<f32>,
    metric: SimilarityMetric,
}

impl EmbeddingBasedReranker {
    pub fn new(query_embedding: Vec<f32>) -> Self {
        Self { query_embedding, metric: SimilarityMetric::Cosine }
    }

    pub fn with_metric(mut self, metric: SimilarityMetric) -> Self {
        self.metric = metric;
        self
    }

    fn score(&self, embedding: &[f32]) -> f32 {
        match self.metric {
            SimilarityMetric::Cosine => cosine_similarity(&self.query_embedding, embedding),
            SimilarityMetric::DotProduct => dot_product(&self.query_embedding, embedding),
            SimilarityMetric::Euclidean => -euclidean_distance(&self.query_embedding, embedding),
            SimilarityMetric::Manhattan => -manhattan_distance(&self.query_embedding, embedding),
        }
    }

    /// Rerank candidates given their embeddings directly, keyed however the
    /// caller likes (declarative memory keys by `Uuid`).
    pub fn rerank_embeddings<T>(
        &self,
        candidates: Vec<(T, Vec<f32>)>,
        top_k: Option<usize>,
    ) -> Vec<(T, f32, usize)> {
        let limit = top_k.unwrap_or(candidates.len());
        let mut results: Vec<(T, f32, usize)> = candidates
            .into_iter()
            .enumerate()
            .map(|(rank, (item, embedding))| (item, self.score(&embedding), rank))
            .collect();
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);
        results
    }

    fn decode(text: &str) -> Vec<f32> {
        text.split('|').filter_map(|v| v.parse().ok()).collect()
    }
}

#[async_trait]
impl Reranker for EmbeddingBasedReranker {
    async fn rerank(
        &self,
        _query: &str,
        candidates: Vec<(String, String)>,
        top_k: Option<usize>,
    ) -> Result<Vec<RerankedItem>, RerankerError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let decoded: Vec<(String, Vec<f32>)> = candidates
            .into_iter()
            .map(|(key, text)| (key, Self::decode(&text)))
            .collect();
        Ok(self
            .rerank_embeddings(decoded, top_k)
            .into_iter()
            .map(|(key, score, original_rank)| RerankedItem { key, score, original_rank })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rerank_embeddings_orders_by_cosine_similarity() {
        let reranker = EmbeddingBasedReranker::new(vec![1.0, 0.0]);
        let candidates = vec![(1, vec![0.0, 1.0]), (2, vec![1.0, 0.0])];
        let results = reranker.rerank_embeddings(candidates, None);
        assert_eq!(results[0].0, 2);
    }

    #[test]
    fn rerank_embeddings_honors_manhattan_metric() {
        let reranker =
            EmbeddingBasedReranker::new(vec![0.0, 0.0]).with_metric(SimilarityMetric::Manhattan);
        let candidates = vec![(1, vec![5.0, 5.0]), (2, vec![1.0, 1.0])];
        let results = reranker.rerank_embeddings(candidates, None);
        assert_eq!(results[0].0, 2);
    }
}

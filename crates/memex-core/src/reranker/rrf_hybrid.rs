//! N-way Reciprocal Rank Fusion reranker, generalizing `search/hybrid.rs`'s
//! `reciprocal_rank_fusion` (which fuses exactly two named lists: keyword
//! and semantic) to an arbitrary list of sub-rerankers.

use std::collections::HashMap;

use async_trait::async_trait;

use super::{RerankedItem, Reranker, RerankerError};

/// Default RRF fusion constant, matching `search/hybrid.rs`'s `rrf_k`.
pub const DEFAULT_RRF_K: f32 = 60.0;

/// Fuses the rankings produced by several sub-rerankers via RRF:
/// `score(candidate) = sum over sub-rerankers of 1 / (k + rank_in_that_ranking)`.
pub struct RrfHybridReranker {
    sub_rerankers: Vec<Box<dyn Reranker>>,
    k: f32,
}

impl RrfHybridReranker {
    pub fn new(sub_rerankers: Vec<Box<dyn Reranker>>) -> Self {
        Self { sub_rerankers, k: DEFAULT_RRF_K }
    }

    pub fn with_k(mut self, k: f32) -> Self {
        self.k = k;
        self
    }
}

#[async_trait]
impl Reranker for RrfHybridReranker {
    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<(String, String)>,
        top_k: Option<usize>,
    ) -> Result<Vec<RerankedItem>, RerankerError> {
        if self.sub_rerankers.is_empty() {
            return Err(RerankerError::InvalidInput(
                "RRF hybrid reranker needs at least one sub-reranker".to_string(),
            ));
        }
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut fused_scores: HashMap<String, f32> = HashMap::new();
        for sub in &self.sub_rerankers {
            let ranking = sub.rerank(query, candidates.clone(), None).await?;
            for (rank, entry) in ranking.into_iter().enumerate() {
                *fused_scores.entry(entry.key).or_insert(0.0) += 1.0 / (self.k + rank as f32);
            }
        }

        let mut fused: Vec<(String, f32)> = fused_scores.into_iter().collect();
        fused.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let limit = top_k.unwrap_or(fused.len());
        Ok(fused
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(rank, (key, score))| RerankedItem { key, score, original_rank: rank })
            .collect())
    }
}

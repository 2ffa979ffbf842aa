//! BM25-like lexical reranker, grounded verbatim on
//! `search/reranker.rs`'s fallback `compute_relevance_score` (hardcoded
//! `k1=1.2`, `b=0.75`, `avg_doc_len=500.0`).

use async_trait::async_trait;

use super::{RerankedItem, Reranker, RerankerError};

const K1: f32 = 1.2;
const B: f32 = 0.75;
const AVG_DOC_LEN: f32 = 500.0;

/// Scores candidates by BM25-like term-frequency overlap with the query.
/// Needs no model weights, used as the cross-encoder's fallback and as a
/// standalone reranker when only lexical signal is wanted.
pub struct LexicalReranker;

impl LexicalReranker {
    fn score(query: &str, document: &str) -> f32 {
        let doc_len = document.len() as f32;
        if doc_len == 0.0 {
            return 0.0;
        }
        let query_lower = query.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();
        let doc_lower = document.to_lowercase();

        let mut score = 0.0;
        for term in &terms {
            let tf = doc_lower.matches(term).count() as f32;
            if tf > 0.0 {
                let numerator = tf * (K1 + 1.0);
                let denominator = tf + K1 * (1.0 - B + B * (doc_len / AVG_DOC_LEN));
                score += numerator / denominator;
            }
        }
        if !terms.is_empty() {
            score /= terms.len() as f32;
        }
        score
    }
}

#[async_trait]
impl Reranker for LexicalReranker {
    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<(String, String)>,
        top_k: Option<usize>,
    ) -> Result<Vec<RerankedItem>, RerankerError> {
        if query.is_empty() {
            return Err(RerankerError::InvalidInput("query cannot be empty".to_string()));
        }
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let limit = top_k.unwrap_or(candidates.len());
        let mut results: Vec<RerankedItem> = candidates
            .into_iter()
            .enumerate()
            .map(|(rank, (key, text))| RerankedItem {
                key,
                score: Self::score(query, &text),
                original_rank: rank,
            })
            .collect();
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ranks_term_overlap_above_unrelated_text() {
        let reranker = LexicalReranker;
        let candidates = vec![
            ("1".to_string(), "the quick brown fox".to_string()),
            ("2".to_string(), "a lazy dog sleeps".to_string()),
            ("3".to_string(), "the fox jumps over".to_string()),
        ];
        let results = reranker.rerank("fox", candidates, Some(2)).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].key == "1" || results[0].key == "3");
    }

    #[tokio::test]
    async fn empty_query_is_an_error() {
        let reranker = LexicalReranker;
        let candidates = vec![("1".to_string(), "text".to_string())];
        assert!(reranker.rerank("", candidates, None).await.is_err());
    }
}

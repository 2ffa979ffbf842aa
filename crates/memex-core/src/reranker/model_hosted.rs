//! HTTP-hosted cross-encoder reranker: delegates scoring to a remote model
//! endpoint, following the call shape spec'd for the HTTP-backed language
//! model adapter (`reqwest` JSON request/response, retry-with-backoff).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::embedder::retry_with_backoff;

use super::{RerankedItem, Reranker, RerankerError};

impl crate::embedder::RetryableError for RerankerError {
    fn is_retryable(&self) -> bool {
        matches!(self, RerankerError::RequestFailed(_))
    }
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    documents: &'a [String],
}

#[derive(Deserialize)]
struct RerankResponseItem {
    index: usize,
    score: f32,
}

/// Calls a remote cross-encoder reranking endpoint (e.g. a self-hosted Jina
/// or Cohere-compatible reranker) over HTTP.
pub struct ModelHostedReranker {
    client: reqwest::Client,
    endpoint: String,
    max_attempts: u32,
}

impl ModelHostedReranker {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            max_attempts: 3,
        }
    }

    async fn call(&self, query: &str, documents: &[String]) -> Result<Vec<RerankResponseItem>, RerankerError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&RerankRequest { query, documents })
            .send()
            .await
            .map_err(|e| RerankerError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RerankerError::RequestFailed(format!(
                "reranker endpoint returned {}",
                response.status()
            )));
        }

        response
            .json::<Vec<RerankResponseItem>>()
            .await
            .map_err(|e| RerankerError::RequestFailed(e.to_string()))
    }
}

#[async_trait]
impl Reranker for ModelHostedReranker {
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

        let documents: Vec<String> = candidates.iter().map(|(_, text)| text.clone()).collect();
        let scored = retry_with_backoff(
            self.max_attempts,
            std::time::Duration::from_millis(200),
            std::time::Duration::from_secs(5),
            || self.call(query, &documents),
        )
        .await?;

        let mut slots: Vec<Option<String>> = candidates.into_iter().map(|(key, _)| Some(key)).collect();
        let limit = top_k.unwrap_or(slots.len());
        let mut out = Vec::with_capacity(limit.min(scored.len()));
        for entry in scored {
            if out.len() >= limit {
                break;
            }
            if let Some(slot) = slots.get_mut(entry.index) {
                if let Some(key) = slot.take() {
                    out.push(RerankedItem {
                        key,
                        score: entry.score,
                        original_rank: entry.index,
                    });
                }
            }
        }
        Ok(out)
    }
}

//! Cross-encoder reranker, grounded on `search/reranker.rs`'s lazily-loaded
//! Jina Reranker v1 Turbo path, falling back to [`LexicalReranker`] when the
//! model is unavailable or errors on a given call.

use async_trait::async_trait;

#[cfg(feature = "cross-encoder")]
use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
#[cfg(feature = "cross-encoder")]
use std::sync::Mutex;

use super::{lexical::LexicalReranker, RerankedItem, Reranker, RerankerError};

/// Neural cross-encoder reranker. Construction is cheap and does not load
/// the model; call [`CrossEncoderReranker::init`] once at startup to load
/// it, matching the teacher's "don't load in tests or hot paths" note.
pub struct CrossEncoderReranker {
    #[cfg(feature = "cross-encoder")]
    model: Mutex<Option<TextRerank>>,
    fallback: LexicalReranker,
}

impl Default for CrossEncoderReranker {
    fn default() -> Self {
        Self::new()
    }
}

impl CrossEncoderReranker {
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "cross-encoder")]
            model: Mutex::new(None),
            fallback: LexicalReranker,
        }
    }

    /// Load the cross-encoder model. Downloads on first call.
    #[cfg(feature = "cross-encoder")]
    pub fn init(&self) {
        let mut guard = self.model.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let options = RerankInitOptions::new(RerankerModel::JINARerankerV1TurboEn);
        match TextRerank::try_new(options) {
            Ok(model) => {
                tracing::info!("cross-encoder reranker loaded");
                *guard = Some(model);
            }
            Err(e) => {
                tracing::warn!(error = %e, "cross-encoder unavailable, using lexical fallback");
            }
        }
    }

    #[cfg(not(feature = "cross-encoder"))]
    pub fn init(&self) {}

    pub fn has_model(&self) -> bool {
        #[cfg(feature = "cross-encoder")]
        {
            self.model.lock().unwrap().is_some()
        }
        #[cfg(not(feature = "cross-encoder"))]
        {
            false
        }
    }
}

#[async_trait]
impl Reranker for CrossEncoderReranker {
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

        #[cfg(feature = "cross-encoder")]
        let candidates = {
            let mut guard = self.model.lock().unwrap();
            if guard.is_some() {
                let model = guard.as_mut().unwrap();
                let mut slots: Vec<Option<(String, String)>> = candidates.into_iter().map(Some).collect();
                let documents: Vec<&str> =
                    slots.iter().map(|slot| slot.as_ref().unwrap().1.as_str()).collect();
                let rerank_outcome = model.rerank(query, &documents, false, None);

                if let Ok(rerank_results) = rerank_outcome {
                    let limit = top_k.unwrap_or(slots.len());
                    let mut out = Vec::with_capacity(limit.min(rerank_results.len()));
                    for rr in rerank_results {
                        if out.len() >= limit {
                            break;
                        }
                        if let Some(slot) = slots.get_mut(rr.index) {
                            if let Some((key, _text)) = slot.take() {
                                out.push(RerankedItem {
                                    key,
                                    score: rr.score,
                                    original_rank: rr.index,
                                });
                            }
                        }
                    }
                    drop(guard);
                    return Ok(out);
                }
                // Cross-encoder errored on this call; recover the candidates
                // and fall through to the lexical fallback below.
                drop(guard);
                slots.into_iter().flatten().collect()
            } else {
                drop(guard);
                candidates
            }
        };

        #[cfg(not(feature = "cross-encoder"))]
        let candidates = candidates;

        self.fallback.rerank(query, candidates, top_k).await
    }
}

//! Derivative derivers: turn an [`EpisodeCluster`] into one or more
//! [`Derivative`]s before mutation and embedding.
//!
//! Grounded on `derivative_deriver/derivative_deriver.py` (abstract base),
//! `identity_derivative_deriver.py`, `concatenation_derivative_deriver.py`,
//! and `sentence_derivative_deriver.py`.

use async_trait::async_trait;
use uuid::Uuid;

use crate::types::{ContentType, Derivative, EpisodeCluster};

/// Error surface for [`DerivativeDeriver`] implementations. Deriving is pure
/// data transformation, so implementations in this crate never fail, but the
/// trait still returns a `Result` so future implementations (e.g. one
/// calling out to a language model) can report failure uniformly.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum DeriverError {
    #[error("{0}")]
    Other(String),
}

/// Produces derivatives from an episode cluster. Mirrors the original's
/// `DerivativeDeriver` abstract base.
#[async_trait]
pub trait DerivativeDeriver: Send + Sync {
    async fn derive(&self, cluster: &EpisodeCluster) -> Result<Vec<Derivative>, DeriverError>;
}

/// One derivative per episode in the cluster, fields copied 1:1. Matches
/// `IdentityDerivativeDeriver`.
pub struct IdentityDeriver {
    derivative_type: String,
}

impl IdentityDeriver {
    pub fn new() -> Self {
        Self { derivative_type: "identity".to_string() }
    }

    pub fn with_derivative_type(mut self, derivative_type: impl Into<String>) -> Self {
        self.derivative_type = derivative_type.into();
        self
    }
}

impl Default for IdentityDeriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DerivativeDeriver for IdentityDeriver {
    async fn derive(&self, cluster: &EpisodeCluster) -> Result<Vec<Derivative>, DeriverError> {
        Ok(cluster
            .episodes
            .iter()
            .map(|episode| Derivative {
                uuid: Uuid::new_v4(),
                derivative_type: self.derivative_type.clone(),
                content: episode.content.clone(),
                content_type: episode.content_type,
                timestamp: episode.timestamp,
                filterable_properties: episode.filterable_properties.clone(),
                user_metadata: episode.user_metadata.clone(),
            })
            .collect())
    }
}

/// A single derivative joining every episode's content with a separator,
/// carrying the cluster's own fields. Matches
/// `ConcatenationDerivativeDeriver`.
pub struct ConcatenationDeriver {
    derivative_type: String,
    separator: String,
}

impl ConcatenationDeriver {
    pub fn new() -> Self {
        Self { derivative_type: "concatenation".to_string(), separator: "\n".to_string() }
    }

    pub fn with_derivative_type(mut self, derivative_type: impl Into<String>) -> Self {
        self.derivative_type = derivative_type.into();
        self
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }
}

impl Default for ConcatenationDeriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DerivativeDeriver for ConcatenationDeriver {
    async fn derive(&self, cluster: &EpisodeCluster) -> Result<Vec<Derivative>, DeriverError> {
        let content = cluster
            .episodes
            .iter()
            .map(|episode| episode.content.as_str())
            .collect::<Vec<_>>()
            .join(&self.separator);

        Ok(vec![Derivative {
            uuid: Uuid::new_v4(),
            derivative_type: self.derivative_type.clone(),
            content,
            content_type: ContentType::String,
            timestamp: cluster.timestamp,
            filterable_properties: cluster.filterable_properties.clone(),
            user_metadata: cluster.user_metadata.clone(),
        }])
    }
}

/// One derivative per sentence per episode, fields copied from the
/// originating episode. Matches `SentenceDerivativeDeriver`, with sentence
/// boundaries detected by a punctuation-based heuristic rather than NLTK's
/// `sent_tokenize` (no equivalent sentence tokenizer crate is available in
/// this dependency stack).
pub struct SentenceDeriver {
    derivative_type: String,
}

impl SentenceDeriver {
    pub fn new() -> Self {
        Self { derivative_type: "sentence".to_string() }
    }

    pub fn with_derivative_type(mut self, derivative_type: impl Into<String>) -> Self {
        self.derivative_type = derivative_type.into();
        self
    }
}

impl Default for SentenceDeriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Split text into sentences on `.`/`?`/`!` boundaries, trimming whitespace
/// and dropping empty fragments.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '?' | '!') {
            let trimmed = current.trim().to_string();
            if !trimmed.is_empty() {
                sentences.push(trimmed);
            }
            current.clear();
        }
    }
    let trailing = current.trim().to_string();
    if !trailing.is_empty() {
        sentences.push(trailing);
    }
    sentences
}

#[async_trait]
impl DerivativeDeriver for SentenceDeriver {
    async fn derive(&self, cluster: &EpisodeCluster) -> Result<Vec<Derivative>, DeriverError> {
        let mut derivatives = Vec::new();
        for episode in &cluster.episodes {
            for line in episode.content.lines() {
                for sentence in split_sentences(line) {
                    derivatives.push(Derivative {
                        uuid: Uuid::new_v4(),
                        derivative_type: self.derivative_type.clone(),
                        content: sentence,
                        content_type: ContentType::String,
                        timestamp: episode.timestamp,
                        filterable_properties: episode.filterable_properties.clone(),
                        user_metadata: episode.user_metadata.clone(),
                    });
                }
            }
        }
        Ok(derivatives)
    }
}

//! Crate-wide error types.
//!
//! Follows the teacher's layering: each component owns a `thiserror` leaf
//! error type, and [`MemoryError`] unifies them for the public C10/C12
//! surface, the way `StorageError` sits underneath higher-level results
//! elsewhere in this crate.

use crate::declarative::DeclarativeMemoryError;
use crate::embedder::EmbedderError;
use crate::graph::GraphStoreError;
use crate::language_model::LanguageModelError;
use crate::reranker::RerankerError as RerankError;
use crate::session_manager::SessionManagerError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Unified error surface returned by [`crate::episodic_memory::EpisodicMemoryInstance`]
/// and [`crate::manager::EpisodicMemoryManager`].
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("graph store error: {0}")]
    Graph(#[from] GraphStoreError),

    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),

    #[error("reranker error: {0}")]
    Reranker(#[from] RerankError),

    #[error("language model error: {0}")]
    LanguageModel(#[from] LanguageModelError),

    #[error("declarative memory error: {0}")]
    DeclarativeMemory(#[from] DeclarativeMemoryError),

    #[error("session manager error: {0}")]
    SessionManager(#[from] SessionManagerError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("context not found: group_id={group_id}, session_id={session_id}")]
    ContextNotFound { group_id: String, session_id: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MemoryError {
    /// Whether retrying the operation that produced this error might
    /// succeed, per the retry policy described for C2/C4 external calls.
    pub fn is_retryable(&self) -> bool {
        match self {
            MemoryError::Embedder(e) => e.is_retryable(),
            MemoryError::LanguageModel(e) => e.is_retryable(),
            MemoryError::Graph(_)
            | MemoryError::Reranker(_)
            | MemoryError::DeclarativeMemory(_)
            | MemoryError::SessionManager(_)
            | MemoryError::Validation(_)
            | MemoryError::ContextNotFound { .. }
            | MemoryError::Config(_)
            | MemoryError::Io(_) => false,
        }
    }
}

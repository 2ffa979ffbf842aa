//! # memex-core
//!
//! A contextual memory engine for conversational AI agents: episodic memory
//! that blends a bounded, summarized short-term session window with a
//! vector-graph-backed long-term store.
//!
//! ## Architecture
//!
//! - [`types`] — the core data model: episodes, clusters, derivatives,
//!   session/context identity.
//! - [`graph`] — the vector-graph storage abstraction ([`graph::VectorGraphStore`])
//!   plus its SQLite + HNSW implementation.
//! - [`embedder`] — turns text into vectors for similarity search.
//! - [`reranker`] — re-scores retrieved candidates against a query.
//! - [`language_model`] — chat-completion abstraction backing session-memory
//!   summarization and derivative rewriting.
//! - [`postulator`] — decides which episodes a new one should be linked to.
//! - [`deriver`] — turns an episode cluster into derivatives.
//! - [`mutator`] — rewrites or augments a derivative before it is embedded.
//! - [`declarative`] — long-term memory: the ingestion and retrieval
//!   pipeline built on the components above.
//! - [`session_memory`] — short-term memory: a bounded rolling window plus
//!   an asynchronously maintained running summary.
//! - [`session_manager`] — relational persistence for groups and sessions.
//! - [`episodic_memory`] — a single conversation's live memory, binding
//!   declarative and session memory together behind a reference-counted
//!   handle.
//! - [`manager`] — the top-level entry point: owns persistence and the
//!   registry of live memory instances.
//!
//! ## Configuration
//!
//! Configuration is a loosely typed YAML tree ([`config`]), following the
//! original's model/vendor/reranker-keyed shape rather than a rigid typed
//! struct per top-level key, since callers pick it apart dynamically to
//! choose concrete component implementations.
//!
//! ## Errors
//!
//! Each component owns a `thiserror` leaf error type; [`error::MemoryError`]
//! unifies them for the public surface exposed by [`episodic_memory`] and
//! [`manager`].
//!
//! ## Feature Flags
//!
//! - `embeddings` (default): local embedding generation via `fastembed`.
//! - `vector-search` (default): HNSW similarity search via `usearch`.
//! - `bundled-sqlite` (default): link an in-tree SQLite instead of the
//!   system library.
//! - `cross-encoder`: enable the local cross-encoder reranker.
//! - `encryption`: at-rest encryption for the graph store.
//! - `metal`: Metal acceleration for local embedding/reranking on macOS.
//! - `full`: every feature above.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod declarative;
pub mod deriver;
pub mod embedder;
pub mod episodic_memory;
pub mod error;
pub mod graph;
pub mod language_model;
pub mod manager;
pub mod mutator;
pub mod postulator;
pub mod reranker;
pub mod session_manager;
pub mod session_memory;
pub mod types;

pub use error::{MemoryError, Result};
pub use episodic_memory::{EpisodicMemoryGuard, EpisodicMemoryInstance, MemoryQueryResult};
pub use manager::{EpisodicMemoryManager, ManagerComponents, ManagerConfigError};
pub use session_manager::SessionManager;
pub use types::{
    ContentType, Derivative, Episode, EpisodeCluster, FilterablePropertyValue, Group,
    GroupConfiguration, MemoryContext, SessionInfo,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Convenient imports for common usage.
pub mod prelude {
    pub use crate::config;
    pub use crate::declarative::DeclarativeMemory;
    pub use crate::embedder::Embedder;
    pub use crate::episodic_memory::{EpisodicMemoryGuard, EpisodicMemoryInstance, MemoryQueryResult};
    pub use crate::graph::{Node, Property, VectorGraphStore};
    pub use crate::language_model::LanguageModel;
    pub use crate::manager::{EpisodicMemoryManager, ManagerComponents};
    pub use crate::reranker::Reranker;
    pub use crate::session_manager::SessionManager;
    pub use crate::session_memory::SessionMemory;
    pub use crate::types::{
        ContentType, Derivative, Episode, EpisodeCluster, FilterablePropertyValue, Group,
        MemoryContext, SessionInfo,
    };
    pub use crate::{MemoryError, Result};
}

//! Shared test harness for the black-box scenario/invariant suites.
//!
//! Builds a fully wired [`memex_core::manager::EpisodicMemoryManager`]
//! against an in-memory SQLite-backed graph store and session store, with a
//! deterministic hashing embedder and a canned language model so the suite
//! needs no network access or external services (spec.md §1's "out of
//! scope" external collaborators).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use memex_core::declarative::{ClusterWorkflow, DerivationWorkflow, MutationWorkflow};
use memex_core::deriver::IdentityDeriver;
use memex_core::embedder::{Embedder, EmbedderError};
use memex_core::graph::{SimilarityMetric, SqliteGraphStore, VectorGraphStore};
use memex_core::language_model::{LanguageModel, LanguageModelError, ToolChoice};
use memex_core::manager::{EpisodicMemoryManager, ManagerComponents};
use memex_core::mutator::IdentityMutator;
use memex_core::postulator::{PreviousPostulator, RelatedEpisodePostulator};
use memex_core::reranker::PassthroughReranker;
use memex_core::session_manager::SessionManager;
use memex_core::types::DEFAULT_EPISODE_TYPE;

/// Fixed-width bag-of-words embedder: hashes each lowercased token into a
/// bucket and accumulates a count, so texts sharing vocabulary land close
/// together under cosine similarity without pulling in a real model. This
/// is deterministic and network-free, standing in for C2 the way spec.md
/// §1 asks externally-supplied components to be swapped out in tests.
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimensions];
        for token in text.to_lowercase().split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let bucket = (fnv1a(token) as usize) % self.dimensions;
            vector[bucket] += 1.0;
        }
        vector
    }
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn ingest_embed(&self, inputs: &[String], _max_attempts: u32) -> Result<Vec<Vec<f32>>, EmbedderError> {
        Ok(inputs.iter().map(|text| self.embed_one(text)).collect())
    }

    async fn search_embed(&self, queries: &[String], _max_attempts: u32) -> Result<Vec<Vec<f32>>, EmbedderError> {
        Ok(queries.iter().map(|text| self.embed_one(text)).collect())
    }

    fn model_id(&self) -> &str {
        "hashing-test-embedder"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn similarity_metric(&self) -> SimilarityMetric {
        SimilarityMetric::Cosine
    }
}

/// Canned language model: returns a fixed rolling-summary string without
/// making any outbound call, so session-memory eviction tests are
/// deterministic and offline. Stands in for C4.
pub struct CannedLanguageModel;

#[async_trait]
impl LanguageModel for CannedLanguageModel {
    async fn generate_response(
        &self,
        _system_prompt: Option<&str>,
        user_prompt: Option<&str>,
        _tools: Option<Vec<memex_core::language_model::ToolDefinition>>,
        _tool_choice: ToolChoice,
        _max_attempts: u32,
    ) -> Result<(String, Vec<memex_core::language_model::ToolCall>), LanguageModelError> {
        let prompt_len = user_prompt.map(str::len).unwrap_or(0);
        Ok((format!("Summary of conversation so far ({prompt_len} chars of context)."), Vec::new()))
    }
}

pub const EMBEDDING_DIMENSIONS: usize = 64;

/// Embedding dimension used by every test harness graph store/embedder
/// pair, picked small enough that the hashing embedder above produces
/// well-separated vectors for short test vocabularies.
pub fn default_embedding_dimensions() -> usize {
    EMBEDDING_DIMENSIONS
}

/// Default workflow tree: a single `"default"` entry with a `Previous`
/// postulator (so clusters pick up recent context, per spec.md §4.5),
/// identity derivation, and identity mutation — the simplest workflow tree
/// that exercises the full ingestion pipeline end to end.
pub fn default_workflows(
    store: Arc<dyn VectorGraphStore>,
) -> HashMap<String, Vec<ClusterWorkflow>> {
    let mut workflows = HashMap::new();
    workflows.insert(
        DEFAULT_EPISODE_TYPE.to_string(),
        vec![ClusterWorkflow {
            postulator: Arc::new(
                PreviousPostulator::new(store)
                    .with_search_limit(5)
                    .with_filterable_property_keys(["group_id".to_string(), "session_id".to_string()].into_iter().collect()),
            ) as Arc<dyn RelatedEpisodePostulator>,
            derivation_workflows: vec![DerivationWorkflow {
                deriver: Arc::new(IdentityDeriver::new()),
                mutation_workflows: vec![MutationWorkflow { mutator: Arc::new(IdentityMutator) }],
            }],
        }],
    );
    workflows
}

/// Everything a scenario/invariant test needs: the manager itself, plus a
/// direct handle to the backing store so assertions can inspect graph state
/// (node/edge counts) the public `EpisodicMemoryManager` surface does not
/// expose.
pub struct TestHarness {
    pub manager: EpisodicMemoryManager,
    pub store: Arc<dyn VectorGraphStore>,
}

/// Build a manager wired for the scenario/invariant suites: in-memory
/// SQLite graph store and session store, the hashing embedder, a
/// passthrough reranker, identity query derivation, and the canned
/// language model backing session-memory summarization.
pub async fn make_harness() -> TestHarness {
    let dims = default_embedding_dimensions();
    let store: Arc<dyn VectorGraphStore> = Arc::new(SqliteGraphStore::open(None, dims).await.unwrap());
    let workflows = default_workflows(Arc::clone(&store));

    let components = ManagerComponents {
        store: Arc::clone(&store),
        embedder: Arc::new(HashingEmbedder::new(dims)),
        reranker: Arc::new(PassthroughReranker),
        query_deriver: Arc::new(IdentityDeriver::new()),
        related_episode_postulators: Vec::new(),
        derivation_workflows: workflows,
        language_model: Some(Arc::new(CannedLanguageModel)),
    };

    let session_manager = Arc::new(SessionManager::open(None).await.unwrap());
    let manager = EpisodicMemoryManager::new(session_manager, components);
    TestHarness { manager, store }
}

/// Build a harness with a small session-memory capacity (for eviction
/// scenario S3), otherwise identical to [`make_harness`].
pub async fn make_harness_with_session_capacity(capacity: usize) -> TestHarness {
    let dims = default_embedding_dimensions();
    let store: Arc<dyn VectorGraphStore> = Arc::new(SqliteGraphStore::open(None, dims).await.unwrap());
    let workflows = default_workflows(Arc::clone(&store));

    let components = ManagerComponents {
        store: Arc::clone(&store),
        embedder: Arc::new(HashingEmbedder::new(dims)),
        reranker: Arc::new(PassthroughReranker),
        query_deriver: Arc::new(IdentityDeriver::new()),
        related_episode_postulators: Vec::new(),
        derivation_workflows: workflows,
        language_model: Some(Arc::new(CannedLanguageModel)),
    };

    let session_manager = Arc::new(SessionManager::open(None).await.unwrap());
    let mut config_doc = serde_json::Map::new();
    let mut session_memory = serde_json::Map::new();
    session_memory.insert("message_capacity".to_string(), serde_json::json!(capacity));
    config_doc.insert("sessionmemory".to_string(), serde_json::Value::Object(session_memory));

    let manager = EpisodicMemoryManager::new(session_manager, components);
    let manager = apply_inline_config(manager, serde_json::Value::Object(config_doc));
    TestHarness { manager, store }
}

/// Apply a config document directly (bypassing file I/O) by writing it to a
/// scratch file and loading it through the manager's normal config path,
/// exercising [`config::load_config_file`] exactly as a real deployment
/// would rather than poking at manager internals.
fn apply_inline_config(manager: EpisodicMemoryManager, doc: serde_json::Value) -> EpisodicMemoryManager {
    let yaml = serde_yaml::to_string(&doc).expect("serialize scratch config");
    let dir = std::env::temp_dir();
    let path = dir.join(format!("memex-e2e-config-{}.yaml", uuid::Uuid::new_v4()));
    std::fs::write(&path, yaml).expect("write scratch config");
    let manager = manager.with_config_file(&path).expect("load scratch config");
    let _ = std::fs::remove_file(&path);
    manager
}

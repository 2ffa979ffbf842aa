//! Top-level entry point: owns group/session persistence plus the registry
//! of live [`EpisodicMemoryInstance`]s, and wires the C1–C9 components
//! together into one per-context instance on demand.
//!
//! Grounded on `episodic_memory_manager.py`'s `EpisodicMemoryManager` and its
//! `create_episodic_memory_manager` factory (YAML config load, recursive
//! lowercasing, per-group configuration override merge via
//! [`crate::config::merge_configs`]).
//!
//! Per the cyclic-reference redesign flag (spec §9): the manager owns the
//! instance registry ([`crate::episodic_memory::InstanceRegistry`]) and
//! hands a clone of that shared handle to each instance it constructs, so an
//! instance can deregister itself on close without holding a reference back
//! to this struct.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::config::{self, ConfigError};
use crate::declarative::{ClusterWorkflow, DeclarativeMemory};
use crate::deriver::DerivativeDeriver;
use crate::embedder::Embedder;
use crate::episodic_memory::{EpisodicMemoryGuard, EpisodicMemoryInstance, InstanceRegistry};
use crate::error::MemoryError;
use crate::graph::VectorGraphStore;
use crate::language_model::LanguageModel;
use crate::postulator::RelatedEpisodePostulator;
use crate::reranker::Reranker;
use crate::session_manager::{SessionManager, SessionManagerError};
use crate::session_memory::SessionMemory;
use crate::types::{Group, MemoryContext, SessionInfo};

/// Errors surfaced constructing an [`EpisodicMemoryManager`] from a config
/// file, distinct from the runtime [`MemoryError`] surface its instances
/// return.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ManagerConfigError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    SessionManager(#[from] SessionManagerError),
}

/// The shared components used to build a [`DeclarativeMemory`] and
/// [`SessionMemory`] for every context this manager opens. The original
/// instantiates these once at manager construction time from config
/// (model vendor, reranker choice, workflow tree) and reuses them across
/// every group/session; this crate keeps that same shape as a plain struct
/// rather than re-deriving it from config on every `open`.
pub struct ManagerComponents {
    pub store: Arc<dyn VectorGraphStore>,
    pub embedder: Arc<dyn Embedder>,
    pub reranker: Arc<dyn Reranker>,
    pub query_deriver: Arc<dyn DerivativeDeriver>,
    pub related_episode_postulators: Vec<Arc<dyn RelatedEpisodePostulator>>,
    pub derivation_workflows: HashMap<String, Vec<ClusterWorkflow>>,
    /// Used for session-memory summarization. Session memory is skipped
    /// entirely for a context when this is `None`.
    pub language_model: Option<Arc<dyn LanguageModel>>,
}

/// Owns group/session persistence and the registry of live memory
/// instances. Mirrors `EpisodicMemoryManager`.
pub struct EpisodicMemoryManager {
    session_manager: Arc<SessionManager>,
    registry: InstanceRegistry,
    components: ManagerComponents,
    default_config: serde_json::Value,
    session_memory_capacity: usize,
    session_memory_max_message_len: usize,
    session_memory_max_token_num: usize,
    summary_system_prompt: String,
    summary_user_prompt: String,
}

impl EpisodicMemoryManager {
    pub fn new(session_manager: Arc<SessionManager>, components: ManagerComponents) -> Self {
        Self {
            session_manager,
            registry: Arc::new(AsyncMutex::new(HashMap::new())),
            components,
            default_config: serde_json::Value::Object(Default::default()),
            session_memory_capacity: 1000,
            session_memory_max_message_len: 8000,
            session_memory_max_token_num: 4000,
            summary_system_prompt: config::DEFAULT_SUMMARY_SYSTEM_PROMPT.to_string(),
            summary_user_prompt: config::DEFAULT_SUMMARY_USER_PROMPT.to_string(),
        }
    }

    /// Load a YAML configuration file and apply its `sessionmemory`
    /// section (capacity/length/token caps, prompt file overrides) plus
    /// stash the full lowercased tree as the default per-group
    /// configuration base. Mirrors `create_episodic_memory_manager`'s
    /// config load and `load_prompt` calls.
    pub fn with_config_file(mut self, path: impl AsRef<Path>) -> Result<Self, ManagerConfigError> {
        let loaded = config::load_config_file(path)?;
        self.apply_config(&loaded)?;
        self.default_config = loaded;
        Ok(self)
    }

    fn apply_config(&mut self, loaded: &serde_json::Value) -> Result<(), ManagerConfigError> {
        let Some(session_memory) = loaded.get("sessionmemory") else { return Ok(()) };
        if let Some(v) = session_memory.get("message_capacity").and_then(|v| v.as_u64()) {
            self.session_memory_capacity = v as usize;
        }
        if let Some(v) = session_memory.get("max_message_length").and_then(|v| v.as_u64()) {
            self.session_memory_max_message_len = v as usize;
        }
        if let Some(v) = session_memory.get("max_token_num").and_then(|v| v.as_u64()) {
            self.session_memory_max_token_num = v as usize;
        }
        let system_prompt_path = session_memory.get("summary_system_prompt_path").and_then(|v| v.as_str());
        self.summary_system_prompt =
            config::load_prompt_or_default(system_prompt_path, config::DEFAULT_SUMMARY_SYSTEM_PROMPT)?;
        let user_prompt_path = session_memory.get("summary_user_prompt_path").and_then(|v| v.as_str());
        self.summary_user_prompt =
            config::load_prompt_or_default(user_prompt_path, config::DEFAULT_SUMMARY_USER_PROMPT)?;
        Ok(())
    }

    /// Register a new group. Its `configuration` is merged over this
    /// manager's default config when building memory instances for its
    /// sessions, matching `_merge_configs`.
    pub async fn create_group(
        &self,
        group_id: &str,
        user_ids: HashSet<String>,
        agent_ids: HashSet<String>,
        configuration: serde_json::Value,
    ) -> Result<Group, MemoryError> {
        Ok(self.session_manager.create_group(group_id, user_ids, agent_ids, configuration).await?)
    }

    pub async fn delete_group(&self, group_id: &str) -> Result<(), MemoryError> {
        Ok(self.session_manager.delete_group(group_id).await?)
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>, MemoryError> {
        Ok(self.session_manager.list_groups().await?)
    }

    pub async fn list_sessions_by_group(&self, group_id: &str) -> Result<Vec<SessionInfo>, MemoryError> {
        Ok(self.session_manager.list_sessions_by_group(group_id).await?)
    }

    pub async fn list_sessions_by_user(&self, user_id: &str) -> Result<Vec<SessionInfo>, MemoryError> {
        Ok(self.session_manager.list_sessions_by_user(user_id).await?)
    }

    pub async fn list_sessions_by_agent(&self, agent_id: &str) -> Result<Vec<SessionInfo>, MemoryError> {
        Ok(self.session_manager.list_sessions_by_agent(agent_id).await?)
    }

    /// Return a handle to an already-open instance for `context`, if one is
    /// live, adding a reference on the caller's behalf. Does not create a
    /// new instance or touch persisted session state. Mirrors
    /// `get_episodic_memory_instance`.
    pub async fn get_episodic_memory_instance(&self, context: &MemoryContext) -> Option<EpisodicMemoryGuard> {
        let registry = self.registry.lock().await;
        let instance = registry.get(context)?.upgrade()?;
        instance.reference();
        Some(EpisodicMemoryGuard::new(instance))
    }

    /// Ensure `group_id`/`session_id` is a persisted session (creating the
    /// group/session if absent, per [`SessionManager::create_session_if_not_exist`]),
    /// then return a handle to its memory instance: the already-registered
    /// one if live, or a freshly constructed one otherwise. Mirrors
    /// `open_episodic_memory_instance`.
    pub async fn open_episodic_memory_instance(
        &self,
        group_id: &str,
        session_id: &str,
        user_ids: Vec<String>,
        agent_ids: Vec<String>,
    ) -> Result<EpisodicMemoryGuard, MemoryError> {
        let session = self
            .session_manager
            .create_session_if_not_exist(
                group_id,
                session_id,
                user_ids,
                agent_ids,
                serde_json::Value::Object(Default::default()),
            )
            .await?;

        let context = MemoryContext {
            group_id: group_id.to_string(),
            session_id: session_id.to_string(),
            configured_user_ids: session.user_ids.iter().cloned().collect(),
            configured_agent_ids: session.agent_ids.iter().cloned().collect(),
        };

        if let Some(guard) = self.get_episodic_memory_instance(&context).await {
            return Ok(guard);
        }

        let group = self.session_manager.get_group(group_id).await?;
        let effective_config = self.effective_config_for_group(group.as_ref());

        let declarative_memory = self.build_declarative_memory(&effective_config);
        let session_memory = self.build_session_memory(&effective_config);

        let instance = EpisodicMemoryInstance::register(
            context,
            declarative_memory,
            session_memory,
            Arc::clone(&self.registry),
        )
        .await;
        instance.reference();
        Ok(EpisodicMemoryGuard::new(instance))
    }

    fn effective_config_for_group(&self, group: Option<&Group>) -> serde_json::Value {
        match group {
            Some(group) => config::merge_configs(&self.default_config, &group.configuration),
            None => self.default_config.clone(),
        }
    }

    fn build_declarative_memory(&self, effective_config: &serde_json::Value) -> Option<Arc<DeclarativeMemory>> {
        let enabled = effective_config
            .get("long_term_memory")
            .and_then(|v| v.get("enabled"))
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        if !enabled {
            return None;
        }
        Some(Arc::new(DeclarativeMemory::new(
            Arc::clone(&self.components.store),
            Arc::clone(&self.components.embedder),
            Arc::clone(&self.components.reranker),
            Arc::clone(&self.components.query_deriver),
            self.components.related_episode_postulators.clone(),
            clone_derivation_workflows(&self.components.derivation_workflows),
        )))
    }

    fn build_session_memory(&self, effective_config: &serde_json::Value) -> Option<Arc<SessionMemory>> {
        let enabled = effective_config
            .get("sessionmemory")
            .and_then(|v| v.get("enabled"))
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let language_model = self.components.language_model.clone()?;
        if !enabled {
            return None;
        }
        Some(Arc::new(
            SessionMemory::new(language_model)
                .with_summary_system_prompt(self.summary_system_prompt.clone())
                .with_summary_user_prompt(self.summary_user_prompt.clone())
                .with_capacity(self.session_memory_capacity)
                .with_max_message_len(self.session_memory_max_message_len)
                .with_max_token_num(self.session_memory_max_token_num),
        ))
    }

    /// Forget every episode tied to `group_id`/`session_id` and delete the
    /// persisted session itself. Opens the instance transiently if it is
    /// not already live. Mirrors `delete_context_memory`.
    pub async fn delete_context_memory(&self, group_id: &str, session_id: &str) -> Result<(), MemoryError> {
        let context = MemoryContext {
            group_id: group_id.to_string(),
            session_id: session_id.to_string(),
            configured_user_ids: HashSet::new(),
            configured_agent_ids: HashSet::new(),
        };
        let guard = match self.get_episodic_memory_instance(&context).await {
            Some(guard) => guard,
            None => self.open_episodic_memory_instance(group_id, session_id, Vec::new(), Vec::new()).await?,
        };
        guard.forget_session().await?;
        guard.close().await;
        self.session_manager.delete_session(group_id, session_id).await?;
        Ok(())
    }

    /// Close every live instance and release underlying resources. Mirrors
    /// `shut_down`.
    pub async fn shut_down(&self) -> Result<(), MemoryError> {
        let instances: Vec<Arc<EpisodicMemoryInstance>> = {
            let registry = self.registry.lock().await;
            registry.values().filter_map(|weak| weak.upgrade()).collect()
        };
        for instance in instances {
            instance.close().await;
        }
        self.session_manager.close().await?;
        self.components.store.close().await?;
        Ok(())
    }
}

fn clone_derivation_workflows(
    workflows: &HashMap<String, Vec<ClusterWorkflow>>,
) -> HashMap<String, Vec<ClusterWorkflow>> {
    workflows
        .iter()
        .map(|(episode_type, cluster_workflows)| {
            let cloned = cluster_workflows
                .iter()
                .map(|cw| ClusterWorkflow {
                    postulator: Arc::clone(&cw.postulator),
                    derivation_workflows: cw
                        .derivation_workflows
                        .iter()
                        .map(|dw| crate::declarative::DerivationWorkflow {
                            deriver: Arc::clone(&dw.deriver),
                            mutation_workflows: dw
                                .mutation_workflows
                                .iter()
                                .map(|mw| crate::declarative::MutationWorkflow { mutator: Arc::clone(&mw.mutator) })
                                .collect(),
                        })
                        .collect(),
                })
                .collect();
            (episode_type.clone(), cloned)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deriver::IdentityDeriver;
    use crate::graph::SqliteGraphStore;
    use crate::reranker::PassthroughReranker;
    use async_trait::async_trait;

    struct StubEmbedder;

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn ingest_embed(
            &self,
            inputs: &[String],
            _max_attempts: u32,
        ) -> Result<Vec<Vec<f32>>, crate::embedder::EmbedderError> {
            Ok(inputs.iter().map(|_| vec![0.1, 0.2, 0.3]).collect())
        }

        async fn search_embed(
            &self,
            queries: &[String],
            _max_attempts: u32,
        ) -> Result<Vec<Vec<f32>>, crate::embedder::EmbedderError> {
            Ok(queries.iter().map(|_| vec![0.1, 0.2, 0.3]).collect())
        }

        fn model_id(&self) -> &str {
            "stub"
        }

        fn dimensions(&self) -> usize {
            3
        }

        fn similarity_metric(&self) -> crate::graph::SimilarityMetric {
            crate::graph::SimilarityMetric::Cosine
        }
    }

    async fn make_manager() -> EpisodicMemoryManager {
        let store = Arc::new(SqliteGraphStore::open(None, 3).await.unwrap());
        let components = ManagerComponents {
            store,
            embedder: Arc::new(StubEmbedder),
            reranker: Arc::new(PassthroughReranker),
            query_deriver: Arc::new(IdentityDeriver::new()),
            related_episode_postulators: Vec::new(),
            derivation_workflows: HashMap::new(),
            language_model: None,
        };
        let session_manager = Arc::new(SessionManager::open(None).await.unwrap());
        EpisodicMemoryManager::new(session_manager, components)
    }

    #[tokio::test]
    async fn open_instance_creates_session_and_registers_instance() {
        let manager = make_manager().await;
        let guard = manager
            .open_episodic_memory_instance("g1", "s1", vec!["user-1".to_string()], vec!["agent-1".to_string()])
            .await
            .unwrap();
        assert_eq!(guard.context().group_id, "g1");
        assert_eq!(registry_len(&manager).await, 1);
    }

    #[tokio::test]
    async fn reopening_same_context_reuses_registered_instance() {
        let manager = make_manager().await;
        let first = manager
            .open_episodic_memory_instance("g1", "s1", vec!["user-1".to_string()], vec!["agent-1".to_string()])
            .await
            .unwrap();
        let second = manager
            .open_episodic_memory_instance("g1", "s1", vec![], vec![])
            .await
            .unwrap();
        assert_eq!(registry_len(&manager).await, 1);
        drop(first);
        drop(second);
    }

    #[tokio::test]
    async fn delete_context_memory_removes_session() {
        let manager = make_manager().await;
        manager
            .open_episodic_memory_instance("g1", "s1", vec!["user-1".to_string()], vec![])
            .await
            .unwrap()
            .close()
            .await;
        manager.delete_context_memory("g1", "s1").await.unwrap();
        assert!(manager.session_manager.get_session("g1", "s1").await.unwrap().is_none());
    }

    async fn registry_len(manager: &EpisodicMemoryManager) -> usize {
        manager.registry.lock().await.len()
    }
}

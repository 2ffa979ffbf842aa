//! A single conversation's live memory: long-term (declarative) plus
//! short-term (session) memory, bound together behind one handle.
//!
//! Grounded on `episodic_memory.py`'s `EpisodicMemory` class and its
//! `AsyncEpisodicMemory` async-context-manager wrapper. Reference counting
//! is kept (multiple callers can hold the same context open concurrently,
//! and the instance only truly closes once every caller has let go), but
//! per the cyclic-reference redesign flag the instance holds only a handle
//! to the registry it is filed under, not a back-reference to the whole
//! [`crate::manager::EpisodicMemoryManager`] — so closing the last reference
//! can deregister the instance without the instance needing to know
//! anything else about the manager that owns it.
//!
//! `#[tracing::instrument]` spans stand in for the original's Prometheus
//! metrics (metrics collection itself is out of scope for this crate).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::declarative::DeclarativeMemory;
use crate::error::MemoryError;
use crate::session_memory::SessionMemory;
use crate::types::{ContentType, Episode, FilterablePropertyValue, MemoryContext};

/// Registry instances deregister themselves from on close, shared with
/// [`crate::manager::EpisodicMemoryManager`] without either side holding a
/// strong reference to the other's owning struct.
pub(crate) type InstanceRegistry = Arc<AsyncMutex<HashMap<MemoryContext, Weak<EpisodicMemoryInstance>>>>;

/// The episodes and running summary returned by a memory query: long-term
/// hits from declarative memory alongside the short-term rolling window and
/// its summary, so a caller can assemble a full context window itself.
#[derive(Debug, Clone)]
pub struct MemoryQueryResult {
    pub declarative_episodes: Vec<Episode>,
    pub session_episodes: Vec<Episode>,
    pub session_summary: String,
}

/// A single conversation context's live memory. Either memory layer may be
/// absent (a context configured with declarative memory disabled still
/// tracks session memory, and vice versa), matching the original's optional
/// `_declarative_memory`/`_session_memory` attributes.
pub struct EpisodicMemoryInstance {
    context: MemoryContext,
    declarative_memory: Option<Arc<DeclarativeMemory>>,
    session_memory: Option<Arc<SessionMemory>>,
    ref_count: AtomicUsize,
    registry: InstanceRegistry,
}

impl EpisodicMemoryInstance {
    /// Construct a fresh instance with one outstanding reference, file it
    /// into `registry` under `context`, and return it.
    ///
    /// The original's constructor sets `_ref_count = 1` and then the
    /// manager's `create_episodic_memory_instance`/`open_episodic_memory_instance`
    /// immediately call `reference()` again, leaving a freshly opened
    /// instance with an effective ref count of 2 for one outstanding caller.
    /// We start at zero here and let the manager's own `reference()` call
    /// establish the first handle, so "one caller holding it open" and "ref
    /// count is 1" stay in lockstep (documented in DESIGN.md).
    pub(crate) async fn register(
        context: MemoryContext,
        declarative_memory: Option<Arc<DeclarativeMemory>>,
        session_memory: Option<Arc<SessionMemory>>,
        registry: InstanceRegistry,
    ) -> Arc<Self> {
        let instance = Arc::new(Self {
            context,
            declarative_memory,
            session_memory,
            ref_count: AtomicUsize::new(0),
            registry: Arc::clone(&registry),
        });
        registry.lock().await.insert(instance.context.clone(), Arc::downgrade(&instance));
        instance
    }

    pub fn context(&self) -> &MemoryContext {
        &self.context
    }

    /// Add an outstanding reference, returning the new count. Called by the
    /// manager each time it hands this instance out to a caller.
    pub fn reference(&self) -> usize {
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn validate_participant(&self, participant_id: &str) -> Result<(), MemoryError> {
        if self.context.configured_user_ids.contains(participant_id)
            || self.context.configured_agent_ids.contains(participant_id)
        {
            Ok(())
        } else {
            Err(MemoryError::Validation(format!(
                "participant {participant_id} is not a configured user or agent for group_id={}, session_id={}",
                self.context.group_id, self.context.session_id
            )))
        }
    }

    /// Ingest a new episode, writing it to declarative memory and appending
    /// it to session memory concurrently. Mirrors `add_memory_episode`.
    #[tracing::instrument(skip(self, content, filterable_properties, user_metadata), fields(group_id = %self.context.group_id, session_id = %self.context.session_id))]
    #[allow(clippy::too_many_arguments)]
    pub async fn add_memory_episode(
        &self,
        producer_id: &str,
        produced_for_id: &str,
        content: &str,
        episode_type: &str,
        content_type: ContentType,
        filterable_properties: HashMap<String, FilterablePropertyValue>,
        user_metadata: HashMap<String, serde_json::Value>,
    ) -> Result<(), MemoryError> {
        self.validate_participant(producer_id)?;
        self.validate_participant(produced_for_id)?;

        let episode = Episode {
            uuid: Uuid::new_v4(),
            episode_type: episode_type.to_string(),
            group_id: self.context.group_id.clone(),
            session_id: self.context.session_id.clone(),
            producer_id: producer_id.to_string(),
            produced_for_id: produced_for_id.to_string(),
            content: content.to_string(),
            content_type,
            timestamp: Utc::now(),
            filterable_properties,
            user_metadata,
        };

        let declarative_fut = async {
            match &self.declarative_memory {
                Some(declarative_memory) => declarative_memory.add_episode(&episode).await.map_err(MemoryError::from),
                None => Ok(()),
            }
        };
        let session_fut = async {
            if let Some(session_memory) = &self.session_memory {
                session_memory.add_episode(episode.clone()).await;
            }
        };

        let (declarative_result, ()) = tokio::join!(declarative_fut, session_fut);
        declarative_result?;
        tracing::debug!("episode ingested");
        Ok(())
    }

    /// Query both memory layers: session memory's rolling window (limited to
    /// `num_episodes_limit`) and declarative memory's search against the raw
    /// `query` run concurrently. Mirrors `query_memory`: the caller's
    /// `property_filter` is pinned to this instance's own `group_id` before
    /// the search runs (cross-session search within a group is allowed,
    /// cross-group is not), and any long-term hit already present in the
    /// short-term window is dropped so the short-term copy takes precedence.
    #[tracing::instrument(skip(self, query, property_filter), fields(group_id = %self.context.group_id, session_id = %self.context.session_id))]
    pub async fn query_memory(
        &self,
        query: &str,
        num_episodes_limit: usize,
        mut property_filter: HashMap<String, FilterablePropertyValue>,
    ) -> Result<MemoryQueryResult, MemoryError> {
        property_filter.insert(
            "group_id".to_string(),
            FilterablePropertyValue::Str(self.context.group_id.clone()),
        );

        let session_fut = async {
            match &self.session_memory {
                Some(session_memory) => {
                    session_memory.get_session_memory_context(query, num_episodes_limit, 0).await
                }
                None => (Vec::new(), String::new()),
            }
        };
        let declarative_fut = async {
            match &self.declarative_memory {
                Some(declarative_memory) => {
                    declarative_memory.search(query, num_episodes_limit, &property_filter).await
                }
                None => Ok(Vec::new()),
            }
        };

        let ((session_episodes, session_summary), declarative_result) =
            tokio::join!(session_fut, declarative_fut);
        let declarative_hits = declarative_result?;

        let session_ids: std::collections::HashSet<Uuid> =
            session_episodes.iter().map(|episode| episode.uuid).collect();
        let declarative_episodes =
            declarative_hits.into_iter().filter(|episode| !session_ids.contains(&episode.uuid)).collect();

        Ok(MemoryQueryResult { declarative_episodes, session_episodes, session_summary })
    }

    /// Construct a finalized query string enriched with memory context:
    /// runs [`Self::query_memory`], merges the short- and long-term hits in
    /// chronological order, and wraps summary/episodes/query in XML-like
    /// tags for a language model to parse. Mirrors
    /// `formalize_query_with_context`.
    pub async fn formalize_query_with_context(
        &self,
        query: &str,
        limit: usize,
        property_filter: HashMap<String, FilterablePropertyValue>,
    ) -> Result<String, MemoryError> {
        let result = self.query_memory(query, limit, property_filter).await?;
        let mut episodes = result.session_episodes;
        episodes.extend(result.declarative_episodes);
        episodes.sort_by_key(|episode| episode.timestamp);

        let mut finalized_query = String::new();
        if !result.session_summary.is_empty() {
            finalized_query.push_str("<Summary>\n");
            finalized_query.push_str(&result.session_summary);
            finalized_query.push_str("\n</Summary>\n");
        }

        if !episodes.is_empty() {
            finalized_query.push_str("<Episodes>\n");
            for episode in &episodes {
                if matches!(episode.content_type, ContentType::String) {
                    finalized_query.push_str(&episode.content);
                    finalized_query.push('\n');
                }
            }
            finalized_query.push_str("</Episodes>\n");
        }

        finalized_query.push_str(&format!("<Query>\n{query}\n</Query>"));
        Ok(finalized_query)
    }

    /// Forget everything tied to this context's session: every declarative
    /// episode filtered by `session_id`, plus the rolling session-memory
    /// window and summary. A convenience wrapper the original does not have
    /// as a single call (it composes `forget_filtered_episodes` and
    /// `clear_memory` at the caller site); collapsed here since every caller
    /// of "forget this session" needs both.
    pub async fn forget_session(&self) -> Result<(), MemoryError> {
        if let Some(declarative_memory) = &self.declarative_memory {
            let mut filter = HashMap::new();
            filter.insert(
                "session_id".to_string(),
                FilterablePropertyValue::Str(self.context.session_id.clone()),
            );
            declarative_memory.forget_filtered_episodes(&filter).await?;
        }
        if let Some(session_memory) = &self.session_memory {
            session_memory.clear_memory().await;
        }
        Ok(())
    }

    /// Release one outstanding reference. Once the count reaches zero,
    /// close session memory and deregister from the registry. Mirrors the
    /// original's `close`.
    pub async fn close(&self) {
        let remaining = self.ref_count.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if remaining == 0 {
            if let Some(session_memory) = &self.session_memory {
                session_memory.close().await;
            }
            self.registry.lock().await.remove(&self.context);
            tracing::debug!(group_id = %self.context.group_id, session_id = %self.context.session_id, "episodic memory instance closed");
        }
    }
}

/// RAII handle over an [`EpisodicMemoryInstance`], matching the original's
/// `AsyncEpisodicMemory` async context manager: acquiring one adds a
/// reference, and it is released automatically when the handle is dropped.
/// Prefer [`EpisodicMemoryGuard::close`] over relying on `Drop` when the
/// caller is already in an async context, since `Drop` can only schedule the
/// cleanup on the runtime rather than await it inline.
pub struct EpisodicMemoryGuard {
    instance: Option<Arc<EpisodicMemoryInstance>>,
}

impl EpisodicMemoryGuard {
    pub(crate) fn new(instance: Arc<EpisodicMemoryInstance>) -> Self {
        Self { instance: Some(instance) }
    }

    /// Borrow the underlying instance.
    pub fn get(&self) -> &EpisodicMemoryInstance {
        self.instance.as_deref().expect("EpisodicMemoryGuard used after close")
    }

    /// Release this handle's reference, awaiting cleanup if it was the
    /// last one. Prefer this over letting the guard drop when inside an
    /// async context that can afford to await.
    pub async fn close(mut self) {
        if let Some(instance) = self.instance.take() {
            instance.close().await;
        }
    }
}

impl std::ops::Deref for EpisodicMemoryGuard {
    type Target = EpisodicMemoryInstance;

    fn deref(&self) -> &Self::Target {
        self.get()
    }
}

impl Drop for EpisodicMemoryGuard {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            tokio::spawn(async move {
                instance.close().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContentType;
    use std::collections::HashSet;

    fn sample_context() -> MemoryContext {
        MemoryContext {
            group_id: "g1".into(),
            session_id: "s1".into(),
            configured_user_ids: ["user-1".to_string()].into_iter().collect(),
            configured_agent_ids: ["agent-1".to_string()].into_iter().collect(),
        }
    }

    async fn make_instance() -> Arc<EpisodicMemoryInstance> {
        let registry: InstanceRegistry = Arc::new(AsyncMutex::new(HashMap::new()));
        let instance = EpisodicMemoryInstance::register(sample_context(), None, None, registry).await;
        instance.reference();
        instance
    }

    #[tokio::test]
    async fn add_memory_episode_rejects_unknown_participant() {
        let instance = make_instance().await;
        let result = instance
            .add_memory_episode(
                "stranger",
                "agent-1",
                "hello",
                "default",
                ContentType::String,
                Default::default(),
                Default::default(),
            )
            .await;
        assert!(matches!(result, Err(MemoryError::Validation(_))));
    }

    #[tokio::test]
    async fn add_memory_episode_accepts_configured_participants() {
        let instance = make_instance().await;
        let result = instance
            .add_memory_episode(
                "user-1",
                "agent-1",
                "hello",
                "default",
                ContentType::String,
                Default::default(),
                Default::default(),
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn formalize_query_with_context_without_memory_layers_wraps_query_only() {
        let instance = make_instance().await;
        let formalized =
            instance.formalize_query_with_context("what happened?", 0, HashMap::new()).await.unwrap();
        assert_eq!(formalized, "<Query>\nwhat happened?\n</Query>");
    }

    #[tokio::test]
    async fn close_deregisters_after_last_reference_released() {
        let registry: InstanceRegistry = Arc::new(AsyncMutex::new(HashMap::new()));
        let instance =
            EpisodicMemoryInstance::register(sample_context(), None, None, Arc::clone(&registry)).await;
        instance.reference();
        assert_eq!(registry.lock().await.len(), 1);
        instance.close().await;
        assert_eq!(registry.lock().await.len(), 0);
    }

    #[tokio::test]
    async fn close_does_not_deregister_while_references_remain() {
        let registry: InstanceRegistry = Arc::new(AsyncMutex::new(HashMap::new()));
        let instance =
            EpisodicMemoryInstance::register(sample_context(), None, None, Arc::clone(&registry)).await;
        instance.reference();
        instance.reference();
        instance.close().await;
        assert_eq!(registry.lock().await.len(), 1);
    }
}

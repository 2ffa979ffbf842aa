//! Testable properties of the declarative-memory ingestion/retrieval
//! pipeline, exercised directly against [`memex_core::declarative::DeclarativeMemory`]
//! and its backing store so graph-level shape (node/edge counts) can be
//! asserted precisely, independent of the cluster-relation postulator in
//! play.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use memex_core::declarative::{ClusterWorkflow, DeclarativeMemory, DerivationWorkflow, MutationWorkflow};
use memex_core::deriver::IdentityDeriver;
use memex_core::embedder::{Embedder, EmbedderError};
use memex_core::graph::{SimilarityMetric, SqliteGraphStore, VectorGraphStore, CONTAINS, DERIVED_FROM};
use memex_core::mutator::{DerivativeMutator, IdentityMutator};
use memex_core::postulator::{NullPostulator, PreviousPostulator};
use memex_core::reranker::PassthroughReranker;
use memex_core::types::{
    ContentType, Derivative, Episode, EpisodeCluster, FilterablePropertyValue, DEFAULT_EPISODE_TYPE,
    DERIVATIVE_LABEL, EPISODE_CLUSTER_LABEL, EPISODE_LABEL,
};
use memex_e2e_tests::HashingEmbedder;
use uuid::Uuid;

const DIMS: usize = 64;

fn sample_episode(group_id: &str, session_id: &str, content: &str) -> Episode {
    Episode {
        uuid: Uuid::new_v4(),
        episode_type: DEFAULT_EPISODE_TYPE.to_string(),
        group_id: group_id.to_string(),
        session_id: session_id.to_string(),
        producer_id: "user-1".to_string(),
        produced_for_id: "agent-1".to_string(),
        content: content.to_string(),
        content_type: ContentType::String,
        timestamp: Utc::now(),
        filterable_properties: [
            ("group_id".to_string(), FilterablePropertyValue::Str(group_id.to_string())),
            ("session_id".to_string(), FilterablePropertyValue::Str(session_id.to_string())),
        ]
        .into_iter()
        .collect(),
        user_metadata: HashMap::new(),
    }
}

async fn single_workflow_memory(
    store: Arc<dyn VectorGraphStore>,
    postulator: Arc<dyn memex_core::postulator::RelatedEpisodePostulator>,
) -> DeclarativeMemory {
    let mut workflows = HashMap::new();
    workflows.insert(
        DEFAULT_EPISODE_TYPE.to_string(),
        vec![ClusterWorkflow {
            postulator,
            derivation_workflows: vec![DerivationWorkflow {
                deriver: Arc::new(IdentityDeriver::new()),
                mutation_workflows: vec![MutationWorkflow { mutator: Arc::new(IdentityMutator) }],
            }],
        }],
    );
    DeclarativeMemory::new(
        Arc::clone(&store),
        Arc::new(HashingEmbedder::new(DIMS)),
        Arc::new(PassthroughReranker),
        Arc::new(IdentityDeriver::new()),
        Vec::new(),
        workflows,
    )
}

/// An episode in isolation (no postulator relations) produces exactly one
/// EpisodeCluster, one Derivative, one CONTAINS edge, and one DERIVED_FROM
/// edge.
#[tokio::test]
async fn ingest_produces_exactly_one_cluster_derivative_and_edge_per_workflow() {
    let store: Arc<dyn VectorGraphStore> = Arc::new(SqliteGraphStore::open(None, DIMS).await.unwrap());
    let memory = single_workflow_memory(Arc::clone(&store), Arc::new(NullPostulator)).await;

    let episode = sample_episode("g1", "s1", "a lone episode");
    memory.add_episode(&episode).await.unwrap();

    let cluster_label: HashSet<String> = [EPISODE_CLUSTER_LABEL.to_string()].into_iter().collect();
    let clusters = store.search_matching_nodes(None, Some(cluster_label), HashMap::new(), false).await.unwrap();
    assert_eq!(clusters.len(), 1);

    let derivative_label: HashSet<String> = [DERIVATIVE_LABEL.to_string()].into_iter().collect();
    let derivatives =
        store.search_matching_nodes(None, Some(derivative_label), HashMap::new(), false).await.unwrap();
    assert_eq!(derivatives.len(), 1);

    let contains: HashSet<String> = [CONTAINS.to_string()].into_iter().collect();
    let episode_label: HashSet<String> = [EPISODE_LABEL.to_string()].into_iter().collect();
    let members = store
        .search_related_nodes(clusters[0].uuid, Some(contains), false, true, None, Some(episode_label), HashMap::new(), false)
        .await
        .unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].uuid, episode.uuid);

    let derived_from: HashSet<String> = [DERIVED_FROM.to_string()].into_iter().collect();
    let derived_targets = store
        .search_related_nodes(
            derivatives[0].uuid,
            Some(derived_from),
            false,
            true,
            None,
            Some(cluster_label_set()),
            HashMap::new(),
            false,
        )
        .await
        .unwrap();
    assert_eq!(derived_targets.len(), 1);
    assert_eq!(derived_targets[0].uuid, clusters[0].uuid);
}

fn cluster_label_set() -> HashSet<String> {
    [EPISODE_CLUSTER_LABEL.to_string()].into_iter().collect()
}

/// A `search` with a filter covering more than one key only returns
/// episodes whose filterable properties satisfy all of them at once.
#[tokio::test]
async fn search_respects_the_intersection_of_filter_properties() {
    let store: Arc<dyn VectorGraphStore> = Arc::new(SqliteGraphStore::open(None, DIMS).await.unwrap());
    let memory = single_workflow_memory(Arc::clone(&store), Arc::new(NullPostulator)).await;

    memory.add_episode(&sample_episode("g1", "s1", "shared vocabulary words")).await.unwrap();
    memory.add_episode(&sample_episode("g1", "s2", "shared vocabulary words")).await.unwrap();

    let mut filter = HashMap::new();
    filter.insert("group_id".to_string(), FilterablePropertyValue::Str("g1".to_string()));
    filter.insert("session_id".to_string(), FilterablePropertyValue::Str("s2".to_string()));
    let results = memory.search("shared vocabulary words", 20, &filter).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].session_id, "s2");
}

/// `forget_filtered_episodes` removes not just the matched Episode nodes
/// but every EpisodeCluster/Derivative reachable from them, leaving nothing
/// of that workflow's output behind.
#[tokio::test]
async fn forget_cascades_to_clusters_and_derivatives() {
    let store: Arc<dyn VectorGraphStore> = Arc::new(SqliteGraphStore::open(None, DIMS).await.unwrap());
    let memory = single_workflow_memory(Arc::clone(&store), Arc::new(NullPostulator)).await;

    memory.add_episode(&sample_episode("g1", "s1", "to be forgotten")).await.unwrap();

    let mut filter = HashMap::new();
    filter.insert("session_id".to_string(), FilterablePropertyValue::Str("s1".to_string()));
    memory.forget_filtered_episodes(&filter).await.unwrap();

    for label in [EPISODE_LABEL, EPISODE_CLUSTER_LABEL, DERIVATIVE_LABEL] {
        let label_set: HashSet<String> = [label.to_string()].into_iter().collect();
        let remaining =
            store.search_matching_nodes(None, Some(label_set), HashMap::new(), false).await.unwrap();
        assert!(remaining.is_empty(), "expected no {label} nodes after forget, found {}", remaining.len());
    }
}

/// Results are bounded by `num_episodes_limit` even when more candidates
/// match.
#[tokio::test]
async fn search_respects_the_result_budget() {
    let store: Arc<dyn VectorGraphStore> = Arc::new(SqliteGraphStore::open(None, DIMS).await.unwrap());
    let memory = single_workflow_memory(Arc::clone(&store), Arc::new(NullPostulator)).await;

    for i in 0..6 {
        memory.add_episode(&sample_episode("g1", "s1", &format!("budget test episode {i}"))).await.unwrap();
    }

    let filter = HashMap::new();
    let results = memory.search("budget test episode", 3, &filter).await.unwrap();
    assert!(results.len() <= 3);
}

/// A postulator wires episodes sharing a group/session together via the
/// `PreviousPostulator`'s `RELATED_TO` edges, but two episodes in different
/// sessions never get linked.
#[tokio::test]
async fn previous_postulator_only_links_episodes_within_its_filter_scope() {
    let store: Arc<dyn VectorGraphStore> = Arc::new(SqliteGraphStore::open(None, DIMS).await.unwrap());
    // Wired as a top-level related-episode postulator (the component that
    // actually emits `RELATED_TO` edges in `DeclarativeMemory::add_episode`),
    // not as a cluster workflow's postulator (which only shapes what gets
    // derived, via `CONTAINS`).
    let postulator: Arc<dyn memex_core::postulator::RelatedEpisodePostulator> = Arc::new(
        PreviousPostulator::new(Arc::clone(&store))
            .with_search_limit(5)
            .with_filterable_property_keys(["group_id".to_string(), "session_id".to_string()].into_iter().collect()),
    );
    let mut workflows = HashMap::new();
    workflows.insert(
        DEFAULT_EPISODE_TYPE.to_string(),
        vec![ClusterWorkflow {
            postulator: Arc::new(NullPostulator),
            derivation_workflows: vec![DerivationWorkflow {
                deriver: Arc::new(IdentityDeriver::new()),
                mutation_workflows: vec![MutationWorkflow { mutator: Arc::new(IdentityMutator) }],
            }],
        }],
    );
    let memory = DeclarativeMemory::new(
        Arc::clone(&store),
        Arc::new(HashingEmbedder::new(DIMS)),
        Arc::new(PassthroughReranker),
        Arc::new(IdentityDeriver::new()),
        vec![postulator],
        workflows,
    );

    let first = sample_episode("g1", "s1", "first in session one");
    memory.add_episode(&first).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = sample_episode("g1", "s1", "second in session one");
    memory.add_episode(&second).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let other_session = sample_episode("g1", "s2", "alone in session two");
    memory.add_episode(&other_session).await.unwrap();

    let related_to: HashSet<String> = [memex_core::graph::RELATED_TO.to_string()].into_iter().collect();
    let linked_from_second = store
        .search_related_nodes(second.uuid, Some(related_to.clone()), false, true, None, None, HashMap::new(), false)
        .await
        .unwrap();
    assert_eq!(linked_from_second.len(), 1);
    assert_eq!(linked_from_second[0].uuid, first.uuid);

    let linked_from_other_session = store
        .search_related_nodes(other_session.uuid, Some(related_to), false, true, None, None, HashMap::new(), false)
        .await
        .unwrap();
    assert!(linked_from_other_session.is_empty());
}

/// An embedder that always fails leaves the Episode node persisted (the
/// episode itself is never lost) but produces zero derivatives for that
/// workflow, matching the embedding-failure tolerance described for this
/// pipeline stage.
#[tokio::test]
async fn embedder_failure_persists_episode_but_drops_derivatives() {
    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn ingest_embed(&self, _inputs: &[String], _max_attempts: u32) -> Result<Vec<Vec<f32>>, EmbedderError> {
            Err(EmbedderError::RequestFailed("embedding backend unreachable".to_string()))
        }

        async fn search_embed(&self, _queries: &[String], _max_attempts: u32) -> Result<Vec<Vec<f32>>, EmbedderError> {
            Err(EmbedderError::RequestFailed("embedding backend unreachable".to_string()))
        }

        fn model_id(&self) -> &str {
            "failing"
        }

        fn dimensions(&self) -> usize {
            DIMS
        }

        fn similarity_metric(&self) -> SimilarityMetric {
            SimilarityMetric::Cosine
        }
    }

    let store: Arc<dyn VectorGraphStore> = Arc::new(SqliteGraphStore::open(None, DIMS).await.unwrap());
    let mut workflows = HashMap::new();
    workflows.insert(
        DEFAULT_EPISODE_TYPE.to_string(),
        vec![ClusterWorkflow {
            postulator: Arc::new(NullPostulator),
            derivation_workflows: vec![DerivationWorkflow {
                deriver: Arc::new(IdentityDeriver::new()),
                mutation_workflows: vec![MutationWorkflow { mutator: Arc::new(IdentityMutator) }],
            }],
        }],
    );
    let memory = DeclarativeMemory::new(
        Arc::clone(&store),
        Arc::new(FailingEmbedder),
        Arc::new(PassthroughReranker),
        Arc::new(IdentityDeriver::new()),
        Vec::new(),
        workflows,
    );

    let episode = sample_episode("g1", "s1", "never embedded");
    memory.add_episode(&episode).await.unwrap();

    let episode_label: HashSet<String> = [EPISODE_LABEL.to_string()].into_iter().collect();
    let episodes = store.search_matching_nodes(None, Some(episode_label), HashMap::new(), false).await.unwrap();
    assert_eq!(episodes.len(), 1);
    assert_eq!(episodes[0].uuid, episode.uuid);

    let derivative_label: HashSet<String> = [DERIVATIVE_LABEL.to_string()].into_iter().collect();
    let derivatives =
        store.search_matching_nodes(None, Some(derivative_label), HashMap::new(), false).await.unwrap();
    assert!(derivatives.is_empty());
}

/// Two calls to the same mutator type never collapse distinct derivatives:
/// [`memex_core::mutator::IdentityMutator`] always assigns a fresh uuid, so
/// round-tripping a derivative through it twice yields two distinct nodes.
#[tokio::test]
async fn identity_mutator_assigns_fresh_identity_each_time() {
    let source = Derivative {
        uuid: Uuid::new_v4(),
        derivative_type: "identity".to_string(),
        content: "content".to_string(),
        content_type: ContentType::String,
        timestamp: Utc::now(),
        filterable_properties: HashMap::new(),
        user_metadata: HashMap::new(),
    };
    let cluster = EpisodeCluster {
        uuid: Uuid::new_v4(),
        episodes: Vec::new(),
        timestamp: Utc::now(),
        filterable_properties: HashMap::new(),
        user_metadata: HashMap::new(),
    };
    let first = IdentityMutator.mutate(&source, &cluster).await.unwrap();
    let second = IdentityMutator.mutate(&source, &cluster).await.unwrap();
    assert_ne!(first[0].uuid, second[0].uuid);
}

//! Declarative (long-term) memory: the vector-graph ingestion and retrieval
//! pipeline built on top of C1–C7.
//!
//! Grounded on `declarative_memory/declarative_memory.py`. The original
//! expresses ingestion as a tree of generic `Workflow` objects
//! (`executable` → `gather` over subworkflows → `callback`); this module
//! collapses that generic tree into the three concrete levels it is always
//! instantiated with here (cluster → derivation → mutation), executed with
//! `futures::future::join_all`/`try_join_all` fan-out at each level instead
//! of a reusable `Workflow` abstraction, since Rust has no ergonomic
//! equivalent of passing an async closure tree around without heavy
//! boxing for a shape that never actually varies at runtime.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::future::{join_all, try_join_all};
use uuid::Uuid;

use crate::deriver::{DerivativeDeriver, DeriverError};
use crate::embedder::{Embedder, EmbedderError};
use crate::graph::{
    Edge, GraphStoreError, Node, Property, ScoredNode, SimilarityMetric, VectorGraphStore, CONTAINS,
    DERIVED_FROM, RELATED_TO,
};
use crate::mutator::{DerivativeMutator, MutatorError};
use crate::postulator::{PostulatorError, RelatedEpisodePostulator};
use crate::reranker::{Reranker, RerankerError};
use crate::types::{
    mangle_filterable_property_key, Derivative, EntityConversionError, Episode, EpisodeCluster,
    FilterablePropertyValue, DEFAULT_EPISODE_TYPE, DERIVATIVE_LABEL, EPISODE_CLUSTER_LABEL,
    EPISODE_LABEL,
};

/// ANN searches require a finite limit; this is the sentinel used when a
/// caller's own `num_episodes_limit` does not bound the candidate pool (the
/// budget applies to the final unified result, not to raw vector-match
/// candidates).
const ANN_CANDIDATE_LIMIT: usize = 100_000;

/// Neighbors examined per BFS step during context expansion.
const CONTEXT_EXPANSION_STEP_LIMIT: usize = 10;

/// Error surface for [`DeclarativeMemory`] ingestion and retrieval.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum DeclarativeMemoryError {
    #[error(transparent)]
    Store(#[from] GraphStoreError),

    #[error(transparent)]
    Postulator(#[from] PostulatorError),

    #[error(transparent)]
    Deriver(#[from] DeriverError),

    #[error(transparent)]
    Conversion(#[from] EntityConversionError),

    #[error(transparent)]
    Reranker(#[from] RerankerError),
}

/// A mutator applied to every derivative a [`DerivationWorkflow`] produces.
/// Leaf of the workflow tree.
pub struct MutationWorkflow {
    pub mutator: Arc<dyn DerivativeMutator>,
}

/// A deriver plus the mutators applied to its output. Produces the flat set
/// of embedded, persisted `Derivative` nodes for one cluster workflow.
pub struct DerivationWorkflow {
    pub deriver: Arc<dyn DerivativeDeriver>,
    pub mutation_workflows: Vec<MutationWorkflow>,
}

/// A postulator (used to assemble the episode cluster, per §4.5) plus the
/// derivation workflows run against that cluster.
pub struct ClusterWorkflow {
    pub postulator: Arc<dyn RelatedEpisodePostulator>,
    pub derivation_workflows: Vec<DerivationWorkflow>,
}

/// Declarative memory: a vector-graph store plus the component references
/// and workflow tree needed to ingest and retrieve episodes. Mirrors
/// `DeclarativeMemory`.
pub struct DeclarativeMemory {
    store: Arc<dyn VectorGraphStore>,
    embedder: Arc<dyn Embedder>,
    reranker: Arc<dyn Reranker>,
    query_deriver: Arc<dyn DerivativeDeriver>,
    /// Postulators run independently of cluster assembly, purely to emit
    /// `RELATED_TO` edges between episodes (§4.8 step 3).
    related_episode_postulators: Vec<Arc<dyn RelatedEpisodePostulator>>,
    derivation_workflows: HashMap<String, Vec<ClusterWorkflow>>,
    /// `$`-style template used to render each context episode when scoring
    /// contexts in retrieval (§4.8 step 7). Default `[$timestamp] $content`.
    episode_metadata_template: String,
    /// How many BFS hops context expansion walks out from a nucleus.
    retrieval_depth: usize,
}

impl DeclarativeMemory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn VectorGraphStore>,
        embedder: Arc<dyn Embedder>,
        reranker: Arc<dyn Reranker>,
        query_deriver: Arc<dyn DerivativeDeriver>,
        related_episode_postulators: Vec<Arc<dyn RelatedEpisodePostulator>>,
        derivation_workflows: HashMap<String, Vec<ClusterWorkflow>>,
    ) -> Self {
        Self {
            store,
            embedder,
            reranker,
            query_deriver,
            related_episode_postulators,
            derivation_workflows,
            episode_metadata_template: "[$timestamp] $content".to_string(),
            retrieval_depth: 1,
        }
    }

    pub fn with_episode_metadata_template(mut self, template: impl Into<String>) -> Self {
        self.episode_metadata_template = template.into();
        self
    }

    pub fn with_retrieval_depth(mut self, depth: usize) -> Self {
        self.retrieval_depth = depth.max(1);
        self
    }

    fn workflows_for(&self, episode_type: &str) -> &[ClusterWorkflow] {
        self.derivation_workflows
            .get(episode_type)
            .or_else(|| self.derivation_workflows.get(DEFAULT_EPISODE_TYPE))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Ingest an episode: write its node, then run every cluster workflow
    /// for its `episode_type` concurrently, then run every top-level
    /// postulator concurrently for `RELATED_TO` edges. Mirrors
    /// `DeclarativeMemory.add_episode`.
    pub async fn add_episode(&self, episode: &Episode) -> Result<(), DeclarativeMemoryError> {
        self.store.add_nodes(vec![episode.to_node()]).await?;

        let workflows = self.workflows_for(&episode.episode_type);
        let cluster_results: Vec<Result<(Vec<Node>, Vec<Edge>), DeclarativeMemoryError>> =
            join_all(workflows.iter().map(|cw| self.run_cluster_workflow(cw, episode))).await;

        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        for result in cluster_results {
            let (cluster_nodes, cluster_edges) = result?;
            nodes.extend(cluster_nodes);
            edges.extend(cluster_edges);
        }

        let related_results: Vec<Result<Vec<Episode>, PostulatorError>> =
            join_all(self.related_episode_postulators.iter().map(|p| p.postulate(episode))).await;
        for result in related_results {
            for related in result? {
                edges.push(Edge::new(episode.uuid, related.uuid, RELATED_TO));
            }
        }

        // Nodes before edges: an edge referencing a not-yet-persisted node
        // would be unresolvable by a real backend's foreign-key constraints.
        self.store.add_nodes(nodes).await?;
        self.store.add_edges(edges).await?;
        Ok(())
    }

    async fn run_cluster_workflow(
        &self,
        cluster_workflow: &ClusterWorkflow,
        episode: &Episode,
    ) -> Result<(Vec<Node>, Vec<Edge>), DeclarativeMemoryError> {
        let cluster = assemble_episode_cluster(&*cluster_workflow.postulator, episode).await?;

        let derivation_results: Vec<Result<Vec<Node>, DeclarativeMemoryError>> = join_all(
            cluster_workflow
                .derivation_workflows
                .iter()
                .map(|dw| self.run_derivation_workflow(dw, &cluster)),
        )
        .await;

        let mut derivative_nodes = Vec::new();
        for result in derivation_results {
            derivative_nodes.extend(result?);
        }

        let cluster_node = cluster.to_node();
        let mut edges: Vec<Edge> = cluster
            .episodes
            .iter()
            .map(|member| Edge::new(cluster_node.uuid, member.uuid, CONTAINS))
            .collect();
        edges.extend(
            derivative_nodes
                .iter()
                .map(|derivative_node| Edge::new(derivative_node.uuid, cluster_node.uuid, DERIVED_FROM)),
        );

        let mut nodes = vec![cluster_node];
        nodes.extend(derivative_nodes);
        Ok((nodes, edges))
    }

    async fn run_derivation_workflow(
        &self,
        derivation_workflow: &DerivationWorkflow,
        cluster: &EpisodeCluster,
    ) -> Result<Vec<Node>, DeclarativeMemoryError> {
        let derivatives = derivation_workflow.deriver.derive(cluster).await?;
        if derivatives.is_empty() || derivation_workflow.mutation_workflows.is_empty() {
            return Ok(Vec::new());
        }

        let mutation_results: Vec<Vec<Node>> = join_all(
            derivation_workflow
                .mutation_workflows
                .iter()
                .map(|mw| self.run_mutation_workflow(mw, &derivatives, cluster)),
        )
        .await;

        Ok(mutation_results.into_iter().flatten().collect())
    }

    async fn run_mutation_workflow(
        &self,
        mutation_workflow: &MutationWorkflow,
        derivatives: &[Derivative],
        cluster: &EpisodeCluster,
    ) -> Vec<Node> {
        let mutated = mutate_all(&*mutation_workflow.mutator, derivatives, cluster).await;
        self.embed_and_build_derivative_nodes(mutated).await
    }

    /// Embed a batch of mutated derivatives and attach the resulting vector
    /// to each as a `Derivative` node. On embedding failure, logs and drops
    /// this mutation workflow's contribution entirely rather than persisting
    /// un-embedded derivatives that could never be found again (§4.8 Failure
    /// semantics).
    async fn embed_and_build_derivative_nodes(&self, derivatives: Vec<Derivative>) -> Vec<Node> {
        if derivatives.is_empty() {
            return Vec::new();
        }
        let contents: Vec<String> = derivatives.iter().map(|d| d.content.clone()).collect();
        match self.embedder.ingest_embed(&contents, 3).await {
            Ok(embeddings) => {
                let property_name =
                    Derivative::embedding_property_name(self.embedder.model_id(), self.embedder.dimensions());
                derivatives
                    .into_iter()
                    .zip(embeddings)
                    .map(|(derivative, embedding)| {
                        let mut node = derivative.to_node();
                        node.properties.insert(
                            property_name.clone(),
                            Property::FloatList(embedding.iter().map(|v| *v as f64).collect()),
                        );
                        node
                    })
                    .collect()
            }
            Err(error) => {
                tracing::error!(%error, "failed to embed mutated derivatives; dropping workflow contribution");
                Vec::new()
            }
        }
    }

    /// Retrieve episodes relevant to `query`, respecting `num_episodes_limit`
    /// and `property_filter`. Mirrors `DeclarativeMemory.search`.
    pub async fn search(
        &self,
        query: &str,
        num_episodes_limit: usize,
        property_filter: &HashMap<String, FilterablePropertyValue>,
    ) -> Result<Vec<Episode>, DeclarativeMemoryError> {
        let required_properties: HashMap<String, Property> = property_filter
            .iter()
            .map(|(key, value)| (mangle_filterable_property_key(key), filterable_to_property(value)))
            .collect();

        // 1. Query derivation: wrap the query in a synthetic single-episode
        // cluster and pass it through the configured query deriver.
        let query_episode = Episode {
            uuid: Uuid::new_v4(),
            episode_type: DEFAULT_EPISODE_TYPE.to_string(),
            group_id: String::new(),
            session_id: String::new(),
            producer_id: String::new(),
            produced_for_id: String::new(),
            content: query.to_string(),
            content_type: crate::types::ContentType::String,
            timestamp: Utc::now(),
            filterable_properties: HashMap::new(),
            user_metadata: HashMap::new(),
        };
        let query_cluster = EpisodeCluster {
            uuid: Uuid::new_v4(),
            episodes: vec![query_episode],
            timestamp: Utc::now(),
            filterable_properties: HashMap::new(),
            user_metadata: HashMap::new(),
        };
        let query_derivatives = self.query_deriver.derive(&query_cluster).await?;
        if query_derivatives.is_empty() {
            return Ok(Vec::new());
        }

        // 2. Embed the query derivatives; on failure, return empty.
        let contents: Vec<String> = query_derivatives.iter().map(|d| d.content.clone()).collect();
        let query_embeddings = match self.embedder.search_embed(&contents, 3).await {
            Ok(embeddings) => embeddings,
            Err(error) => {
                tracing::error!(%error, "query embedding failed; returning empty search result");
                return Ok(Vec::new());
            }
        };

        // 3. Vector match against Derivative nodes, union across derivatives.
        let derivative_property_name =
            Derivative::embedding_property_name(self.embedder.model_id(), self.embedder.dimensions());
        let derivative_label: HashSet<String> = [DERIVATIVE_LABEL.to_string()].into_iter().collect();
        let matched_derivative_batches: Vec<Vec<ScoredNode>> = try_join_all(query_embeddings.iter().map(
            |embedding| {
                self.store.search_similar_nodes(
                    embedding,
                    &derivative_property_name,
                    self.embedder.similarity_metric(),
                    ANN_CANDIDATE_LIMIT,
                    Some(derivative_label.clone()),
                    required_properties.clone(),
                    true,
                )
            },
        ))
        .await?;
        let matched_derivatives = dedupe_nodes(
            matched_derivative_batches.into_iter().flatten().map(|scored| scored.node),
        );

        // 4. Derivative -> EpisodeCluster via DERIVED_FROM (permissive filter).
        let cluster_label: HashSet<String> = [EPISODE_CLUSTER_LABEL.to_string()].into_iter().collect();
        let derived_from: HashSet<String> = [DERIVED_FROM.to_string()].into_iter().collect();
        let matched_clusters = dedupe_nodes(
            try_join_all(matched_derivatives.iter().map(|derivative_node| {
                self.store.search_related_nodes(
                    derivative_node.uuid,
                    Some(derived_from.clone()),
                    false,
                    true,
                    None,
                    Some(cluster_label.clone()),
                    required_properties.clone(),
                    true,
                )
            }))
            .await?
            .into_iter()
            .flatten(),
        );

        // 5. EpisodeCluster -> Episode via CONTAINS, strict filter: nuclei.
        let episode_label: HashSet<String> = [EPISODE_LABEL.to_string()].into_iter().collect();
        let contains: HashSet<String> = [CONTAINS.to_string()].into_iter().collect();
        let nuclei = dedupe_nodes(
            try_join_all(matched_clusters.iter().map(|cluster_node| {
                self.store.search_related_nodes(
                    cluster_node.uuid,
                    Some(contains.clone()),
                    false,
                    true,
                    None,
                    Some(episode_label.clone()),
                    required_properties.clone(),
                    false,
                )
            }))
            .await?
            .into_iter()
            .flatten(),
        );
        if nuclei.is_empty() {
            return Ok(Vec::new());
        }

        // 6. Context expansion: BFS 1-hop (or configured depth) per nucleus.
        let contexts: Vec<Vec<Node>> = try_join_all(
            nuclei
                .iter()
                .map(|nucleus| self.expand_episode_node_context(nucleus, required_properties.clone())),
        )
        .await?;

        // 7. Rerank contexts: render each chronologically, score via C3.
        let candidates: Vec<(String, String)> = contexts
            .iter()
            .enumerate()
            .map(|(index, context)| (index.to_string(), self.render_context(context)))
            .collect();
        let reranked = self.reranker.rerank(query, candidates, None).await?;

        let anchored: Vec<(&Node, &Vec<Node>)> = reranked
            .iter()
            .filter_map(|item| {
                let index: usize = item.key.parse().ok()?;
                Some((&nuclei[index], &contexts[index]))
            })
            .collect();

        // 8. Unify under budget.
        let unified = unify_anchored_contexts(anchored, num_episodes_limit);

        // 9. Reconstruct episodes, sorted ascending by timestamp.
        let mut episodes: Vec<Episode> =
            unified.into_iter().map(|node| Episode::from_node(&node)).collect::<Result<_, _>>()?;
        episodes.sort_by_key(|episode| episode.timestamp);
        Ok(episodes)
    }

    async fn expand_episode_node_context(
        &self,
        nucleus: &Node,
        required_properties: HashMap<String, Property>,
    ) -> Result<Vec<Node>, GraphStoreError> {
        let episode_label: HashSet<String> = [EPISODE_LABEL.to_string()].into_iter().collect();
        let mut retrieved: HashMap<Uuid, Node> = HashMap::new();
        retrieved.insert(nucleus.uuid, nucleus.clone());
        let mut frontier = vec![nucleus.clone()];

        for _ in 0..self.retrieval_depth {
            let neighborhoods = try_join_all(frontier.iter().map(|node| {
                self.store.search_related_nodes(
                    node.uuid,
                    None,
                    true,
                    true,
                    Some(CONTEXT_EXPANSION_STEP_LIMIT),
                    Some(episode_label.clone()),
                    required_properties.clone(),
                    true,
                )
            }))
            .await?;

            let mut next_frontier = Vec::new();
            for neighbors in neighborhoods {
                for neighbor in neighbors {
                    if let std::collections::hash_map::Entry::Vacant(entry) = retrieved.entry(neighbor.uuid) {
                        entry.insert(neighbor.clone());
                        next_frontier.push(neighbor);
                    }
                }
            }
            if next_frontier.is_empty() {
                break;
            }
            frontier = next_frontier;
        }

        Ok(retrieved.into_values().collect())
    }

    /// Render a context's episodes chronologically via the configured
    /// `$`-template, one per line.
    fn render_context(&self, context: &[Node]) -> String {
        let mut episodes: Vec<Episode> =
            context.iter().filter_map(|node| Episode::from_node(node).ok()).collect();
        episodes.sort_by_key(|episode| episode.timestamp);
        episodes
            .iter()
            .map(|episode| render_episode_template(&self.episode_metadata_template, episode))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Drop every node and edge in the store. Mirrors `forget_all`.
    pub async fn forget_all(&self) -> Result<(), DeclarativeMemoryError> {
        self.store.clear_data().await?;
        Ok(())
    }

    /// Delete every Episode matching `property_filter`, plus the
    /// EpisodeClusters and Derivatives reachable from them. Mirrors
    /// `forget_filtered_episodes`.
    pub async fn forget_filtered_episodes(
        &self,
        property_filter: &HashMap<String, FilterablePropertyValue>,
    ) -> Result<(), DeclarativeMemoryError> {
        let required_properties: HashMap<String, Property> = property_filter
            .iter()
            .map(|(key, value)| (mangle_filterable_property_key(key), filterable_to_property(value)))
            .collect();

        let episode_label: HashSet<String> = [EPISODE_LABEL.to_string()].into_iter().collect();
        let matching_episodes = self
            .store
            .search_matching_nodes(None, Some(episode_label), required_properties, false)
            .await?;

        let cluster_label: HashSet<String> = [EPISODE_CLUSTER_LABEL.to_string()].into_iter().collect();
        let contains: HashSet<String> = [CONTAINS.to_string()].into_iter().collect();
        let clusters = dedupe_nodes(
            try_join_all(matching_episodes.iter().map(|episode_node| {
                self.store.search_related_nodes(
                    episode_node.uuid,
                    Some(contains.clone()),
                    true,
                    false,
                    None,
                    Some(cluster_label.clone()),
                    HashMap::new(),
                    false,
                )
            }))
            .await?
            .into_iter()
            .flatten(),
        );

        let derivative_label: HashSet<String> = [DERIVATIVE_LABEL.to_string()].into_iter().collect();
        let derived_from: HashSet<String> = [DERIVED_FROM.to_string()].into_iter().collect();
        let derivatives = dedupe_nodes(
            try_join_all(clusters.iter().map(|cluster_node| {
                self.store.search_related_nodes(
                    cluster_node.uuid,
                    Some(derived_from.clone()),
                    true,
                    false,
                    None,
                    Some(derivative_label.clone()),
                    HashMap::new(),
                    false,
                )
            }))
            .await?
            .into_iter()
            .flatten(),
        );

        let mut uuids: Vec<Uuid> = matching_episodes.iter().map(|n| n.uuid).collect();
        uuids.extend(clusters.iter().map(|n| n.uuid));
        uuids.extend(derivatives.iter().map(|n| n.uuid));
        self.store.delete_nodes(uuids).await?;
        Ok(())
    }
}

/// Run a mutator across every derivative, flattening its outputs. Mutator
/// failures are logged and that derivative's contribution is dropped rather
/// than failing the whole workflow, matching the embedding-failure tolerance
/// described for this pipeline stage.
async fn mutate_all(
    mutator: &dyn DerivativeMutator,
    derivatives: &[Derivative],
    cluster: &EpisodeCluster,
) -> Vec<Derivative> {
    let results: Vec<Result<Vec<Derivative>, MutatorError>> =
        join_all(derivatives.iter().map(|derivative| mutator.mutate(derivative, cluster))).await;
    let mut mutated = Vec::new();
    for result in results {
        match result {
            Ok(outputs) => mutated.extend(outputs),
            Err(error) => tracing::error!(%error, "mutator failed; dropping derivative"),
        }
    }
    mutated
}

/// Build the cluster a new episode belongs to: the episode plus whatever the
/// postulator judges related, sorted chronologically, with filterable
/// properties intersected across every member. Mirrors the cluster assembly
/// described in §4.5.
async fn assemble_episode_cluster(
    postulator: &dyn RelatedEpisodePostulator,
    episode: &Episode,
) -> Result<EpisodeCluster, DeclarativeMemoryError> {
    let related = postulator.postulate(episode).await?;
    let mut members = Vec::with_capacity(related.len() + 1);
    members.push(episode.clone());
    members.extend(related);
    members.sort_by_key(|member| member.timestamp);

    let filterable_properties = intersect_filterable_properties(&members);
    let timestamp = members.last().map(|m| m.timestamp).unwrap_or(episode.timestamp);

    Ok(EpisodeCluster {
        uuid: Uuid::new_v4(),
        timestamp,
        filterable_properties,
        user_metadata: episode.user_metadata.clone(),
        episodes: members,
    })
}

fn intersect_filterable_properties(
    episodes: &[Episode],
) -> HashMap<String, FilterablePropertyValue> {
    let mut iter = episodes.iter();
    let Some(first) = iter.next() else { return HashMap::new() };
    let mut intersection = first.filterable_properties.clone();
    for episode in iter {
        intersection.retain(|key, value| episode.filterable_properties.get(key) == Some(value));
    }
    intersection
}

fn filterable_to_property(value: &FilterablePropertyValue) -> Property {
    match value {
        FilterablePropertyValue::Bool(b) => Property::Bool(*b),
        FilterablePropertyValue::Int(i) => Property::Int(*i),
        FilterablePropertyValue::Str(s) => Property::Str(s.clone()),
    }
}

fn dedupe_nodes(nodes: impl IntoIterator<Item = Node>) -> Vec<Node> {
    let mut seen = HashSet::new();
    nodes.into_iter().filter(|node| seen.insert(node.uuid)).collect()
}

/// Render one episode against the `$`-template used for context scoring,
/// reusing [`crate::mutator`]'s `$`-to-`{}` translation so both mutation and
/// retrieval share one substitution implementation.
fn render_episode_template(template: &str, episode: &Episode) -> String {
    let mut values: HashMap<&str, String> = HashMap::new();
    values.insert("content", episode.content.clone());
    values.insert("timestamp", episode.timestamp.to_rfc3339());
    values.insert("episode_type", episode.episode_type.clone());
    values.insert("producer_id", episode.producer_id.clone());
    values.insert("produced_for_id", episode.produced_for_id.clone());
    for (key, value) in &episode.filterable_properties {
        values.insert(key.as_str(), value.to_string());
    }
    for (key, value) in &episode.user_metadata {
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        values.insert(key.as_str(), rendered);
    }
    let borrowed: HashMap<&str, &str> = values.iter().map(|(k, v)| (*k, v.as_str())).collect();
    crate::config::render_prompt_template(&crate::mutator::dollar_to_brace(template), &borrowed)
}

/// Greedily add whole contexts while they fit the budget; once one doesn't,
/// fill the remaining budget chronologically-then-by-proximity-to-nucleus
/// and stop globally. Mirrors §4.8 step 8.
fn unify_anchored_contexts(anchored: Vec<(&Node, &Vec<Node>)>, limit: usize) -> Vec<Node> {
    let mut unified: HashMap<Uuid, Node> = HashMap::new();

    for (nucleus, context) in anchored {
        if unified.len() >= limit {
            break;
        }
        let new_members = context.iter().filter(|n| !unified.contains_key(&n.uuid)).count();
        if unified.len() + new_members <= limit {
            for node in context {
                unified.entry(node.uuid).or_insert_with(|| node.clone());
            }
            continue;
        }

        let mut chronological: Vec<&Node> = context.iter().collect();
        chronological.sort_by_key(|node| episode_timestamp(node));
        let nucleus_index =
            chronological.iter().position(|node| node.uuid == nucleus.uuid).unwrap_or(0);
        let mut by_proximity: Vec<(usize, &Node)> = chronological.iter().copied().enumerate().collect();
        by_proximity.sort_by_key(|(index, _)| (*index as isize - nucleus_index as isize).abs());

        for (_, node) in by_proximity {
            if unified.len() >= limit {
                break;
            }
            unified.entry(node.uuid).or_insert_with(|| node.clone());
        }
        if unified.len() >= limit {
            break;
        }
    }

    unified.into_values().collect()
}

fn episode_timestamp(node: &Node) -> chrono::DateTime<Utc> {
    match node.properties.get("timestamp") {
        Some(Property::DateTime(ts)) => *ts,
        _ => chrono::DateTime::<Utc>::MIN_UTC,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deriver::IdentityDeriver;
    use crate::graph::sqlite_store::SqliteGraphStore;
    use crate::mutator::IdentityMutator;
    use crate::postulator::NullPostulator;
    use crate::reranker::PassthroughReranker;
    use crate::types::ContentType;

    struct StubEmbedder;

    #[async_trait::async_trait]
    impl Embedder for StubEmbedder {
        async fn ingest_embed(
            &self,
            inputs: &[String],
            _max_attempts: u32,
        ) -> Result<Vec<Vec<f32>>, EmbedderError> {
            Ok(inputs.iter().map(|text| vec![text.len() as f32, 0.0]).collect())
        }

        async fn search_embed(
            &self,
            queries: &[String],
            _max_attempts: u32,
        ) -> Result<Vec<Vec<f32>>, EmbedderError> {
            Ok(queries.iter().map(|text| vec![text.len() as f32, 0.0]).collect())
        }

        fn model_id(&self) -> &str {
            "stub"
        }

        fn dimensions(&self) -> usize {
            2
        }

        fn similarity_metric(&self) -> SimilarityMetric {
            SimilarityMetric::Cosine
        }
    }

    fn sample_episode(content: &str) -> Episode {
        Episode {
            uuid: Uuid::new_v4(),
            episode_type: DEFAULT_EPISODE_TYPE.to_string(),
            group_id: "g1".into(),
            session_id: "s1".into(),
            producer_id: "user-1".into(),
            produced_for_id: "agent-1".into(),
            content: content.to_string(),
            content_type: ContentType::String,
            timestamp: Utc::now(),
            filterable_properties: [(
                "group_id".to_string(),
                FilterablePropertyValue::Str("g1".into()),
            )]
            .into_iter()
            .collect(),
            user_metadata: HashMap::new(),
        }
    }

    async fn sample_memory() -> DeclarativeMemory {
        let store: Arc<dyn VectorGraphStore> =
            Arc::new(SqliteGraphStore::open(None, 2).await.unwrap());
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
        DeclarativeMemory::new(
            store,
            Arc::new(StubEmbedder),
            Arc::new(PassthroughReranker),
            Arc::new(IdentityDeriver::new()),
            vec![Arc::new(NullPostulator)],
            workflows,
        )
    }

    #[tokio::test]
    async fn add_episode_then_search_round_trips() {
        let memory = sample_memory().await;
        let episode = sample_episode("the quick brown fox");
        memory.add_episode(&episode).await.unwrap();

        let mut filter = HashMap::new();
        filter.insert("group_id".to_string(), FilterablePropertyValue::Str("g1".into()));
        let results = memory.search("the quick brown fox", 20, &filter).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "the quick brown fox");
    }

    #[tokio::test]
    async fn forget_all_clears_everything() {
        let memory = sample_memory().await;
        memory.add_episode(&sample_episode("hello")).await.unwrap();
        memory.forget_all().await.unwrap();

        let filter = HashMap::new();
        let results = memory.search("hello", 20, &filter).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn forget_filtered_episodes_removes_matching_only() {
        let memory = sample_memory().await;
        let keep = sample_episode("keep me");
        let mut drop_me = sample_episode("drop me");
        drop_me.group_id = "g2".into();
        drop_me.filterable_properties =
            [("group_id".to_string(), FilterablePropertyValue::Str("g2".into()))].into_iter().collect();
        memory.add_episode(&keep).await.unwrap();
        memory.add_episode(&drop_me).await.unwrap();

        let mut filter = HashMap::new();
        filter.insert("group_id".to_string(), FilterablePropertyValue::Str("g2".into()));
        memory.forget_filtered_episodes(&filter).await.unwrap();

        let empty_filter = HashMap::new();
        let results = memory.search("keep me", 20, &empty_filter).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "keep me");
    }

    #[test]
    fn unify_anchored_contexts_respects_budget() {
        let mut make_node = |ts_offset: i64| {
            let mut node = Node::new(["Episode".to_string()]);
            node.properties.insert(
                "timestamp".to_string(),
                Property::DateTime(Utc::now() + chrono::Duration::seconds(ts_offset)),
            );
            node
        };
        let nucleus = make_node(0);
        let context = vec![make_node(-2), make_node(-1), nucleus.clone(), make_node(1), make_node(2)];
        let anchored = vec![(&nucleus, &context)];
        let unified = unify_anchored_contexts(anchored, 3);
        assert_eq!(unified.len(), 3);
    }
}

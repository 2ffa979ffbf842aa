//! Vector-graph store: the storage abstraction underneath declarative memory.
//!
//! Mirrors the original's `VectorGraphStore` interface (node/edge CRUD,
//! similarity search, relation traversal, directional scan, matching scan)
//! as an async trait, so declarative memory can be built against any backend
//! implementing it. [`sqlite_store::SqliteGraphStore`] is the concrete
//! implementation shipped with this crate.

pub mod sqlite_store;
#[cfg(feature = "vector-search")]
pub mod vector_index;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use sqlite_store::SqliteGraphStore;

/// Error surface for [`VectorGraphStore`] implementations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum GraphStoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("node not found: {0}")]
    NodeNotFound(Uuid),

    #[error("vector index error: {0}")]
    VectorIndex(String),

    #[error("embedding dimension mismatch: index has {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A scalar or list-of-scalar value attached to a [`Node`] or [`Edge`].
///
/// Broader than [`crate::types::FilterablePropertyValue`]: the graph layer
/// also stores floats, datetimes, and homogeneous lists, since nodes carry
/// embedding vectors and episode timestamps directly as properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Property {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    DateTime(DateTime<Utc>),
    BoolList(Vec<bool>),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
    StrList(Vec<String>),
    DateTimeList(Vec<DateTime<Utc>>),
    Null,
}

impl Property {
    /// View this property as an embedding vector, if it is a float list.
    pub fn as_embedding(&self) -> Option<Vec<f32>> {
        match self {
            Property::FloatList(values) => Some(values.iter().map(|v| *v as f32).collect()),
            _ => None,
        }
    }
}

/// A node in the vector-graph store: an episode, a derivative, or a cluster
/// anchor, tagged with labels and keyed by `uuid`.
///
/// Equality and hashing are over `uuid` only, matching the original's
/// dataclass (`eq=False` structural fields, identity by uuid).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub uuid: Uuid,
    pub labels: HashSet<String>,
    pub properties: HashMap<String, Property>,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}
impl Eq for Node {}
impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
    }
}

impl Node {
    pub fn new(labels: impl IntoIterator<Item = String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            labels: labels.into_iter().collect(),
            properties: HashMap::new(),
        }
    }
}

/// A directed, labeled edge between two nodes, keyed by `uuid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub uuid: Uuid,
    pub source_uuid: Uuid,
    pub target_uuid: Uuid,
    pub relation: String,
    pub properties: HashMap<String, Property>,
}

impl PartialEq for Edge {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}
impl Eq for Edge {}
impl std::hash::Hash for Edge {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
    }
}

impl Edge {
    pub fn new(source_uuid: Uuid, target_uuid: Uuid, relation: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            source_uuid,
            target_uuid,
            relation: relation.into(),
            properties: HashMap::new(),
        }
    }
}

/// Relation name used to link a derivative node back to the episode(s) or
/// cluster it was derived from.
pub const DERIVED_FROM: &str = "DERIVED_FROM";

/// Relation name used to link an episode cluster to its member episodes.
pub const CONTAINS: &str = "CONTAINS";

/// Relation name used to link an episode to another episode a postulator
/// judged related to it (e.g. the immediately preceding episode).
pub const RELATED_TO: &str = "RELATED_TO";

/// Distance metric used for a similarity search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    Euclidean,
    DotProduct,
    Manhattan,
}

/// A scored node returned from a similarity or directional search.
#[derive(Debug, Clone)]
pub struct ScoredNode {
    pub node: Node,
    pub score: f32,
}

/// Storage abstraction over a property graph with per-property vector
/// indexes, grounded verbatim on the original's `VectorGraphStore` abstract
/// base class.
#[async_trait]
pub trait VectorGraphStore: Send + Sync {
    /// Insert or upsert the given nodes.
    async fn add_nodes(&self, nodes: Vec<Node>) -> Result<(), GraphStoreError>;

    /// Insert or upsert the given edges.
    async fn add_edges(&self, edges: Vec<Edge>) -> Result<(), GraphStoreError>;

    /// Find nodes whose `embedding_property_name` vector is nearest to
    /// `query_embedding`, optionally filtered by label and property.
    #[allow(clippy::too_many_arguments)]
    async fn search_similar_nodes(
        &self,
        query_embedding: &[f32],
        embedding_property_name: &str,
        similarity_metric: SimilarityMetric,
        limit: usize,
        required_labels: Option<HashSet<String>>,
        required_properties: HashMap<String, Property>,
        include_missing_properties: bool,
    ) -> Result<Vec<ScoredNode>, GraphStoreError>;

    /// Traverse edges incident to `node_uuid`, returning the nodes at the
    /// other end, optionally restricted to certain relation names/directions.
    #[allow(clippy::too_many_arguments)]
    async fn search_related_nodes(
        &self,
        node_uuid: Uuid,
        allowed_relations: Option<HashSet<String>>,
        find_sources: bool,
        find_targets: bool,
        limit: Option<usize>,
        required_labels: Option<HashSet<String>>,
        required_properties: HashMap<String, Property>,
        include_missing_properties: bool,
    ) -> Result<Vec<Node>, GraphStoreError>;

    /// Scan nodes ordered by a property, optionally starting at a value and
    /// direction, the way the related-episode postulator walks episodes
    /// backwards in time from a timestamp.
    #[allow(clippy::too_many_arguments)]
    async fn search_directional_nodes(
        &self,
        by_property: &str,
        start_at_value: Option<Property>,
        include_equal_start_at_value: bool,
        order_ascending: bool,
        limit: usize,
        required_labels: Option<HashSet<String>>,
        required_properties: HashMap<String, Property>,
        include_missing_properties: bool,
    ) -> Result<Vec<Node>, GraphStoreError>;

    /// Scan nodes matching label/property filters with no particular order.
    async fn search_matching_nodes(
        &self,
        limit: Option<usize>,
        required_labels: Option<HashSet<String>>,
        required_properties: HashMap<String, Property>,
        include_missing_properties: bool,
    ) -> Result<Vec<Node>, GraphStoreError>;

    /// Delete the given nodes and any edges incident to them.
    async fn delete_nodes(&self, node_uuids: Vec<Uuid>) -> Result<(), GraphStoreError>;

    /// Drop all nodes and edges, leaving the store empty but usable.
    async fn clear_data(&self) -> Result<(), GraphStoreError>;

    /// Release any resources (connections, index files) held by the store.
    async fn close(&self) -> Result<(), GraphStoreError>;
}

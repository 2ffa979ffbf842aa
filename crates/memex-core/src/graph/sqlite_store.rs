//! SQLite-backed [`VectorGraphStore`](super::VectorGraphStore) implementation.
//!
//! Nodes and edges live in SQLite (connection/PRAGMA setup grounded on
//! `storage/sqlite.rs`); each `(label, embedding_property_name)` pair gets
//! its own HNSW index (grounded on `search/vector.rs`'s `VectorIndex`),
//! built lazily the first time a similarity search needs it and guarded by
//! a creation lock so concurrent callers don't race to build the same
//! index twice.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

#[cfg(feature = "vector-search")]
use super::vector_index::{VectorIndex, VectorIndexConfig};

use super::{Edge, GraphStoreError, Node, Property, ScoredNode, SimilarityMetric};

/// Escape a property name into a filesystem/identifier-safe form, replacing
/// every byte outside `[A-Za-z0-9_]` with `_u<hex>_`. Reversible via
/// [`desanitize_identifier`]. Used to derive stable on-disk file stems for
/// per-`(label, property)` vector indexes from arbitrary user property names.
pub fn sanitize_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("_u{b:02x}_"));
        }
    }
    out
}

/// Inverse of [`sanitize_identifier`].
pub fn desanitize_identifier(sanitized: &str) -> String {
    let mut out = String::with_capacity(sanitized.len());
    let bytes = sanitized.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_' && i + 1 < bytes.len() && bytes[i + 1] == b'u' && i + 4 < bytes.len() {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 2..i + 4]) {
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    if bytes.get(i + 4) == Some(&b'_') {
                        out.push(byte as char);
                        i += 5;
                        continue;
                    }
                }
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// Registry of per-`(label, embedding_property)` HNSW indexes. Behind the
/// `vector-search` feature this wraps [`VectorIndex`]; without it (or
/// without `usearch` bindings available), the registry is permanently
/// empty and every similarity search takes the exact-scan path below.
#[cfg(feature = "vector-search")]
struct VectorIndexRegistry {
    indexes: AsyncMutex<HashMap<(String, String), Arc<AsyncMutex<VectorIndex>>>>,
    dimensions: usize,
}

#[cfg(feature = "vector-search")]
impl VectorIndexRegistry {
    fn new(dimensions: usize) -> Self {
        Self {
            indexes: AsyncMutex::new(HashMap::new()),
            dimensions,
        }
    }

    /// Fetch the index for `(label, embedding_property)`, creating it if
    /// absent. The outer registry lock serializes creation across
    /// concurrent callers; once created, callers only contend on the
    /// per-index lock.
    async fn get_or_create(
        &self,
        label: &str,
        embedding_property: &str,
    ) -> Result<Arc<AsyncMutex<VectorIndex>>, GraphStoreError> {
        let key = (label.to_string(), embedding_property.to_string());
        let mut indexes = self.indexes.lock().await;
        if let Some(existing) = indexes.get(&key) {
            return Ok(Arc::clone(existing));
        }
        tracing::debug!(label, embedding_property, "creating vector index");
        let index = VectorIndex::with_config(VectorIndexConfig {
            dimensions: self.dimensions,
            ..VectorIndexConfig::default()
        })
        .map_err(|e| GraphStoreError::VectorIndex(e.to_string()))?;
        let index = Arc::new(AsyncMutex::new(index));
        indexes.insert(key, Arc::clone(&index));
        Ok(index)
    }

    async fn existing(
        &self,
        label: &str,
        embedding_property: &str,
    ) -> Option<Arc<AsyncMutex<VectorIndex>>> {
        let key = (label.to_string(), embedding_property.to_string());
        self.indexes.lock().await.get(&key).cloned()
    }

    async fn remove_node(&self, uuid: &Uuid) {
        let mut indexes = self.indexes.lock().await;
        for index in indexes.values_mut() {
            let mut index = index.lock().await;
            let _ = index.remove(&uuid.to_string());
        }
    }

    async fn clear(&self) {
        self.indexes.lock().await.clear();
    }
}

#[cfg(not(feature = "vector-search"))]
struct VectorIndexRegistry;

#[cfg(not(feature = "vector-search"))]
impl VectorIndexRegistry {
    fn new(_dimensions: usize) -> Self {
        Self
    }

    async fn remove_node(&self, _uuid: &Uuid) {}

    async fn clear(&self) {}
}

/// SQLite + per-property HNSW vector-graph store.
pub struct SqliteGraphStore {
    conn: Arc<AsyncMutex<Connection>>,
    vector_indexes: VectorIndexRegistry,
}

impl SqliteGraphStore {
    /// Open (creating if absent) a graph store at `path`, or an in-memory
    /// store when `path` is `None`.
    pub async fn open(
        path: Option<PathBuf>,
        embedding_dimensions: usize,
    ) -> Result<Self, GraphStoreError> {
        let conn = match path {
            Some(p) => Connection::open(p)?,
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS nodes (
                uuid TEXT PRIMARY KEY,
                labels TEXT NOT NULL,
                properties TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS node_labels (
                node_uuid TEXT NOT NULL REFERENCES nodes(uuid) ON DELETE CASCADE,
                label TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_node_labels_label ON node_labels(label);
             CREATE TABLE IF NOT EXISTS edges (
                uuid TEXT PRIMARY KEY,
                source_uuid TEXT NOT NULL,
                target_uuid TEXT NOT NULL,
                relation TEXT NOT NULL,
                properties TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_uuid);
             CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_uuid);",
        )?;

        Ok(Self {
            conn: Arc::new(AsyncMutex::new(conn)),
            vector_indexes: VectorIndexRegistry::new(embedding_dimensions),
        })
    }

    fn row_to_node(uuid: &str, labels_json: &str, properties_json: &str) -> Option<Node> {
        let uuid = Uuid::parse_str(uuid).ok()?;
        let labels: HashSet<String> = serde_json::from_str(labels_json).ok()?;
        let properties: HashMap<String, Property> = serde_json::from_str(properties_json).ok()?;
        Some(Node {
            uuid,
            labels,
            properties,
        })
    }

    fn node_matches(
        node: &Node,
        required_labels: &Option<HashSet<String>>,
        required_properties: &HashMap<String, Property>,
        include_missing_properties: bool,
    ) -> bool {
        if let Some(labels) = required_labels {
            if !labels.is_subset(&node.labels) {
                return false;
            }
        }
        for (key, expected) in required_properties {
            match node.properties.get(key) {
                Some(actual) => {
                    if actual != expected {
                        return false;
                    }
                }
                None => {
                    if !include_missing_properties {
                        return false;
                    }
                }
            }
        }
        true
    }

    async fn insert_node(conn: &Connection, node: &Node) -> Result<(), GraphStoreError> {
        let labels_json = serde_json::to_string(&node.labels)?;
        let properties_json = serde_json::to_string(&node.properties)?;
        conn.execute(
            "INSERT INTO nodes (uuid, labels, properties) VALUES (?1, ?2, ?3)
             ON CONFLICT(uuid) DO UPDATE SET labels = excluded.labels, properties = excluded.properties",
            params![node.uuid.to_string(), labels_json, properties_json],
        )?;
        conn.execute(
            "DELETE FROM node_labels WHERE node_uuid = ?1",
            params![node.uuid.to_string()],
        )?;
        for label in &node.labels {
            conn.execute(
                "INSERT INTO node_labels (node_uuid, label) VALUES (?1, ?2)",
                params![node.uuid.to_string(), label],
            )?;
        }
        Ok(())
    }

    /// Update every vector index keyed by one of `node`'s labels with any
    /// float-list properties it carries, so a later similarity search sees
    /// this node without needing a full rebuild.
    #[cfg(feature = "vector-search")]
    async fn index_node_embeddings(&self, node: &Node) {
        for label in &node.labels {
            for (property_name, value) in &node.properties {
                if let Some(vector) = value.as_embedding() {
                    if let Ok(index) = self.vector_indexes.get_or_create(label, property_name).await {
                        let mut index = index.lock().await;
                        if index.dimensions() == vector.len() {
                            let _ = index.add(&node.uuid.to_string(), &vector);
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(feature = "vector-search"))]
    async fn index_node_embeddings(&self, _node: &Node) {}
}

#[async_trait]
impl super::VectorGraphStore for SqliteGraphStore {
    async fn add_nodes(&self, nodes: Vec<Node>) -> Result<(), GraphStoreError> {
        {
            let conn = self.conn.lock().await;
            for node in &nodes {
                Self::insert_node(&conn, node).await?;
            }
        }
        for node in &nodes {
            self.index_node_embeddings(node).await;
        }
        Ok(())
    }

    async fn add_edges(&self, edges: Vec<Edge>) -> Result<(), GraphStoreError> {
        let conn = self.conn.lock().await;
        for edge in &edges {
            let properties_json = serde_json::to_string(&edge.properties)?;
            conn.execute(
                "INSERT INTO edges (uuid, source_uuid, target_uuid, relation, properties)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(uuid) DO UPDATE SET
                    source_uuid = excluded.source_uuid,
                    target_uuid = excluded.target_uuid,
                    relation = excluded.relation,
                    properties = excluded.properties",
                params![
                    edge.uuid.to_string(),
                    edge.source_uuid.to_string(),
                    edge.target_uuid.to_string(),
                    edge.relation,
                    properties_json,
                ],
            )?;
        }
        Ok(())
    }

    async fn search_similar_nodes(
        &self,
        query_embedding: &[f32],
        embedding_property_name: &str,
        similarity_metric: SimilarityMetric,
        limit: usize,
        required_labels: Option<HashSet<String>>,
        required_properties: HashMap<String, Property>,
        include_missing_properties: bool,
    ) -> Result<Vec<ScoredNode>, GraphStoreError> {
        // An ANN index is keyed by a single label; with no required label we
        // cannot pick one, so we fall back to an exact scan. This is an
        // explicit, logged choice (see DESIGN.md Open Question resolution),
        // not a silent slow path.
        let single_label = match &required_labels {
            Some(labels) if labels.len() == 1 => labels.iter().next().cloned(),
            _ => None,
        };

        #[cfg(feature = "vector-search")]
        if let Some(label) = &single_label {
            if similarity_metric == SimilarityMetric::Cosine {
                if let Some(index) = self.vector_indexes.existing(label, embedding_property_name).await {
                    let index = index.lock().await;
                    if !index.is_empty() {
                        let hits = index
                            .search(query_embedding, limit * 4 + limit.max(1))
                            .map_err(|e| GraphStoreError::VectorIndex(e.to_string()))?;
                        drop(index);
                        let conn = self.conn.lock().await;
                        let mut results = Vec::with_capacity(limit);
                        for (key, score) in hits {
                            let Ok(uuid) = Uuid::parse_str(&key) else { continue };
                            let Some(node) = Self::fetch_node(&conn, uuid)? else { continue };
                            if Self::node_matches(
                                &node,
                                &required_labels,
                                &required_properties,
                                include_missing_properties,
                            ) {
                                results.push(ScoredNode { node, score });
                                if results.len() >= limit {
                                    break;
                                }
                            }
                        }
                        return Ok(results);
                    }
                }
            }
        }
        if single_label.is_none() {
            tracing::debug!("exact scan: no single required label, skipping ANN index");
        }

        // Exact-scan fallback: cosine similarity computed in Rust against
        // every matching node's embedding property.
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT uuid, labels, properties FROM nodes")?;
        let mut rows = stmt.query([])?;
        let mut scored = Vec::new();
        while let Some(row) = rows.next()? {
            let uuid: String = row.get(0)?;
            let labels: String = row.get(1)?;
            let properties: String = row.get(2)?;
            let Some(node) = Self::row_to_node(&uuid, &labels, &properties) else { continue };
            if !Self::node_matches(
                &node,
                &required_labels,
                &required_properties,
                include_missing_properties,
            ) {
                continue;
            }
            let Some(vector) = node.properties.get(embedding_property_name).and_then(Property::as_embedding)
            else {
                continue;
            };
            let score = match similarity_metric {
                SimilarityMetric::Cosine => {
                    crate::embedder::cosine_similarity(query_embedding, &vector)
                }
                SimilarityMetric::Euclidean => {
                    -crate::embedder::euclidean_distance(query_embedding, &vector)
                }
                SimilarityMetric::DotProduct => crate::embedder::dot_product(query_embedding, &vector),
                SimilarityMetric::Manhattan => {
                    -crate::embedder::manhattan_distance(query_embedding, &vector)
                }
            };
            scored.push(ScoredNode { node, score });
        }
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

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
    ) -> Result<Vec<Node>, GraphStoreError> {
        let conn = self.conn.lock().await;
        let mut neighbor_uuids: Vec<Uuid> = Vec::new();

        if find_targets {
            let mut stmt = conn.prepare(
                "SELECT target_uuid, relation FROM edges WHERE source_uuid = ?1",
            )?;
            let mut rows = stmt.query(params![node_uuid.to_string()])?;
            while let Some(row) = rows.next()? {
                let target: String = row.get(0)?;
                let relation: String = row.get(1)?;
                if allowed_relations.as_ref().is_none_or(|r| r.contains(&relation)) {
                    if let Ok(uuid) = Uuid::parse_str(&target) {
                        neighbor_uuids.push(uuid);
                    }
                }
            }
        }
        if find_sources {
            let mut stmt = conn.prepare(
                "SELECT source_uuid, relation FROM edges WHERE target_uuid = ?1",
            )?;
            let mut rows = stmt.query(params![node_uuid.to_string()])?;
            while let Some(row) = rows.next()? {
                let source: String = row.get(0)?;
                let relation: String = row.get(1)?;
                if allowed_relations.as_ref().is_none_or(|r| r.contains(&relation)) {
                    if let Ok(uuid) = Uuid::parse_str(&source) {
                        neighbor_uuids.push(uuid);
                    }
                }
            }
        }

        let mut results = Vec::new();
        for uuid in neighbor_uuids {
            let Some(node) = Self::fetch_node(&conn, uuid)? else { continue };
            if Self::node_matches(&node, &required_labels, &required_properties, include_missing_properties) {
                results.push(node);
                if let Some(limit) = limit {
                    if results.len() >= limit {
                        break;
                    }
                }
            }
        }
        Ok(results)
    }

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
    ) -> Result<Vec<Node>, GraphStoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT uuid, labels, properties FROM nodes")?;
        let mut rows = stmt.query([])?;
        let mut candidates = Vec::new();
        while let Some(row) = rows.next()? {
            let uuid: String = row.get(0)?;
            let labels: String = row.get(1)?;
            let properties: String = row.get(2)?;
            let Some(node) = Self::row_to_node(&uuid, &labels, &properties) else { continue };
            if !Self::node_matches(&node, &required_labels, &required_properties, include_missing_properties) {
                continue;
            }
            let Some(sort_value) = node.properties.get(by_property) else { continue };
            if let Some(start) = &start_at_value {
                let cmp = compare_properties(sort_value, start);
                let keep = match (order_ascending, include_equal_start_at_value) {
                    (true, true) => cmp.is_ge(),
                    (true, false) => cmp.is_gt(),
                    (false, true) => cmp.is_le(),
                    (false, false) => cmp.is_lt(),
                };
                if !keep {
                    continue;
                }
            }
            candidates.push((sort_value.clone(), node));
        }
        candidates.sort_by(|a, b| {
            let ord = compare_properties(&a.0, &b.0);
            if order_ascending { ord } else { ord.reverse() }
        });
        candidates.truncate(limit);
        Ok(candidates.into_iter().map(|(_, n)| n).collect())
    }

    async fn search_matching_nodes(
        &self,
        limit: Option<usize>,
        required_labels: Option<HashSet<String>>,
        required_properties: HashMap<String, Property>,
        include_missing_properties: bool,
    ) -> Result<Vec<Node>, GraphStoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT uuid, labels, properties FROM nodes")?;
        let mut rows = stmt.query([])?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            let uuid: String = row.get(0)?;
            let labels: String = row.get(1)?;
            let properties: String = row.get(2)?;
            let Some(node) = Self::row_to_node(&uuid, &labels, &properties) else { continue };
            if Self::node_matches(&node, &required_labels, &required_properties, include_missing_properties) {
                results.push(node);
                if let Some(limit) = limit {
                    if results.len() >= limit {
                        break;
                    }
                }
            }
        }
        Ok(results)
    }

    async fn delete_nodes(&self, node_uuids: Vec<Uuid>) -> Result<(), GraphStoreError> {
        let conn = self.conn.lock().await;
        for uuid in &node_uuids {
            conn.execute("DELETE FROM nodes WHERE uuid = ?1", params![uuid.to_string()])?;
            conn.execute(
                "DELETE FROM edges WHERE source_uuid = ?1 OR target_uuid = ?1",
                params![uuid.to_string()],
            )?;
        }
        drop(conn);
        for uuid in &node_uuids {
            self.vector_indexes.remove_node(uuid).await;
        }
        Ok(())
    }

    async fn clear_data(&self) -> Result<(), GraphStoreError> {
        {
            let conn = self.conn.lock().await;
            conn.execute_batch("DELETE FROM edges; DELETE FROM node_labels; DELETE FROM nodes;")?;
        }
        self.vector_indexes.clear().await;
        Ok(())
    }

    async fn close(&self) -> Result<(), GraphStoreError> {
        Ok(())
    }
}

impl SqliteGraphStore {
    fn fetch_node(conn: &Connection, uuid: Uuid) -> Result<Option<Node>, GraphStoreError> {
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT labels, properties FROM nodes WHERE uuid = ?1",
                params![uuid.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.and_then(|(labels, properties)| Self::row_to_node(&uuid.to_string(), &labels, &properties)))
    }
}

fn compare_properties(a: &Property, b: &Property) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Property::Int(x), Property::Int(y)) => x.cmp(y),
        (Property::Float(x), Property::Float(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Property::Str(x), Property::Str(y)) => x.cmp(y),
        (Property::DateTime(x), Property::DateTime(y)) => x.cmp(y),
        (Property::Bool(x), Property::Bool(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

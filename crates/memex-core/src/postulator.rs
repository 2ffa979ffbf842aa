//! Related-episode postulators: decide which prior episodes a newly
//! ingested episode should be linked to via a `RELATED_TO` edge.
//!
//! Grounded on `related_episode_postulator/related_episode_postulator.py`
//! (abstract base), `null_related_episode_postulator.py`, and
//! `previous_related_episode_postulator.py`.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::graph::{GraphStoreError, Property, VectorGraphStore};
use crate::types::{Episode, EntityConversionError};

/// Error surface for [`RelatedEpisodePostulator`] implementations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum PostulatorError {
    #[error(transparent)]
    Store(#[from] GraphStoreError),

    #[error(transparent)]
    Conversion(#[from] EntityConversionError),
}

/// Decides which already-stored episodes a newly ingested episode should be
/// linked to, so declarative memory can draw `RELATED_TO` edges between
/// them. Mirrors the original's `RelatedEpisodePostulator` abstract base.
#[async_trait]
pub trait RelatedEpisodePostulator: Send + Sync {
    /// Return the episodes `episode` should be linked to. `episode` itself
    /// is not yet persisted at call time in [`crate::declarative`]'s
    /// ingestion order, so implementations must not assume it is findable
    /// in the store.
    async fn postulate(&self, episode: &Episode) -> Result<Vec<Episode>, PostulatorError>;
}

/// Postulates no relations at all, matching `NullRelatedEpisodePostulator`.
pub struct NullPostulator;

#[async_trait]
impl RelatedEpisodePostulator for NullPostulator {
    async fn postulate(&self, _episode: &Episode) -> Result<Vec<Episode>, PostulatorError> {
        Ok(Vec::new())
    }
}

/// Postulates the `search_limit` most recent episodes strictly before
/// `episode`'s timestamp, optionally restricted to episodes sharing a set
/// of filterable property values with it. Matches
/// `PreviousRelatedEpisodePostulator`.
pub struct PreviousPostulator {
    store: Arc<dyn VectorGraphStore>,
    search_limit: usize,
    filterable_property_keys: HashSet<String>,
}

impl PreviousPostulator {
    pub fn new(store: Arc<dyn VectorGraphStore>) -> Self {
        Self { store, search_limit: 1, filterable_property_keys: HashSet::new() }
    }

    pub fn with_search_limit(mut self, search_limit: usize) -> Self {
        self.search_limit = search_limit;
        self
    }

    pub fn with_filterable_property_keys(mut self, keys: HashSet<String>) -> Self {
        self.filterable_property_keys = keys;
        self
    }
}

#[async_trait]
impl RelatedEpisodePostulator for PreviousPostulator {
    async fn postulate(&self, episode: &Episode) -> Result<Vec<Episode>, PostulatorError> {
        let mangled = episode.mangled_filterable_properties();
        let required_properties = self
            .filterable_property_keys
            .iter()
            .filter_map(|key| {
                let mangled_key = crate::types::mangle_filterable_property_key(key);
                mangled.get(&mangled_key).map(|value| {
                    let property = match value {
                        crate::types::FilterablePropertyValue::Bool(b) => Property::Bool(*b),
                        crate::types::FilterablePropertyValue::Int(i) => Property::Int(*i),
                        crate::types::FilterablePropertyValue::Str(s) => Property::Str(s.clone()),
                    };
                    (mangled_key, property)
                })
            })
            .collect();

        let nodes = self
            .store
            .search_directional_nodes(
                "timestamp",
                Some(Property::DateTime(episode.timestamp)),
                false,
                false,
                self.search_limit,
                Some([crate::types::EPISODE_LABEL.to_string()].into_iter().collect()),
                required_properties,
                false,
            )
            .await?;

        nodes.iter().map(Episode::from_node).collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

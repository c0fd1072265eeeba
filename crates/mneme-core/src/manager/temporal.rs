//! Point-in-time and history reads
//!
//! Backends without [`HistoryQueryable`](crate::storage::HistoryQueryable)
//! only know the current state: history is the current record as a single
//! version, and the graph at a time is the current graph filtered by
//! validity windows. Unknown names are `NotFound` on every backend.

use tracing::debug;

use super::{KnowledgeGraphManager, require_name};
use crate::domain::knowledge::{DecayOptions, Entity, KnowledgeGraph, Relation, RelationKey};
use crate::error::{Error, Result};

impl KnowledgeGraphManager {
    // ========== Temporal Reads ==========

    /// Every version of an entity, oldest first
    pub async fn get_entity_history(&self, entity_name: &str) -> Result<Vec<Entity>> {
        require_name(entity_name, "entityName")?;
        if let Some(history) = self.storage.as_history() {
            return history.get_entity_history(entity_name).await;
        }

        debug!(entity = %entity_name, "No version history, returning current record");
        let graph = self.storage.open_nodes(&[entity_name.to_string()]).await?;
        if graph.entities.is_empty() {
            return Err(Error::EntityNotFound(entity_name.to_string()));
        }
        Ok(graph.entities)
    }

    /// Every version of a relation, oldest first
    pub async fn get_relation_history(&self, key: &RelationKey) -> Result<Vec<Relation>> {
        require_name(&key.from, "from")?;
        require_name(&key.to, "to")?;
        require_name(&key.relation_type, "relationType")?;
        if let Some(history) = self.storage.as_history() {
            return history.get_relation_history(key).await;
        }

        debug!(relation = %key, "No version history, returning current record");
        match self.storage.get_relation(key).await? {
            Some(relation) => Ok(vec![relation]),
            None => Err(Error::RelationNotFound {
                from: key.from.clone(),
                to: key.to.clone(),
                relation_type: key.relation_type.clone(),
            }),
        }
    }

    /// The graph as it stood at `timestamp` (epoch millis)
    pub async fn get_graph_at_time(&self, timestamp: i64) -> Result<KnowledgeGraph> {
        if timestamp < 0 {
            return Err(Error::Validation(format!(
                "timestamp must not be negative, got {}",
                timestamp
            )));
        }
        if let Some(history) = self.storage.as_history() {
            return history.get_graph_at_time(timestamp).await;
        }
        Ok(self.read_graph().await?.valid_at(timestamp))
    }

    /// The current graph with relation confidences decayed by age
    pub async fn get_decayed_graph(&self, options: DecayOptions) -> Result<KnowledgeGraph> {
        if !options.half_life_days.is_finite() {
            return Err(Error::Validation("halfLifeDays must be finite".to_string()));
        }
        if !(0.0..=1.0).contains(&options.min_confidence) {
            return Err(Error::Validation(format!(
                "minConfidence must be between 0 and 1, got {}",
                options.min_confidence
            )));
        }
        Ok(self.read_graph().await?.decayed(&options))
    }
}

//! In-memory view of a knowledge graph

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::entity::Entity;
use super::relation::Relation;
use super::temporal::{DecayOptions, Temporal, now_millis};

/// Filters for keyword search
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchOptions {
    pub limit: Option<usize>,
    pub entity_types: Vec<String>,
}

impl SearchOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_entity_types(mut self, types: Vec<String>) -> Self {
        self.entity_types = types;
        self
    }

    pub fn accepts_type(&self, entity_type: &str) -> bool {
        self.entity_types.is_empty() || self.entity_types.iter().any(|t| t == entity_type)
    }
}

/// A set of entities and the relations among them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeGraph {
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub relations: Vec<Relation>,
}

impl KnowledgeGraph {
    pub fn new(entities: Vec<Entity>, relations: Vec<Relation>) -> Self {
        Self {
            entities,
            relations,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty()
    }

    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn entity_mut(&mut self, name: &str) -> Option<&mut Entity> {
        self.entities.iter_mut().find(|e| e.name == name)
    }

    pub fn contains_entity(&self, name: &str) -> bool {
        self.entity(name).is_some()
    }

    /// Keep only relations whose endpoints are both in `names`
    fn relations_within(&self, names: &HashSet<&str>) -> Vec<Relation> {
        self.relations
            .iter()
            .filter(|r| names.contains(r.from.as_str()) && names.contains(r.to.as_str()))
            .cloned()
            .collect()
    }

    /// Keyword search; relations are those between matched entities.
    pub fn search(&self, query: &str, options: &SearchOptions) -> KnowledgeGraph {
        let mut entities: Vec<Entity> = self
            .entities
            .iter()
            .filter(|e| options.accepts_type(&e.entity_type) && e.matches_query(query))
            .cloned()
            .collect();
        if let Some(limit) = options.limit {
            entities.truncate(limit);
        }
        let names: HashSet<&str> = entities.iter().map(|e| e.name.as_str()).collect();
        let relations = self.relations_within(&names);
        KnowledgeGraph::new(entities, relations)
    }

    /// Named entities plus relations among them; unknown names are skipped.
    pub fn open(&self, names: &[String]) -> KnowledgeGraph {
        let wanted: HashSet<&str> = names.iter().map(String::as_str).collect();
        let entities: Vec<Entity> = self
            .entities
            .iter()
            .filter(|e| wanted.contains(e.name.as_str()))
            .cloned()
            .collect();
        let found: HashSet<&str> = entities.iter().map(|e| e.name.as_str()).collect();
        let relations = self.relations_within(&found);
        KnowledgeGraph::new(entities, relations)
    }

    /// Records in force at `timestamp`.
    ///
    /// An entity must also exist by then (`created_at <= timestamp`).
    /// Relations are kept only when both endpoints survive.
    pub fn valid_at(&self, timestamp: i64) -> KnowledgeGraph {
        let entities: Vec<Entity> = self
            .entities
            .iter()
            .filter(|e| e.created_at <= timestamp && e.is_valid_at(timestamp))
            .cloned()
            .collect();
        let names: HashSet<&str> = entities.iter().map(|e| e.name.as_str()).collect();
        let relations = self
            .relations
            .iter()
            .filter(|r| r.created_at <= timestamp && r.is_valid_at(timestamp))
            .filter(|r| names.contains(r.from.as_str()) && names.contains(r.to.as_str()))
            .cloned()
            .collect();
        KnowledgeGraph::new(entities, relations)
    }

    /// Copy with relation confidences decayed by age since last update.
    pub fn decayed(&self, options: &DecayOptions) -> KnowledgeGraph {
        let reference = options.reference_time.unwrap_or_else(now_millis);
        let relations = self
            .relations
            .iter()
            .map(|r| {
                let mut relation = r.clone();
                if let Some(confidence) = relation.confidence {
                    let last_touched = relation
                        .metadata
                        .as_ref()
                        .map_or(relation.updated_at, |m| m.updated_at.max(relation.updated_at));
                    relation.confidence = Some(options.decay(confidence, reference - last_touched));
                }
                relation
            })
            .collect();
        KnowledgeGraph::new(self.entities.clone(), relations)
    }

    /// Copy with embedding payloads removed from every entity
    pub fn without_embeddings(mut self) -> KnowledgeGraph {
        for entity in &mut self.entities {
            entity.embedding = None;
        }
        self
    }
}

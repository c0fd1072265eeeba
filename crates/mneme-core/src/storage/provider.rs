//! Storage provider contract
//!
//! Every backend implements [`StorageProvider`]. Optional capabilities
//! (semantic search, version history, embedding persistence) are separate
//! traits a backend may expose through the `as_*` accessors; callers must
//! check for them and fall back when they are absent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::knowledge::{
    Entity, EntityEmbedding, KnowledgeGraph, Relation, RelationKey, SearchOptions,
};
use crate::error::Result;

/// What happened to one entity in a batch write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntityOutcome {
    Created,
    /// Existing entity received new observations
    Updated,
    /// Existing entity already had every observation
    Unchanged,
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityWriteResult {
    pub name: String,
    #[serde(flatten)]
    pub outcome: EntityOutcome,
}

impl EntityWriteResult {
    pub fn new(name: impl Into<String>, outcome: EntityOutcome) -> Self {
        Self {
            name: name.into(),
            outcome,
        }
    }

    /// Whether the stored entity changed
    pub fn is_write(&self) -> bool {
        matches!(self.outcome, EntityOutcome::Created | EntityOutcome::Updated)
    }
}

/// What happened to one relation in a batch write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RelationOutcome {
    Created,
    AlreadyExists,
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationWriteResult {
    pub relation: RelationKey,
    #[serde(flatten)]
    pub outcome: RelationOutcome,
}

impl RelationWriteResult {
    pub fn new(relation: RelationKey, outcome: RelationOutcome) -> Self {
        Self { relation, outcome }
    }
}

/// Observations to append to an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationAddition {
    pub entity_name: String,
    pub contents: Vec<String>,
}

/// Observations actually appended (duplicates are skipped)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationResult {
    pub entity_name: String,
    pub added_observations: Vec<String>,
}

/// Observations to remove from an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationDeletion {
    pub entity_name: String,
    pub observations: Vec<String>,
}

/// Filters for backend-native semantic search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SemanticSearchOptions {
    pub limit: usize,
    pub min_similarity: f32,
    pub entity_types: Vec<String>,
}

impl Default for SemanticSearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            min_similarity: 0.0,
            entity_types: Vec::new(),
        }
    }
}

/// One semantic search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemanticMatch {
    pub entity: Entity,
    pub similarity: f32,
}

/// Persistence contract shared by all backends.
///
/// Writes are idempotent by identity: entities by name, relations by
/// `(from, to, relation_type)`. Deletes of missing records are no-ops.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Short backend identifier for logs
    fn backend_name(&self) -> &'static str;

    // ========== Graph Operations ==========

    /// Load every current entity and relation
    async fn load_graph(&self) -> Result<KnowledgeGraph>;

    /// Replace the stored graph with `graph`
    async fn save_graph(&self, graph: &KnowledgeGraph) -> Result<()>;

    /// Keyword search over names, types and observations
    async fn search_nodes(&self, query: &str, options: &SearchOptions) -> Result<KnowledgeGraph>;

    /// Named entities plus the relations among them
    async fn open_nodes(&self, names: &[String]) -> Result<KnowledgeGraph>;

    // ========== Entity Operations ==========

    /// Create missing entities; merge observations into existing ones
    async fn create_entities(&self, entities: Vec<Entity>) -> Result<Vec<EntityWriteResult>>;

    /// Append observations. Fails with `EntityNotFound` before writing
    /// anything if any target entity is missing.
    async fn add_observations(
        &self,
        additions: Vec<ObservationAddition>,
    ) -> Result<Vec<ObservationResult>>;

    /// Delete entities and every relation touching them
    async fn delete_entities(&self, names: &[String]) -> Result<()>;

    async fn delete_observations(&self, deletions: Vec<ObservationDeletion>) -> Result<()>;

    // ========== Relation Operations ==========

    /// Create relations atomically, reporting each item's outcome
    async fn create_relations(&self, relations: Vec<Relation>) -> Result<Vec<RelationWriteResult>>;

    async fn delete_relations(&self, keys: &[RelationKey]) -> Result<()>;

    async fn get_relation(&self, key: &RelationKey) -> Result<Option<Relation>>;

    /// Replace strength, confidence, metadata and validity of an existing
    /// relation. Fails with `RelationNotFound` if absent.
    async fn update_relation(&self, relation: Relation) -> Result<Relation>;

    // ========== Capabilities ==========

    fn as_semantic_search(&self) -> Option<&dyn SemanticSearchable> {
        None
    }

    fn as_history(&self) -> Option<&dyn HistoryQueryable> {
        None
    }

    fn as_vector_capable(&self) -> Option<&dyn VectorCapable> {
        None
    }
}

/// Backend-native similarity search over stored embeddings
#[async_trait]
pub trait SemanticSearchable: Send + Sync {
    async fn semantic_search(
        &self,
        query_vector: &[f32],
        options: &SemanticSearchOptions,
    ) -> Result<Vec<SemanticMatch>>;
}

/// Access to superseded versions
#[async_trait]
pub trait HistoryQueryable: Send + Sync {
    /// Every version of an entity, oldest first
    async fn get_entity_history(&self, name: &str) -> Result<Vec<Entity>>;

    /// Every version of a relation, oldest first
    async fn get_relation_history(&self, key: &RelationKey) -> Result<Vec<Relation>>;

    /// The graph as it stood at `timestamp`
    async fn get_graph_at_time(&self, timestamp: i64) -> Result<KnowledgeGraph>;
}

/// Embedding persistence alongside entities
#[async_trait]
pub trait VectorCapable: Send + Sync {
    /// Fails with `EntityNotFound` if the entity does not exist
    async fn update_entity_embedding(&self, name: &str, embedding: &EntityEmbedding) -> Result<()>;

    async fn get_entity_embedding(&self, name: &str) -> Result<Option<EntityEmbedding>>;
}

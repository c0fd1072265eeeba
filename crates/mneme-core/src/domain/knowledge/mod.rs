//! Knowledge graph domain model
//!
//! - **Entity**: a named node with free-form observations
//! - **Relation**: a directed, typed edge with optional strength and confidence
//! - **KnowledgeGraph**: a set of entities and relations, with keyword
//!   search, time-slicing and confidence decay
//!
//! Every record carries temporal fields (`id`, `createdAt`, `updatedAt`,
//! `version`, `validFrom`, `validTo`, `changedBy`) that are optional on
//! input and assigned by storage on write.

mod entity;
mod graph;
mod relation;
mod temporal;
pub mod validation;

pub use entity::{Entity, EntityEmbedding};
pub use graph::{KnowledgeGraph, SearchOptions};
pub use relation::{DEFAULT_EDGE_COST, Relation, RelationKey, RelationMetadata};
pub use temporal::{DecayOptions, Temporal, now_millis};
pub use validation::{
    has_confidence, has_strength, has_valid_time_range, is_relation, validate_entity,
    validate_entity_payload, validate_relation, validate_relation_payload,
};

pub(crate) use relation::edge_cost;

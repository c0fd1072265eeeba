//! Mneme Core Library
//!
//! This crate provides the core functionality for Mneme, a temporal and
//! semantically searchable knowledge graph:
//! - Knowledge model (entities, relations, validity windows, confidence decay)
//! - Pluggable storage (JSON file + SQLite with version history)
//! - Search result caching
//! - Vector index and embedding job processing
//! - Graph analytics (statistics, centrality, path finding)
//! - The `KnowledgeGraphManager` facade and its tool router

pub mod analytics;
pub mod cache;
pub mod config;
pub mod domain;
pub mod embedding;
pub mod error;
pub mod manager;
pub mod storage;
pub mod tools;
pub mod vector;

pub use error::{Error, ErrorKind, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::domain::knowledge::{
        Entity, EntityEmbedding, KnowledgeGraph, Relation, RelationKey, RelationMetadata,
    };
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::manager::KnowledgeGraphManager;
    pub use crate::storage::StorageProvider;
    pub use crate::tools::ToolRouter;
}

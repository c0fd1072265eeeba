//! JSON file storage backend
//!
//! The whole graph lives in one JSON document `{"entities": [...],
//! "relations": [...]}`. Writes are serialized behind a mutex and land via
//! a temp file plus rename, so readers see either the old or the new
//! document. Only current versions are kept; there is no history.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::knowledge::{
    Entity, EntityEmbedding, KnowledgeGraph, Relation, RelationKey, SearchOptions, now_millis,
};
use crate::error::{Error, Result, StorageContext};
use crate::storage::provider::{
    EntityOutcome, EntityWriteResult, ObservationAddition, ObservationDeletion, ObservationResult,
    RelationOutcome, RelationWriteResult, StorageProvider, VectorCapable,
};

/// Single-document JSON storage
pub struct FileStorageProvider {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStorageProvider {
    /// The parent directory is not created; a missing one surfaces as an
    /// I/O error on the first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn key(&self) -> String {
        self.path.display().to_string()
    }

    /// The stored document exactly as parsed, or `None` if the file does not
    /// exist. Documents missing `entities` or `relations` are returned as is.
    pub async fn load_raw(&self) -> Result<Option<Value>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes).storage_context("load", self.key())?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::from(e).in_storage("load", self.key())),
        }
    }

    /// Parse the document; absent keys read as empty.
    async fn read_graph(&self) -> Result<KnowledgeGraph> {
        match self.load_raw().await? {
            None => Ok(KnowledgeGraph::default()),
            Some(value) => serde_json::from_value(value).storage_context("load", self.key()),
        }
    }

    /// Parse the document for a write. A document missing either key is
    /// refused so it is never silently rewritten.
    async fn read_graph_for_write(&self, operation: &'static str) -> Result<KnowledgeGraph> {
        let Some(value) = self.load_raw().await? else {
            return Ok(KnowledgeGraph::default());
        };
        for field in ["entities", "relations"] {
            if !value.get(field).is_some_and(Value::is_array) {
                warn!(path = %self.path.display(), field, "Refusing to write over malformed graph document");
                return Err(Error::Corrupt(format!("missing '{}' array", field))
                    .in_storage(operation, self.key()));
            }
        }
        serde_json::from_value(value).storage_context(operation, self.key())
    }

    async fn write_graph(&self, graph: &KnowledgeGraph, operation: &'static str) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(graph).storage_context(operation, self.key())?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &bytes)
            .await
            .storage_context(operation, self.key())?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .storage_context(operation, self.key())?;

        debug!(
            path = %self.path.display(),
            entities = graph.entities.len(),
            relations = graph.relations.len(),
            "Graph document written"
        );
        Ok(())
    }

    /// Read, apply `f`, and write back if `f` reports a change.
    async fn mutate<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut KnowledgeGraph, i64) -> Result<(T, bool)> + Send,
        T: Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut graph = self.read_graph_for_write(operation).await?;
        let (out, changed) = f(&mut graph, now_millis())?;
        if changed {
            self.write_graph(&graph, operation).await?;
        }
        Ok(out)
    }
}

fn upsert_entity(graph: &mut KnowledgeGraph, mut incoming: Entity, now: i64) -> EntityOutcome {
    match graph.entity_mut(&incoming.name) {
        Some(existing) => {
            if existing.merge_observations(&incoming.observations).is_empty() {
                EntityOutcome::Unchanged
            } else {
                existing.bump_version(now);
                if incoming.changed_by.is_some() {
                    existing.changed_by = incoming.changed_by;
                }
                EntityOutcome::Updated
            }
        }
        None => {
            let mut seen = Vec::with_capacity(incoming.observations.len());
            for observation in incoming.observations.drain(..) {
                if !seen.contains(&observation) {
                    seen.push(observation);
                }
            }
            incoming.observations = seen;
            incoming.embedding = None;
            incoming.created_at = now;
            incoming.updated_at = now;
            incoming.version = 1;
            graph.entities.push(incoming);
            EntityOutcome::Created
        }
    }
}

fn insert_relation(graph: &mut KnowledgeGraph, mut incoming: Relation, now: i64) -> RelationOutcome {
    for endpoint in [&incoming.from, &incoming.to] {
        if !graph.contains_entity(endpoint) {
            return RelationOutcome::Rejected {
                reason: format!("entity '{}' does not exist", endpoint),
            };
        }
    }
    let key = incoming.key();
    if graph.relations.iter().any(|r| r.matches_key(&key)) {
        return RelationOutcome::AlreadyExists;
    }
    incoming.created_at = now;
    incoming.updated_at = now;
    incoming.version = 1;
    graph.relations.push(incoming);
    RelationOutcome::Created
}

#[async_trait]
impl StorageProvider for FileStorageProvider {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    // ========== Graph Operations ==========

    async fn load_graph(&self) -> Result<KnowledgeGraph> {
        Ok(self.read_graph().await?.without_embeddings())
    }

    async fn save_graph(&self, graph: &KnowledgeGraph) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_graph(graph, "save_graph").await
    }

    async fn search_nodes(&self, query: &str, options: &SearchOptions) -> Result<KnowledgeGraph> {
        Ok(self.load_graph().await?.search(query, options))
    }

    async fn open_nodes(&self, names: &[String]) -> Result<KnowledgeGraph> {
        Ok(self.load_graph().await?.open(names))
    }

    // ========== Entity Operations ==========

    async fn create_entities(&self, entities: Vec<Entity>) -> Result<Vec<EntityWriteResult>> {
        self.mutate("create_entities", move |graph, now| {
            let mut changed = false;
            let results = entities
                .into_iter()
                .map(|entity| {
                    let name = entity.name.clone();
                    let outcome = upsert_entity(graph, entity, now);
                    changed |= outcome != EntityOutcome::Unchanged;
                    EntityWriteResult::new(name, outcome)
                })
                .collect();
            Ok((results, changed))
        })
        .await
    }

    async fn add_observations(
        &self,
        additions: Vec<ObservationAddition>,
    ) -> Result<Vec<ObservationResult>> {
        self.mutate("add_observations", move |graph, now| {
            if let Some(missing) = additions.iter().find(|a| !graph.contains_entity(&a.entity_name)) {
                return Err(Error::EntityNotFound(missing.entity_name.clone()));
            }
            let mut changed = false;
            let mut results = Vec::with_capacity(additions.len());
            for addition in additions {
                let mut added = Vec::new();
                if let Some(entity) = graph.entity_mut(&addition.entity_name) {
                    added = entity.merge_observations(&addition.contents);
                    if !added.is_empty() {
                        entity.bump_version(now);
                        changed = true;
                    }
                }
                results.push(ObservationResult {
                    entity_name: addition.entity_name,
                    added_observations: added,
                });
            }
            Ok((results, changed))
        })
        .await
    }

    async fn delete_entities(&self, names: &[String]) -> Result<()> {
        self.mutate("delete_entities", |graph, _| {
            let before = (graph.entities.len(), graph.relations.len());
            graph.entities.retain(|e| !names.contains(&e.name));
            graph
                .relations
                .retain(|r| !names.contains(&r.from) && !names.contains(&r.to));
            Ok(((), before != (graph.entities.len(), graph.relations.len())))
        })
        .await
    }

    async fn delete_observations(&self, deletions: Vec<ObservationDeletion>) -> Result<()> {
        self.mutate("delete_observations", move |graph, now| {
            let mut changed = false;
            for deletion in &deletions {
                if let Some(entity) = graph.entity_mut(&deletion.entity_name) {
                    if entity.remove_observations(&deletion.observations) {
                        entity.bump_version(now);
                        changed = true;
                    }
                }
            }
            Ok(((), changed))
        })
        .await
    }

    // ========== Relation Operations ==========

    async fn create_relations(&self, relations: Vec<Relation>) -> Result<Vec<RelationWriteResult>> {
        self.mutate("create_relations", move |graph, now| {
            let mut changed = false;
            let results = relations
                .into_iter()
                .map(|relation| {
                    let key = relation.key();
                    let outcome = insert_relation(graph, relation, now);
                    changed |= outcome == RelationOutcome::Created;
                    RelationWriteResult::new(key, outcome)
                })
                .collect();
            Ok((results, changed))
        })
        .await
    }

    async fn delete_relations(&self, keys: &[RelationKey]) -> Result<()> {
        self.mutate("delete_relations", |graph, _| {
            let before = graph.relations.len();
            graph
                .relations
                .retain(|r| !keys.iter().any(|key| r.matches_key(key)));
            Ok(((), before != graph.relations.len()))
        })
        .await
    }

    async fn get_relation(&self, key: &RelationKey) -> Result<Option<Relation>> {
        let graph = self.read_graph().await?;
        Ok(graph.relations.into_iter().find(|r| r.matches_key(key)))
    }

    async fn update_relation(&self, relation: Relation) -> Result<Relation> {
        self.mutate("update_relation", move |graph, now| {
            let key = relation.key();
            let existing = graph
                .relations
                .iter_mut()
                .find(|r| r.matches_key(&key))
                .ok_or_else(|| Error::RelationNotFound {
                    from: key.from.clone(),
                    to: key.to.clone(),
                    relation_type: key.relation_type.clone(),
                })?;
            existing.strength = relation.strength;
            existing.confidence = relation.confidence;
            existing.metadata = relation.metadata;
            existing.valid_from = relation.valid_from;
            existing.valid_to = relation.valid_to;
            existing.changed_by = relation.changed_by;
            existing.version += 1;
            existing.updated_at = now;
            Ok((existing.clone(), true))
        })
        .await
    }

    fn as_vector_capable(&self) -> Option<&dyn VectorCapable> {
        Some(self)
    }
}

#[async_trait]
impl VectorCapable for FileStorageProvider {
    async fn update_entity_embedding(&self, name: &str, embedding: &EntityEmbedding) -> Result<()> {
        self.mutate("update_entity_embedding", |graph, _| {
            let entity = graph
                .entity_mut(name)
                .ok_or_else(|| Error::EntityNotFound(name.to_string()))?;
            entity.embedding = Some(embedding.clone());
            Ok(((), true))
        })
        .await
    }

    async fn get_entity_embedding(&self, name: &str) -> Result<Option<EntityEmbedding>> {
        let graph = self.read_graph().await?;
        Ok(graph.entity(name).and_then(|e| e.embedding.clone()))
    }
}

//! Knowledge graph manager
//!
//! The façade callers talk to. It composes a storage backend, the search
//! result cache, an optional vector index and embedding job manager, and the
//! analytics engine.
//!
//! Writes always run store first, then cache invalidation, then vector index
//! and embedding work, so a failed store write leaves derived state alone.

mod search;
mod temporal;

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use search::{AdvancedSearchOptions, HybridWeights, SearchHit, SearchResults, keyword_score};

use crate::analytics::{
    FindPathsOptions, GraphAnalyticsEngine, GraphStatistics, GraphStatisticsOptions,
    NodeAnalytics, NodeAnalyticsOptions, PathResult,
};
use crate::cache::{CacheKey, CacheStats, SearchResultCache};
use crate::config::{CacheSettings, Config, VectorConfig};
use crate::domain::knowledge::{
    Entity, KnowledgeGraph, Relation, RelationKey, SearchOptions, validate_entity,
    validate_relation,
};
use crate::embedding::{EmbeddingJobManager, embedding_service_from_config};
use crate::error::{Error, Result};
use crate::storage::{
    EntityOutcome, EntityWriteResult, ObservationAddition, ObservationDeletion,
    ObservationResult, RelationOutcome, RelationWriteResult, StorageProvider, open_storage,
};
use crate::vector::{InMemoryVectorStore, SqliteVectorStore, VectorStore};

/// Priority given to jobs scheduled by writes
const WRITE_JOB_PRIORITY: i32 = 0;
/// Backfill jobs run after anything a write scheduled
const BACKFILL_JOB_PRIORITY: i32 = -1;

/// Entry point for every graph operation
pub struct KnowledgeGraphManager {
    storage: Arc<dyn StorageProvider>,
    cache: SearchResultCache<KnowledgeGraph>,
    vector_store: Option<Arc<dyn VectorStore>>,
    embeddings: Option<Arc<EmbeddingJobManager>>,
    analytics: GraphAnalyticsEngine,
    vector: VectorConfig,
    process_on_write: bool,
}

/// Builder for [`KnowledgeGraphManager`]
pub struct KnowledgeGraphManagerBuilder {
    storage: Arc<dyn StorageProvider>,
    cache: CacheSettings,
    vector_store: Option<Arc<dyn VectorStore>>,
    embeddings: Option<Arc<EmbeddingJobManager>>,
    analytics: GraphAnalyticsEngine,
    vector: VectorConfig,
    process_on_write: bool,
}

impl KnowledgeGraphManagerBuilder {
    pub fn with_cache_settings(mut self, settings: CacheSettings) -> Self {
        self.cache = settings;
        self
    }

    /// Index searched when the backend has no native semantic search
    pub fn with_vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }

    /// Enables embedding on write and semantic search.
    ///
    /// The job manager's vector store is used unless one was set explicitly.
    pub fn with_embedding_jobs(mut self, jobs: Arc<EmbeddingJobManager>) -> Self {
        if self.vector_store.is_none() {
            self.vector_store = jobs.vector_store().cloned();
        }
        self.embeddings = Some(jobs);
        self
    }

    pub fn with_analytics(mut self, engine: GraphAnalyticsEngine) -> Self {
        self.analytics = engine;
        self
    }

    pub fn with_vector_config(mut self, config: VectorConfig) -> Self {
        self.vector = config;
        self
    }

    /// Run a batch of embedding jobs right after each entity write
    pub fn process_on_write(mut self, enabled: bool) -> Self {
        self.process_on_write = enabled;
        self
    }

    pub fn build(self) -> KnowledgeGraphManager {
        KnowledgeGraphManager {
            storage: self.storage,
            cache: SearchResultCache::new(self.cache),
            vector_store: self.vector_store,
            embeddings: self.embeddings,
            analytics: self.analytics,
            vector: self.vector,
            process_on_write: self.process_on_write,
        }
    }
}

impl KnowledgeGraphManager {
    pub fn builder(storage: Arc<dyn StorageProvider>) -> KnowledgeGraphManagerBuilder {
        KnowledgeGraphManagerBuilder {
            storage,
            cache: CacheSettings::default(),
            vector_store: None,
            embeddings: None,
            analytics: GraphAnalyticsEngine::new(),
            vector: VectorConfig::default(),
            process_on_write: false,
        }
    }

    /// Storage only: no vector index, no embeddings
    pub fn new(storage: Arc<dyn StorageProvider>) -> Self {
        Self::builder(storage).build()
    }

    /// Wire up every component from configuration.
    ///
    /// SQLite deployments share the database pool with a persistent vector
    /// index. File deployments get an in-memory index rebuilt from the
    /// embeddings stored on entities.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let (storage, database) = open_storage(&config.storage).await?;
        let embedder = embedding_service_from_config(&config.embedding)?;
        let dimensions = embedder.model_info().dimensions;

        let vector_store: Arc<dyn VectorStore> = match &database {
            Some(db) => Arc::new(SqliteVectorStore::new(db.pool().clone(), dimensions)),
            None => Arc::new(InMemoryVectorStore::new(dimensions)),
        };
        vector_store.initialize().await?;

        let jobs = Arc::new(
            EmbeddingJobManager::new(Arc::clone(&storage), embedder, &config.embedding)
                .with_vector_store(Arc::clone(&vector_store)),
        );

        let manager = Self::builder(storage)
            .with_cache_settings(config.cache.clone())
            .with_vector_store(vector_store)
            .with_embedding_jobs(jobs)
            .with_analytics(GraphAnalyticsEngine::from_config(&config.analytics))
            .with_vector_config(config.vector.clone())
            .process_on_write(config.embedding.process_on_write)
            .build();

        if database.is_none() {
            manager.reindex_vectors().await?;
        }

        info!(
            backend = manager.storage.backend_name(),
            dimensions,
            "Knowledge graph manager ready"
        );
        Ok(manager)
    }

    // ========== Accessors ==========

    pub fn storage(&self) -> &Arc<dyn StorageProvider> {
        &self.storage
    }

    pub fn embedding_jobs(&self) -> Option<&Arc<EmbeddingJobManager>> {
        self.embeddings.as_ref()
    }

    pub fn vector_store(&self) -> Option<&Arc<dyn VectorStore>> {
        self.vector_store.as_ref()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.get_stats()
    }

    // ========== Entity Operations ==========

    /// Create or merge entities.
    ///
    /// Invalid entities are reported as `Rejected` in their slot and never
    /// reach storage; the rest are written in one batch.
    pub async fn create_entities(&self, entities: Vec<Entity>) -> Result<Vec<EntityWriteResult>> {
        let mut slots = Vec::with_capacity(entities.len());
        let mut accepted = Vec::new();
        for entity in entities {
            match validate_entity(&entity) {
                Ok(()) => {
                    slots.push(None);
                    accepted.push(entity);
                }
                Err(err) => {
                    debug!(entity = %entity.name, error = %err, "Entity rejected");
                    slots.push(Some(EntityWriteResult::new(
                        entity.name,
                        EntityOutcome::Rejected {
                            reason: err.to_string(),
                        },
                    )));
                }
            }
        }

        let written = if accepted.is_empty() {
            Vec::new()
        } else {
            let written = self.storage.create_entities(accepted).await?;
            self.cache.clear();
            written
        };
        let results = fill_slots(slots, written);

        let changed: Vec<String> = results
            .iter()
            .filter(|r| r.is_write())
            .map(|r| r.name.clone())
            .collect();
        info!(
            requested = results.len(),
            written = changed.len(),
            "Entities created"
        );
        self.schedule_embeddings(changed).await;
        Ok(results)
    }

    /// Fails with `EntityNotFound` if any target entity is missing, in which
    /// case nothing is written.
    pub async fn add_observations(
        &self,
        additions: Vec<ObservationAddition>,
    ) -> Result<Vec<ObservationResult>> {
        for addition in &additions {
            require_name(&addition.entity_name, "entityName")?;
            if addition.contents.iter().any(|c| c.trim().is_empty()) {
                return Err(Error::Validation(format!(
                    "observations for '{}' must not be empty",
                    addition.entity_name
                )));
            }
        }
        if additions.is_empty() {
            return Ok(Vec::new());
        }

        let results = self.storage.add_observations(additions).await?;
        self.cache.clear();

        let changed: Vec<String> = results
            .iter()
            .filter(|r| !r.added_observations.is_empty())
            .map(|r| r.entity_name.clone())
            .collect();
        debug!(entities = changed.len(), "Observations added");
        self.schedule_embeddings(changed).await;
        Ok(results)
    }

    /// Deletes entities and every relation touching them. Unknown names are
    /// ignored.
    pub async fn delete_entities(&self, names: &[String]) -> Result<()> {
        for name in names {
            require_name(name, "entity name")?;
        }
        if names.is_empty() {
            return Ok(());
        }

        self.storage.delete_entities(names).await?;
        self.cache.clear();

        if let Some(store) = &self.vector_store {
            for name in names {
                if let Err(err) = store.remove_vector(name).await {
                    warn!(entity = %name, error = %err, "Failed to drop vector for deleted entity");
                }
            }
        }
        info!(count = names.len(), "Entities deleted");
        Ok(())
    }

    pub async fn delete_observations(&self, deletions: Vec<ObservationDeletion>) -> Result<()> {
        for deletion in &deletions {
            require_name(&deletion.entity_name, "entityName")?;
        }
        if deletions.is_empty() {
            return Ok(());
        }

        let names: Vec<String> = deletions.iter().map(|d| d.entity_name.clone()).collect();
        self.storage.delete_observations(deletions).await?;
        self.cache.clear();

        if self.embeddings.is_some() {
            let existing = self.storage.open_nodes(&names).await?;
            self.schedule_embeddings(existing.entities.into_iter().map(|e| e.name))
                .await;
        }
        Ok(())
    }

    // ========== Relation Operations ==========

    /// Create relations in one batch.
    ///
    /// Invalid relations are reported as `Rejected` without reaching
    /// storage; storage rejects relations whose endpoints do not exist.
    pub async fn create_relations(
        &self,
        relations: Vec<Relation>,
    ) -> Result<Vec<RelationWriteResult>> {
        let mut slots = Vec::with_capacity(relations.len());
        let mut accepted = Vec::new();
        for relation in relations {
            match validate_relation(&relation) {
                Ok(()) => {
                    slots.push(None);
                    accepted.push(relation);
                }
                Err(err) => {
                    debug!(relation = %relation.key(), error = %err, "Relation rejected");
                    slots.push(Some(RelationWriteResult::new(
                        relation.key(),
                        RelationOutcome::Rejected {
                            reason: err.to_string(),
                        },
                    )));
                }
            }
        }

        let written = if accepted.is_empty() {
            Vec::new()
        } else {
            let written = self.storage.create_relations(accepted).await?;
            self.cache.clear();
            written
        };
        let results = fill_slots(slots, written);

        info!(
            requested = results.len(),
            created = results
                .iter()
                .filter(|r| r.outcome == RelationOutcome::Created)
                .count(),
            "Relations created"
        );
        Ok(results)
    }

    pub async fn delete_relations(&self, keys: &[RelationKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.storage.delete_relations(keys).await?;
        self.cache.clear();
        debug!(count = keys.len(), "Relations deleted");
        Ok(())
    }

    pub async fn get_relation(&self, key: &RelationKey) -> Result<Option<Relation>> {
        self.storage.get_relation(key).await
    }

    /// Fails with `RelationNotFound` if no relation has the same key
    pub async fn update_relation(&self, relation: Relation) -> Result<Relation> {
        validate_relation(&relation)?;
        let updated = self.storage.update_relation(relation).await?;
        self.cache.clear();
        debug!(relation = %updated.key(), version = updated.version, "Relation updated");
        Ok(updated)
    }

    // ========== Reads ==========

    pub async fn read_graph(&self) -> Result<KnowledgeGraph> {
        let key = CacheKey::new("read_graph", None);
        if let Some(graph) = self.cache.get(&key) {
            return Ok(graph);
        }
        let generation = self.cache.generation();
        let graph = self.storage.load_graph().await?;
        self.cache.set_if_current(key, graph.clone(), None, generation);
        Ok(graph)
    }

    /// Case-insensitive substring search over names, types and observations
    pub async fn search_nodes(&self, query: &str, options: &SearchOptions) -> Result<KnowledgeGraph> {
        let key = CacheKey::new(
            query,
            Some(&json!({
                "op": "search_nodes",
                "limit": options.limit,
                "entityTypes": options.entity_types,
            })),
        );
        if let Some(graph) = self.cache.get(&key) {
            debug!(query = %query, "Search served from cache");
            return Ok(graph);
        }
        let generation = self.cache.generation();
        let graph = self.storage.search_nodes(query, options).await?;
        self.cache.set_if_current(key, graph.clone(), None, generation);
        Ok(graph)
    }

    /// Named entities and the relations among them; unknown names are skipped
    pub async fn open_nodes(&self, names: &[String]) -> Result<KnowledgeGraph> {
        let key = CacheKey::new("open_nodes", Some(&json!(names)));
        if let Some(graph) = self.cache.get(&key) {
            return Ok(graph);
        }
        let generation = self.cache.generation();
        let graph = self.storage.open_nodes(names).await?;
        self.cache.set_if_current(key, graph.clone(), None, generation);
        Ok(graph)
    }

    // ========== Analytics ==========

    pub async fn get_graph_statistics(
        &self,
        options: GraphStatisticsOptions,
    ) -> Result<GraphStatistics> {
        let graph = self.read_graph().await?;
        let engine = self.analytics.clone();
        run_blocking(move || Ok(engine.graph_statistics(&graph, &options))).await
    }

    pub async fn get_node_analytics(
        &self,
        entity_name: &str,
        options: NodeAnalyticsOptions,
    ) -> Result<NodeAnalytics> {
        require_name(entity_name, "entityName")?;
        options.validate()?;

        let graph = self.read_graph().await?;
        let engine = self.analytics.clone();
        let name = entity_name.to_string();
        run_blocking(move || engine.node_analytics(&graph, &name, &options)).await
    }

    pub async fn find_paths(
        &self,
        from: &str,
        to: &str,
        options: FindPathsOptions,
    ) -> Result<PathResult> {
        self.find_paths_with_cancel(from, to, options, CancellationToken::new())
            .await
    }

    /// Path search that stops early, reporting `timed_out`, once `cancel`
    /// fires
    pub async fn find_paths_with_cancel(
        &self,
        from: &str,
        to: &str,
        options: FindPathsOptions,
        cancel: CancellationToken,
    ) -> Result<PathResult> {
        require_name(from, "fromEntity")?;
        require_name(to, "toEntity")?;
        options.validate()?;

        let graph = self.read_graph().await?;
        let engine = self.analytics.clone();
        let (from, to) = (from.to_string(), to.to_string());
        run_blocking(move || engine.find_paths_with_cancel(&graph, &from, &to, &options, &cancel))
            .await
    }

    // ========== Embeddings ==========

    /// Queue an embedding job for every entity without a stored embedding.
    ///
    /// Backends that cannot store embeddings get a job for every entity.
    /// Returns how many jobs were scheduled.
    pub async fn schedule_missing_embeddings(&self) -> Result<usize> {
        let Some(jobs) = &self.embeddings else {
            return Err(Error::CapabilityUnavailable("entity embeddings"));
        };

        let graph = self.storage.load_graph().await?;
        let mut scheduled = 0;
        for entity in &graph.entities {
            if let Some(backend) = self.storage.as_vector_capable()
                && backend.get_entity_embedding(&entity.name).await?.is_some()
            {
                continue;
            }
            jobs.schedule_entity_embedding(&entity.name, BACKFILL_JOB_PRIORITY)
                .await;
            scheduled += 1;
        }

        info!(scheduled, "Missing embeddings queued");
        Ok(scheduled)
    }

    async fn schedule_embeddings<I>(&self, names: I)
    where
        I: IntoIterator<Item = String>,
    {
        let Some(jobs) = &self.embeddings else {
            return;
        };

        let mut scheduled = HashSet::new();
        for name in names {
            if scheduled.insert(name.clone()) {
                jobs.schedule_entity_embedding(&name, WRITE_JOB_PRIORITY).await;
            }
        }

        if self.process_on_write && !scheduled.is_empty() {
            let report = jobs.process_jobs(jobs.batch_size()).await;
            debug!(
                processed = report.processed,
                failed = report.failed,
                remaining = report.remaining,
                "Embedding jobs processed after write"
            );
        }
    }
}

/// Put storage results into the slots validation left empty, keeping input
/// order.
pub(crate) fn fill_slots<T>(slots: Vec<Option<T>>, written: Vec<T>) -> Vec<T> {
    let mut written = written.into_iter();
    slots
        .into_iter()
        .filter_map(|slot| slot.or_else(|| written.next()))
        .collect()
}

fn require_name(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

async fn run_blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| Error::Other(format!("Analytics task failed: {}", e)))?
}

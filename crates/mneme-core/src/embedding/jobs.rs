//! Embedding job scheduling
//!
//! Entity writes enqueue jobs here; a worker drains them later, calls the
//! embedding service under the shared rate limit, stores the vector on the
//! entity (when the backend can) and refreshes the vector index.
//!
//! The registry owns every job record. At most one unfinished job exists
//! per entity; scheduling an entity that already has one returns that job.
//! Finished jobs stay visible until [`EmbeddingJobManager::cleanup_jobs`]
//! evicts them; the background worker does so every tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::rate_limiter::{RateLimiter, RateLimiterStatus};
use super::service::{EmbeddingModelInfo, EmbeddingService};
use crate::config::EmbeddingConfig;
use crate::domain::knowledge::{Entity, EntityEmbedding, now_millis};
use crate::error::{Error, Result};
use crate::storage::StorageProvider;
use crate::vector::{VectorStore, check_dimensions};

/// Lifecycle of an embedding job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One queued embedding computation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingJob {
    pub id: String,
    pub entity_name: String,
    /// Higher runs first
    pub priority: i32,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub error: Option<String>,
    pub created_at: i64,
    pub processed_at: Option<i64>,
    #[serde(skip)]
    seq: u64,
    /// Rescheduled while processing; run once more after this attempt
    #[serde(skip)]
    rerun: bool,
}

/// Returned by [`EmbeddingJobManager::schedule_entity_embedding`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub job_id: String,
    pub entity_name: String,
    /// False when an unfinished job for the entity already existed
    pub newly_scheduled: bool,
}

/// Outcome of one job within a processing round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub job_id: String,
    pub entity_name: String,
    pub status: JobStatus,
    pub error: Option<String>,
}

/// Summary of a [`EmbeddingJobManager::process_jobs`] round
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingReport {
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    /// Jobs still pending after the round
    pub remaining: usize,
    pub outcomes: Vec<JobOutcome>,
}

/// Job counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

#[derive(Default)]
struct JobRegistry {
    jobs: HashMap<String, EmbeddingJob>,
    /// entity name -> id of its unfinished job
    active: HashMap<String, String>,
    next_seq: u64,
}

impl JobRegistry {
    fn pending_count(&self) -> usize {
        self.jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .count()
    }

    /// Claim up to `max` pending jobs, highest priority first, FIFO within a priority
    fn claim(&mut self, max: usize) -> Vec<(String, String)> {
        let mut ready: Vec<&EmbeddingJob> = self
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .collect();
        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));

        let claimed: Vec<(String, String)> = ready
            .into_iter()
            .take(max)
            .map(|j| (j.id.clone(), j.entity_name.clone()))
            .collect();

        for (id, _) in &claimed {
            if let Some(job) = self.jobs.get_mut(id) {
                job.status = JobStatus::Processing;
                job.attempts += 1;
            }
        }
        claimed
    }

    fn finish(&mut self, id: &str, result: &Result<()>, now: i64) -> Option<JobOutcome> {
        let job = self.jobs.get_mut(id)?;
        job.processed_at = Some(now);

        match result {
            Ok(()) if job.rerun => {
                job.rerun = false;
                job.status = JobStatus::Pending;
                job.attempts = 0;
                job.error = None;
            }
            Ok(()) => {
                job.status = JobStatus::Completed;
                job.error = None;
            }
            Err(e) => {
                job.error = Some(e.to_string());
                // a deleted entity will never succeed
                let retryable = !matches!(e, Error::EntityNotFound(_));
                if job.rerun {
                    // a newer write asked for another run; start over
                    job.rerun = false;
                    job.status = JobStatus::Pending;
                    job.attempts = 0;
                } else if retryable && job.attempts < job.max_attempts {
                    job.status = JobStatus::Pending;
                } else {
                    job.status = JobStatus::Failed;
                }
            }
        }

        let outcome = JobOutcome {
            job_id: job.id.clone(),
            entity_name: job.entity_name.clone(),
            status: job.status,
            error: job.error.clone(),
        };
        if job.status.is_finished() {
            let entity_name = job.entity_name.clone();
            if self.active.get(&entity_name).map(String::as_str) == Some(id) {
                self.active.remove(&entity_name);
            }
        }
        Some(outcome)
    }
}

/// Schedules and runs embedding jobs
pub struct EmbeddingJobManager {
    storage: Arc<dyn StorageProvider>,
    embedder: Arc<dyn EmbeddingService>,
    vector_store: Option<Arc<dyn VectorStore>>,
    rate_limiter: Arc<RateLimiter>,
    registry: Mutex<JobRegistry>,
    cache: Cache<String, Arc<Vec<f32>>>,
    max_attempts: u32,
    batch_size: usize,
    job_retention: Duration,
}

impl EmbeddingJobManager {
    pub fn new(
        storage: Arc<dyn StorageProvider>,
        embedder: Arc<dyn EmbeddingService>,
        config: &EmbeddingConfig,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_max_entries)
            .time_to_live(Duration::from_secs(config.cache_ttl_secs.max(1)))
            .build();

        Self {
            storage,
            embedder,
            vector_store: None,
            rate_limiter: Arc::new(RateLimiter::from_config(config)),
            registry: Mutex::new(JobRegistry::default()),
            cache,
            max_attempts: config.max_attempts.max(1),
            batch_size: config.batch_size.max(1),
            job_retention: config.job_retention(),
        }
    }

    /// Also refresh `store` after each successful job
    pub fn with_vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }

    /// Share a limiter with other embedding callers
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    /// How long finished jobs survive worker cleanup
    pub fn with_job_retention(mut self, retention: Duration) -> Self {
        self.job_retention = retention;
        self
    }

    pub fn model_info(&self) -> EmbeddingModelInfo {
        self.embedder.model_info()
    }

    /// Jobs taken per worker tick
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn vector_store(&self) -> Option<&Arc<dyn VectorStore>> {
        self.vector_store.as_ref()
    }

    pub async fn rate_limit_status(&self) -> RateLimiterStatus {
        self.rate_limiter.status().await
    }

    // ========== Scheduling ==========

    /// Queue an embedding for `entity_name`.
    ///
    /// Does not touch storage. An entity with an unfinished job keeps that
    /// job; its priority is raised if the new request is higher, and an
    /// in-flight job is marked to run again so the stored vector reflects
    /// the latest write.
    pub async fn schedule_entity_embedding(&self, entity_name: &str, priority: i32) -> JobHandle {
        let mut registry = self.registry.lock().await;

        if let Some(job_id) = registry.active.get(entity_name).cloned()
            && let Some(job) = registry.jobs.get_mut(&job_id)
        {
            match job.status {
                JobStatus::Pending => job.priority = job.priority.max(priority),
                JobStatus::Processing => job.rerun = true,
                _ => {}
            }
            debug!(entity = %entity_name, job_id = %job_id, "Embedding job already queued");
            return JobHandle {
                job_id,
                entity_name: entity_name.to_string(),
                newly_scheduled: false,
            };
        }

        let seq = registry.next_seq;
        registry.next_seq += 1;
        let job = EmbeddingJob {
            id: Uuid::new_v4().to_string(),
            entity_name: entity_name.to_string(),
            priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            error: None,
            created_at: now_millis(),
            processed_at: None,
            seq,
            rerun: false,
        };
        let handle = JobHandle {
            job_id: job.id.clone(),
            entity_name: entity_name.to_string(),
            newly_scheduled: true,
        };

        registry
            .active
            .insert(entity_name.to_string(), job.id.clone());
        registry.jobs.insert(job.id.clone(), job);
        debug!(entity = %entity_name, job_id = %handle.job_id, priority, "Embedding job scheduled");
        handle
    }

    // ========== Processing ==========

    /// Run up to `max_jobs` pending jobs.
    ///
    /// A failing job never stops the round. It returns to the queue until it
    /// has used its attempts, then stays failed with the error recorded.
    pub async fn process_jobs(&self, max_jobs: usize) -> ProcessingReport {
        let claimed = self.registry.lock().await.claim(max_jobs);
        let mut report = ProcessingReport {
            processed: claimed.len(),
            ..Default::default()
        };

        for (job_id, entity_name) in claimed {
            let result = self.embed_entity(&entity_name).await;
            match &result {
                Ok(()) => {
                    report.successful += 1;
                    debug!(entity = %entity_name, "Embedding stored");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(entity = %entity_name, job_id = %job_id, error = %e, "Embedding job failed");
                }
            }

            let mut registry = self.registry.lock().await;
            if let Some(outcome) = registry.finish(&job_id, &result, now_millis()) {
                report.outcomes.push(outcome);
            }
        }

        report.remaining = self.registry.lock().await.pending_count();
        if report.processed > 0 {
            info!(
                processed = report.processed,
                successful = report.successful,
                failed = report.failed,
                remaining = report.remaining,
                "Embedding jobs processed"
            );
        }
        report
    }

    async fn embed_entity(&self, entity_name: &str) -> Result<()> {
        let graph = self.storage.open_nodes(&[entity_name.to_string()]).await?;
        let entity = graph
            .entity(entity_name)
            .ok_or_else(|| Error::EntityNotFound(entity_name.to_string()))?;

        let vector = self.generate_embedding(&entity.embedding_text()).await?;
        let model = self.embedder.model_info();

        if let Some(backend) = self.storage.as_vector_capable() {
            let embedding = EntityEmbedding::new(vector.clone(), &model.name);
            backend.update_entity_embedding(entity_name, &embedding).await?;
        }

        if let Some(store) = &self.vector_store {
            store
                .add_vector(entity_name, &vector, Some(vector_metadata(entity, &model.name)))
                .await?;
        }
        Ok(())
    }

    /// Embed `text` now, bypassing the queue.
    ///
    /// Results are cached per model and text. Service calls share the rate
    /// limit with queued jobs.
    pub async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let model = self.embedder.model_info();
        let key = cache_key(&model.name, text);

        if let Some(cached) = self.cache.get(&key).await {
            debug!(model = %model.name, "Embedding cache hit");
            return Ok(cached.as_ref().clone());
        }

        self.rate_limiter.acquire().await;
        let vector = self.embedder.embed(text).await?;
        check_dimensions(model.dimensions, &vector)?;

        self.cache.insert(key, Arc::new(vector.clone())).await;
        Ok(vector)
    }

    // ========== Registry ==========

    pub async fn get_job(&self, job_id: &str) -> Result<EmbeddingJob> {
        self.registry
            .lock()
            .await
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))
    }

    pub async fn queue_status(&self) -> QueueStatus {
        let registry = self.registry.lock().await;
        let mut status = QueueStatus {
            total: registry.jobs.len(),
            ..Default::default()
        };
        for job in registry.jobs.values() {
            match job.status {
                JobStatus::Pending => status.pending += 1,
                JobStatus::Processing => status.processing += 1,
                JobStatus::Completed => status.completed += 1,
                JobStatus::Failed => status.failed += 1,
            }
        }
        status
    }

    /// Evict finished jobs processed more than `older_than` ago.
    /// Returns the number removed.
    pub async fn cleanup_jobs(&self, older_than: Duration) -> usize {
        let cutoff = now_millis().saturating_sub(older_than.as_millis() as i64);
        let mut registry = self.registry.lock().await;
        let before = registry.jobs.len();
        registry.jobs.retain(|_, job| {
            !(job.status.is_finished() && job.processed_at.is_some_and(|t| t <= cutoff))
        });
        let removed = before - registry.jobs.len();
        if removed > 0 {
            debug!(removed, "Finished embedding jobs evicted");
        }
        removed
    }

    /// Process a batch and evict expired finished jobs every `interval`
    /// until `cancel` fires
    pub fn spawn_worker(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis() as u64, "Embedding worker started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.process_jobs(manager.batch_size).await;
                        manager.cleanup_jobs(manager.job_retention).await;
                    }
                }
            }
            info!("Embedding worker stopped");
        })
    }
}

/// Metadata stored next to an entity's vector in the index
pub(crate) fn vector_metadata(entity: &Entity, model: &str) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("name".into(), Value::String(entity.name.clone()));
    metadata.insert("entityType".into(), Value::String(entity.entity_type.clone()));
    metadata.insert("model".into(), Value::String(model.to_string()));
    metadata
}

fn cache_key(model: &str, text: &str) -> String {
    format!("{}:{}", model, hex::encode(Sha256::digest(text.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::knowledge::Entity;
    use crate::embedding::DefaultEmbeddingService;
    use crate::storage::FileStorageProvider;
    use crate::vector::{InMemoryVectorStore, VectorSearchOptions};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails for any text mentioning "broken"
    struct FlakyEmbedder {
        inner: DefaultEmbeddingService,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingService for FlakyEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if text.contains("broken") {
                return Err(Error::EmbeddingFailed("service unavailable".to_string()));
            }
            self.inner.embed(text).await
        }

        fn model_info(&self) -> EmbeddingModelInfo {
            self.inner.model_info()
        }
    }

    fn config() -> EmbeddingConfig {
        EmbeddingConfig {
            dimensions: 8,
            tokens_per_interval: 100,
            interval_ms: 1_000,
            max_attempts: 2,
            ..Default::default()
        }
    }

    async fn setup() -> (
        tempfile::TempDir,
        Arc<FileStorageProvider>,
        Arc<FlakyEmbedder>,
        Arc<InMemoryVectorStore>,
        EmbeddingJobManager,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileStorageProvider::new(dir.path().join("graph.json")));
        storage
            .create_entities(vec![
                Entity::new("alice", "person").with_observation("likes tea"),
                Entity::new("bob", "person").with_observation("broken record"),
                Entity::new("carol", "person"),
            ])
            .await
            .unwrap();

        let embedder = Arc::new(FlakyEmbedder {
            inner: DefaultEmbeddingService::new(8),
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(InMemoryVectorStore::new(8));
        let manager = EmbeddingJobManager::new(storage.clone(), embedder.clone(), &config())
            .with_vector_store(store.clone());
        (dir, storage, embedder, store, manager)
    }

    #[tokio::test]
    async fn test_schedule_is_idempotent() {
        let (_dir, _storage, _embedder, _store, manager) = setup().await;

        let first = manager.schedule_entity_embedding("alice", 1).await;
        let second = manager.schedule_entity_embedding("alice", 5).await;

        assert!(first.newly_scheduled);
        assert!(!second.newly_scheduled);
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(manager.get_job(&first.job_id).await.unwrap().priority, 5);
        assert_eq!(manager.queue_status().await.pending, 1);
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_batch() {
        let (_dir, storage, _embedder, store, manager) = setup().await;
        let alice = manager.schedule_entity_embedding("alice", 0).await;
        let bob = manager.schedule_entity_embedding("bob", 0).await;
        manager.schedule_entity_embedding("carol", 0).await;

        let report = manager.process_jobs(10).await;

        assert_eq!(report.processed, 3);
        assert_eq!(report.successful, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.remaining, 1);
        assert_eq!(report.outcomes.len(), 3);

        assert_eq!(manager.get_job(&alice.job_id).await.unwrap().status, JobStatus::Completed);
        let bob_job = manager.get_job(&bob.job_id).await.unwrap();
        assert_eq!(bob_job.status, JobStatus::Pending);
        assert!(bob_job.error.unwrap().contains("service unavailable"));

        assert_eq!(store.count().await.unwrap(), 2);
        let vc = storage.as_vector_capable().unwrap();
        assert!(vc.get_entity_embedding("alice").await.unwrap().is_some());
        assert!(vc.get_entity_embedding("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_job_fails_after_max_attempts() {
        let (_dir, _storage, _embedder, _store, manager) = setup().await;
        let bob = manager.schedule_entity_embedding("bob", 0).await;

        manager.process_jobs(10).await;
        let report = manager.process_jobs(10).await;
        assert_eq!(report.remaining, 0);

        let job = manager.get_job(&bob.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);

        // a failed job no longer blocks new scheduling
        let again = manager.schedule_entity_embedding("bob", 0).await;
        assert!(again.newly_scheduled);
        assert_ne!(again.job_id, bob.job_id);
    }

    #[tokio::test]
    async fn test_priority_then_fifo_order() {
        let (_dir, _storage, _embedder, _store, manager) = setup().await;
        manager.schedule_entity_embedding("carol", 0).await;
        manager.schedule_entity_embedding("alice", 0).await;
        manager.schedule_entity_embedding("bob", 9).await;

        let report = manager.process_jobs(2).await;

        let order: Vec<&str> = report.outcomes.iter().map(|o| o.entity_name.as_str()).collect();
        assert_eq!(order, vec!["bob", "carol"]);
        assert_eq!(report.remaining, 2);
    }

    #[tokio::test]
    async fn test_missing_entity_fails_without_retry() {
        let (_dir, _storage, _embedder, _store, manager) = setup().await;
        let ghost = manager.schedule_entity_embedding("ghost", 0).await;

        manager.process_jobs(1).await;

        let job = manager.get_job(&ghost.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn test_generate_embedding_is_cached() {
        let (_dir, _storage, embedder, _store, manager) = setup().await;

        let a = manager.generate_embedding("query text").await.unwrap();
        let b = manager.generate_embedding("query text").await.unwrap();

        assert_eq!(a, b);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.rate_limit_status().await.available_tokens, 99);
    }

    #[tokio::test]
    async fn test_vector_metadata_and_search() {
        let (_dir, _storage, _embedder, store, manager) = setup().await;
        manager.schedule_entity_embedding("alice", 0).await;
        manager.process_jobs(10).await;

        let query = manager
            .generate_embedding(
                &Entity::new("alice", "person")
                    .with_observation("likes tea")
                    .embedding_text(),
            )
            .await
            .unwrap();
        let results = store
            .search(&query, &VectorSearchOptions::default())
            .await
            .unwrap();

        assert_eq!(results[0].id, "alice");
        assert_eq!(results[0].metadata["entityType"], "person");
        assert!((results[0].similarity - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_cleanup_and_unknown_job() {
        let (_dir, _storage, _embedder, _store, manager) = setup().await;
        let alice = manager.schedule_entity_embedding("alice", 0).await;
        manager.process_jobs(10).await;

        assert_eq!(manager.cleanup_jobs(Duration::from_secs(3600)).await, 0);
        assert_eq!(manager.cleanup_jobs(Duration::ZERO).await, 1);

        let err = manager.get_job(&alice.job_id).await.unwrap_err();
        assert!(matches!(err, Error::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_rerun_survives_terminal_failure() {
        let (_dir, storage, _embedder, _store, manager) = setup().await;
        let handle = manager.schedule_entity_embedding("dave", 0).await;

        // dave is created while its first attempt is in flight
        let claimed = manager.registry.lock().await.claim(1);
        assert_eq!(claimed.len(), 1);
        let again = manager.schedule_entity_embedding("dave", 0).await;
        assert_eq!(again.job_id, handle.job_id);

        let missing: Result<()> = Err(Error::EntityNotFound("dave".to_string()));
        let outcome = manager
            .registry
            .lock()
            .await
            .finish(&handle.job_id, &missing, now_millis())
            .unwrap();
        assert_eq!(outcome.status, JobStatus::Pending);

        let job = manager.get_job(&handle.job_id).await.unwrap();
        assert_eq!(job.attempts, 0);

        storage
            .create_entities(vec![Entity::new("dave", "person")])
            .await
            .unwrap();
        let report = manager.process_jobs(10).await;
        assert_eq!(report.successful, 1);
        assert_eq!(
            manager.get_job(&handle.job_id).await.unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_worker_evicts_finished_jobs() {
        let (_dir, _storage, _embedder, store, manager) = setup().await;
        let manager = Arc::new(manager.with_job_retention(Duration::ZERO));
        manager.schedule_entity_embedding("alice", 0).await;
        manager.schedule_entity_embedding("ghost", 0).await;

        let cancel = CancellationToken::new();
        let handle = manager.spawn_worker(Duration::from_millis(10), cancel.clone());

        for _ in 0..100 {
            if store.count().await.unwrap() == 1 && manager.queue_status().await.total == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(manager.queue_status().await, QueueStatus::default());
    }

    #[tokio::test]
    async fn test_worker_stops_on_cancel() {
        let (_dir, _storage, _embedder, store, manager) = setup().await;
        let manager = Arc::new(manager);
        manager.schedule_entity_embedding("alice", 0).await;

        let cancel = CancellationToken::new();
        let handle = manager.spawn_worker(Duration::from_millis(10), cancel.clone());

        for _ in 0..100 {
            if store.count().await.unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(manager.queue_status().await.completed, 1);
    }
}

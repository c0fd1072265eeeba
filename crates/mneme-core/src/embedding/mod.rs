//! Embeddings
//!
//! - [`EmbeddingService`] turns text into vectors ([`DefaultEmbeddingService`]
//!   offline, [`OpenAiEmbeddingService`] over HTTP)
//! - [`RateLimiter`] caps service calls per interval
//! - [`EmbeddingJobManager`] queues per-entity jobs and processes them

mod jobs;
mod openai;
mod rate_limiter;
mod service;

use std::sync::Arc;

pub use jobs::{
    EmbeddingJob, EmbeddingJobManager, JobHandle, JobOutcome, JobStatus, ProcessingReport,
    QueueStatus,
};
pub(crate) use jobs::vector_metadata;
pub use openai::{OpenAiEmbeddingService, OpenAiEmbeddingServiceBuilder};
pub use rate_limiter::{RateLimiter, RateLimiterStatus};
pub use service::{DefaultEmbeddingService, EmbeddingModelInfo, EmbeddingService};

use crate::config::{EmbeddingConfig, EmbeddingProvider};
use crate::error::Result;

/// Build the embedding service selected by `config`
pub fn embedding_service_from_config(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingService>> {
    match config.provider {
        EmbeddingProvider::Default => Ok(Arc::new(
            DefaultEmbeddingService::new(config.dimensions).with_model(&config.model),
        )),
        EmbeddingProvider::OpenAi => Ok(Arc::new(OpenAiEmbeddingService::from_config(config)?)),
    }
}

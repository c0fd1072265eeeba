//! Embedding service abstraction and the offline default provider

use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::vector::normalize;

/// Identity of the model behind an [`EmbeddingService`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingModelInfo {
    pub name: String,
    pub dimensions: usize,
    pub version: String,
}

/// Turns text into fixed-length vectors
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts, preserving order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }

    fn model_info(&self) -> EmbeddingModelInfo;
}

/// Deterministic embeddings derived from a hash of the text.
///
/// Equal texts always map to the same unit vector, which makes the engine
/// usable offline and keeps tests reproducible. Similarity between
/// different texts carries no meaning.
#[derive(Debug, Clone)]
pub struct DefaultEmbeddingService {
    model: String,
    dimensions: usize,
}

impl DefaultEmbeddingService {
    pub const VERSION: &'static str = "1";

    pub fn new(dimensions: usize) -> Self {
        Self {
            model: "mneme-hash-embedding".to_string(),
            dimensions,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let digest = Sha256::digest(text.as_bytes());
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&digest);

        let mut rng = ChaCha8Rng::from_seed(seed);
        let raw: Vec<f32> = (0..self.dimensions)
            .map(|_| StandardNormal.sample(&mut rng))
            .collect();
        normalize(raw)
    }
}

#[async_trait]
impl EmbeddingService for DefaultEmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.dimensions == 0 {
            return Err(Error::EmbeddingFailed(
                "embedding dimensions must be greater than zero".to_string(),
            ));
        }
        Ok(self.vector_for(text))
    }

    fn model_info(&self) -> EmbeddingModelInfo {
        EmbeddingModelInfo {
            name: self.model.clone(),
            dimensions: self.dimensions,
            version: Self::VERSION.to_string(),
        }
    }
}

//! OpenAI-compatible embeddings client
//!
//! Talks to any `/embeddings` endpoint that follows the OpenAI request and
//! response shape. The API key is taken from the environment only.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::service::{EmbeddingModelInfo, EmbeddingService};
use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "text-embedding-3-small";
const DEFAULT_DIMENSIONS: usize = 1536;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    encoding_format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Embeddings over HTTP
pub struct OpenAiEmbeddingService {
    http_client: HttpClient,
    api_key: String,
    base_url: String,
    model: String,
    dimensions: usize,
}

impl std::fmt::Debug for OpenAiEmbeddingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEmbeddingService")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

/// Builder for [`OpenAiEmbeddingService`]
#[derive(Default)]
pub struct OpenAiEmbeddingServiceBuilder {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    dimensions: Option<usize>,
    timeout_secs: Option<u64>,
}

impl OpenAiEmbeddingServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn build(self) -> Result<OpenAiEmbeddingService> {
        let api_key = self
            .api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                Error::Config(
                    "an API key is required; set MNEME_OPENAI_API_KEY or OPENAI_API_KEY"
                        .to_string(),
                )
            })?;

        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(
                self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            ))
            .build()?;

        Ok(OpenAiEmbeddingService {
            http_client,
            api_key,
            base_url: self
                .base_url
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: self.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            dimensions: self.dimensions.unwrap_or(DEFAULT_DIMENSIONS),
        })
    }
}

impl OpenAiEmbeddingService {
    pub fn builder() -> OpenAiEmbeddingServiceBuilder {
        OpenAiEmbeddingServiceBuilder::new()
    }

    /// Build from configuration, reading the key from the environment
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config
            .resolved_api_key()
            .map_err(|e| Error::Config(e.to_string()))?
            .unwrap_or_default();

        Self::builder()
            .api_key(api_key)
            .base_url(&config.api_base)
            .model(&config.model)
            .dimensions(config.dimensions)
            .build()
    }

    // only the v3 family accepts a requested output size
    fn requested_dimensions(&self) -> Option<usize> {
        self.model
            .starts_with("text-embedding-3")
            .then_some(self.dimensions)
    }

    async fn request(&self, input: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);
        let request = EmbeddingRequest {
            model: &self.model,
            input,
            encoding_format: "float",
            dimensions: self.requested_dimensions(),
        };

        debug!(model = %self.model, inputs = input.len(), "Sending embeddings request");

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::EmbeddingFailed(format!(
                "embeddings endpoint returned {}: {}",
                status,
                body.chars().take(500).collect::<String>()
            )));
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::EmbeddingFailed(format!("Failed to parse response: {}", e)))?;

        if parsed.data.len() != input.len() {
            return Err(Error::EmbeddingFailed(format!(
                "expected {} embeddings, got {}",
                input.len(),
                parsed.data.len()
            )));
        }

        parsed.data.sort_by_key(|d| d.index);
        parsed
            .data
            .into_iter()
            .map(|d| {
                if d.embedding.len() != self.dimensions {
                    return Err(Error::DimensionMismatch {
                        expected: self.dimensions,
                        actual: d.embedding.len(),
                    });
                }
                Ok(d.embedding)
            })
            .collect()
    }
}

#[async_trait]
impl EmbeddingService for OpenAiEmbeddingService {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.request(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::EmbeddingFailed("empty response from API".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts).await
    }

    fn model_info(&self) -> EmbeddingModelInfo {
        EmbeddingModelInfo {
            name: self.model.clone(),
            dimensions: self.dimensions,
            version: "v1".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_build_requires_api_key() {
        let err = OpenAiEmbeddingService::builder().build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);

        let err = OpenAiEmbeddingService::builder()
            .api_key("   ")
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_debug_redacts_key() {
        let service = OpenAiEmbeddingService::builder()
            .api_key("sk-secret-value")
            .base_url("http://localhost:9999/v1/")
            .build()
            .unwrap();

        let debug = format!("{:?}", service);
        assert!(!debug.contains("sk-secret-value"));
        assert!(debug.contains("[REDACTED]"));
        assert_eq!(service.base_url, "http://localhost:9999/v1");
    }

    #[test]
    fn test_requested_dimensions_only_for_v3_models() {
        let v3 = OpenAiEmbeddingService::builder()
            .api_key("k")
            .dimensions(256)
            .build()
            .unwrap();
        assert_eq!(v3.requested_dimensions(), Some(256));

        let ada = OpenAiEmbeddingService::builder()
            .api_key("k")
            .model("text-embedding-ada-002")
            .build()
            .unwrap();
        assert_eq!(ada.requested_dimensions(), None);
        assert_eq!(ada.model_info().dimensions, DEFAULT_DIMENSIONS);
    }
}

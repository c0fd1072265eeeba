//! Vector index
//!
//! A [`VectorStore`] maps ids to fixed-dimension vectors plus a metadata
//! map and answers nearest-neighbour queries by cosine similarity.
//!
//! Queries are checked before reaching the backend: a wrong-length query is
//! a `DimensionMismatch`, and a degenerate one (non-finite components, or
//! a norm that underflows to zero or overflows) is answered by the recency fallback instead of similarity
//! search. Every result says which method produced it.

mod memory;
mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{Error, Result};

pub use memory::InMemoryVectorStore;
pub use sqlite::SqliteVectorStore;

/// Metadata key mirroring the method that produced a result
pub const SEARCH_METHOD_KEY: &str = "searchMethod";

/// How a search result was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMethod {
    /// Cosine similarity against stored vectors
    Vector,
    /// Most recently updated vectors, similarity 0
    RecencyFallback,
    /// Keyword scoring requested by the caller
    Keyword,
    /// Keyword scoring used because vector search could not run
    KeywordFallback,
    /// Weighted merge of vector and keyword scores
    Hybrid,
}

impl SearchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vector => "vector",
            Self::RecencyFallback => "recency_fallback",
            Self::Keyword => "keyword",
            Self::KeywordFallback => "keyword_fallback",
            Self::Hybrid => "hybrid",
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::RecencyFallback | Self::KeywordFallback)
    }
}

/// Query options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VectorSearchOptions {
    pub limit: usize,
    /// Similarity floor; ignored by the recency fallback
    pub min_similarity: Option<f32>,
    /// Exact-match constraints on metadata keys
    pub filter: BTreeMap<String, Value>,
}

impl Default for VectorSearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            min_similarity: None,
            filter: BTreeMap::new(),
        }
    }
}

impl VectorSearchOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_min_similarity(mut self, min: f32) -> Self {
        self.min_similarity = Some(min);
        self
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.filter.insert(key.into(), value);
        self
    }

    pub fn matches(&self, metadata: &Map<String, Value>) -> bool {
        self.filter
            .iter()
            .all(|(key, expected)| metadata.get(key) == Some(expected))
    }
}

/// One search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorSearchResult {
    pub id: String,
    pub similarity: f32,
    pub metadata: Map<String, Value>,
    pub search_method: SearchMethod,
}

impl VectorSearchResult {
    pub(crate) fn new(
        id: String,
        similarity: f32,
        mut metadata: Map<String, Value>,
        search_method: SearchMethod,
    ) -> Self {
        metadata.insert(
            SEARCH_METHOD_KEY.to_string(),
            Value::String(search_method.as_str().to_string()),
        );
        Self {
            id,
            similarity,
            metadata,
            search_method,
        }
    }
}

/// Nearest-neighbour index over fixed-dimension vectors
#[async_trait]
pub trait VectorStore: Send + Sync {
    fn dimensions(&self) -> usize;

    /// Prepare backing storage; safe to call more than once
    async fn initialize(&self) -> Result<()>;

    /// Insert or replace the vector for `id`
    async fn add_vector(
        &self,
        id: &str,
        vector: &[f32],
        metadata: Option<Map<String, Value>>,
    ) -> Result<()>;

    /// Returns false if `id` was not indexed
    async fn remove_vector(&self, id: &str) -> Result<bool>;

    async fn count(&self) -> Result<usize>;

    /// Cosine similarity search over a validated, non-degenerate query
    async fn similarity_search(
        &self,
        query: &[f32],
        options: &VectorSearchOptions,
    ) -> Result<Vec<VectorSearchResult>>;

    /// Most recently updated vectors matching the filter
    async fn recency_search(&self, options: &VectorSearchOptions)
    -> Result<Vec<VectorSearchResult>>;

    /// Validate the query, then route it to similarity or recency search.
    async fn search(
        &self,
        query: &[f32],
        options: &VectorSearchOptions,
    ) -> Result<Vec<VectorSearchResult>> {
        check_dimensions(self.dimensions(), query)?;
        if is_degenerate(query) {
            warn!(
                dimensions = query.len(),
                "Degenerate query vector, falling back to recency search"
            );
            return self.recency_search(options).await;
        }
        self.similarity_search(query, options).await
    }
}

pub(crate) fn check_dimensions(expected: usize, vector: &[f32]) -> Result<()> {
    if vector.len() != expected {
        return Err(Error::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}

/// Non-finite components, or a norm that is zero or overflows in f32.
///
/// The norm is computed exactly as [`cosine_similarity`] computes it, so a
/// vector that passes can always be compared.
pub fn is_degenerate(vector: &[f32]) -> bool {
    if vector.iter().any(|x| !x.is_finite()) {
        return true;
    }
    let norm = magnitude(vector);
    norm == 0.0 || !norm.is_finite()
}

fn magnitude(vector: &[f32]) -> f32 {
    vector.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity; 0.0 when either side has zero magnitude or the
/// result is not finite
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a = magnitude(a);
    let magnitude_b = magnitude(b);

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    let similarity = dot_product / (magnitude_a * magnitude_b);
    if similarity.is_finite() { similarity } else { 0.0 }
}

/// Scale to unit length; zero vectors are returned unchanged
pub fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut vector {
            *x /= norm;
        }
    }
    vector
}

/// Little-endian f32 blob
pub(crate) fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub(crate) fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Corrupt(format!(
            "vector blob of {} bytes is not a whole number of f32 values",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Shared ranking for stores that scan candidates in memory
pub(crate) struct Candidate<'a> {
    pub id: &'a str,
    pub vector: &'a [f32],
    pub metadata: &'a Map<String, Value>,
    pub updated_at: i64,
}

pub(crate) fn rank_by_similarity<'a>(
    candidates: impl Iterator<Item = Candidate<'a>>,
    query: &[f32],
    options: &VectorSearchOptions,
) -> Vec<VectorSearchResult> {
    let floor = options.min_similarity.unwrap_or(f32::NEG_INFINITY);
    let mut scored: Vec<(f32, Candidate<'a>)> = candidates
        .filter(|c| options.matches(c.metadata))
        .map(|c| (cosine_similarity(query, c.vector), c))
        .filter(|(similarity, _)| *similarity >= floor)
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.id.cmp(b.1.id)));
    scored.truncate(options.limit);
    scored
        .into_iter()
        .map(|(similarity, c)| {
            VectorSearchResult::new(
                c.id.to_string(),
                similarity,
                c.metadata.clone(),
                SearchMethod::Vector,
            )
        })
        .collect()
}

pub(crate) fn rank_by_recency<'a>(
    candidates: impl Iterator<Item = Candidate<'a>>,
    options: &VectorSearchOptions,
) -> Vec<VectorSearchResult> {
    let mut matching: Vec<Candidate<'a>> =
        candidates.filter(|c| options.matches(c.metadata)).collect();
    matching.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(b.id)));
    matching.truncate(options.limit);
    matching
        .into_iter()
        .map(|c| {
            VectorSearchResult::new(
                c.id.to_string(),
                0.0,
                c.metadata.clone(),
                SearchMethod::RecencyFallback,
            )
        })
        .collect()
}

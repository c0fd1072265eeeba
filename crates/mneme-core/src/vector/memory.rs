//! In-process vector index

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use super::{
    Candidate, VectorSearchOptions, VectorSearchResult, VectorStore, check_dimensions,
    rank_by_recency, rank_by_similarity,
};
use crate::domain::knowledge::now_millis;
use crate::error::{Error, Result};

struct StoredVector {
    vector: Vec<f32>,
    metadata: Map<String, Value>,
    updated_at: i64,
}

/// Brute-force index held in memory
pub struct InMemoryVectorStore {
    dimensions: usize,
    vectors: RwLock<HashMap<String, StoredVector>>,
}

impl InMemoryVectorStore {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            vectors: RwLock::new(HashMap::new()),
        }
    }

    /// Remove every vector
    pub async fn clear(&self) {
        self.vectors.write().await.clear();
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn add_vector(
        &self,
        id: &str,
        vector: &[f32],
        metadata: Option<Map<String, Value>>,
    ) -> Result<()> {
        check_dimensions(self.dimensions, vector)?;
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(Error::Validation(format!("vector for '{}' has non-finite values", id)));
        }
        let mut vectors = self.vectors.write().await;
        // equal timestamps would make recency order depend on map iteration
        let latest = vectors.values().map(|v| v.updated_at).max().unwrap_or(i64::MIN);
        vectors.insert(
            id.to_string(),
            StoredVector {
                vector: vector.to_vec(),
                metadata: metadata.unwrap_or_default(),
                updated_at: now_millis().max(latest.saturating_add(1)),
            },
        );
        Ok(())
    }

    async fn remove_vector(&self, id: &str) -> Result<bool> {
        Ok(self.vectors.write().await.remove(id).is_some())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.vectors.read().await.len())
    }

    async fn similarity_search(
        &self,
        query: &[f32],
        options: &VectorSearchOptions,
    ) -> Result<Vec<VectorSearchResult>> {
        let vectors = self.vectors.read().await;
        let candidates = vectors.iter().map(|(id, stored)| Candidate {
            id,
            vector: &stored.vector,
            metadata: &stored.metadata,
            updated_at: stored.updated_at,
        });
        Ok(rank_by_similarity(candidates, query, options))
    }

    async fn recency_search(
        &self,
        options: &VectorSearchOptions,
    ) -> Result<Vec<VectorSearchResult>> {
        let vectors = self.vectors.read().await;
        let candidates = vectors.iter().map(|(id, stored)| Candidate {
            id,
            vector: &stored.vector,
            metadata: &stored.metadata,
            updated_at: stored.updated_at,
        });
        Ok(rank_by_recency(candidates, options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::{SEARCH_METHOD_KEY, SearchMethod};
    use serde_json::json;

    fn meta(entity_type: &str) -> Option<Map<String, Value>> {
        let mut map = Map::new();
        map.insert("entityType".into(), json!(entity_type));
        Some(map)
    }

    #[tokio::test]
    async fn test_similarity_ranking() {
        let store = InMemoryVectorStore::new(2);
        store.add_vector("east", &[1.0, 0.0], meta("dir")).await.unwrap();
        store.add_vector("north", &[0.0, 1.0], meta("dir")).await.unwrap();
        store.add_vector("northeast", &[1.0, 1.0], meta("dir")).await.unwrap();

        let results = store
            .search(&[1.0, 0.1], &VectorSearchOptions::default().with_limit(2))
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "east");
        assert_eq!(results[1].id, "northeast");
        assert_eq!(results[0].search_method, SearchMethod::Vector);
        assert_eq!(results[0].metadata[SEARCH_METHOD_KEY], "vector");
    }

    #[tokio::test]
    async fn test_min_similarity_and_filter() {
        let store = InMemoryVectorStore::new(2);
        store.add_vector("a", &[1.0, 0.0], meta("x")).await.unwrap();
        store.add_vector("b", &[0.9, 0.1], meta("y")).await.unwrap();
        store.add_vector("c", &[0.0, 1.0], meta("x")).await.unwrap();

        let results = store
            .search(
                &[1.0, 0.0],
                &VectorSearchOptions::default()
                    .with_min_similarity(0.5)
                    .with_filter("entityType", json!("x")),
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "a");
    }

    #[tokio::test]
    async fn test_zero_query_uses_recency_fallback() {
        let store = InMemoryVectorStore::new(2);
        store.add_vector("old", &[1.0, 0.0], None).await.unwrap();
        store.add_vector("new", &[0.0, 1.0], None).await.unwrap();

        let results = store
            .search(&[0.0, 0.0], &VectorSearchOptions::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "new");
        assert!(results.iter().all(|r| r.similarity == 0.0));
        assert!(results.iter().all(|r| r.search_method == SearchMethod::RecencyFallback));
        assert_eq!(results[0].metadata[SEARCH_METHOD_KEY], "recency_fallback");
    }

    #[tokio::test]
    async fn test_tiny_and_huge_queries_use_recency_fallback() {
        let store = InMemoryVectorStore::new(3);
        store.add_vector("a", &[1.0, 0.0, 0.0], None).await.unwrap();
        store.add_vector("b", &[0.0, 1.0, 0.0], None).await.unwrap();

        for query in [[1e-30_f32; 3], [1e20_f32; 3]] {
            let results = store
                .search(&query, &VectorSearchOptions::default())
                .await
                .unwrap();
            assert_eq!(results.len(), 2);
            assert!(results.iter().all(|r| r.search_method == SearchMethod::RecencyFallback));
        }
    }

    #[tokio::test]
    async fn test_dimension_checks() {
        let store = InMemoryVectorStore::new(3);
        assert!(store.add_vector("a", &[1.0, 0.0], None).await.is_err());
        assert!(store.search(&[1.0], &VectorSearchOptions::default()).await.is_err());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replace_and_remove() {
        let store = InMemoryVectorStore::new(2);
        store.add_vector("a", &[1.0, 0.0], None).await.unwrap();
        store.add_vector("a", &[0.0, 1.0], None).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);

        assert!(store.remove_vector("a").await.unwrap());
        assert!(!store.remove_vector("a").await.unwrap());
        assert_eq!(store.count().await.unwrap(), 0);
    }
}

//! SQLite-backed vector index
//!
//! Vectors live in the `vector_index` table as little-endian f32 blobs.
//! Search scans the table and scores in process.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{FromRow, SqlitePool};
use tracing::debug;

use super::{
    Candidate, VectorSearchOptions, VectorSearchResult, VectorStore, check_dimensions,
    decode_vector, encode_vector, rank_by_recency, rank_by_similarity,
};
use crate::domain::knowledge::now_millis;
use crate::error::{Error, Result, StorageContext};
use crate::storage::migrations::VECTOR_INDEX_SCHEMA;

#[derive(Debug, FromRow)]
struct VectorRow {
    id: String,
    dimensions: i64,
    vector: Vec<u8>,
    metadata: String,
    updated_at: i64,
}

struct DecodedRow {
    id: String,
    vector: Vec<f32>,
    metadata: Map<String, Value>,
    updated_at: i64,
}

/// Persistent vector index sharing the graph database's pool
#[derive(Clone)]
pub struct SqliteVectorStore {
    pool: SqlitePool,
    dimensions: usize,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool, dimensions: usize) -> Self {
        Self { pool, dimensions }
    }

    async fn load_rows(&self) -> Result<Vec<DecodedRow>> {
        let rows: Vec<VectorRow> = sqlx::query_as(
            "SELECT id, dimensions, vector, metadata, updated_at FROM vector_index",
        )
        .fetch_all(&self.pool)
        .await
        .storage_context("vector_search", "vector_index")?;

        let mut decoded = Vec::with_capacity(rows.len());
        for row in rows {
            if row.dimensions as usize != self.dimensions {
                return Err(Error::DimensionMismatch {
                    expected: self.dimensions,
                    actual: row.dimensions as usize,
                });
            }
            let metadata = match serde_json::from_str(&row.metadata)? {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            decoded.push(DecodedRow {
                vector: decode_vector(&row.vector)?,
                id: row.id,
                metadata,
                updated_at: row.updated_at,
            });
        }
        Ok(decoded)
    }
}

fn candidates(rows: &[DecodedRow]) -> impl Iterator<Item = Candidate<'_>> {
    rows.iter().map(|row| Candidate {
        id: &row.id,
        vector: &row.vector,
        metadata: &row.metadata,
        updated_at: row.updated_at,
    })
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::raw_sql(VECTOR_INDEX_SCHEMA)
            .execute(&self.pool)
            .await
            .storage_context("initialize", "vector_index")?;
        debug!(dimensions = self.dimensions, "Vector index ready");
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
        let metadata = Value::Object(metadata.unwrap_or_default()).to_string();

        sqlx::query(
            r#"
            INSERT INTO vector_index (id, dimensions, vector, metadata, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                dimensions = excluded.dimensions,
                vector = excluded.vector,
                metadata = excluded.metadata,
                updated_at = MAX(excluded.updated_at, vector_index.updated_at + 1)
            "#,
        )
        .bind(id)
        .bind(self.dimensions as i64)
        .bind(encode_vector(vector))
        .bind(&metadata)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .storage_context("add_vector", id)?;

        debug!(vector_id = %id, "Vector indexed");
        Ok(())
    }

    async fn remove_vector(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM vector_index WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .storage_context("remove_vector", id)?;
        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM vector_index")
            .fetch_one(&self.pool)
            .await
            .storage_context("count", "vector_index")?;
        Ok(count as usize)
    }

    async fn similarity_search(
        &self,
        query: &[f32],
        options: &VectorSearchOptions,
    ) -> Result<Vec<VectorSearchResult>> {
        let rows = self.load_rows().await?;
        Ok(rank_by_similarity(candidates(&rows), query, options))
    }

    async fn recency_search(
        &self,
        options: &VectorSearchOptions,
    ) -> Result<Vec<VectorSearchResult>> {
        let rows = self.load_rows().await?;
        Ok(rank_by_recency(candidates(&rows), options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::SearchMethod;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store(dimensions: usize) -> SqliteVectorStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteVectorStore::new(pool, dimensions);
        store.initialize().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let store = store(2).await;
        store.initialize().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_add_search_remove() {
        let store = store(2).await;
        let mut meta = Map::new();
        meta.insert("entityType".into(), Value::from("city"));
        store.add_vector("paris", &[1.0, 0.0], Some(meta)).await.unwrap();
        store.add_vector("rome", &[0.0, 1.0], None).await.unwrap();

        let results = store
            .search(&[0.9, 0.1], &VectorSearchOptions::default())
            .await
            .unwrap();
        assert_eq!(results[0].id, "paris");
        assert_eq!(results[0].metadata["entityType"], "city");
        assert_eq!(results[0].search_method, SearchMethod::Vector);

        assert!(store.remove_vector("paris").await.unwrap());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_degenerate_query_falls_back_to_recency() {
        let store = store(2).await;
        store.add_vector("first", &[1.0, 0.0], None).await.unwrap();
        store.add_vector("second", &[0.0, 1.0], None).await.unwrap();
        store.add_vector("first", &[1.0, 0.1], None).await.unwrap();

        let results = store
            .search(&[f32::NAN, 0.0], &VectorSearchOptions::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "first");
        assert!(results.iter().all(|r| r.search_method == SearchMethod::RecencyFallback));
    }

    #[tokio::test]
    async fn test_dimension_mismatch() {
        let store = store(3).await;
        let err = store.add_vector("x", &[1.0], None).await.unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 3, actual: 1 }));
    }
}

//! SQLite storage backend with version history
//!
//! Each write closes the current row of a record (`is_current = 0`,
//! `superseded_at = now`) and inserts the next version, all inside one
//! transaction. Current rows are what the graph operations see; superseded
//! rows back entity/relation history and point-in-time reads.
//!
//! Write transactions start with `BEGIN IMMEDIATE`. Concurrent writers then
//! wait on the busy timeout for the write lock instead of failing when a
//! read snapshot is upgraded.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use sqlx::{FromRow, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::debug;

use crate::domain::knowledge::{
    Entity, EntityEmbedding, KnowledgeGraph, Relation, RelationKey, RelationMetadata,
    SearchOptions, Temporal, now_millis,
};
use crate::error::{Error, Result, StorageContext};
use crate::storage::database::Database;
use crate::storage::provider::{
    EntityOutcome, EntityWriteResult, HistoryQueryable, ObservationAddition, ObservationDeletion,
    ObservationResult, RelationOutcome, RelationWriteResult, SemanticMatch, SemanticSearchOptions,
    SemanticSearchable, StorageProvider, VectorCapable,
};
use crate::vector::{cosine_similarity, decode_vector, encode_vector};

const ENTITY_COLUMNS: &str = "id, name, entity_type, observations, version, created_at, \
                              updated_at, valid_from, valid_to, changed_by";

const RELATION_COLUMNS: &str = "id, from_name, to_name, relation_type, strength, confidence, \
                                metadata, version, created_at, updated_at, valid_from, valid_to, \
                                changed_by";

/// SQLite implementation of the storage provider
#[derive(Clone)]
pub struct SqliteStorageProvider {
    pool: SqlitePool,
}

impl SqliteStorageProvider {
    /// The pool must point at a migrated database
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn from_database(database: &Database) -> Self {
        Self::new(database.pool().clone())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn begin_write(&self) -> sqlx::Result<Transaction<'static, Sqlite>> {
        self.pool.begin_with("BEGIN IMMEDIATE").await
    }

    async fn load_current(&self) -> Result<KnowledgeGraph> {
        let mut conn = self.pool.acquire().await?;
        let entities = all_current_entities(&mut conn).await?;
        let relations: Vec<RelationRow> = sqlx::query_as(&format!(
            "SELECT {RELATION_COLUMNS} FROM relations WHERE is_current = 1 ORDER BY row_id"
        ))
        .fetch_all(&mut *conn)
        .await?;
        let relations = relations
            .into_iter()
            .map(RelationRow::into_relation)
            .collect::<Result<Vec<_>>>()?;
        Ok(KnowledgeGraph::new(entities, relations))
    }

    async fn semantic_search_inner(
        &self,
        query_vector: &[f32],
        options: &SemanticSearchOptions,
    ) -> Result<Vec<SemanticMatch>> {
        let rows: Vec<(String, String, Vec<u8>)> = sqlx::query_as(
            r#"
            SELECT e.name, e.entity_type, emb.vector
            FROM entity_embeddings emb
            JOIN entities e ON e.name = emb.entity_name AND e.is_current = 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut scored = Vec::new();
        for (name, entity_type, blob) in rows {
            if !options.entity_types.is_empty() && !options.entity_types.contains(&entity_type) {
                continue;
            }
            let vector = decode_vector(&blob)?;
            if vector.len() != query_vector.len() {
                return Err(Error::DimensionMismatch {
                    expected: vector.len(),
                    actual: query_vector.len(),
                });
            }
            let similarity = cosine_similarity(query_vector, &vector);
            if similarity >= options.min_similarity {
                scored.push((name, similarity));
            }
        }
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(options.limit);

        let names: Vec<String> = scored.iter().map(|(name, _)| name.clone()).collect();
        let mut conn = self.pool.acquire().await?;
        let mut by_name: HashMap<String, Entity> = current_entities_named(&mut conn, &names)
            .await?
            .into_iter()
            .map(|e| (e.name.clone(), e))
            .collect();

        Ok(scored
            .into_iter()
            .filter_map(|(name, similarity)| {
                by_name
                    .remove(&name)
                    .map(|entity| SemanticMatch { entity, similarity })
            })
            .collect())
    }
}

fn batch_key<'a>(names: impl Iterator<Item = &'a str>) -> String {
    let names: Vec<&str> = names.collect();
    match names.as_slice() {
        [] => "(empty batch)".to_string(),
        [one] => one.to_string(),
        [first, rest @ ..] => format!("{} (+{} more)", first, rest.len()),
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn relation_not_found(key: &RelationKey) -> Error {
    Error::RelationNotFound {
        from: key.from.clone(),
        to: key.to.clone(),
        relation_type: key.relation_type.clone(),
    }
}

// ========== Entity Rows ==========

async fn all_current_entities(conn: &mut SqliteConnection) -> Result<Vec<Entity>> {
    let rows: Vec<EntityRow> = sqlx::query_as(&format!(
        "SELECT {ENTITY_COLUMNS} FROM entities WHERE is_current = 1 ORDER BY row_id"
    ))
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(EntityRow::into_entity).collect()
}

async fn current_entity(conn: &mut SqliteConnection, name: &str) -> Result<Option<Entity>> {
    let row: Option<EntityRow> = sqlx::query_as(&format!(
        "SELECT {ENTITY_COLUMNS} FROM entities WHERE name = ? AND is_current = 1"
    ))
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(EntityRow::into_entity).transpose()
}

async fn current_entities_named(
    conn: &mut SqliteConnection,
    names: &[String],
) -> Result<Vec<Entity>> {
    if names.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT {ENTITY_COLUMNS} FROM entities WHERE is_current = 1 AND name IN ({}) ORDER BY row_id",
        placeholders(names.len())
    );
    let mut query = sqlx::query_as::<_, EntityRow>(&sql);
    for name in names {
        query = query.bind(name);
    }
    let rows = query.fetch_all(&mut *conn).await?;
    rows.into_iter().map(EntityRow::into_entity).collect()
}

async fn entity_exists(conn: &mut SqliteConnection, name: &str) -> Result<bool> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT 1 FROM entities WHERE name = ? AND is_current = 1")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(row.is_some())
}

async fn next_entity_version(conn: &mut SqliteConnection, name: &str) -> Result<u64> {
    let (max,): (i64,) =
        sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM entities WHERE name = ?")
            .bind(name)
            .fetch_one(&mut *conn)
            .await?;
    Ok(max as u64 + 1)
}

async fn supersede_entity(conn: &mut SqliteConnection, name: &str, now: i64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE entities SET is_current = 0, superseded_at = ? WHERE name = ? AND is_current = 1",
    )
    .bind(now)
    .bind(name)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

async fn insert_entity_row(conn: &mut SqliteConnection, entity: &Entity) -> Result<()> {
    let observations = serde_json::to_string(&entity.observations)?;
    sqlx::query(
        r#"
        INSERT INTO entities (
            id, name, entity_type, observations, version, created_at, updated_at,
            valid_from, valid_to, changed_by, is_current
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
        "#,
    )
    .bind(&entity.id)
    .bind(&entity.name)
    .bind(&entity.entity_type)
    .bind(&observations)
    .bind(entity.version as i64)
    .bind(entity.created_at)
    .bind(entity.updated_at)
    .bind(entity.valid_from)
    .bind(entity.valid_to)
    .bind(&entity.changed_by)
    .execute(&mut *conn)
    .await?;

    debug!(entity_name = %entity.name, version = entity.version, "Entity version saved");
    Ok(())
}

/// Close the current version and make `entity` the new one
async fn write_entity_version(conn: &mut SqliteConnection, entity: &Entity, now: i64) -> Result<()> {
    supersede_entity(conn, &entity.name, now).await?;
    insert_entity_row(conn, entity).await
}

// ========== Relation Rows ==========

async fn current_relation(
    conn: &mut SqliteConnection,
    key: &RelationKey,
) -> Result<Option<Relation>> {
    let row: Option<RelationRow> = sqlx::query_as(&format!(
        "SELECT {RELATION_COLUMNS} FROM relations \
         WHERE from_name = ? AND to_name = ? AND relation_type = ? AND is_current = 1"
    ))
    .bind(&key.from)
    .bind(&key.to)
    .bind(&key.relation_type)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(RelationRow::into_relation).transpose()
}

/// Current relations with both endpoints in `names`
async fn relations_among(conn: &mut SqliteConnection, names: &[String]) -> Result<Vec<Relation>> {
    if names.is_empty() {
        return Ok(Vec::new());
    }
    let marks = placeholders(names.len());
    let sql = format!(
        "SELECT {RELATION_COLUMNS} FROM relations \
         WHERE is_current = 1 AND from_name IN ({marks}) AND to_name IN ({marks}) ORDER BY row_id"
    );
    let mut query = sqlx::query_as::<_, RelationRow>(&sql);
    for name in names.iter().chain(names.iter()) {
        query = query.bind(name);
    }
    let rows = query.fetch_all(&mut *conn).await?;
    rows.into_iter().map(RelationRow::into_relation).collect()
}

async fn next_relation_version(conn: &mut SqliteConnection, key: &RelationKey) -> Result<u64> {
    let (max,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(MAX(version), 0) FROM relations \
         WHERE from_name = ? AND to_name = ? AND relation_type = ?",
    )
    .bind(&key.from)
    .bind(&key.to)
    .bind(&key.relation_type)
    .fetch_one(&mut *conn)
    .await?;
    Ok(max as u64 + 1)
}

async fn supersede_relation(conn: &mut SqliteConnection, key: &RelationKey, now: i64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE relations SET is_current = 0, superseded_at = ? \
         WHERE from_name = ? AND to_name = ? AND relation_type = ? AND is_current = 1",
    )
    .bind(now)
    .bind(&key.from)
    .bind(&key.to)
    .bind(&key.relation_type)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

async fn insert_relation_row(conn: &mut SqliteConnection, relation: &Relation) -> Result<()> {
    let metadata = relation
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    sqlx::query(
        r#"
        INSERT INTO relations (
            id, from_name, to_name, relation_type, strength, confidence, metadata,
            version, created_at, updated_at, valid_from, valid_to, changed_by, is_current
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
        "#,
    )
    .bind(&relation.id)
    .bind(&relation.from)
    .bind(&relation.to)
    .bind(&relation.relation_type)
    .bind(relation.strength)
    .bind(relation.confidence)
    .bind(&metadata)
    .bind(relation.version as i64)
    .bind(relation.created_at)
    .bind(relation.updated_at)
    .bind(relation.valid_from)
    .bind(relation.valid_to)
    .bind(&relation.changed_by)
    .execute(&mut *conn)
    .await?;

    debug!(relation = %relation.key(), version = relation.version, "Relation version saved");
    Ok(())
}

async fn drop_orphaned_embeddings(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query(
        "DELETE FROM entity_embeddings \
         WHERE entity_name NOT IN (SELECT name FROM entities WHERE is_current = 1)",
    )
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl StorageProvider for SqliteStorageProvider {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    // ========== Graph Operations ==========

    async fn load_graph(&self) -> Result<KnowledgeGraph> {
        self.load_current().await.storage_context("load_graph", "graph")
    }

    async fn save_graph(&self, graph: &KnowledgeGraph) -> Result<()> {
        async {
            let now = now_millis();
            let mut tx = self.begin_write().await?;
            sqlx::query("UPDATE entities SET is_current = 0, superseded_at = ? WHERE is_current = 1")
                .bind(now)
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE relations SET is_current = 0, superseded_at = ? WHERE is_current = 1")
                .bind(now)
                .execute(&mut *tx)
                .await?;

            for entity in &graph.entities {
                let mut entity = entity.clone();
                entity.version = next_entity_version(&mut tx, &entity.name).await?;
                if entity.created_at == 0 {
                    entity.created_at = now;
                }
                entity.updated_at = now;
                insert_entity_row(&mut tx, &entity).await?;
            }
            for relation in &graph.relations {
                let mut relation = relation.clone();
                relation.version = next_relation_version(&mut tx, &relation.key()).await?;
                if relation.created_at == 0 {
                    relation.created_at = now;
                }
                relation.updated_at = now;
                insert_relation_row(&mut tx, &relation).await?;
            }
            drop_orphaned_embeddings(&mut tx).await?;
            tx.commit().await?;
            Ok::<_, Error>(())
        }
        .await
        .storage_context("save_graph", "graph")
    }

    async fn search_nodes(&self, query: &str, options: &SearchOptions) -> Result<KnowledgeGraph> {
        async {
            let mut conn = self.pool.acquire().await?;
            // matching happens in Rust so both backends agree on case folding
            let mut entities: Vec<Entity> = all_current_entities(&mut conn)
                .await?
                .into_iter()
                .filter(|e| options.accepts_type(&e.entity_type) && e.matches_query(query))
                .collect();
            if let Some(limit) = options.limit {
                entities.truncate(limit);
            }
            let names: Vec<String> = entities.iter().map(|e| e.name.clone()).collect();
            let relations = relations_among(&mut conn, &names).await?;
            Ok::<_, Error>(KnowledgeGraph::new(entities, relations))
        }
        .await
        .storage_context("search_nodes", query)
    }

    async fn open_nodes(&self, names: &[String]) -> Result<KnowledgeGraph> {
        async {
            let mut conn = self.pool.acquire().await?;
            let entities = current_entities_named(&mut conn, names).await?;
            let found: Vec<String> = entities.iter().map(|e| e.name.clone()).collect();
            let relations = relations_among(&mut conn, &found).await?;
            Ok::<_, Error>(KnowledgeGraph::new(entities, relations))
        }
        .await
        .storage_context("open_nodes", batch_key(names.iter().map(String::as_str)))
    }

    // ========== Entity Operations ==========

    async fn create_entities(&self, entities: Vec<Entity>) -> Result<Vec<EntityWriteResult>> {
        let key = batch_key(entities.iter().map(|e| e.name.as_str()));
        async {
            let now = now_millis();
            let mut tx = self.begin_write().await?;
            let mut results = Vec::with_capacity(entities.len());

            for mut entity in entities {
                let outcome = match current_entity(&mut tx, &entity.name).await? {
                    Some(mut existing) => {
                        if existing.merge_observations(&entity.observations).is_empty() {
                            EntityOutcome::Unchanged
                        } else {
                            existing.bump_version(now);
                            if entity.changed_by.is_some() {
                                existing.changed_by = entity.changed_by.take();
                            }
                            write_entity_version(&mut tx, &existing, now).await?;
                            EntityOutcome::Updated
                        }
                    }
                    None => {
                        let mut observations = Vec::with_capacity(entity.observations.len());
                        for observation in entity.observations.drain(..) {
                            if !observations.contains(&observation) {
                                observations.push(observation);
                            }
                        }
                        entity.observations = observations;
                        entity.version = next_entity_version(&mut tx, &entity.name).await?;
                        entity.created_at = now;
                        entity.updated_at = now;
                        insert_entity_row(&mut tx, &entity).await?;
                        EntityOutcome::Created
                    }
                };
                results.push(EntityWriteResult::new(entity.name, outcome));
            }

            tx.commit().await?;
            Ok::<_, Error>(results)
        }
        .await
        .storage_context("create_entities", key)
    }

    async fn add_observations(
        &self,
        additions: Vec<ObservationAddition>,
    ) -> Result<Vec<ObservationResult>> {
        let key = batch_key(additions.iter().map(|a| a.entity_name.as_str()));
        async {
            let now = now_millis();
            let mut tx = self.begin_write().await?;
            let mut results = Vec::with_capacity(additions.len());

            for addition in additions {
                let mut entity = current_entity(&mut tx, &addition.entity_name)
                    .await?
                    .ok_or_else(|| Error::EntityNotFound(addition.entity_name.clone()))?;
                let added = entity.merge_observations(&addition.contents);
                if !added.is_empty() {
                    entity.bump_version(now);
                    write_entity_version(&mut tx, &entity, now).await?;
                }
                results.push(ObservationResult {
                    entity_name: addition.entity_name,
                    added_observations: added,
                });
            }

            // an early return above drops the transaction, rolling back
            tx.commit().await?;
            Ok::<_, Error>(results)
        }
        .await
        .storage_context("add_observations", key)
    }

    async fn delete_entities(&self, names: &[String]) -> Result<()> {
        async {
            let now = now_millis();
            let mut tx = self.begin_write().await?;
            for name in names {
                supersede_entity(&mut tx, name, now).await?;
                sqlx::query(
                    "UPDATE relations SET is_current = 0, superseded_at = ? \
                     WHERE is_current = 1 AND (from_name = ? OR to_name = ?)",
                )
                .bind(now)
                .bind(name)
                .bind(name)
                .execute(&mut *tx)
                .await?;
            }
            drop_orphaned_embeddings(&mut tx).await?;
            tx.commit().await?;
            debug!(count = names.len(), "Entities deleted");
            Ok::<_, Error>(())
        }
        .await
        .storage_context("delete_entities", batch_key(names.iter().map(String::as_str)))
    }

    async fn delete_observations(&self, deletions: Vec<ObservationDeletion>) -> Result<()> {
        let key = batch_key(deletions.iter().map(|d| d.entity_name.as_str()));
        async {
            let now = now_millis();
            let mut tx = self.begin_write().await?;
            for deletion in &deletions {
                if let Some(mut entity) = current_entity(&mut tx, &deletion.entity_name).await? {
                    if entity.remove_observations(&deletion.observations) {
                        entity.bump_version(now);
                        write_entity_version(&mut tx, &entity, now).await?;
                    }
                }
            }
            tx.commit().await?;
            Ok::<_, Error>(())
        }
        .await
        .storage_context("delete_observations", key)
    }

    // ========== Relation Operations ==========

    async fn create_relations(&self, relations: Vec<Relation>) -> Result<Vec<RelationWriteResult>> {
        let key = batch_key(relations.iter().map(|r| r.from.as_str()));
        async {
            let now = now_millis();
            let mut tx = self.begin_write().await?;
            let mut results = Vec::with_capacity(relations.len());

            for mut relation in relations {
                let key = relation.key();
                let mut missing = None;
                for endpoint in [&relation.from, &relation.to] {
                    if !entity_exists(&mut tx, endpoint).await? {
                        missing = Some(endpoint.clone());
                        break;
                    }
                }
                let outcome = if let Some(endpoint) = missing {
                    RelationOutcome::Rejected {
                        reason: format!("entity '{}' does not exist", endpoint),
                    }
                } else if current_relation(&mut tx, &key).await?.is_some() {
                    RelationOutcome::AlreadyExists
                } else {
                    relation.version = next_relation_version(&mut tx, &key).await?;
                    relation.created_at = now;
                    relation.updated_at = now;
                    insert_relation_row(&mut tx, &relation).await?;
                    RelationOutcome::Created
                };
                results.push(RelationWriteResult::new(key, outcome));
            }

            tx.commit().await?;
            Ok::<_, Error>(results)
        }
        .await
        .storage_context("create_relations", key)
    }

    async fn delete_relations(&self, keys: &[RelationKey]) -> Result<()> {
        async {
            let now = now_millis();
            let mut tx = self.begin_write().await?;
            for key in keys {
                supersede_relation(&mut tx, key, now).await?;
            }
            tx.commit().await?;
            Ok::<_, Error>(())
        }
        .await
        .storage_context("delete_relations", format!("{} relations", keys.len()))
    }

    async fn get_relation(&self, key: &RelationKey) -> Result<Option<Relation>> {
        async {
            let mut conn = self.pool.acquire().await?;
            current_relation(&mut conn, key).await
        }
        .await
        .storage_context("get_relation", key.to_string())
    }

    async fn update_relation(&self, relation: Relation) -> Result<Relation> {
        let key = relation.key();
        async {
            let now = now_millis();
            let mut tx = self.begin_write().await?;
            let mut updated = current_relation(&mut tx, &key)
                .await?
                .ok_or_else(|| relation_not_found(&key))?;
            updated.strength = relation.strength;
            updated.confidence = relation.confidence;
            updated.metadata = relation.metadata;
            updated.valid_from = relation.valid_from;
            updated.valid_to = relation.valid_to;
            updated.changed_by = relation.changed_by;
            updated.version += 1;
            updated.updated_at = now;

            supersede_relation(&mut tx, &key, now).await?;
            insert_relation_row(&mut tx, &updated).await?;
            tx.commit().await?;
            Ok::<_, Error>(updated)
        }
        .await
        .storage_context("update_relation", key.to_string())
    }

    fn as_semantic_search(&self) -> Option<&dyn SemanticSearchable> {
        Some(self)
    }

    fn as_history(&self) -> Option<&dyn HistoryQueryable> {
        Some(self)
    }

    fn as_vector_capable(&self) -> Option<&dyn VectorCapable> {
        Some(self)
    }
}

#[async_trait]
impl SemanticSearchable for SqliteStorageProvider {
    async fn semantic_search(
        &self,
        query_vector: &[f32],
        options: &SemanticSearchOptions,
    ) -> Result<Vec<SemanticMatch>> {
        self.semantic_search_inner(query_vector, options)
            .await
            .storage_context("semantic_search", "entity_embeddings")
    }
}

#[async_trait]
impl HistoryQueryable for SqliteStorageProvider {
    async fn get_entity_history(&self, name: &str) -> Result<Vec<Entity>> {
        let rows: Vec<EntityRow> = sqlx::query_as(&format!(
            "SELECT {ENTITY_COLUMNS} FROM entities WHERE name = ? ORDER BY version, row_id"
        ))
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .storage_context("get_entity_history", name)?;

        if rows.is_empty() {
            return Err(Error::EntityNotFound(name.to_string()));
        }
        rows.into_iter().map(EntityRow::into_entity).collect()
    }

    async fn get_relation_history(&self, key: &RelationKey) -> Result<Vec<Relation>> {
        let rows: Vec<RelationRow> = sqlx::query_as(&format!(
            "SELECT {RELATION_COLUMNS} FROM relations \
             WHERE from_name = ? AND to_name = ? AND relation_type = ? ORDER BY version, row_id"
        ))
        .bind(&key.from)
        .bind(&key.to)
        .bind(&key.relation_type)
        .fetch_all(&self.pool)
        .await
        .storage_context("get_relation_history", key.to_string())?;

        if rows.is_empty() {
            return Err(relation_not_found(key));
        }
        rows.into_iter().map(RelationRow::into_relation).collect()
    }

    async fn get_graph_at_time(&self, timestamp: i64) -> Result<KnowledgeGraph> {
        async {
            let entity_rows: Vec<EntityRow> = sqlx::query_as(&format!(
                "SELECT {ENTITY_COLUMNS} FROM entities \
                 WHERE updated_at <= ? AND (superseded_at IS NULL OR superseded_at > ?) \
                 ORDER BY row_id"
            ))
            .bind(timestamp)
            .bind(timestamp)
            .fetch_all(&self.pool)
            .await?;

            let mut entities = Vec::with_capacity(entity_rows.len());
            for row in entity_rows {
                let entity = row.into_entity()?;
                if entity.is_valid_at(timestamp) {
                    entities.push(entity);
                }
            }
            let names: HashSet<&str> = entities.iter().map(|e| e.name.as_str()).collect();

            let relation_rows: Vec<RelationRow> = sqlx::query_as(&format!(
                "SELECT {RELATION_COLUMNS} FROM relations \
                 WHERE updated_at <= ? AND (superseded_at IS NULL OR superseded_at > ?) \
                 ORDER BY row_id"
            ))
            .bind(timestamp)
            .bind(timestamp)
            .fetch_all(&self.pool)
            .await?;

            let mut relations = Vec::new();
            for row in relation_rows {
                let relation = row.into_relation()?;
                if relation.is_valid_at(timestamp)
                    && names.contains(relation.from.as_str())
                    && names.contains(relation.to.as_str())
                {
                    relations.push(relation);
                }
            }
            Ok::<_, Error>(KnowledgeGraph::new(entities, relations))
        }
        .await
        .storage_context("get_graph_at_time", timestamp.to_string())
    }
}

#[async_trait]
impl VectorCapable for SqliteStorageProvider {
    async fn update_entity_embedding(&self, name: &str, embedding: &EntityEmbedding) -> Result<()> {
        async {
            let mut conn = self.pool.acquire().await?;
            if !entity_exists(&mut conn, name).await? {
                return Err(Error::EntityNotFound(name.to_string()));
            }
            sqlx::query(
                r#"
                INSERT INTO entity_embeddings (entity_name, model, dimensions, vector, last_updated)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(entity_name) DO UPDATE SET
                    model = excluded.model,
                    dimensions = excluded.dimensions,
                    vector = excluded.vector,
                    last_updated = excluded.last_updated
                "#,
            )
            .bind(name)
            .bind(&embedding.model)
            .bind(embedding.dimensions() as i64)
            .bind(encode_vector(&embedding.vector))
            .bind(embedding.last_updated)
            .execute(&mut *conn)
            .await?;

            debug!(entity_name = %name, model = %embedding.model, "Entity embedding saved");
            Ok::<_, Error>(())
        }
        .await
        .storage_context("update_entity_embedding", name)
    }

    async fn get_entity_embedding(&self, name: &str) -> Result<Option<EntityEmbedding>> {
        let row: Option<EmbeddingRow> = sqlx::query_as(
            "SELECT model, vector, last_updated FROM entity_embeddings WHERE entity_name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .storage_context("get_entity_embedding", name)?;

        row.map(EmbeddingRow::into_embedding).transpose()
    }
}

// ========== Database Row Types ==========

#[derive(Debug, FromRow)]
struct EntityRow {
    id: String,
    name: String,
    entity_type: String,
    observations: String,
    version: i64,
    created_at: i64,
    updated_at: i64,
    valid_from: Option<i64>,
    valid_to: Option<i64>,
    changed_by: Option<String>,
}

impl EntityRow {
    fn into_entity(self) -> Result<Entity> {
        Ok(Entity {
            observations: serde_json::from_str(&self.observations)?,
            name: self.name,
            entity_type: self.entity_type,
            embedding: None,
            id: self.id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            version: self.version as u64,
            valid_from: self.valid_from,
            valid_to: self.valid_to,
            changed_by: self.changed_by,
        })
    }
}

#[derive(Debug, FromRow)]
struct RelationRow {
    id: String,
    from_name: String,
    to_name: String,
    relation_type: String,
    strength: Option<f64>,
    confidence: Option<f64>,
    metadata: Option<String>,
    version: i64,
    created_at: i64,
    updated_at: i64,
    valid_from: Option<i64>,
    valid_to: Option<i64>,
    changed_by: Option<String>,
}

impl RelationRow {
    fn into_relation(self) -> Result<Relation> {
        let metadata: Option<RelationMetadata> = self
            .metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(Relation {
            from: self.from_name,
            to: self.to_name,
            relation_type: self.relation_type,
            strength: self.strength,
            confidence: self.confidence,
            metadata,
            id: self.id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            version: self.version as u64,
            valid_from: self.valid_from,
            valid_to: self.valid_to,
            changed_by: self.changed_by,
        })
    }
}

#[derive(Debug, FromRow)]
struct EmbeddingRow {
    model: String,
    vector: Vec<u8>,
    last_updated: i64,
}

impl EmbeddingRow {
    fn into_embedding(self) -> Result<EntityEmbedding> {
        Ok(EntityEmbedding {
            vector: decode_vector(&self.vector)?,
            model: self.model,
            last_updated: self.last_updated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::storage::migrations::run_migrations;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        run_migrations(&pool).await.unwrap();

        pool
    }

    async fn provider() -> SqliteStorageProvider {
        SqliteStorageProvider::new(setup_test_db().await)
    }

    async fn tick() {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    #[tokio::test]
    async fn test_updates_create_new_versions() {
        let repo = provider().await;
        repo.create_entities(vec![Entity::new("alice", "person").with_observation("a")])
            .await
            .unwrap();
        repo.add_observations(vec![ObservationAddition {
            entity_name: "alice".into(),
            contents: vec!["b".into()],
        }])
        .await
        .unwrap();

        let history = repo.get_entity_history("alice").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version, 1);
        assert_eq!(history[0].observations, vec!["a"]);
        assert_eq!(history[1].version, 2);
        assert_eq!(history[1].observations, vec!["a", "b"]);

        let graph = repo.load_graph().await.unwrap();
        assert_eq!(graph.entities.len(), 1);
        assert_eq!(graph.entities[0].version, 2);
        assert_eq!(graph.entities[0].id, history[0].id);
    }

    #[tokio::test]
    async fn test_add_observations_is_atomic() {
        let repo = provider().await;
        repo.create_entities(vec![Entity::new("alice", "person")])
            .await
            .unwrap();

        let err = repo
            .add_observations(vec![
                ObservationAddition {
                    entity_name: "alice".into(),
                    contents: vec!["x".into()],
                },
                ObservationAddition {
                    entity_name: "ghost".into(),
                    contents: vec!["y".into()],
                },
            ])
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        let graph = repo.load_graph().await.unwrap();
        assert!(graph.entities[0].observations.is_empty());
        assert_eq!(repo.get_entity_history("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_graph_at_time_sees_past_versions() {
        let repo = provider().await;
        repo.create_entities(vec![Entity::new("a", "t"), Entity::new("b", "t")])
            .await
            .unwrap();
        repo.create_relations(vec![Relation::new("a", "b", "r")])
            .await
            .unwrap();
        tick().await;
        let before_delete = now_millis();
        tick().await;
        repo.delete_entities(&["b".to_string()]).await.unwrap();

        let past = repo.get_graph_at_time(before_delete).await.unwrap();
        assert_eq!(past.entities.len(), 2);
        assert_eq!(past.relations.len(), 1);

        let now = repo.get_graph_at_time(now_millis() + 1).await.unwrap();
        assert_eq!(now.entities.len(), 1);
        assert!(now.relations.is_empty());
    }

    #[tokio::test]
    async fn test_relation_versions() {
        let repo = provider().await;
        repo.create_entities(vec![Entity::new("a", "t"), Entity::new("b", "t")])
            .await
            .unwrap();
        repo.create_relations(vec![Relation::new("a", "b", "r").with_strength(0.2)])
            .await
            .unwrap();

        let updated = repo
            .update_relation(Relation::new("a", "b", "r").with_strength(0.9))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.strength, Some(0.9));

        let key = RelationKey::new("a", "b", "r");
        let history = repo.get_relation_history(&key).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].strength, Some(0.2));

        let missing = repo
            .update_relation(Relation::new("b", "a", "r"))
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_recreated_entity_continues_version_sequence() {
        let repo = provider().await;
        repo.create_entities(vec![Entity::new("a", "t")]).await.unwrap();
        repo.delete_entities(&["a".to_string()]).await.unwrap();
        repo.create_entities(vec![Entity::new("a", "t")]).await.unwrap();

        let graph = repo.load_graph().await.unwrap();
        assert_eq!(graph.entities[0].version, 2);
    }

    #[tokio::test]
    async fn test_semantic_search() {
        let repo = provider().await;
        repo.create_entities(vec![
            Entity::new("rust", "language"),
            Entity::new("go", "language"),
            Entity::new("tea", "drink"),
        ])
        .await
        .unwrap();
        for (name, vector) in [
            ("rust", vec![1.0, 0.0, 0.0]),
            ("go", vec![0.9, 0.1, 0.0]),
            ("tea", vec![0.0, 0.0, 1.0]),
        ] {
            repo.update_entity_embedding(name, &EntityEmbedding::new(vector, "test"))
                .await
                .unwrap();
        }

        let results = repo
            .semantic_search(
                &[1.0, 0.0, 0.0],
                &SemanticSearchOptions {
                    limit: 5,
                    min_similarity: 0.5,
                    entity_types: Vec::new(),
                },
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].entity.name, "rust");
        assert!((results[0].similarity - 1.0).abs() < 1e-6);
        assert_eq!(results[1].entity.name, "go");

        let err = repo
            .semantic_search(&[1.0, 0.0], &SemanticSearchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DimensionMismatch);
    }

    #[tokio::test]
    async fn test_delete_entity_drops_embedding() {
        let repo = provider().await;
        repo.create_entities(vec![Entity::new("a", "t")]).await.unwrap();
        repo.update_entity_embedding("a", &EntityEmbedding::new(vec![1.0], "m"))
            .await
            .unwrap();

        repo.delete_entities(&["a".to_string()]).await.unwrap();

        assert!(repo.get_entity_embedding("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_of_unknown_entity() {
        let repo = provider().await;
        let err = repo.get_entity_history("nobody").await.unwrap_err();
        assert!(matches!(err, Error::EntityNotFound(_)));
    }
}

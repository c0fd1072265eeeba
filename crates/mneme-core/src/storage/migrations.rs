//! Database migrations
//!
//! SQLite schema for the versioned knowledge graph. Migrations are numbered
//! and applied in order on connection; each one is recorded in
//! `_migrations` so reruns are no-ops.

use sqlx::SqlitePool;

use crate::error::Result;

/// Current schema version
pub const CURRENT_VERSION: i32 = 3;

const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

/// Migration 1: versioned entities and relations
///
/// Every write produces a new row. The row with `is_current = 1` is the
/// live version; superseded rows keep the time they stopped being current.
const MIGRATION_V1: &str = r#"
    CREATE TABLE IF NOT EXISTS entities (
        row_id INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL,
        name TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        observations TEXT NOT NULL DEFAULT '[]',
        version INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        valid_from INTEGER,
        valid_to INTEGER,
        changed_by TEXT,
        is_current INTEGER NOT NULL DEFAULT 1 CHECK (is_current IN (0, 1)),
        superseded_at INTEGER
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_entities_current_name
        ON entities(name) WHERE is_current = 1;
    CREATE INDEX IF NOT EXISTS idx_entities_name_version ON entities(name, version);
    CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(entity_type);

    CREATE TABLE IF NOT EXISTS relations (
        row_id INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL,
        from_name TEXT NOT NULL,
        to_name TEXT NOT NULL,
        relation_type TEXT NOT NULL,
        strength REAL,
        confidence REAL,
        metadata TEXT,
        version INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        valid_from INTEGER,
        valid_to INTEGER,
        changed_by TEXT,
        is_current INTEGER NOT NULL DEFAULT 1 CHECK (is_current IN (0, 1)),
        superseded_at INTEGER
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_relations_current_key
        ON relations(from_name, to_name, relation_type) WHERE is_current = 1;
    CREATE INDEX IF NOT EXISTS idx_relations_from ON relations(from_name);
    CREATE INDEX IF NOT EXISTS idx_relations_to ON relations(to_name);
"#;

/// Migration 2: entity embeddings
const MIGRATION_V2: &str = r#"
    CREATE TABLE IF NOT EXISTS entity_embeddings (
        entity_name TEXT PRIMARY KEY NOT NULL,
        model TEXT NOT NULL,
        dimensions INTEGER NOT NULL,
        vector BLOB NOT NULL,
        last_updated INTEGER NOT NULL
    );
"#;

/// Migration 3: standalone vector index
const MIGRATION_V3: &str = r#"
    CREATE TABLE IF NOT EXISTS vector_index (
        id TEXT PRIMARY KEY NOT NULL,
        dimensions INTEGER NOT NULL,
        vector BLOB NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}',
        updated_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_vector_index_updated ON vector_index(updated_at);
"#;

const MIGRATIONS: &[(i32, &str, &str)] = &[
    (1, "Versioned entities and relations", MIGRATION_V1),
    (2, "Entity embeddings", MIGRATION_V2),
    (3, "Vector index", MIGRATION_V3),
];

/// SQL for the vector index table, also used when a vector store
/// initializes against a database that was never migrated
pub(crate) const VECTOR_INDEX_SCHEMA: &str = MIGRATION_V3;

async fn get_current_version(pool: &SqlitePool) -> Result<i32> {
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let row: Option<(Option<i32>,)> = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_optional(pool)
        .await?;

    Ok(row.and_then(|(v,)| v).unwrap_or(0))
}

async fn record_migration(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let current_version = get_current_version(pool).await?;

    tracing::info!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking database migrations"
    );

    if current_version >= CURRENT_VERSION {
        tracing::debug!("Database is up to date");
        return Ok(());
    }

    for &(version, description, sql) in MIGRATIONS {
        if current_version < version {
            tracing::info!(version, "Applying migration: {}", description);
            sqlx::raw_sql(sql).execute(pool).await?;
            record_migration(pool, version).await?;
        }
    }

    tracing::info!("Database migrations completed");
    Ok(())
}

/// Get migration status information
pub async fn migration_status(pool: &SqlitePool) -> Result<MigrationStatus> {
    let current_version = get_current_version(pool).await?;
    Ok(MigrationStatus {
        current_version,
        target_version: CURRENT_VERSION,
        needs_migration: current_version < CURRENT_VERSION,
    })
}

/// Migration status information
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub current_version: i32,
    pub target_version: i32,
    pub needs_migration: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool")
    }

    #[tokio::test]
    async fn test_run_migrations() {
        let pool = create_test_pool().await;

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, 0);
        assert!(status.needs_migration);

        run_migrations(&pool).await.unwrap();

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, CURRENT_VERSION);
        assert!(!status.needs_migration);
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let pool = create_test_pool().await;

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, CURRENT_VERSION);
    }

    #[tokio::test]
    async fn test_tables_created() {
        let pool = create_test_pool().await;
        run_migrations(&pool).await.unwrap();

        for table in ["entities", "relations", "entity_embeddings", "vector_index"] {
            let result: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&pool)
                .await
                .unwrap_or_else(|_| panic!("Table {} should exist", table));
            assert_eq!(result.0, 0, "Table {} should be empty", table);
        }
    }

    #[tokio::test]
    async fn test_only_one_current_version_per_name() {
        let pool = create_test_pool().await;
        run_migrations(&pool).await.unwrap();

        let insert = "INSERT INTO entities (id, name, entity_type, version, created_at, updated_at) \
                      VALUES ('x', 'alice', 'person', ?, 0, 0)";
        sqlx::query(insert).bind(1).execute(&pool).await.unwrap();
        let duplicate = sqlx::query(insert).bind(2).execute(&pool).await;

        assert!(duplicate.is_err());
    }
}

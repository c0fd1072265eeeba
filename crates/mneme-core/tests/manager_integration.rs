//! Knowledge Graph Manager Integration Tests
//!
//! These drive the manager and the tool router the way a transport would,
//! against managers built from configuration for both storage backends.

use std::sync::Arc;
use std::time::Duration;

use mneme_core::analytics::{FindPathsOptions, GraphStatisticsOptions, PathAlgorithm};
use mneme_core::config::{Config, StorageBackend};
use mneme_core::domain::knowledge::{Entity, Relation, RelationKey, now_millis};
use mneme_core::error::ErrorKind;
use mneme_core::manager::{AdvancedSearchOptions, KnowledgeGraphManager};
use mneme_core::storage::{EntityOutcome, ObservationAddition};
use mneme_core::tools::ToolRouter;
use mneme_core::vector::SearchMethod;
use serde_json::json;
use tempfile::TempDir;

fn test_config(dir: &TempDir, backend: StorageBackend) -> Config {
    let mut config = Config::default();
    config.storage.backend = backend;
    config.storage.file_path = dir.path().join("memory.json");
    config.storage.database_path = dir.path().join("mneme.db");
    config.embedding.dimensions = 32;
    config.embedding.tokens_per_interval = 1000;
    config.embedding.process_on_write = true;
    config
}

async fn manager_for(dir: &TempDir, backend: StorageBackend) -> KnowledgeGraphManager {
    KnowledgeGraphManager::from_config(&test_config(dir, backend))
        .await
        .unwrap()
}

async fn seed(manager: &KnowledgeGraphManager) {
    manager
        .create_entities(vec![
            Entity::new("alice", "person").with_observation("writes Rust"),
            Entity::new("bob", "person").with_observation("reviews code"),
            Entity::new("carol", "person"),
            Entity::new("mneme", "project").with_observation("knowledge graph"),
        ])
        .await
        .unwrap();
    manager
        .create_relations(vec![
            Relation::new("alice", "mneme", "works_on"),
            Relation::new("bob", "alice", "mentors"),
            Relation::new("carol", "bob", "knows"),
        ])
        .await
        .unwrap();
}

// ========== Write Semantics ==========

#[tokio::test]
async fn test_batch_results_follow_input_order() {
    let dir = TempDir::new().unwrap();
    let manager = manager_for(&dir, StorageBackend::File).await;

    let results = manager
        .create_entities(vec![
            Entity::new("alice", "person"),
            Entity::new("", "person"),
            Entity::new("alice", "person"),
            Entity::new("bob", "person"),
        ])
        .await
        .unwrap();

    let names: Vec<&str> = results.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["alice", "", "alice", "bob"]);
    assert_eq!(results[0].outcome, EntityOutcome::Created);
    assert!(matches!(results[1].outcome, EntityOutcome::Rejected { .. }));
    assert_eq!(results[2].outcome, EntityOutcome::Unchanged);
    assert_eq!(results[3].outcome, EntityOutcome::Created);
}

#[tokio::test]
async fn test_reads_see_writes_through_cache() {
    let dir = TempDir::new().unwrap();
    let manager = manager_for(&dir, StorageBackend::File).await;
    seed(&manager).await;

    assert_eq!(manager.read_graph().await.unwrap().entities.len(), 4);
    manager.read_graph().await.unwrap();
    assert!(manager.cache_stats().hits >= 1);

    manager.delete_entities(&["carol".to_string()]).await.unwrap();
    let graph = manager.read_graph().await.unwrap();
    assert_eq!(graph.entities.len(), 3);
    assert!(graph.relations.iter().all(|r| r.from != "carol" && r.to != "carol"));
}

#[tokio::test]
async fn test_file_backend_persists_across_managers() {
    let dir = TempDir::new().unwrap();
    {
        let manager = manager_for(&dir, StorageBackend::File).await;
        seed(&manager).await;
    }

    let manager = manager_for(&dir, StorageBackend::File).await;
    let graph = manager.read_graph().await.unwrap();
    assert_eq!(graph.entities.len(), 4);
    assert_eq!(graph.relations.len(), 3);

    // vectors are rebuilt from stored embeddings on startup
    let store = manager.vector_store().unwrap();
    assert_eq!(store.count().await.unwrap(), 4);
}

#[tokio::test]
async fn test_backfill_embeds_entities_written_without_processing() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir, StorageBackend::Sqlite);
    config.embedding.process_on_write = false;
    let manager = KnowledgeGraphManager::from_config(&config).await.unwrap();
    seed(&manager).await;

    let jobs = manager.embedding_jobs().unwrap();
    let report = jobs.process_jobs(10).await;
    assert_eq!(report.successful, 4);

    manager
        .create_entities(vec![Entity::new("dave", "person")])
        .await
        .unwrap();
    // the write queued a job; backfill sees no stored embedding either way
    assert_eq!(manager.schedule_missing_embeddings().await.unwrap(), 1);
    jobs.process_jobs(10).await;
    assert_eq!(manager.schedule_missing_embeddings().await.unwrap(), 0);
}

// ========== Search ==========

#[tokio::test]
async fn test_semantic_search_on_both_backends() {
    for backend in [StorageBackend::File, StorageBackend::Sqlite] {
        let dir = TempDir::new().unwrap();
        let manager = manager_for(&dir, backend).await;
        seed(&manager).await;

        let alice = manager
            .open_nodes(&["alice".to_string()])
            .await
            .unwrap()
            .entities
            .remove(0);
        let results = manager
            .semantic_search(&alice.embedding_text(), AdvancedSearchOptions::default())
            .await
            .unwrap();

        assert_eq!(results.search_method, SearchMethod::Vector, "{:?}", backend);
        assert_eq!(results.results[0].entity.name, "alice");
        assert!(results.results[0].similarity.unwrap() > 0.99);
        assert!(results.results[0].entity.embedding.is_none());
    }
}

#[tokio::test]
async fn test_keyword_search_pages_and_filters() {
    let dir = TempDir::new().unwrap();
    let manager = manager_for(&dir, StorageBackend::File).await;
    seed(&manager).await;

    let options = AdvancedSearchOptions::keyword_only()
        .with_entity_types(vec!["person".to_string()])
        .with_limit(2);
    let first = manager.advanced_search("person", options.clone()).await.unwrap();
    let second = manager
        .advanced_search("person", options.with_offset(2))
        .await
        .unwrap();

    assert_eq!(first.total, 3);
    assert_eq!(first.results.len(), 2);
    assert_eq!(second.results.len(), 1);
    assert_eq!(first.search_method, SearchMethod::Keyword);

    let mut seen: Vec<&str> = first.entity_names();
    seen.extend(second.entity_names());
    seen.sort();
    assert_eq!(seen, vec!["alice", "bob", "carol"]);
}

#[tokio::test]
async fn test_find_similar_excludes_the_entity_itself() {
    let dir = TempDir::new().unwrap();
    let manager = manager_for(&dir, StorageBackend::Sqlite).await;
    seed(&manager).await;

    let similar = manager
        .find_similar_entities("alice", Some(10), Some(-1.0))
        .await
        .unwrap();
    assert_eq!(similar.len(), 3);
    assert!(similar.iter().all(|hit| hit.entity.name != "alice"));

    let err = manager
        .find_similar_entities("ghost", None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ========== Analytics ==========

#[tokio::test]
async fn test_analytics_over_seeded_graph() {
    let dir = TempDir::new().unwrap();
    let manager = manager_for(&dir, StorageBackend::Sqlite).await;
    seed(&manager).await;

    let stats = manager
        .get_graph_statistics(GraphStatisticsOptions::default())
        .await
        .unwrap();
    assert_eq!(stats.total_entities, 4);
    assert_eq!(stats.total_relations, 3);
    assert_eq!(stats.entity_types.get("person"), Some(&3));
    assert!(stats.isolated_entities.is_empty());

    let options = FindPathsOptions {
        algorithm: PathAlgorithm::Bfs,
        ..FindPathsOptions::default()
    };
    let result = manager.find_paths("carol", "mneme", options).await.unwrap();
    assert_eq!(result.paths.len(), 1);
    assert_eq!(
        result.paths[0].entities,
        vec!["carol", "bob", "alice", "mneme"]
    );
    assert_eq!(result.paths[0].length, 3);

    let short = FindPathsOptions {
        max_depth: 2,
        ..FindPathsOptions::default()
    };
    let result = manager.find_paths("carol", "mneme", short).await.unwrap();
    assert!(result.paths.is_empty());
}

// ========== Temporal ==========

#[tokio::test]
async fn test_sqlite_keeps_history_and_point_in_time_views() {
    let dir = TempDir::new().unwrap();
    let manager = manager_for(&dir, StorageBackend::Sqlite).await;
    seed(&manager).await;

    manager
        .add_observations(vec![ObservationAddition {
            entity_name: "alice".into(),
            contents: vec!["likes graphs".into()],
        }])
        .await
        .unwrap();
    let history = manager.get_entity_history("alice").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].observations, vec!["writes Rust"]);
    assert_eq!(history[1].observations, vec!["writes Rust", "likes graphs"]);
    assert!(history[0].version < history[1].version);

    tokio::time::sleep(Duration::from_millis(5)).await;
    let before_delete = now_millis();
    tokio::time::sleep(Duration::from_millis(5)).await;
    manager.delete_entities(&["bob".to_string()]).await.unwrap();

    let now = manager.read_graph().await.unwrap();
    assert!(now.entity("bob").is_none());

    let then = manager.get_graph_at_time(before_delete).await.unwrap();
    assert!(then.entity("bob").is_some());
    assert!(then.relations.iter().any(|r| r.relation_type == "mentors"));

    // deleted entities keep their history
    assert!(!manager.get_entity_history("bob").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_relation_history_tracks_updates() {
    let dir = TempDir::new().unwrap();
    let manager = manager_for(&dir, StorageBackend::Sqlite).await;
    seed(&manager).await;

    manager
        .update_relation(Relation::new("alice", "mneme", "works_on").with_confidence(0.4))
        .await
        .unwrap();

    let key = RelationKey::new("alice", "mneme", "works_on");
    let history = manager.get_relation_history(&key).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].confidence, Some(0.4));
}

// ========== Tool Router ==========

#[tokio::test]
async fn test_tool_router_round_trip() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(manager_for(&dir, StorageBackend::File).await);
    let router = ToolRouter::new(Arc::clone(&manager));

    let created = router
        .dispatch(
            "create_entities",
            json!({"entities": [
                {"name": "alice", "entityType": "person", "observations": ["writes Rust"]},
                {"name": "mneme", "entityType": "project"}
            ]}),
        )
        .await
        .unwrap();
    assert_eq!(created.as_array().unwrap().len(), 2);

    router
        .dispatch(
            "create_relations",
            json!({"relations": [
                {"from": "alice", "to": "mneme", "relationType": "works_on", "strength": 0.8}
            ]}),
        )
        .await
        .unwrap();

    let relation = router
        .dispatch(
            "get_relation",
            json!({"from": "alice", "to": "mneme", "relationType": "works_on"}),
        )
        .await
        .unwrap();
    assert_eq!(relation["strength"], json!(0.8));

    let found = router
        .dispatch("search_nodes", json!({"query": "RUST"}))
        .await
        .unwrap();
    assert_eq!(found["entities"][0]["name"], "alice");

    let stats = router
        .dispatch("get_graph_statistics", json!({}))
        .await
        .unwrap();
    assert_eq!(stats["totalEntities"], 2);
    assert_eq!(stats["totalRelations"], 1);
}

#[tokio::test]
async fn test_tool_router_validates_before_storage() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(manager_for(&dir, StorageBackend::File).await);
    let router = ToolRouter::new(Arc::clone(&manager));

    let err = router
        .dispatch("search_nodes", json!({"limit": 5}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = router
        .dispatch(
            "get_node_analytics",
            json!({"entityName": "alice", "neighborDepth": 9}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = router
        .dispatch(
            "find_paths",
            json!({"fromEntity": "a", "toEntity": "b", "algorithm": "teleport"}),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    // nothing was read from storage
    assert_eq!(manager.cache_stats().misses, 0);
}

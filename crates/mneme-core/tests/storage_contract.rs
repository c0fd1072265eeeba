//! Storage Contract Tests
//!
//! Both backends must agree on the observable behavior of every
//! `StorageProvider` operation. Each check runs against the JSON file
//! backend and an in-memory SQLite database.

use std::sync::Arc;

use mneme_core::domain::knowledge::{Entity, Relation, RelationKey, SearchOptions};
use mneme_core::error::{Error, ErrorKind};
use mneme_core::storage::{
    Database, DatabaseConfig, EntityOutcome, FileStorageProvider, ObservationAddition, ObservationDeletion,
    RelationOutcome, SqliteStorageProvider, StorageProvider,
};
use tempfile::TempDir;

// ========== Fixtures ==========

struct Backend {
    storage: Arc<dyn StorageProvider>,
    _dir: Option<TempDir>,
    _db: Option<Database>,
}

fn file_backend() -> Backend {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(FileStorageProvider::new(dir.path().join("graph.json")));
    Backend {
        storage,
        _dir: Some(dir),
        _db: None,
    }
}

async fn sqlite_backend() -> Backend {
    let db = Database::in_memory().await.unwrap();
    let storage = Arc::new(SqliteStorageProvider::from_database(&db));
    Backend {
        storage,
        _dir: None,
        _db: Some(db),
    }
}

async fn seed(storage: &dyn StorageProvider) {
    storage
        .create_entities(vec![
            Entity::new("alice", "person").with_observation("writes Rust"),
            Entity::new("bob", "person").with_observation("reviews code"),
            Entity::new("mneme", "project"),
        ])
        .await
        .unwrap();
    storage
        .create_relations(vec![
            Relation::new("alice", "mneme", "works_on"),
            Relation::new("bob", "alice", "mentors"),
        ])
        .await
        .unwrap();
}

fn names(graph: &mneme_core::domain::knowledge::KnowledgeGraph) -> Vec<&str> {
    let mut names: Vec<&str> = graph.entities.iter().map(|e| e.name.as_str()).collect();
    names.sort();
    names
}

macro_rules! contract_tests {
    ($($check:ident),* $(,)?) => {
        mod file {
            $(
                #[tokio::test]
                async fn $check() {
                    let backend = super::file_backend();
                    super::$check(backend.storage.as_ref()).await;
                }
            )*
        }

        mod sqlite {
            $(
                #[tokio::test]
                async fn $check() {
                    let backend = super::sqlite_backend().await;
                    super::$check(backend.storage.as_ref()).await;
                }
            )*
        }
    };
}

contract_tests!(
    empty_store_reads_as_empty_graph,
    create_is_idempotent_per_name,
    create_merges_new_observations,
    open_nodes_skips_unknown_names,
    add_observations_requires_entity,
    add_observations_skips_duplicates,
    delete_observations_ignores_missing,
    relation_endpoints_must_exist,
    duplicate_relation_is_reported,
    update_relation_requires_existing,
    update_relation_replaces_attributes,
    deletes_are_idempotent,
    deleting_entity_removes_its_relations,
    search_is_case_insensitive,
    search_respects_type_filter_and_limit,
    embeddings_are_not_returned_from_reads,
);

// ========== Reads ==========

async fn empty_store_reads_as_empty_graph(storage: &dyn StorageProvider) {
    let graph = storage.load_graph().await.unwrap();
    assert!(graph.is_empty());
    assert!(storage
        .get_relation(&RelationKey::new("a", "b", "r"))
        .await
        .unwrap()
        .is_none());
}

async fn open_nodes_skips_unknown_names(storage: &dyn StorageProvider) {
    seed(storage).await;

    let graph = storage
        .open_nodes(&["alice".to_string(), "ghost".to_string(), "mneme".to_string()])
        .await
        .unwrap();
    assert_eq!(names(&graph), vec!["alice", "mneme"]);
    // only relations with both endpoints in the result
    assert_eq!(graph.relations.len(), 1);
    assert_eq!(graph.relations[0].relation_type, "works_on");
}

async fn search_is_case_insensitive(storage: &dyn StorageProvider) {
    seed(storage).await;

    let graph = storage
        .search_nodes("RUST", &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(names(&graph), vec!["alice"]);

    let graph = storage
        .search_nodes("Person", &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(names(&graph), vec!["alice", "bob"]);
    assert_eq!(graph.relations.len(), 1);
}

async fn search_respects_type_filter_and_limit(storage: &dyn StorageProvider) {
    seed(storage).await;

    let options = SearchOptions::default().with_entity_types(vec!["project".to_string()]);
    let graph = storage.search_nodes("m", &options).await.unwrap();
    assert_eq!(names(&graph), vec!["mneme"]);

    let options = SearchOptions::default().with_limit(1);
    let graph = storage.search_nodes("person", &options).await.unwrap();
    assert_eq!(graph.entities.len(), 1);
}

async fn embeddings_are_not_returned_from_reads(storage: &dyn StorageProvider) {
    seed(storage).await;
    if let Some(vectors) = storage.as_vector_capable() {
        let embedding =
            mneme_core::domain::knowledge::EntityEmbedding::new(vec![0.1, 0.2, 0.3], "test-model");
        vectors
            .update_entity_embedding("alice", &embedding)
            .await
            .unwrap();
        let stored = vectors.get_entity_embedding("alice").await.unwrap().unwrap();
        assert_eq!(stored.dimensions(), 3);
    }

    let graph = storage.load_graph().await.unwrap();
    assert!(graph.entities.iter().all(|e| e.embedding.is_none()));
}

// ========== Entity Writes ==========

async fn create_is_idempotent_per_name(storage: &dyn StorageProvider) {
    let first = storage
        .create_entities(vec![Entity::new("alice", "person").with_observation("writes Rust")])
        .await
        .unwrap();
    assert_eq!(first[0].outcome, EntityOutcome::Created);

    let second = storage
        .create_entities(vec![Entity::new("alice", "person").with_observation("writes Rust")])
        .await
        .unwrap();
    assert_eq!(second[0].outcome, EntityOutcome::Unchanged);

    let graph = storage.open_nodes(&["alice".to_string()]).await.unwrap();
    assert_eq!(graph.entities.len(), 1);
    assert_eq!(graph.entities[0].observations, vec!["writes Rust"]);
}

async fn create_merges_new_observations(storage: &dyn StorageProvider) {
    storage
        .create_entities(vec![Entity::new("alice", "person").with_observation("writes Rust")])
        .await
        .unwrap();

    let results = storage
        .create_entities(vec![
            Entity::new("alice", "person")
                .with_observation("writes Rust")
                .with_observation("drinks tea"),
            Entity::new("bob", "person"),
        ])
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].name, "alice");
    assert_eq!(results[0].outcome, EntityOutcome::Updated);
    assert_eq!(results[1].name, "bob");
    assert_eq!(results[1].outcome, EntityOutcome::Created);

    let graph = storage.open_nodes(&["alice".to_string()]).await.unwrap();
    assert_eq!(
        graph.entities[0].observations,
        vec!["writes Rust", "drinks tea"]
    );
}

async fn add_observations_requires_entity(storage: &dyn StorageProvider) {
    seed(storage).await;

    let err = storage
        .add_observations(vec![ObservationAddition {
            entity_name: "ghost".into(),
            contents: vec!["boo".into()],
        }])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EntityNotFound(ref name) if name == "ghost"));
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

async fn add_observations_skips_duplicates(storage: &dyn StorageProvider) {
    seed(storage).await;

    let results = storage
        .add_observations(vec![ObservationAddition {
            entity_name: "alice".into(),
            contents: vec!["writes Rust".into(), "likes graphs".into()],
        }])
        .await
        .unwrap();
    assert_eq!(results[0].added_observations, vec!["likes graphs"]);

    let graph = storage.open_nodes(&["alice".to_string()]).await.unwrap();
    assert_eq!(
        graph.entities[0].observations,
        vec!["writes Rust", "likes graphs"]
    );
}

async fn delete_observations_ignores_missing(storage: &dyn StorageProvider) {
    seed(storage).await;

    storage
        .delete_observations(vec![
            ObservationDeletion {
                entity_name: "alice".into(),
                observations: vec!["writes Rust".into(), "never said".into()],
            },
            ObservationDeletion {
                entity_name: "ghost".into(),
                observations: vec!["anything".into()],
            },
        ])
        .await
        .unwrap();

    let graph = storage.open_nodes(&["alice".to_string()]).await.unwrap();
    assert!(graph.entities[0].observations.is_empty());
}

// ========== Relation Writes ==========

async fn relation_endpoints_must_exist(storage: &dyn StorageProvider) {
    seed(storage).await;

    let results = storage
        .create_relations(vec![
            Relation::new("alice", "ghost", "haunts"),
            Relation::new("bob", "mneme", "works_on"),
        ])
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(matches!(results[0].outcome, RelationOutcome::Rejected { .. }));
    assert_eq!(results[1].outcome, RelationOutcome::Created);

    let key = RelationKey::new("alice", "ghost", "haunts");
    assert!(storage.get_relation(&key).await.unwrap().is_none());
}

async fn duplicate_relation_is_reported(storage: &dyn StorageProvider) {
    seed(storage).await;

    let results = storage
        .create_relations(vec![Relation::new("alice", "mneme", "works_on")])
        .await
        .unwrap();
    assert_eq!(results[0].outcome, RelationOutcome::AlreadyExists);

    let graph = storage.load_graph().await.unwrap();
    assert_eq!(graph.relations.len(), 2);
}

async fn update_relation_requires_existing(storage: &dyn StorageProvider) {
    seed(storage).await;

    let err = storage
        .update_relation(Relation::new("mneme", "alice", "works_on"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RelationNotFound { .. }));
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

async fn update_relation_replaces_attributes(storage: &dyn StorageProvider) {
    seed(storage).await;
    let key = RelationKey::new("alice", "mneme", "works_on");
    let before = storage.get_relation(&key).await.unwrap().unwrap();

    let updated = storage
        .update_relation(
            Relation::new("alice", "mneme", "works_on")
                .with_strength(0.9)
                .with_confidence(0.5),
        )
        .await
        .unwrap();
    assert_eq!(updated.strength, Some(0.9));
    assert_eq!(updated.confidence, Some(0.5));
    assert!(updated.version > before.version);

    let stored = storage.get_relation(&key).await.unwrap().unwrap();
    assert_eq!(stored.strength, Some(0.9));
}

// ========== Deletes ==========

async fn deletes_are_idempotent(storage: &dyn StorageProvider) {
    seed(storage).await;
    let key = RelationKey::new("bob", "alice", "mentors");

    storage.delete_relations(&[key.clone()]).await.unwrap();
    storage.delete_relations(&[key.clone()]).await.unwrap();
    assert!(storage.get_relation(&key).await.unwrap().is_none());

    storage.delete_entities(&["mneme".to_string()]).await.unwrap();
    storage
        .delete_entities(&["mneme".to_string(), "ghost".to_string()])
        .await
        .unwrap();
    let graph = storage.load_graph().await.unwrap();
    assert_eq!(names(&graph), vec!["alice", "bob"]);
}

async fn deleting_entity_removes_its_relations(storage: &dyn StorageProvider) {
    seed(storage).await;

    storage.delete_entities(&["alice".to_string()]).await.unwrap();

    let graph = storage.load_graph().await.unwrap();
    assert_eq!(names(&graph), vec!["bob", "mneme"]);
    assert!(graph.relations.is_empty());

    // recreating the name does not resurrect old relations
    storage
        .create_entities(vec![Entity::new("alice", "person")])
        .await
        .unwrap();
    let graph = storage.load_graph().await.unwrap();
    assert!(graph.relations.is_empty());
}

// ========== Concurrency ==========

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_file_database_serializes_concurrent_writers() {
    let dir = TempDir::new().unwrap();
    let db = Database::new(DatabaseConfig::with_path(dir.path().join("graph.db")))
        .await
        .unwrap();
    let storage = Arc::new(SqliteStorageProvider::from_database(&db));

    for round in 0..20 {
        let name = format!("n{round}");
        let writers: Vec<_> = (0..8)
            .map(|i| {
                let storage = storage.clone();
                let entity = Entity::new(name.clone(), "node").with_observation(format!("o{i}"));
                tokio::spawn(async move { storage.create_entities(vec![entity]).await })
            })
            .collect();

        let mut created = 0;
        for writer in writers {
            let results = writer.await.unwrap().unwrap();
            match results[0].outcome {
                EntityOutcome::Created => created += 1,
                EntityOutcome::Updated => {}
                ref other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(created, 1);

        let graph = storage.open_nodes(&[name]).await.unwrap();
        assert_eq!(graph.entities[0].observations.len(), 8);
    }

    // relation writers share the same lock
    let relations: Vec<_> = (1..20)
        .map(|round| {
            let storage = storage.clone();
            let relation = Relation::new("n0", format!("n{round}"), "links");
            tokio::spawn(async move { storage.create_relations(vec![relation]).await })
        })
        .collect();
    for writer in relations {
        let results = writer.await.unwrap().unwrap();
        assert_eq!(results[0].outcome, RelationOutcome::Created);
    }
    assert_eq!(storage.load_graph().await.unwrap().relations.len(), 19);
}

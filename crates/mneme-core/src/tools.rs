//! Tool dispatcher
//!
//! Maps tool-style calls (`name` plus a JSON object of arguments) onto
//! [`KnowledgeGraphManager`] operations. Arguments are parsed and range
//! checked here, before the manager or storage is touched; any problem is a
//! `Validation` error.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use crate::analytics::{
    FindPathsOptions, GraphStatisticsOptions, MAX_NEIGHBOR_DEPTH, MAX_PATH_DEPTH, MAX_PATHS,
    NodeAnalyticsOptions, PathAlgorithm,
};
use crate::domain::knowledge::{
    DecayOptions, Entity, Relation, RelationKey, SearchOptions, validate_entity_payload,
    validate_relation_payload,
};
use crate::error::{Error, Result};
use crate::manager::{AdvancedSearchOptions, KnowledgeGraphManager, fill_slots};
use crate::storage::{
    EntityOutcome, EntityWriteResult, ObservationAddition, ObservationDeletion, RelationOutcome,
    RelationWriteResult,
};

/// Every tool [`ToolRouter::dispatch`] understands
pub const TOOL_NAMES: &[&str] = &[
    "create_entities",
    "create_relations",
    "add_observations",
    "delete_entities",
    "delete_observations",
    "delete_relations",
    "get_relation",
    "update_relation",
    "read_graph",
    "search_nodes",
    "open_nodes",
    "semantic_search",
    "advanced_search",
    "get_graph_statistics",
    "get_node_analytics",
    "find_paths",
    "find_similar_entities",
    "get_entity_embedding",
    "get_entity_history",
    "get_relation_history",
    "get_graph_at_time",
    "get_decayed_graph",
];

// ========== Parameters ==========

#[derive(Deserialize)]
struct EntitiesParams {
    entities: Vec<Value>,
}

#[derive(Deserialize)]
struct RelationsParams {
    relations: Vec<Value>,
}

#[derive(Deserialize)]
struct ObservationsParams {
    observations: Vec<ObservationAddition>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityNamesParams {
    entity_names: Vec<String>,
}

#[derive(Deserialize)]
struct DeletionsParams {
    deletions: Vec<ObservationDeletion>,
}

#[derive(Deserialize)]
struct RelationKeysParams {
    relations: Vec<RelationKey>,
}

#[derive(Deserialize)]
struct UpdateRelationParams {
    relation: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchNodesParams {
    query: String,
    limit: Option<usize>,
    #[serde(default)]
    entity_types: Vec<String>,
}

#[derive(Deserialize)]
struct NamesParams {
    names: Vec<String>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchFilters {
    #[serde(default)]
    entity_types: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchParams {
    query: String,
    semantic_search: Option<bool>,
    #[serde(default)]
    hybrid_search: bool,
    min_similarity: Option<f32>,
    #[serde(default)]
    entity_types: Vec<String>,
    #[serde(default)]
    filters: SearchFilters,
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
}

impl SearchParams {
    fn into_options(self) -> AdvancedSearchOptions {
        let mut entity_types = self.entity_types;
        for t in self.filters.entity_types {
            if !entity_types.contains(&t) {
                entity_types.push(t);
            }
        }
        AdvancedSearchOptions {
            semantic_search: self.semantic_search.unwrap_or(true),
            hybrid_search: self.hybrid_search,
            min_similarity: self.min_similarity,
            entity_types,
            limit: self.limit,
            offset: self.offset,
            ..AdvancedSearchOptions::default()
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityNameParams {
    entity_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeAnalyticsParams {
    entity_name: String,
    #[serde(flatten)]
    options: NodeAnalyticsOptions,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FindPathsParams {
    from_entity: String,
    to_entity: String,
    algorithm: Option<String>,
    timeout_ms: Option<u64>,
    #[serde(flatten)]
    options: FindPathsOptions,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimilarParams {
    entity_name: String,
    limit: Option<usize>,
    min_similarity: Option<f32>,
}

#[derive(Deserialize)]
struct TimestampParams {
    timestamp: i64,
}

/// Routes tool calls to a shared manager
#[derive(Clone)]
pub struct ToolRouter {
    manager: Arc<KnowledgeGraphManager>,
}

impl ToolRouter {
    pub fn new(manager: Arc<KnowledgeGraphManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<KnowledgeGraphManager> {
        &self.manager
    }

    pub fn tool_names() -> &'static [&'static str] {
        TOOL_NAMES
    }

    /// Run tool `name` with `args`.
    ///
    /// Unknown tools fail with `NotFound`; malformed arguments with
    /// `Validation`. `null` arguments count as an empty object.
    pub async fn dispatch(&self, name: &str, args: Value) -> Result<Value> {
        let args = match args {
            Value::Null => Value::Object(Default::default()),
            Value::Object(map) => Value::Object(map),
            _ => {
                return Err(Error::Validation(format!(
                    "arguments for '{}' must be an object",
                    name
                )));
            }
        };
        debug!(tool = %name, "Dispatching tool call");

        let m = &self.manager;
        match name {
            "create_entities" => {
                let params: EntitiesParams = parse(name, args)?;
                to_json(self.create_entities(params.entities).await?)
            }
            "create_relations" => {
                let params: RelationsParams = parse(name, args)?;
                to_json(self.create_relations(params.relations).await?)
            }
            "add_observations" => {
                let params: ObservationsParams = parse(name, args)?;
                to_json(m.add_observations(params.observations).await?)
            }
            "delete_entities" => {
                let params: EntityNamesParams = parse(name, args)?;
                m.delete_entities(&params.entity_names).await?;
                Ok(json!({ "deleted": params.entity_names }))
            }
            "delete_observations" => {
                let params: DeletionsParams = parse(name, args)?;
                let count = params.deletions.len();
                m.delete_observations(params.deletions).await?;
                Ok(json!({ "entitiesUpdated": count }))
            }
            "delete_relations" => {
                let params: RelationKeysParams = parse(name, args)?;
                m.delete_relations(&params.relations).await?;
                Ok(json!({ "deleted": params.relations.len() }))
            }
            "get_relation" => {
                let key: RelationKey = parse(name, args)?;
                to_json(m.get_relation(&key).await?)
            }
            "update_relation" => {
                let params: UpdateRelationParams = parse(name, args)?;
                validate_relation_payload(&params.relation)?;
                let relation: Relation = parse(name, params.relation)?;
                to_json(m.update_relation(relation).await?)
            }
            "read_graph" => to_json(m.read_graph().await?),
            "search_nodes" => {
                let params: SearchNodesParams = parse(name, args)?;
                check_limit(params.limit)?;
                let options = SearchOptions {
                    limit: params.limit,
                    entity_types: params.entity_types,
                };
                to_json(m.search_nodes(&params.query, &options).await?)
            }
            "open_nodes" => {
                let params: NamesParams = parse(name, args)?;
                to_json(m.open_nodes(&params.names).await?)
            }
            "semantic_search" => {
                let params: SearchParams = parse(name, args)?;
                let query = params.query.clone();
                to_json(m.semantic_search(&query, params.into_options()).await?)
            }
            "advanced_search" => {
                let params: SearchParams = parse(name, args)?;
                let query = params.query.clone();
                to_json(m.advanced_search(&query, params.into_options()).await?)
            }
            "get_graph_statistics" => {
                let options: GraphStatisticsOptions = parse(name, args)?;
                to_json(m.get_graph_statistics(options).await?)
            }
            "get_node_analytics" => {
                let params: NodeAnalyticsParams = parse(name, args)?;
                check_range(
                    "neighborDepth",
                    params.options.neighbor_depth,
                    1,
                    MAX_NEIGHBOR_DEPTH,
                )?;
                to_json(
                    m.get_node_analytics(&params.entity_name, params.options)
                        .await?,
                )
            }
            "find_paths" => {
                let params: FindPathsParams = parse(name, args)?;
                let mut options = params.options;
                if let Some(algorithm) = params.algorithm {
                    options.algorithm = algorithm.parse::<PathAlgorithm>()?;
                }
                options.timeout = params.timeout_ms.map(Duration::from_millis);
                check_range("maxDepth", options.max_depth, 1, MAX_PATH_DEPTH)?;
                check_range("maxPaths", options.max_paths, 1, MAX_PATHS)?;
                to_json(
                    m.find_paths(&params.from_entity, &params.to_entity, options)
                        .await?,
                )
            }
            "find_similar_entities" => {
                let params: SimilarParams = parse(name, args)?;
                check_limit(params.limit)?;
                to_json(
                    m.find_similar_entities(
                        &params.entity_name,
                        params.limit,
                        params.min_similarity,
                    )
                    .await?,
                )
            }
            "get_entity_embedding" => {
                let params: EntityNameParams = parse(name, args)?;
                to_json(m.get_entity_embedding(&params.entity_name).await?)
            }
            "get_entity_history" => {
                let params: EntityNameParams = parse(name, args)?;
                to_json(m.get_entity_history(&params.entity_name).await?)
            }
            "get_relation_history" => {
                let key: RelationKey = parse(name, args)?;
                to_json(m.get_relation_history(&key).await?)
            }
            "get_graph_at_time" => {
                let params: TimestampParams = parse(name, args)?;
                to_json(m.get_graph_at_time(params.timestamp).await?)
            }
            "get_decayed_graph" => {
                let options: DecayOptions = parse(name, args)?;
                to_json(m.get_decayed_graph(options).await?)
            }
            other => Err(Error::NotFound(format!("Tool '{}'", other))),
        }
    }

    /// Payloads failing shape checks are rejected in their slot; the rest go
    /// to the manager, which applies its own per-item validation.
    async fn create_entities(&self, payloads: Vec<Value>) -> Result<Vec<EntityWriteResult>> {
        let mut slots = Vec::with_capacity(payloads.len());
        let mut entities = Vec::new();
        for payload in payloads {
            let name = payload_str(&payload, "name");
            match validate_entity_payload(&payload)
                .and_then(|()| parse::<Entity>("entity", payload))
            {
                Ok(entity) => {
                    slots.push(None);
                    entities.push(entity);
                }
                Err(err) => slots.push(Some(EntityWriteResult::new(
                    name,
                    EntityOutcome::Rejected {
                        reason: err.to_string(),
                    },
                ))),
            }
        }

        let written = if entities.is_empty() {
            Vec::new()
        } else {
            self.manager.create_entities(entities).await?
        };
        Ok(fill_slots(slots, written))
    }

    async fn create_relations(&self, payloads: Vec<Value>) -> Result<Vec<RelationWriteResult>> {
        let mut slots = Vec::with_capacity(payloads.len());
        let mut relations = Vec::new();
        for payload in payloads {
            let key = RelationKey::new(
                payload_str(&payload, "from"),
                payload_str(&payload, "to"),
                payload_str(&payload, "relationType"),
            );
            match validate_relation_payload(&payload)
                .and_then(|()| parse::<Relation>("relation", payload))
            {
                Ok(relation) => {
                    slots.push(None);
                    relations.push(relation);
                }
                Err(err) => slots.push(Some(RelationWriteResult::new(
                    key,
                    RelationOutcome::Rejected {
                        reason: err.to_string(),
                    },
                ))),
            }
        }

        let written = if relations.is_empty() {
            Vec::new()
        } else {
            self.manager.create_relations(relations).await?
        };
        Ok(fill_slots(slots, written))
    }
}

fn parse<T: DeserializeOwned>(context: &str, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| Error::Validation(format!("invalid arguments for '{}': {}", context, e)))
}

fn to_json<T: serde::Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn payload_str(payload: &Value, field: &str) -> String {
    payload
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn check_range(field: &str, value: usize, min: usize, max: usize) -> Result<()> {
    if !(min..=max).contains(&value) {
        return Err(Error::Validation(format!(
            "{} must be between {} and {}, got {}",
            field, min, max, value
        )));
    }
    Ok(())
}

fn check_limit(limit: Option<usize>) -> Result<()> {
    if limit == Some(0) {
        return Err(Error::Validation("limit must be at least 1".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::storage::FileStorageProvider;
    use tempfile::TempDir;

    fn router() -> (ToolRouter, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(FileStorageProvider::new(dir.path().join("graph.json")));
        let manager = Arc::new(KnowledgeGraphManager::new(storage));
        (ToolRouter::new(manager), dir)
    }

    async fn seed(router: &ToolRouter) {
        router
            .dispatch(
                "create_entities",
                json!({ "entities": [
                    { "name": "a", "entityType": "t", "observations": [] },
                    { "name": "b", "entityType": "t", "observations": [] },
                    { "name": "c", "entityType": "t", "observations": ["end"] },
                ]}),
            )
            .await
            .unwrap();
        router
            .dispatch(
                "create_relations",
                json!({ "relations": [
                    { "from": "a", "to": "b", "relationType": "KNOWS" },
                    { "from": "b", "to": "c", "relationType": "KNOWS" },
                ]}),
            )
            .await
            .unwrap();
    }

    #[test]
    fn test_tool_names_are_unique() {
        let mut names = ToolRouter::tool_names().to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), TOOL_NAMES.len());
        assert_eq!(names.len(), 22);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let (router, _dir) = router();
        let err = router.dispatch("drop_database", Value::Null).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_malformed_entity_rejected_in_place() {
        let (router, _dir) = router();

        let result = router
            .dispatch(
                "create_entities",
                json!({ "entities": [
                    { "name": "a", "entityType": "t", "observations": [] },
                    { "name": "b", "entityType": "t", "observations": "not a list" },
                ]}),
            )
            .await
            .unwrap();

        assert_eq!(result[0]["status"], "created");
        assert_eq!(result[1]["status"], "rejected");
        assert_eq!(result[1]["name"], "b");
    }

    #[tokio::test]
    async fn test_find_paths_via_tool() {
        let (router, _dir) = router();
        seed(&router).await;

        let result = router
            .dispatch(
                "find_paths",
                json!({ "fromEntity": "a", "toEntity": "c", "algorithm": "bfs", "maxDepth": 5 }),
            )
            .await
            .unwrap();
        assert_eq!(result["paths"].as_array().unwrap().len(), 1);
        assert_eq!(result["paths"][0]["length"], 2);

        let shallow = router
            .dispatch(
                "find_paths",
                json!({ "fromEntity": "a", "toEntity": "c", "maxDepth": 1 }),
            )
            .await
            .unwrap();
        assert!(shallow["paths"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_range_checks() {
        let (router, _dir) = router();
        seed(&router).await;

        for (tool, args) in [
            ("find_paths", json!({ "fromEntity": "a", "toEntity": "c", "maxDepth": 11 })),
            ("find_paths", json!({ "fromEntity": "a", "toEntity": "c", "maxPaths": 0 })),
            ("find_paths", json!({ "fromEntity": "a", "toEntity": "c", "algorithm": "teleport" })),
            ("get_node_analytics", json!({ "entityName": "a", "neighborDepth": 4 })),
            ("search_nodes", json!({ "query": "a", "limit": 0 })),
            ("search_nodes", json!({ "limit": 3 })),
            ("get_graph_at_time", json!({ "timestamp": "yesterday" })),
        ] {
            let err = router.dispatch(tool, args).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{}", tool);
        }
    }

    #[tokio::test]
    async fn test_get_and_update_relation() {
        let (router, _dir) = router();
        seed(&router).await;

        let key = json!({ "from": "a", "to": "b", "relationType": "KNOWS" });
        let relation = router.dispatch("get_relation", key.clone()).await.unwrap();
        assert_eq!(relation["from"], "a");

        let updated = router
            .dispatch(
                "update_relation",
                json!({ "relation": { "from": "a", "to": "b", "relationType": "KNOWS", "strength": 0.9 } }),
            )
            .await
            .unwrap();
        assert_eq!(updated["strength"], 0.9);

        let missing = router
            .dispatch(
                "get_relation",
                json!({ "from": "c", "to": "a", "relationType": "KNOWS" }),
            )
            .await
            .unwrap();
        assert!(missing.is_null());
    }

    #[tokio::test]
    async fn test_advanced_search_filters() {
        let (router, _dir) = router();
        seed(&router).await;

        let result = router
            .dispatch(
                "advanced_search",
                json!({ "query": "end", "semanticSearch": false, "filters": { "entityTypes": ["t"] } }),
            )
            .await
            .unwrap();
        assert_eq!(result["searchMethod"], "keyword");
        assert_eq!(result["results"][0]["entity"]["name"], "c");
    }

    #[tokio::test]
    async fn test_delete_entities_twice_is_noop() {
        let (router, _dir) = router();
        seed(&router).await;

        let args = json!({ "entityNames": ["a"] });
        router.dispatch("delete_entities", args.clone()).await.unwrap();
        router.dispatch("delete_entities", args).await.unwrap();

        let graph = router.dispatch("read_graph", Value::Null).await.unwrap();
        assert_eq!(graph["entities"].as_array().unwrap().len(), 2);
        assert_eq!(graph["relations"].as_array().unwrap().len(), 1);
    }
}

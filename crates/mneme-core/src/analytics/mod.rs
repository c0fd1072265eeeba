//! Graph analytics
//!
//! Everything here is computed on demand from a [`KnowledgeGraph`] and keeps
//! no state between calls. The work is synchronous and CPU bound; async
//! callers should run it on a blocking thread.

mod node;
mod paths;
mod snapshot;
mod statistics;

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use node::{
    MAX_NEIGHBOR_DEPTH, NeighborInfo, NodeAnalytics, NodeAnalyticsOptions, NodeCentrality,
    NodeClustering, NodePathMetrics,
};
pub use paths::{
    EntityFrequency, FindPathsOptions, GraphPath, MAX_PATH_DEPTH, MAX_PATHS, PathAlgorithm,
    PathAnalysis, PathEdge, PathResult,
};
pub use statistics::{
    AdvancedStatistics, ClusteringStatistics, ComponentSummary, ConnectedEntity, GraphStatistics,
    GraphStatisticsOptions,
};

use crate::config::AnalyticsConfig;
use crate::domain::knowledge::KnowledgeGraph;
use crate::error::Result;
use snapshot::GraphSnapshot;

/// Statistics, per-entity analytics and path finding
#[derive(Debug, Clone, Default)]
pub struct GraphAnalyticsEngine {
    default_path_timeout: Option<Duration>,
}

impl GraphAnalyticsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &AnalyticsConfig) -> Self {
        Self {
            default_path_timeout: config.path_timeout(),
        }
    }

    /// Applied to path searches that set no timeout of their own
    pub fn with_path_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_path_timeout = timeout;
        self
    }

    pub fn graph_statistics(
        &self,
        graph: &KnowledgeGraph,
        options: &GraphStatisticsOptions,
    ) -> GraphStatistics {
        let snapshot = GraphSnapshot::from_graph(graph);
        let stats = statistics::compute(&snapshot, options);
        debug!(
            entities = stats.total_entities,
            relations = stats.total_relations,
            "Graph statistics computed"
        );
        stats
    }

    /// Fails with `EntityNotFound` for an unknown entity and `Validation`
    /// for out-of-range options.
    pub fn node_analytics(
        &self,
        graph: &KnowledgeGraph,
        entity_name: &str,
        options: &NodeAnalyticsOptions,
    ) -> Result<NodeAnalytics> {
        options.validate()?;
        node::analyse(&GraphSnapshot::from_graph(graph), entity_name, options)
    }

    /// Fails with `Validation` for out-of-range options or a missing
    /// endpoint. No path within the limits is an empty result.
    pub fn find_paths(
        &self,
        graph: &KnowledgeGraph,
        from: &str,
        to: &str,
        options: &FindPathsOptions,
    ) -> Result<PathResult> {
        self.run_find_paths(graph, from, to, options, None)
    }

    /// Like [`find_paths`](Self::find_paths), stopping early once `cancel` fires
    pub fn find_paths_with_cancel(
        &self,
        graph: &KnowledgeGraph,
        from: &str,
        to: &str,
        options: &FindPathsOptions,
        cancel: &CancellationToken,
    ) -> Result<PathResult> {
        self.run_find_paths(graph, from, to, options, Some(cancel))
    }

    fn run_find_paths(
        &self,
        graph: &KnowledgeGraph,
        from: &str,
        to: &str,
        options: &FindPathsOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<PathResult> {
        options.validate()?;
        let mut options = options.clone();
        if options.timeout.is_none() {
            options.timeout = self.default_path_timeout;
        }

        let snapshot = GraphSnapshot::from_graph(graph);
        let result = paths::find_paths(&snapshot, from, to, &options, cancel)?;
        debug!(
            from = %from,
            to = %to,
            algorithm = options.algorithm.as_str(),
            paths = result.paths.len(),
            timed_out = result.timed_out,
            "Path search finished"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::knowledge::{Entity, Relation};

    #[test]
    fn test_engine_applies_default_timeout() {
        let graph = KnowledgeGraph::new(
            vec![Entity::new("a", "t"), Entity::new("b", "t")],
            vec![Relation::new("a", "b", "r")],
        );
        let engine = GraphAnalyticsEngine::new().with_path_timeout(Some(Duration::ZERO));

        let result = engine
            .find_paths(&graph, "a", "b", &FindPathsOptions::default())
            .unwrap();
        assert!(result.timed_out);

        let unlimited = GraphAnalyticsEngine::new()
            .find_paths(&graph, "a", "b", &FindPathsOptions::default())
            .unwrap();
        assert_eq!(unlimited.paths.len(), 1);
    }

    #[test]
    fn test_statistics_on_empty_graph() {
        let stats = GraphAnalyticsEngine::new().graph_statistics(
            &KnowledgeGraph::default(),
            &GraphStatisticsOptions::default(),
        );
        assert_eq!(stats.total_entities, 0);
        assert_eq!(stats.total_relations, 0);
        assert_eq!(stats.graph_density, 0.0);
    }
}

//! Analytics scoped to a single entity

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::snapshot::GraphSnapshot;
use super::statistics::{local_clustering, neighbour_links};
use crate::error::{Error, Result};

pub const MAX_NEIGHBOR_DEPTH: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeAnalyticsOptions {
    pub include_neighbors: bool,
    /// Hops to expand, 1 to 3
    pub neighbor_depth: usize,
    pub include_centrality: bool,
    pub include_path_metrics: bool,
    pub include_clustering: bool,
    pub max_neighbors: usize,
}

impl Default for NodeAnalyticsOptions {
    fn default() -> Self {
        Self {
            include_neighbors: true,
            neighbor_depth: 1,
            include_centrality: true,
            include_path_metrics: false,
            include_clustering: false,
            max_neighbors: 50,
        }
    }
}

impl NodeAnalyticsOptions {
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_NEIGHBOR_DEPTH).contains(&self.neighbor_depth) {
            return Err(Error::Validation(format!(
                "neighborDepth must be between 1 and {}, got {}",
                MAX_NEIGHBOR_DEPTH, self.neighbor_depth
            )));
        }
        if self.max_neighbors == 0 {
            return Err(Error::Validation("maxNeighbors must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NeighborInfo {
    pub name: String,
    pub entity_type: String,
    /// Hops from the analysed entity, ignoring direction
    pub distance: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCentrality {
    pub degree: usize,
    pub in_degree: usize,
    pub out_degree: usize,
    /// Distinct neighbours over `n - 1`
    pub degree_centrality: f64,
    pub closeness_centrality: f64,
    pub betweenness_centrality: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePathMetrics {
    pub eccentricity: usize,
    pub average_distance: f64,
    pub reachable_entities: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeClustering {
    pub clustering_coefficient: f64,
    pub triangles: usize,
    pub neighbor_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAnalytics {
    pub name: String,
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neighbors: Option<Vec<NeighborInfo>>,
    /// More neighbours existed than `maxNeighbors`
    #[serde(default)]
    pub neighbors_truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub centrality: Option<NodeCentrality>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_metrics: Option<NodePathMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clustering: Option<NodeClustering>,
}

pub(crate) fn analyse(
    snapshot: &GraphSnapshot,
    name: &str,
    options: &NodeAnalyticsOptions,
) -> Result<NodeAnalytics> {
    options.validate()?;
    let node = snapshot
        .index_of(name)
        .ok_or_else(|| Error::EntityNotFound(name.to_string()))?;

    let mut analytics = NodeAnalytics {
        name: name.to_string(),
        entity_type: snapshot.entity_type(node).to_string(),
        neighbors: None,
        neighbors_truncated: false,
        centrality: None,
        path_metrics: None,
        clustering: None,
    };

    if options.include_neighbors {
        let (neighbors, truncated) =
            neighborhood(snapshot, node, options.neighbor_depth, options.max_neighbors);
        analytics.neighbors = Some(neighbors);
        analytics.neighbors_truncated = truncated;
    }

    let distances = (options.include_centrality || options.include_path_metrics)
        .then(|| snapshot.bfs_distances(node, false));

    if options.include_centrality
        && let Some(distances) = &distances
    {
        analytics.centrality = Some(centrality(snapshot, node, distances));
    }

    if options.include_path_metrics
        && let Some(distances) = &distances
    {
        analytics.path_metrics = Some(path_metrics(distances, node));
    }

    if options.include_clustering {
        analytics.clustering = Some(NodeClustering {
            clustering_coefficient: local_clustering(snapshot, node),
            triangles: neighbour_links(snapshot, node),
            neighbor_count: snapshot.neighbours(node).len(),
        });
    }

    Ok(analytics)
}

/// Entities within `depth` hops, nearest first then by name
fn neighborhood(
    snapshot: &GraphSnapshot,
    node: usize,
    depth: usize,
    max: usize,
) -> (Vec<NeighborInfo>, bool) {
    let mut distance = vec![None; snapshot.node_count()];
    distance[node] = Some(0usize);
    let mut queue = VecDeque::from([node]);
    let mut found = Vec::new();

    while let Some(current) = queue.pop_front() {
        let d = distance[current].unwrap_or(0);
        if d >= depth {
            continue;
        }
        for &next in snapshot.neighbours(current) {
            if distance[next].is_none() {
                distance[next] = Some(d + 1);
                found.push((d + 1, next));
                queue.push_back(next);
            }
        }
    }

    found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| snapshot.name(a.1).cmp(snapshot.name(b.1))));
    let truncated = found.len() > max;
    found.truncate(max);

    let neighbors = found
        .into_iter()
        .map(|(distance, v)| NeighborInfo {
            name: snapshot.name(v).to_string(),
            entity_type: snapshot.entity_type(v).to_string(),
            distance,
        })
        .collect();
    (neighbors, truncated)
}

fn centrality(snapshot: &GraphSnapshot, node: usize, distances: &[Option<usize>]) -> NodeCentrality {
    let n = snapshot.node_count();
    let others = n.saturating_sub(1);

    let degree_centrality = if others > 0 {
        snapshot.neighbours(node).len() as f64 / others as f64
    } else {
        0.0
    };

    // Wasserman-Faust closeness, scaled by the reachable share
    let (reachable, total) = distances
        .iter()
        .flatten()
        .filter(|&&d| d > 0)
        .fold((0usize, 0usize), |(count, sum), &d| (count + 1, sum + d));
    let closeness_centrality = if total > 0 && others > 0 {
        (reachable as f64 / total as f64) * (reachable as f64 / others as f64)
    } else {
        0.0
    };

    NodeCentrality {
        degree: snapshot.degree(node),
        in_degree: snapshot.in_degree(node),
        out_degree: snapshot.out_degree(node),
        degree_centrality,
        closeness_centrality,
        betweenness_centrality: betweenness(snapshot, node),
    }
}

/// Brandes accumulation for one target node over undirected shortest paths,
/// normalized to `[0, 1]`.
fn betweenness(snapshot: &GraphSnapshot, target: usize) -> f64 {
    let n = snapshot.node_count();
    if n < 3 {
        return 0.0;
    }

    let mut score = 0.0;
    for source in 0..n {
        if source == target {
            continue;
        }
        let mut stack = Vec::with_capacity(n);
        let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut sigma = vec![0.0f64; n];
        let mut distance: Vec<Option<usize>> = vec![None; n];
        sigma[source] = 1.0;
        distance[source] = Some(0);

        let mut queue = VecDeque::from([source]);
        while let Some(v) = queue.pop_front() {
            stack.push(v);
            let dv = distance[v].unwrap_or(0);
            for &w in snapshot.neighbours(v) {
                if distance[w].is_none() {
                    distance[w] = Some(dv + 1);
                    queue.push_back(w);
                }
                if distance[w] == Some(dv + 1) {
                    sigma[w] += sigma[v];
                    predecessors[w].push(v);
                }
            }
        }

        let mut delta = vec![0.0f64; n];
        while let Some(w) = stack.pop() {
            for &v in &predecessors[w] {
                delta[v] += sigma[v] / sigma[w] * (1.0 + delta[w]);
            }
        }
        score += delta[target];
    }

    // every unordered pair was counted from both ends
    score / ((n - 1) * (n - 2)) as f64
}

fn path_metrics(distances: &[Option<usize>], node: usize) -> NodePathMetrics {
    let reached: Vec<usize> = distances
        .iter()
        .enumerate()
        .filter(|(v, _)| *v != node)
        .filter_map(|(_, d)| *d)
        .collect();

    NodePathMetrics {
        eccentricity: reached.iter().copied().max().unwrap_or(0),
        average_distance: if reached.is_empty() {
            0.0
        } else {
            reached.iter().sum::<usize>() as f64 / reached.len() as f64
        },
        reachable_entities: reached.len(),
    }
}

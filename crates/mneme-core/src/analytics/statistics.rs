//! Whole-graph statistics

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use super::snapshot::GraphSnapshot;

const TOP_CONNECTED_LIMIT: usize = 10;

/// Optional blocks of [`GraphStatistics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GraphStatisticsOptions {
    pub include_advanced: bool,
    pub include_clustering: bool,
    pub include_components: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedEntity {
    pub name: String,
    pub entity_type: String,
    pub connections: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedStatistics {
    pub strongly_connected_components: usize,
    pub weakly_connected_components: usize,
    /// Mean directed hop distance over reachable ordered pairs
    pub average_path_length: f64,
    pub diameter: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusteringStatistics {
    /// Transitivity: closed triplets over all connected triplets
    pub global_clustering_coefficient: f64,
    pub average_clustering_coefficient: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSummary {
    pub size: usize,
    pub entities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphStatistics {
    pub total_entities: usize,
    pub total_relations: usize,
    pub entity_types: BTreeMap<String, usize>,
    pub relation_types: BTreeMap<String, usize>,
    /// `|R| / (|V| * (|V| - 1))`, 0 below two entities
    pub graph_density: f64,
    pub average_connections: f64,
    pub top_connected_entities: Vec<ConnectedEntity>,
    pub isolated_entities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advanced: Option<AdvancedStatistics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clustering: Option<ClusteringStatistics>,
    /// Weakly connected components, largest first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<ComponentSummary>>,
}

pub(crate) fn compute(snapshot: &GraphSnapshot, options: &GraphStatisticsOptions) -> GraphStatistics {
    let n = snapshot.node_count();
    let r = snapshot.edge_count();

    let mut entity_types = BTreeMap::new();
    for node in 0..n {
        *entity_types
            .entry(snapshot.entity_type(node).to_string())
            .or_insert(0) += 1;
    }
    let mut relation_types = BTreeMap::new();
    for edge in snapshot.edges() {
        *relation_types.entry(edge.relation_type.clone()).or_insert(0) += 1;
    }

    let graph_density = if n > 1 {
        r as f64 / (n as f64 * (n as f64 - 1.0))
    } else {
        0.0
    };
    let average_connections = if n > 0 {
        2.0 * r as f64 / n as f64
    } else {
        0.0
    };

    let mut by_degree: Vec<usize> = (0..n).filter(|&v| snapshot.degree(v) > 0).collect();
    by_degree.sort_by(|&a, &b| {
        snapshot
            .degree(b)
            .cmp(&snapshot.degree(a))
            .then_with(|| snapshot.name(a).cmp(snapshot.name(b)))
    });
    let top_connected_entities = by_degree
        .into_iter()
        .take(TOP_CONNECTED_LIMIT)
        .map(|v| ConnectedEntity {
            name: snapshot.name(v).to_string(),
            entity_type: snapshot.entity_type(v).to_string(),
            connections: snapshot.degree(v),
        })
        .collect();

    let mut isolated_entities: Vec<String> = (0..n)
        .filter(|&v| snapshot.degree(v) == 0)
        .map(|v| snapshot.name(v).to_string())
        .collect();
    isolated_entities.sort();

    let weak = options
        .include_advanced
        .then(|| weakly_connected_components(snapshot))
        .or_else(|| {
            options
                .include_components
                .then(|| weakly_connected_components(snapshot))
        });

    let advanced = options.include_advanced.then(|| {
        let (average_path_length, diameter) = path_lengths(snapshot);
        AdvancedStatistics {
            strongly_connected_components: strongly_connected_components(snapshot).len(),
            weakly_connected_components: weak.as_ref().map_or(0, Vec::len),
            average_path_length,
            diameter,
        }
    });

    let clustering = options.include_clustering.then(|| {
        let (global, average) = clustering_coefficients(snapshot);
        ClusteringStatistics {
            global_clustering_coefficient: global,
            average_clustering_coefficient: average,
        }
    });

    let components = if options.include_components {
        weak.map(|groups| {
            groups
                .into_iter()
                .map(|members| {
                    let mut entities: Vec<String> = members
                        .into_iter()
                        .map(|v| snapshot.name(v).to_string())
                        .collect();
                    entities.sort();
                    ComponentSummary {
                        size: entities.len(),
                        entities,
                    }
                })
                .collect()
        })
    } else {
        None
    };

    GraphStatistics {
        total_entities: n,
        total_relations: r,
        entity_types,
        relation_types,
        graph_density,
        average_connections,
        top_connected_entities,
        isolated_entities,
        advanced,
        clustering,
        components,
    }
}

/// Components ignoring direction, largest first
pub(crate) fn weakly_connected_components(snapshot: &GraphSnapshot) -> Vec<Vec<usize>> {
    let n = snapshot.node_count();
    let mut seen = vec![false; n];
    let mut components = Vec::new();

    for start in 0..n {
        if seen[start] {
            continue;
        }
        seen[start] = true;
        let mut members = vec![start];
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            for &next in snapshot.neighbours(current) {
                if !seen[next] {
                    seen[next] = true;
                    members.push(next);
                    queue.push_back(next);
                }
            }
        }
        components.push(members);
    }

    components.sort_by(|a, b| b.len().cmp(&a.len()));
    components
}

/// Kosaraju's algorithm with explicit stacks
pub(crate) fn strongly_connected_components(snapshot: &GraphSnapshot) -> Vec<Vec<usize>> {
    let n = snapshot.node_count();
    let successors: Vec<Vec<usize>> = (0..n).map(|v| snapshot.successors(v)).collect();
    let predecessors: Vec<Vec<usize>> = (0..n).map(|v| snapshot.predecessors(v)).collect();

    // first pass: finish order on the forward graph
    let mut visited = vec![false; n];
    let mut order = Vec::with_capacity(n);
    for start in 0..n {
        if visited[start] {
            continue;
        }
        visited[start] = true;
        let mut stack = vec![(start, 0usize)];
        while let Some((node, next_child)) = stack.pop() {
            if let Some(&child) = successors[node].get(next_child) {
                stack.push((node, next_child + 1));
                if !visited[child] {
                    visited[child] = true;
                    stack.push((child, 0));
                }
            } else {
                order.push(node);
            }
        }
    }

    // second pass: reverse graph in reverse finish order
    let mut assigned = vec![false; n];
    let mut components = Vec::new();
    for &start in order.iter().rev() {
        if assigned[start] {
            continue;
        }
        assigned[start] = true;
        let mut members = Vec::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            members.push(node);
            for &prev in &predecessors[node] {
                if !assigned[prev] {
                    assigned[prev] = true;
                    stack.push(prev);
                }
            }
        }
        components.push(members);
    }
    components
}

/// Mean and maximum directed hop distance over reachable pairs
fn path_lengths(snapshot: &GraphSnapshot) -> (f64, usize) {
    let mut total = 0usize;
    let mut pairs = 0usize;
    let mut diameter = 0usize;

    for source in 0..snapshot.node_count() {
        for distance in snapshot.bfs_distances(source, true).into_iter().flatten() {
            if distance > 0 {
                total += distance;
                pairs += 1;
                diameter = diameter.max(distance);
            }
        }
    }

    let average = if pairs > 0 {
        total as f64 / pairs as f64
    } else {
        0.0
    };
    (average, diameter)
}

/// Edges among the neighbours of `node`, ignoring direction
pub(crate) fn neighbour_links(snapshot: &GraphSnapshot, node: usize) -> usize {
    let neighbours = snapshot.neighbours(node);
    let mut links = 0;
    for (i, &a) in neighbours.iter().enumerate() {
        for &b in &neighbours[i + 1..] {
            if snapshot.neighbours(a).binary_search(&b).is_ok() {
                links += 1;
            }
        }
    }
    links
}

/// Local coefficient: 0 for fewer than two neighbours
pub(crate) fn local_clustering(snapshot: &GraphSnapshot, node: usize) -> f64 {
    let k = snapshot.neighbours(node).len();
    if k < 2 {
        return 0.0;
    }
    2.0 * neighbour_links(snapshot, node) as f64 / (k * (k - 1)) as f64
}

/// (global transitivity, average local coefficient)
fn clustering_coefficients(snapshot: &GraphSnapshot) -> (f64, f64) {
    let n = snapshot.node_count();
    if n == 0 {
        return (0.0, 0.0);
    }

    let mut closed = 0usize;
    let mut triplets = 0usize;
    let mut local_sum = 0.0;

    for node in 0..n {
        let k = snapshot.neighbours(node).len();
        if k < 2 {
            continue;
        }
        let links = neighbour_links(snapshot, node);
        closed += links;
        triplets += k * (k - 1) / 2;
        local_sum += 2.0 * links as f64 / (k * (k - 1)) as f64;
    }

    let global = if triplets > 0 {
        closed as f64 / triplets as f64
    } else {
        0.0
    };
    (global, local_sum / n as f64)
}

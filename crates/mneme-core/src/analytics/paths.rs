//! Path finding between two entities
//!
//! Traversable edges are fixed before the search starts: the allow and deny
//! lists on relation type are applied, and with `bidirectional` every
//! relation may also be walked against its direction. Paths are simple
//! (no entity repeats) and never longer than `max_depth` hops.
//!
//! Weighted searches cost an edge `1 / strength`, or 1.0 without a usable
//! strength. A* estimates the remaining cost as the hop distance to the
//! target times the cheapest traversable edge, which never overestimates.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::snapshot::GraphSnapshot;
use crate::error::{Error, Result};

pub const MAX_PATH_DEPTH: usize = 10;
pub const MAX_PATHS: usize = 100;
const MOST_COMMON_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathAlgorithm {
    /// Fewest hops
    #[default]
    Bfs,
    /// First path found depth first
    Dfs,
    Dijkstra,
    #[serde(rename = "astar")]
    AStar,
}

impl PathAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bfs => "bfs",
            Self::Dfs => "dfs",
            Self::Dijkstra => "dijkstra",
            Self::AStar => "astar",
        }
    }

    pub fn is_weighted(&self) -> bool {
        matches!(self, Self::Dijkstra | Self::AStar)
    }
}

impl std::str::FromStr for PathAlgorithm {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "bfs" => Ok(Self::Bfs),
            "dfs" => Ok(Self::Dfs),
            "dijkstra" => Ok(Self::Dijkstra),
            "astar" | "a*" => Ok(Self::AStar),
            other => Err(Error::Validation(format!(
                "unknown path algorithm '{}'; expected bfs, dfs, dijkstra or astar",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FindPathsOptions {
    /// Hop limit, 1 to 10
    pub max_depth: usize,
    pub find_all_paths: bool,
    /// 1 to 100; only used with `find_all_paths`
    pub max_paths: usize,
    /// Only these relation types are traversable
    pub relation_types: Option<Vec<String>>,
    /// These relation types are never traversed
    pub exclude_relation_types: Option<Vec<String>>,
    pub bidirectional: bool,
    pub include_weights: bool,
    pub algorithm: PathAlgorithm,
    pub include_analysis: bool,
    /// Give up and report `timed_out` after this long
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl Default for FindPathsOptions {
    fn default() -> Self {
        Self {
            max_depth: 5,
            find_all_paths: false,
            max_paths: 10,
            relation_types: None,
            exclude_relation_types: None,
            bidirectional: true,
            include_weights: false,
            algorithm: PathAlgorithm::Bfs,
            include_analysis: false,
            timeout: None,
        }
    }
}

impl FindPathsOptions {
    pub fn with_algorithm(mut self, algorithm: PathAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn all_paths(mut self, max_paths: usize) -> Self {
        self.find_all_paths = true;
        self.max_paths = max_paths;
        self
    }

    pub fn weighted(mut self) -> Self {
        self.include_weights = true;
        self
    }

    pub fn directed(mut self) -> Self {
        self.bidirectional = false;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_PATH_DEPTH).contains(&self.max_depth) {
            return Err(Error::Validation(format!(
                "maxDepth must be between 1 and {}, got {}",
                MAX_PATH_DEPTH, self.max_depth
            )));
        }
        if !(1..=MAX_PATHS).contains(&self.max_paths) {
            return Err(Error::Validation(format!(
                "maxPaths must be between 1 and {}, got {}",
                MAX_PATHS, self.max_paths
            )));
        }
        if self.algorithm.is_weighted() && !self.include_weights {
            return Err(Error::Validation(format!(
                "algorithm '{}' requires includeWeights",
                self.algorithm.as_str()
            )));
        }
        Ok(())
    }

    fn traversable(&self, relation_type: &str) -> bool {
        let allowed = self
            .relation_types
            .as_ref()
            .is_none_or(|types| types.iter().any(|t| t == relation_type));
        let excluded = self
            .exclude_relation_types
            .as_ref()
            .is_some_and(|types| types.iter().any(|t| t == relation_type));
        allowed && !excluded
    }
}

/// One traversed relation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathEdge {
    pub from: String,
    pub to: String,
    pub relation_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strength: Option<f64>,
    /// Walked from `to` towards `from`
    pub reversed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphPath {
    /// Entities in walk order, both endpoints included
    pub entities: Vec<String>,
    pub relations: Vec<PathEdge>,
    /// Hop count
    pub length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_weight: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityFrequency {
    pub name: String,
    pub occurrences: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathAnalysis {
    pub shortest_length: usize,
    pub longest_length: usize,
    pub average_length: f64,
    pub relation_type_frequency: BTreeMap<String, usize>,
    /// Intermediate entities by number of paths through them
    pub most_common_entities: Vec<EntityFrequency>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathResult {
    pub from: String,
    pub to: String,
    pub algorithm: PathAlgorithm,
    pub paths: Vec<GraphPath>,
    /// The search stopped early; `paths` holds what was found by then
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<PathAnalysis>,
}

/// A move from one node to the next along edge `edge`
#[derive(Debug, Clone, Copy)]
struct Step {
    edge: usize,
    next: usize,
    reversed: bool,
}

/// Deadline and cancellation, polled during the search
struct Budget<'a> {
    deadline: Option<Instant>,
    cancel: Option<&'a CancellationToken>,
    exhausted: bool,
}

impl Budget<'_> {
    fn spent(&mut self) -> bool {
        if !self.exhausted {
            self.exhausted = self.deadline.is_some_and(|d| Instant::now() >= d)
                || self.cancel.is_some_and(|c| c.is_cancelled());
        }
        self.exhausted
    }
}

struct Search<'a> {
    snapshot: &'a GraphSnapshot,
    options: &'a FindPathsOptions,
    steps: Vec<Vec<Step>>,
    budget: Budget<'a>,
}

pub(crate) fn find_paths(
    snapshot: &GraphSnapshot,
    from: &str,
    to: &str,
    options: &FindPathsOptions,
    cancel: Option<&CancellationToken>,
) -> Result<PathResult> {
    options.validate()?;
    let source = snapshot
        .index_of(from)
        .ok_or_else(|| Error::Validation(format!("source entity '{}' does not exist", from)))?;
    let target = snapshot
        .index_of(to)
        .ok_or_else(|| Error::Validation(format!("target entity '{}' does not exist", to)))?;

    let mut search = Search {
        snapshot,
        options,
        steps: traversal_steps(snapshot, options),
        budget: Budget {
            deadline: options.timeout.map(|t| Instant::now() + t),
            cancel,
            exhausted: false,
        },
    };

    let walks = if source == target {
        vec![Vec::new()]
    } else {
        match (options.algorithm, options.find_all_paths) {
            (PathAlgorithm::Bfs, false) => {
                search.shortest_by_hops(source, target).into_iter().collect()
            }
            (PathAlgorithm::Bfs, true) => search.all_breadth_first(source, target),
            (PathAlgorithm::Dfs, all) => {
                let limit = if all { options.max_paths } else { 1 };
                search.depth_first(source, target, limit)
            }
            (PathAlgorithm::Dijkstra, false) => {
                search.cheapest(source, target, false).into_iter().collect()
            }
            (PathAlgorithm::AStar, false) => {
                search.cheapest(source, target, true).into_iter().collect()
            }
            (_, true) => search.cheapest_k(source, target),
        }
    };

    let paths: Vec<GraphPath> = walks
        .into_iter()
        .map(|walk| search.materialize(source, &walk))
        .collect();
    let analysis = (options.include_analysis && !paths.is_empty()).then(|| analyse(&paths));

    Ok(PathResult {
        from: from.to_string(),
        to: to.to_string(),
        algorithm: options.algorithm,
        paths,
        timed_out: search.budget.exhausted,
        analysis,
    })
}

fn traversal_steps(snapshot: &GraphSnapshot, options: &FindPathsOptions) -> Vec<Vec<Step>> {
    let mut steps = vec![Vec::new(); snapshot.node_count()];
    for (id, edge) in snapshot.edges().iter().enumerate() {
        if !options.traversable(&edge.relation_type) {
            continue;
        }
        steps[edge.from].push(Step {
            edge: id,
            next: edge.to,
            reversed: false,
        });
        if options.bidirectional && edge.from != edge.to {
            steps[edge.to].push(Step {
                edge: id,
                next: edge.from,
                reversed: true,
            });
        }
    }
    steps
}

/// Min-heap entry ordered by priority, then discovery order
#[derive(Debug)]
struct Queued {
    priority: f64,
    cost: f64,
    seq: u64,
    state: usize,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .total_cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl Search<'_> {
    fn walk_cost(&self, walk: &[Step]) -> f64 {
        walk.iter().map(|s| self.snapshot.edge(s.edge).cost()).sum()
    }

    /// Parent-map BFS; one shortest walk by hop count
    fn shortest_by_hops(&mut self, source: usize, target: usize) -> Option<Vec<Step>> {
        let mut parent: HashMap<usize, (usize, Step)> = HashMap::new();
        let mut depth = vec![usize::MAX; self.snapshot.node_count()];
        let mut queue = VecDeque::from([source]);
        depth[source] = 0;

        while let Some(current) = queue.pop_front() {
            if self.budget.spent() {
                return None;
            }
            if depth[current] >= self.options.max_depth {
                continue;
            }
            for &step in &self.steps[current] {
                if depth[step.next] != usize::MAX {
                    continue;
                }
                depth[step.next] = depth[current] + 1;
                parent.insert(step.next, (current, step));
                if step.next == target {
                    return Some(unwind(&parent, source, target));
                }
                queue.push_back(step.next);
            }
        }
        None
    }

    /// Simple walks in nondecreasing length, up to `max_paths`
    fn all_breadth_first(&mut self, source: usize, target: usize) -> Vec<Vec<Step>> {
        let mut found = Vec::new();
        let mut queue: VecDeque<(usize, Vec<Step>)> = VecDeque::from([(source, Vec::new())]);

        while let Some((node, walk)) = queue.pop_front() {
            if found.len() >= self.options.max_paths || self.budget.spent() {
                break;
            }
            if walk.len() >= self.options.max_depth {
                continue;
            }
            for &step in &self.steps[node] {
                if step.next == source || walk.iter().any(|s| s.next == step.next) {
                    continue;
                }
                let mut extended = walk.clone();
                extended.push(step);
                if step.next == target {
                    found.push(extended);
                    if found.len() >= self.options.max_paths {
                        break;
                    }
                } else {
                    queue.push_back((step.next, extended));
                }
            }
        }
        found
    }

    /// Depth-first enumeration of simple walks, stopping after `limit`
    fn depth_first(&mut self, source: usize, target: usize, limit: usize) -> Vec<Vec<Step>> {
        let mut found = Vec::new();
        let mut on_path = vec![false; self.snapshot.node_count()];
        on_path[source] = true;
        let mut walk: Vec<Step> = Vec::new();
        // (node, index of next step to try)
        let mut stack = vec![(source, 0usize)];

        while let Some(&(node, index)) = stack.last() {
            if found.len() >= limit || self.budget.spent() {
                break;
            }
            let Some(&step) = self.steps[node].get(index) else {
                stack.pop();
                if let Some(last) = walk.pop() {
                    on_path[last.next] = false;
                }
                continue;
            };
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }

            if on_path[step.next] {
                continue;
            }
            if step.next == target {
                let mut complete = walk.clone();
                complete.push(step);
                found.push(complete);
                continue;
            }
            if walk.len() + 1 < self.options.max_depth {
                on_path[step.next] = true;
                walk.push(step);
                stack.push((step.next, 0));
            }
        }
        found
    }

    /// Lowest-cost walk within the hop limit (Dijkstra, or A* with `guided`)
    fn cheapest(&mut self, source: usize, target: usize, guided: bool) -> Option<Vec<Step>> {
        let layers = self.options.max_depth + 1;
        let state = |node: usize, hops: usize| node * layers + hops;
        let bound = self.hops_to(target);
        bound[source]?;

        // admissible even when some strength exceeds 1
        let min_cost = self
            .steps
            .iter()
            .flatten()
            .map(|s| self.snapshot.edge(s.edge).cost())
            .fold(f64::INFINITY, f64::min);
        let estimate = |remaining: usize| {
            if guided {
                remaining as f64 * min_cost
            } else {
                0.0
            }
        };

        let mut best = vec![f64::INFINITY; self.snapshot.node_count() * layers];
        let mut parent: HashMap<usize, (usize, Step)> = HashMap::new();
        let mut heap = BinaryHeap::new();
        let mut seq = 0u64;

        let start = state(source, 0);
        best[start] = 0.0;
        heap.push(Queued {
            priority: estimate(bound[source].unwrap_or(0)),
            cost: 0.0,
            seq,
            state: start,
        });

        while let Some(Queued { cost, state: current, .. }) = heap.pop() {
            if self.budget.spent() {
                return None;
            }
            if cost > best[current] {
                continue;
            }
            let (node, hops) = (current / layers, current % layers);
            if node == target {
                return Some(unwind(&parent, start, current));
            }
            if hops >= self.options.max_depth {
                continue;
            }
            for &step in &self.steps[node] {
                let Some(remaining) = bound[step.next] else {
                    continue;
                };
                if hops + 1 + remaining > self.options.max_depth {
                    continue;
                }
                let next_cost = cost + self.snapshot.edge(step.edge).cost();
                let next = state(step.next, hops + 1);
                if next_cost < best[next] {
                    best[next] = next_cost;
                    parent.insert(next, (current, step));
                    seq += 1;
                    heap.push(Queued {
                        priority: next_cost + estimate(remaining),
                        cost: next_cost,
                        seq,
                        state: next,
                    });
                }
            }
        }
        None
    }

    /// Hop distance from each node to `target` over traversable steps.
    /// Prunes states that cannot arrive within the hop limit.
    fn hops_to(&self, target: usize) -> Vec<Option<usize>> {
        let n = self.snapshot.node_count();
        let mut incoming: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (node, steps) in self.steps.iter().enumerate() {
            for step in steps {
                incoming[step.next].push(node);
            }
        }

        let mut distance = vec![None; n];
        distance[target] = Some(0);
        let mut queue = VecDeque::from([target]);
        while let Some(current) = queue.pop_front() {
            let d = distance[current].unwrap_or(0);
            for &prev in &incoming[current] {
                if distance[prev].is_none() {
                    distance[prev] = Some(d + 1);
                    queue.push_back(prev);
                }
            }
        }
        distance
    }

    /// Every simple walk within the hop limit, cheapest `max_paths` kept
    fn cheapest_k(&mut self, source: usize, target: usize) -> Vec<Vec<Step>> {
        let mut walks = self.depth_first(source, target, usize::MAX);
        walks.sort_by(|a, b| {
            self.walk_cost(a)
                .total_cmp(&self.walk_cost(b))
                .then_with(|| a.len().cmp(&b.len()))
        });
        walks.truncate(self.options.max_paths);
        walks
    }

    fn materialize(&self, source: usize, walk: &[Step]) -> GraphPath {
        let snapshot = self.snapshot;
        let mut entities = vec![snapshot.name(source).to_string()];
        let mut relations = Vec::with_capacity(walk.len());

        for step in walk {
            let edge = snapshot.edge(step.edge);
            entities.push(snapshot.name(step.next).to_string());
            relations.push(PathEdge {
                from: snapshot.name(edge.from).to_string(),
                to: snapshot.name(edge.to).to_string(),
                relation_type: edge.relation_type.clone(),
                strength: edge.strength,
                reversed: step.reversed,
            });
        }

        GraphPath {
            entities,
            relations,
            length: walk.len(),
            total_weight: self.options.include_weights.then(|| self.walk_cost(walk)),
        }
    }
}

fn unwind(parent: &HashMap<usize, (usize, Step)>, source: usize, target: usize) -> Vec<Step> {
    let mut walk = Vec::new();
    let mut current = target;
    while current != source {
        let Some(&(previous, step)) = parent.get(&current) else {
            break;
        };
        walk.push(step);
        current = previous;
    }
    walk.reverse();
    walk
}

fn analyse(paths: &[GraphPath]) -> PathAnalysis {
    let lengths: Vec<usize> = paths.iter().map(|p| p.length).collect();
    let mut relation_type_frequency = BTreeMap::new();
    let mut through: HashMap<&str, usize> = HashMap::new();

    for path in paths {
        for relation in &path.relations {
            *relation_type_frequency
                .entry(relation.relation_type.clone())
                .or_insert(0) += 1;
        }
        if path.entities.len() > 2 {
            for name in &path.entities[1..path.entities.len() - 1] {
                *through.entry(name.as_str()).or_insert(0) += 1;
            }
        }
    }

    let mut most_common_entities: Vec<EntityFrequency> = through
        .into_iter()
        .map(|(name, occurrences)| EntityFrequency {
            name: name.to_string(),
            occurrences,
        })
        .collect();
    most_common_entities.sort_by(|a, b| b.occurrences.cmp(&a.occurrences).then_with(|| a.name.cmp(&b.name)));
    most_common_entities.truncate(MOST_COMMON_LIMIT);

    PathAnalysis {
        shortest_length: lengths.iter().copied().min().unwrap_or(0),
        longest_length: lengths.iter().copied().max().unwrap_or(0),
        average_length: lengths.iter().sum::<usize>() as f64 / lengths.len().max(1) as f64,
        relation_type_frequency,
        most_common_entities,
    }
}

//! Dense in-memory view of a knowledge graph for analytics

use std::collections::{HashMap, VecDeque};

use crate::domain::knowledge::{KnowledgeGraph, edge_cost};

/// One relation between indexed entities
#[derive(Debug, Clone)]
pub(crate) struct Edge {
    pub from: usize,
    pub to: usize,
    pub relation_type: String,
    pub strength: Option<f64>,
}

impl Edge {
    pub fn cost(&self) -> f64 {
        edge_cost(self.strength)
    }
}

/// Entities become indices `0..n`; relations become edges between them.
///
/// Relations pointing at entities missing from the graph are dropped.
#[derive(Debug, Default)]
pub(crate) struct GraphSnapshot {
    names: Vec<String>,
    types: Vec<String>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    out_edges: Vec<Vec<usize>>,
    in_edges: Vec<Vec<usize>>,
    /// Distinct neighbours ignoring direction, sorted, without self loops
    undirected: Vec<Vec<usize>>,
}

impl GraphSnapshot {
    pub fn from_graph(graph: &KnowledgeGraph) -> Self {
        let mut snapshot = Self::default();

        for entity in &graph.entities {
            if snapshot.index.contains_key(&entity.name) {
                continue;
            }
            snapshot
                .index
                .insert(entity.name.clone(), snapshot.names.len());
            snapshot.names.push(entity.name.clone());
            snapshot.types.push(entity.entity_type.clone());
        }

        let n = snapshot.names.len();
        snapshot.out_edges = vec![Vec::new(); n];
        snapshot.in_edges = vec![Vec::new(); n];
        snapshot.undirected = vec![Vec::new(); n];

        for relation in &graph.relations {
            let (Some(&from), Some(&to)) = (
                snapshot.index.get(&relation.from),
                snapshot.index.get(&relation.to),
            ) else {
                continue;
            };
            let id = snapshot.edges.len();
            snapshot.edges.push(Edge {
                from,
                to,
                relation_type: relation.relation_type.clone(),
                strength: relation.strength,
            });
            snapshot.out_edges[from].push(id);
            snapshot.in_edges[to].push(id);
            if from != to {
                snapshot.undirected[from].push(to);
                snapshot.undirected[to].push(from);
            }
        }

        for neighbours in &mut snapshot.undirected {
            neighbours.sort_unstable();
            neighbours.dedup();
        }
        snapshot
    }

    pub fn node_count(&self) -> usize {
        self.names.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn name(&self, node: usize) -> &str {
        &self.names[node]
    }

    pub fn entity_type(&self, node: usize) -> &str {
        &self.types[node]
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge(&self, id: usize) -> &Edge {
        &self.edges[id]
    }

    pub fn out_edges(&self, node: usize) -> &[usize] {
        &self.out_edges[node]
    }

    pub fn in_edges(&self, node: usize) -> &[usize] {
        &self.in_edges[node]
    }

    pub fn out_degree(&self, node: usize) -> usize {
        self.out_edges[node].len()
    }

    pub fn in_degree(&self, node: usize) -> usize {
        self.in_edges[node].len()
    }

    pub fn degree(&self, node: usize) -> usize {
        self.out_degree(node) + self.in_degree(node)
    }

    pub fn neighbours(&self, node: usize) -> &[usize] {
        &self.undirected[node]
    }

    /// Distinct successors along relation direction
    pub fn successors(&self, node: usize) -> Vec<usize> {
        let mut next: Vec<usize> = self.out_edges[node]
            .iter()
            .map(|&e| self.edges[e].to)
            .collect();
        next.sort_unstable();
        next.dedup();
        next
    }

    /// Distinct predecessors along relation direction
    pub fn predecessors(&self, node: usize) -> Vec<usize> {
        let mut prev: Vec<usize> = self.in_edges[node]
            .iter()
            .map(|&e| self.edges[e].from)
            .collect();
        prev.sort_unstable();
        prev.dedup();
        prev
    }

    /// Hop distances from `source`, following direction when `directed`
    pub fn bfs_distances(&self, source: usize, directed: bool) -> Vec<Option<usize>> {
        let mut distance = vec![None; self.node_count()];
        let mut queue = VecDeque::new();
        distance[source] = Some(0);
        queue.push_back(source);

        while let Some(current) = queue.pop_front() {
            let depth = distance[current].unwrap_or(0);
            let next = if directed {
                self.successors(current)
            } else {
                self.undirected[current].clone()
            };
            for neighbour in next {
                if distance[neighbour].is_none() {
                    distance[neighbour] = Some(depth + 1);
                    queue.push_back(neighbour);
                }
            }
        }
        distance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::knowledge::{Entity, Relation};

    #[test]
    fn test_dangling_relations_are_skipped() {
        let graph = KnowledgeGraph::new(
            vec![Entity::new("a", "t"), Entity::new("b", "t")],
            vec![
                Relation::new("a", "b", "knows"),
                Relation::new("a", "ghost", "knows"),
                Relation::new("b", "a", "knows"),
            ],
        );

        let snapshot = GraphSnapshot::from_graph(&graph);

        assert_eq!(snapshot.node_count(), 2);
        assert_eq!(snapshot.edge_count(), 2);
        assert_eq!(snapshot.degree(0), 2);
        assert_eq!(snapshot.neighbours(0), &[1]);
    }

    #[test]
    fn test_bfs_distances() {
        let graph = KnowledgeGraph::new(
            vec![
                Entity::new("a", "t"),
                Entity::new("b", "t"),
                Entity::new("c", "t"),
            ],
            vec![Relation::new("a", "b", "r"), Relation::new("b", "c", "r")],
        );
        let snapshot = GraphSnapshot::from_graph(&graph);

        assert_eq!(snapshot.bfs_distances(0, true), vec![Some(0), Some(1), Some(2)]);
        assert_eq!(snapshot.bfs_distances(2, true), vec![None, None, Some(0)]);
        assert_eq!(snapshot.bfs_distances(2, false), vec![Some(2), Some(1), Some(0)]);
    }
}

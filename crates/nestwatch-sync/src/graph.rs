//! Undirected view over `previous_version_id` and manual-link edges.

use std::collections::{HashMap, HashSet, VecDeque};

use nestwatch_core::{GraphEdge, Listing};
use nestwatch_storage::{ListingStore, StoreResult};
use uuid::Uuid;

/// Upper bound on nodes loaded for one component.
pub const MAX_COMPONENT_NODES: usize = 1_000;

#[derive(Debug, Clone, Default)]
pub struct VersionGraph {
    nodes: Vec<Uuid>,
    adjacency: HashMap<Uuid, Vec<GraphEdge>>,
    edges: Vec<GraphEdge>,
    truncated: bool,
}

impl VersionGraph {
    /// Breadth-first load of the component containing `start`, one store
    /// round trip per frontier. Cycles are fine; the visited set bounds the walk.
    pub async fn load(store: &dyn ListingStore, start: Uuid) -> StoreResult<Self> {
        let mut graph = VersionGraph::default();
        let mut visited = HashSet::from([start]);
        let mut seen_edges = HashSet::new();
        graph.nodes.push(start);
        let mut frontier = vec![start];

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for edge in store.edges_touching(&frontier).await? {
                if edge.a == edge.b || !seen_edges.insert(edge) {
                    continue;
                }
                for id in [edge.a, edge.b] {
                    if visited.contains(&id) {
                        continue;
                    }
                    if visited.len() >= MAX_COMPONENT_NODES {
                        graph.truncated = true;
                        continue;
                    }
                    visited.insert(id);
                    graph.nodes.push(id);
                    next.push(id);
                }
                if visited.contains(&edge.a) && visited.contains(&edge.b) {
                    graph.insert_edge(edge);
                }
            }
            frontier = next;
        }
        Ok(graph)
    }

    pub fn from_edges(start: Uuid, edges: impl IntoIterator<Item = GraphEdge>) -> Self {
        let mut graph = VersionGraph::default();
        let mut known = HashSet::from([start]);
        graph.nodes.push(start);
        let mut seen = HashSet::new();
        for edge in edges {
            if edge.a == edge.b || !seen.insert(edge) {
                continue;
            }
            for id in [edge.a, edge.b] {
                if known.insert(id) {
                    graph.nodes.push(id);
                }
            }
            graph.insert_edge(edge);
        }
        graph
    }

    fn insert_edge(&mut self, edge: GraphEdge) {
        self.adjacency.entry(edge.a).or_default().push(edge);
        self.adjacency.entry(edge.b).or_default().push(edge);
        self.edges.push(edge);
    }

    /// Nodes in discovery order; the start node comes first.
    pub fn nodes(&self) -> &[Uuid] {
        &self.nodes
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.nodes.contains(&id)
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    pub fn incident(&self, id: Uuid) -> &[GraphEdge] {
        self.adjacency.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether the load stopped at [`MAX_COMPONENT_NODES`].
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Nodes reachable from `start` without passing through `excluding`.
    pub fn component_from(&self, start: Uuid, excluding: Option<Uuid>) -> HashSet<Uuid> {
        let mut seen = HashSet::new();
        if Some(start) == excluding {
            return seen;
        }
        seen.insert(start);
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            for edge in self.incident(id) {
                let Some(other) = edge.other(id) else {
                    continue;
                };
                if Some(other) != excluding && seen.insert(other) {
                    queue.push_back(other);
                }
            }
        }
        seen
    }
}

/// Latest `published_at ?? created_at` wins; tombstoned listings only when
/// nothing else is left.
pub fn select_head(members: &[Listing]) -> Option<&Listing> {
    members
        .iter()
        .max_by_key(|l| (!l.manually_deleted, l.timeline_at(), l.created_at, l.id))
}

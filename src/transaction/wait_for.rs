// Wait-For Graph
use super::types::*;
use crate::error::Result;
use ahash::{AHashMap, AHashSet};
use serde::Serialize;

/// Edge store plus cycle search. Implementations are not synchronized;
/// `DeadlockDetector` owns one behind its mutex.
pub trait WaitForGraph: Send {
    /// Adds `waiter -> holder`. Returns `false` if the edge was already present.
    fn insert_edge(&mut self, waiter: ContextId, holder: ContextId) -> Result<bool>;

    fn remove_edge(&mut self, waiter: ContextId, holder: ContextId);

    /// Contexts on a cycle through `start`, in wait order beginning at `start`.
    fn find_cycle(&self, start: ContextId) -> Option<Vec<ContextId>>;

    fn edges(&self) -> Vec<(ContextId, ContextId)>;

    fn edge_count(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.edge_count() == 0
    }

    fn strategy(&self) -> DetectionStrategy;
}

/// Adjacency-set graph searched with DFS. Unbounded.
#[derive(Debug, Default)]
pub struct AdjacencyGraph {
    waits_for: AHashMap<ContextId, AHashSet<ContextId>>,
    edge_count: usize,
}

impl AdjacencyGraph {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WaitForGraph for AdjacencyGraph {
    fn insert_edge(&mut self, waiter: ContextId, holder: ContextId) -> Result<bool> {
        let inserted = self.waits_for.entry(waiter).or_default().insert(holder);
        if inserted {
            self.edge_count += 1;
        }
        Ok(inserted)
    }

    fn remove_edge(&mut self, waiter: ContextId, holder: ContextId) {
        if let Some(targets) = self.waits_for.get_mut(&waiter) {
            if targets.remove(&holder) {
                self.edge_count -= 1;
            }
            if targets.is_empty() {
                self.waits_for.remove(&waiter);
            }
        }
    }

    fn find_cycle(&self, start: ContextId) -> Option<Vec<ContextId>> {
        detect_cycle(&self.waits_for, start)
    }

    fn edges(&self) -> Vec<(ContextId, ContextId)> {
        let mut edges: Vec<(ContextId, ContextId)> = self
            .waits_for
            .iter()
            .flat_map(|(&waiter, holders)| holders.iter().map(move |&holder| (waiter, holder)))
            .collect();
        edges.sort();
        edges
    }

    fn edge_count(&self) -> usize {
        self.edge_count
    }

    fn strategy(&self) -> DetectionStrategy {
        DetectionStrategy::IncrementalDfs
    }
}

/// DFS from `start` with a visited set and a recursion stack. A back edge to
/// a node still on the stack closes a cycle.
pub fn detect_cycle(
    graph: &AHashMap<ContextId, AHashSet<ContextId>>,
    start: ContextId,
) -> Option<Vec<ContextId>> {
    let mut visited = AHashSet::new();
    let mut rec_stack = Vec::new();

    dfs(start, graph, &mut visited, &mut rec_stack)
}

fn dfs(
    node: ContextId,
    graph: &AHashMap<ContextId, AHashSet<ContextId>>,
    visited: &mut AHashSet<ContextId>,
    rec_stack: &mut Vec<ContextId>,
) -> Option<Vec<ContextId>> {
    visited.insert(node);
    rec_stack.push(node);

    if let Some(neighbors) = graph.get(&node) {
        for &neighbor in neighbors {
            if !visited.contains(&neighbor) {
                if let Some(cycle) = dfs(neighbor, graph, visited, rec_stack) {
                    return Some(cycle);
                }
            } else if let Some(pos) = rec_stack.iter().position(|&n| n == neighbor) {
                return Some(rec_stack[pos..].to_vec());
            }
        }
    }

    rec_stack.pop();
    None
}

/// Read-only view of the graph for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphSnapshot {
    pub strategy: DetectionStrategy,
    pub edges: Vec<WaitEdgeView>,
    /// Contexts with at least one outgoing edge.
    pub blocked: Vec<ContextId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WaitEdgeView {
    pub waiter: ContextId,
    pub holder: ContextId,
}

impl GraphSnapshot {
    pub fn capture(graph: &dyn WaitForGraph) -> Self {
        let edges: Vec<WaitEdgeView> = graph
            .edges()
            .into_iter()
            .map(|(waiter, holder)| WaitEdgeView { waiter, holder })
            .collect();

        let mut blocked: Vec<ContextId> = edges.iter().map(|e| e.waiter).collect();
        blocked.dedup();

        GraphSnapshot {
            strategy: graph.strategy(),
            edges,
            blocked,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

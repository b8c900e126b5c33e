// Transitive-closure wait-for graph over a fixed set of context slots
use super::types::*;
use super::wait_for::WaitForGraph;
use crate::error::{Error, Result};
use ahash::AHashMap;
use std::collections::VecDeque;
use tracing::debug;

/// Hands out matrix rows to contexts. Freed slots go back on a free list and
/// are reused lowest-first; the allocator never grows past `capacity`.
#[derive(Debug)]
pub struct SlotAllocator {
    capacity: usize,
    free: Vec<usize>,
    assigned: AHashMap<ContextId, usize>,
}

impl SlotAllocator {
    pub fn new(capacity: usize) -> Self {
        SlotAllocator {
            capacity,
            free: (0..capacity).rev().collect(),
            assigned: AHashMap::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.assigned.len()
    }

    pub fn slot_of(&self, context: ContextId) -> Option<usize> {
        self.assigned.get(&context).copied()
    }

    pub fn assign(&mut self, context: ContextId) -> Result<usize> {
        if let Some(slot) = self.slot_of(context) {
            return Ok(slot);
        }

        let slot = self.free.pop().ok_or_else(|| {
            Error::ConfigError(format!(
                "All {} context slots are in use; raise max_concurrent_contexts",
                self.capacity
            ))
        })?;
        self.assigned.insert(context, slot);
        Ok(slot)
    }

    pub fn release(&mut self, context: ContextId) -> Option<usize> {
        let slot = self.assigned.remove(&context)?;
        // Keep the free list sorted descending so pop() yields the lowest slot.
        let pos = self.free.partition_point(|&s| s > slot);
        self.free.insert(pos, slot);
        Some(slot)
    }
}

/// Adjacency matrix whose cycle check recomputes the Warshall closure.
#[derive(Debug)]
pub struct ClosureMatrix {
    slots: SlotAllocator,
    adjacency: Vec<bool>,
    owners: Vec<Option<ContextId>>,
    // Edges touching each slot, in either direction.
    degree: Vec<usize>,
    edge_count: usize,
}

impl ClosureMatrix {
    pub fn new(capacity: usize) -> Self {
        ClosureMatrix {
            slots: SlotAllocator::new(capacity),
            adjacency: vec![false; capacity * capacity],
            owners: vec![None; capacity],
            degree: vec![0; capacity],
            edge_count: 0,
        }
    }

    pub fn slots(&self) -> &SlotAllocator {
        &self.slots
    }

    fn idx(&self, row: usize, col: usize) -> usize {
        row * self.slots.capacity() + col
    }

    fn occupied(&self) -> Vec<usize> {
        (0..self.owners.len())
            .filter(|&s| self.owners[s].is_some())
            .collect()
    }

    fn assign(&mut self, context: ContextId) -> Result<usize> {
        let slot = self.slots.assign(context)?;
        self.owners[slot] = Some(context);
        Ok(slot)
    }

    fn reclaim_if_idle(&mut self, slot: usize) {
        if self.degree[slot] == 0 {
            if let Some(context) = self.owners[slot].take() {
                self.slots.release(context);
                debug!(%context, slot, "context slot reclaimed");
            }
        }
    }

    fn closure(&self, occupied: &[usize]) -> Vec<bool> {
        let mut reach = self.adjacency.clone();
        for &k in occupied {
            for &i in occupied {
                if !reach[self.idx(i, k)] {
                    continue;
                }
                for &j in occupied {
                    if reach[self.idx(k, j)] {
                        let ij = self.idx(i, j);
                        reach[ij] = true;
                    }
                }
            }
        }
        reach
    }

    // Shortest path from `slot` back to itself over direct edges.
    fn cycle_through(&self, slot: usize, occupied: &[usize]) -> Vec<ContextId> {
        let mut parent: AHashMap<usize, usize> = AHashMap::new();
        let mut queue = VecDeque::from([slot]);

        while let Some(node) = queue.pop_front() {
            for &next in occupied {
                if !self.adjacency[self.idx(node, next)] {
                    continue;
                }
                if next == slot {
                    let mut path = vec![node];
                    let mut cur = node;
                    while cur != slot {
                        cur = parent[&cur];
                        path.push(cur);
                    }
                    path.reverse();
                    return path.into_iter().filter_map(|s| self.owners[s]).collect();
                }
                if next != slot && !parent.contains_key(&next) {
                    parent.insert(next, node);
                    queue.push_back(next);
                }
            }
        }

        Vec::new()
    }
}

impl WaitForGraph for ClosureMatrix {
    fn insert_edge(&mut self, waiter: ContextId, holder: ContextId) -> Result<bool> {
        let w = self.assign(waiter)?;
        let h = match self.assign(holder) {
            Ok(h) => h,
            Err(e) => {
                self.reclaim_if_idle(w);
                return Err(e);
            }
        };

        let cell = self.idx(w, h);
        if self.adjacency[cell] {
            return Ok(false);
        }
        self.adjacency[cell] = true;
        self.degree[w] += 1;
        self.degree[h] += 1;
        self.edge_count += 1;
        Ok(true)
    }

    fn remove_edge(&mut self, waiter: ContextId, holder: ContextId) {
        let (Some(w), Some(h)) = (self.slots.slot_of(waiter), self.slots.slot_of(holder)) else {
            return;
        };

        let cell = self.idx(w, h);
        if !self.adjacency[cell] {
            return;
        }
        self.adjacency[cell] = false;
        self.degree[w] -= 1;
        self.degree[h] -= 1;
        self.edge_count -= 1;

        self.reclaim_if_idle(w);
        self.reclaim_if_idle(h);
    }

    fn find_cycle(&self, start: ContextId) -> Option<Vec<ContextId>> {
        let occupied = self.occupied();
        if occupied.is_empty() {
            return None;
        }

        let reach = self.closure(&occupied);
        let on_diagonal = |s: usize| reach[self.idx(s, s)];

        // Any diagonal entry means a cycle; prefer reporting the one through `start`.
        let slot = self
            .slots
            .slot_of(start)
            .filter(|&s| on_diagonal(s))
            .or_else(|| occupied.iter().copied().find(|&s| on_diagonal(s)))?;

        Some(self.cycle_through(slot, &occupied))
    }

    fn edges(&self) -> Vec<(ContextId, ContextId)> {
        let occupied = self.occupied();
        let mut edges = Vec::with_capacity(self.edge_count);
        for &i in &occupied {
            for &j in &occupied {
                if self.adjacency[self.idx(i, j)] {
                    if let (Some(w), Some(h)) = (self.owners[i], self.owners[j]) {
                        edges.push((w, h));
                    }
                }
            }
        }
        edges.sort();
        edges
    }

    fn edge_count(&self) -> usize {
        self.edge_count
    }

    fn strategy(&self) -> DetectionStrategy {
        DetectionStrategy::TransitiveClosure
    }
}

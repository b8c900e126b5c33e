// Deadlock Detection
use super::closure::ClosureMatrix;
use super::types::*;
use super::wait_for::{AdjacencyGraph, GraphSnapshot, WaitForGraph};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Shared wait-for graph plus proactive cycle checks.
///
/// The inner mutex is only ever held for one insert/check/remove step and is
/// never held while a caller blocks on a resource lock.
pub struct DeadlockDetector {
    graph: Mutex<Box<dyn WaitForGraph>>,
    probes: AtomicU64,
    cycles_found: AtomicU64,
}

impl DeadlockDetector {
    pub fn new(strategy: DetectionStrategy, max_contexts: Option<usize>) -> Result<Self> {
        let graph: Box<dyn WaitForGraph> = match strategy {
            DetectionStrategy::IncrementalDfs => Box::new(AdjacencyGraph::new()),
            DetectionStrategy::TransitiveClosure => {
                let capacity = max_contexts.ok_or_else(|| {
                    Error::ConfigError(
                        "transitive_closure requires max_concurrent_contexts".to_string(),
                    )
                })?;
                if capacity == 0 {
                    return Err(Error::ConfigError(
                        "max_concurrent_contexts must be positive".to_string(),
                    ));
                }
                Box::new(ClosureMatrix::new(capacity))
            }
        };

        Ok(Self::with_graph(graph))
    }

    pub fn with_graph(graph: Box<dyn WaitForGraph>) -> Self {
        DeadlockDetector {
            graph: Mutex::new(graph),
            probes: AtomicU64::new(0),
            cycles_found: AtomicU64::new(0),
        }
    }

    pub fn strategy(&self) -> DetectionStrategy {
        self.graph.lock().strategy()
    }

    /// Speculatively adds `source -> target`, searches for a cycle, and
    /// removes the edge again. The graph is unchanged on return.
    pub fn would_create_cycle(&self, source: ContextId, target: ContextId) -> Result<bool> {
        let mut graph = self.graph.lock();
        Ok(self.probe(&mut **graph, source, target)?.is_some())
    }

    fn probe(
        &self,
        graph: &mut dyn WaitForGraph,
        source: ContextId,
        target: ContextId,
    ) -> Result<Option<Vec<ContextId>>> {
        self.probes.fetch_add(1, Ordering::Relaxed);

        let inserted = graph.insert_edge(source, target)?;
        let cycle = graph.find_cycle(source);
        if inserted {
            graph.remove_edge(source, target);
        }

        if cycle.is_some() {
            self.cycles_found.fetch_add(1, Ordering::Relaxed);
        }
        Ok(cycle)
    }

    /// Checks `waiter -> holder` and, if it closes no cycle, installs it as
    /// the edge for the blocking wait that follows. Check and install happen
    /// under one hold of the graph lock, so two contexts entering opposite
    /// waits cannot both pass the check.
    pub fn enter_wait(
        &self,
        waiter: ContextId,
        holder: ContextId,
        resource: ResourceId,
    ) -> Result<WaitEdge<'_>> {
        let mut graph = self.graph.lock();

        if let Some(cycle) = self.probe(&mut **graph, waiter, holder)? {
            warn!(%waiter, %holder, %resource, ?cycle, "wait would close a cycle");
            return Err(Error::DeadlockDetected {
                context: waiter,
                resource,
                holder,
                cycle,
            });
        }

        if !graph.insert_edge(waiter, holder)? {
            return Err(Error::InvariantViolation(format!(
                "{} is already waiting on {}",
                waiter, holder
            )));
        }
        debug!(%waiter, %holder, %resource, "wait edge installed");

        Ok(WaitEdge {
            detector: self,
            waiter,
            holder,
        })
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let graph = self.graph.lock();
        GraphSnapshot::capture(&**graph)
    }

    pub fn is_empty(&self) -> bool {
        self.graph.lock().is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.lock().edge_count()
    }

    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }

    pub fn cycles_found(&self) -> u64 {
        self.cycles_found.load(Ordering::Relaxed)
    }
}

/// A wait edge that exists for as long as this guard does.
#[must_use = "the wait edge is removed as soon as the guard is dropped"]
pub struct WaitEdge<'a> {
    detector: &'a DeadlockDetector,
    waiter: ContextId,
    holder: ContextId,
}

impl Drop for WaitEdge<'_> {
    fn drop(&mut self) {
        self.detector
            .graph
            .lock()
            .remove_edge(self.waiter, self.holder);
        debug!(waiter = %self.waiter, holder = %self.holder, "wait edge removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detectors() -> Vec<DeadlockDetector> {
        vec![
            DeadlockDetector::new(DetectionStrategy::IncrementalDfs, None).unwrap(),
            DeadlockDetector::new(DetectionStrategy::TransitiveClosure, Some(8)).unwrap(),
        ]
    }

    #[test]
    fn test_closure_requires_context_bound() {
        assert!(matches!(
            DeadlockDetector::new(DetectionStrategy::TransitiveClosure, None),
            Err(Error::ConfigError(_))
        ));
        assert!(DeadlockDetector::new(DetectionStrategy::TransitiveClosure, Some(0)).is_err());
    }

    #[test]
    fn test_speculative_check_leaves_graph_unchanged() {
        for detector in detectors() {
            let (a, b) = (ContextId::new(), ContextId::new());
            assert!(!detector.would_create_cycle(a, b).unwrap());
            assert!(detector.is_empty());
            assert_eq!(detector.probe_count(), 1);
        }
    }

    #[test]
    fn test_opposing_waits_detected() {
        for detector in detectors() {
            let (a, b) = (ContextId::new(), ContextId::new());
            let edge = detector.enter_wait(a, b, ResourceId(2)).unwrap();

            assert!(detector.would_create_cycle(b, a).unwrap());
            let err = detector.enter_wait(b, a, ResourceId(1)).err().unwrap();
            match err {
                Error::DeadlockDetected {
                    context,
                    resource,
                    holder,
                    cycle,
                } => {
                    assert_eq!(context, b);
                    assert_eq!(resource, ResourceId(1));
                    assert_eq!(holder, a);
                    assert_eq!(cycle, vec![b, a]);
                }
                other => panic!("unexpected error: {other:?}"),
            }

            // Only the real wait edge remains.
            assert_eq!(detector.edge_count(), 1);
            drop(edge);
            assert!(detector.is_empty());
            assert_eq!(detector.cycles_found(), 2);
        }
    }

    #[test]
    fn test_speculative_check_keeps_existing_edge() {
        for detector in detectors() {
            let (a, b) = (ContextId::new(), ContextId::new());
            let _edge = detector.enter_wait(a, b, ResourceId(1)).unwrap();

            // Probing an edge that is already present must not remove it.
            assert!(!detector.would_create_cycle(a, b).unwrap());
            assert_eq!(detector.edge_count(), 1);
        }
    }

    #[test]
    fn test_three_party_cycle() {
        for detector in detectors() {
            let (a, b, c) = (ContextId::new(), ContextId::new(), ContextId::new());
            let _ab = detector.enter_wait(a, b, ResourceId(2)).unwrap();
            let _bc = detector.enter_wait(b, c, ResourceId(3)).unwrap();

            assert!(detector.enter_wait(c, a, ResourceId(1)).is_err());
            assert_eq!(detector.edge_count(), 2);
        }
    }

    #[test]
    fn test_snapshot_is_read_only() {
        let detector = DeadlockDetector::new(DetectionStrategy::IncrementalDfs, None).unwrap();
        let (a, b) = (ContextId::new(), ContextId::new());
        let _edge = detector.enter_wait(a, b, ResourceId(1)).unwrap();

        let first = detector.snapshot();
        let second = detector.snapshot();
        assert_eq!(first, second);
        assert_eq!(first.blocked, vec![a]);
        assert_eq!(detector.probe_count(), 1);
    }

    #[test]
    fn test_closure_slot_exhaustion_surfaces() {
        let detector = DeadlockDetector::new(DetectionStrategy::TransitiveClosure, Some(2)).unwrap();
        let (a, b, c) = (ContextId::new(), ContextId::new(), ContextId::new());
        let _edge = detector.enter_wait(a, b, ResourceId(1)).unwrap();

        assert!(matches!(
            detector.enter_wait(c, a, ResourceId(2)),
            Err(Error::ConfigError(_))
        ));
        assert_eq!(detector.edge_count(), 1);
    }
}

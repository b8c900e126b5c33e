// Transaction Coordinator
use super::context::{HeldResources, OperationContext};
use super::deadlock::DeadlockDetector;
use super::lock_manager::ResourceLockTable;
use super::types::*;
use super::wait_for::GraphSnapshot;
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::ledger::{InMemoryLedger, Ledger};
use crate::observability::{EventSink, ManagerStats, OperationEvent, StatsSnapshot, TracingSink};
use ahash::AHashSet;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Operation {
    Transfer {
        from: ResourceId,
        to: ResourceId,
        amount: i64,
    },
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Transfer { .. } => "transfer",
        }
    }

    /// Resources in the order they will be requested.
    pub fn resources(&self) -> Vec<ResourceId> {
        match *self {
            Operation::Transfer { from, to, .. } => vec![from, to],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Effect {
    Transferred(TransferReceipt),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReceipt {
    pub operation_id: ContextId,
    pub from: ResourceId,
    pub to: ResourceId,
    pub amount: i64,
    pub from_balance: i64,
    pub to_balance: i64,
}

/// Runs multi-resource operations over a fixed set of resources, refusing
/// any wait that would close a cycle in the wait-for graph.
pub struct TransactionCoordinator {
    config: ManagerConfig,
    locks: ResourceLockTable,
    ledger: Arc<dyn Ledger>,
    detector: DeadlockDetector,
    sink: Arc<dyn EventSink>,
    stats: ManagerStats,
}

impl TransactionCoordinator {
    /// One lock per resource the ledger knows about.
    pub fn new(config: ManagerConfig, ledger: Arc<dyn Ledger>) -> Result<Self> {
        config.validate()?;
        let detector =
            DeadlockDetector::new(config.detection_strategy, config.max_concurrent_contexts)?;
        let locks = ResourceLockTable::new(ledger.resources());

        Ok(TransactionCoordinator {
            config,
            locks,
            ledger,
            detector,
            sink: Arc::new(TracingSink),
            stats: ManagerStats::new(),
        })
    }

    pub fn with_balances(
        config: ManagerConfig,
        balances: impl IntoIterator<Item = (ResourceId, i64)>,
    ) -> Result<Self> {
        let ledger = InMemoryLedger::new(balances)?;
        Self::new(config, Arc::new(ledger))
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn lock_table(&self) -> &ResourceLockTable {
        &self.locks
    }

    pub fn detector(&self) -> &DeadlockDetector {
        &self.detector
    }

    pub fn execute(&self, operation: &Operation) -> Result<Effect> {
        match *operation {
            Operation::Transfer { from, to, amount } => {
                self.transfer(from, to, amount).map(Effect::Transferred)
            }
        }
    }

    /// Moves `amount` from `from` to `to`. Locks `from` first unless the
    /// configured order says otherwise.
    pub fn transfer(&self, from: ResourceId, to: ResourceId, amount: i64) -> Result<TransferReceipt> {
        let operation = Operation::Transfer { from, to, amount };
        let ledger = &self.ledger;
        let precheck = || {
            if amount <= 0 {
                return Err(Error::InvalidRequest(format!(
                    "Amount must be positive, got {}",
                    amount
                )));
            }
            if from == to {
                return Err(Error::InvalidRequest(format!(
                    "Cannot transfer from {} to itself",
                    from
                )));
            }
            for resource in [from, to] {
                if !ledger.contains(resource) {
                    return Err(Error::InvalidRequest(format!("Unknown resource {}", resource)));
                }
            }
            ensure_funds(from, ledger.get_value(from)?, amount)?;
            ensure_room(to, ledger.get_value(to)?, amount)
        };

        self.run(
            operation.kind(),
            &operation.resources(),
            precheck,
            // Re-checked once `from` is locked: it cannot change after that.
            Some(from),
            |held| ensure_funds(from, held.value(from)?, amount),
            |id, held| {
                // `to` may have been credited since the precheck.
                ensure_room(to, held.value(to)?, amount)?;

                let from_balance = held.apply_delta(from, -amount).map_err(|e| {
                    Error::InvariantViolation(format!("debit failed after validation: {}", e))
                })?;
                let to_balance = match held.apply_delta(to, amount) {
                    Ok(balance) => balance,
                    Err(e) => {
                        held.apply_delta(from, amount)?;
                        return Err(Error::InvariantViolation(format!(
                            "credit failed after validation: {}",
                            e
                        )));
                    }
                };

                Ok(TransferReceipt {
                    operation_id: id,
                    from,
                    to,
                    amount,
                    from_balance,
                    to_balance,
                })
            },
        )
    }

    /// Locks `resources`, runs `effect` with all of them held, and releases
    /// them in reverse order. The effect must not fail for ordinary reasons;
    /// validate before calling. Changes made before a failing effect returns
    /// are not undone, so any error it returns is reported as
    /// `InvariantViolation`.
    pub fn execute_with<T>(
        &self,
        resources: &[ResourceId],
        effect: impl FnOnce(&HeldResources<'_>) -> Result<T>,
    ) -> Result<T> {
        self.run(
            "custom",
            resources,
            || Ok(()),
            None,
            |_| Ok(()),
            |_, held| {
                effect(held).map_err(|e| match e {
                    Error::InvariantViolation(_) => e,
                    other => Error::InvariantViolation(format!(
                        "effect failed with locks held: {}",
                        other
                    )),
                })
            },
        )
    }

    /// Reads one value under its lock.
    pub fn balance(&self, resource: ResourceId) -> Result<i64> {
        self.run(
            "balance",
            &[resource],
            || Ok(()),
            None,
            |_| Ok(()),
            |_, held| held.value(resource),
        )
    }

    pub fn inspect_graph(&self) -> GraphSnapshot {
        self.detector.snapshot()
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        snapshot.detector_probes = self.detector.probe_count();
        snapshot.lock_acquisitions = self.locks.acquisition_count();
        snapshot
    }

    /// Fails if any wait edge or resource lock survives while no operation
    /// is running.
    pub fn assert_quiescent(&self) -> Result<()> {
        let snapshot = self.detector.snapshot();
        if !snapshot.is_empty() {
            return Err(Error::InvariantViolation(format!(
                "{} stale wait edges at rest: {:?}",
                snapshot.edges.len(),
                snapshot.edges
            )));
        }

        let held: Vec<ResourceId> = self
            .locks
            .resources()
            .into_iter()
            .filter(|&r| self.locks.is_held(r))
            .collect();
        if !held.is_empty() {
            return Err(Error::InvariantViolation(format!(
                "locks held at rest: {:?}",
                held
            )));
        }
        Ok(())
    }

    fn run<T>(
        &self,
        kind: &'static str,
        resources: &[ResourceId],
        precheck: impl FnOnce() -> Result<()>,
        check_on: Option<ResourceId>,
        check: impl FnOnce(&HeldResources<'_>) -> Result<()>,
        effect: impl FnOnce(ContextId, &HeldResources<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut ctx = OperationContext::new(&self.locks, kind);

        let result = self.run_in(&mut ctx, resources, precheck, check_on, check, effect);
        let result = match (result, ctx.release_all()) {
            (result, Ok(())) => result,
            (_, Err(e)) => Err(e),
        };

        self.finish(&ctx, resources, &result);
        result
    }

    fn run_in<T>(
        &self,
        ctx: &mut OperationContext<'_>,
        resources: &[ResourceId],
        precheck: impl FnOnce() -> Result<()>,
        check_on: Option<ResourceId>,
        check: impl FnOnce(&HeldResources<'_>) -> Result<()>,
        effect: impl FnOnce(ContextId, &HeldResources<'_>) -> Result<T>,
    ) -> Result<T> {
        precheck()?;
        let order = self.acquisition_order(resources)?;
        let mut check = Some(check);

        for (position, &resource) in order.iter().enumerate() {
            if position == 0 {
                self.acquire(ctx, resource)?;
            } else {
                self.acquire_blocking(ctx, resource)?;
            }
            self.sink.lock_acquired(ctx.id(), resource, position);

            if check_on == Some(resource) {
                if let Some(check) = check.take() {
                    check(&HeldResources::new(self.ledger.as_ref(), ctx.held()))?;
                }
            }
        }

        effect(ctx.id(), &HeldResources::new(self.ledger.as_ref(), ctx.held()))
    }

    fn acquisition_order(&self, resources: &[ResourceId]) -> Result<Vec<ResourceId>> {
        if resources.is_empty() {
            return Err(Error::InvalidRequest("No resources requested".to_string()));
        }

        let mut seen = AHashSet::with_capacity(resources.len());
        for &resource in resources {
            if !self.locks.contains(resource) {
                return Err(Error::InvalidRequest(format!("Unknown resource {}", resource)));
            }
            if !seen.insert(resource) {
                return Err(Error::InvalidRequest(format!(
                    "Resource {} requested twice",
                    resource
                )));
            }
        }

        let mut order = resources.to_vec();
        if self.config.acquisition_order == AcquisitionOrder::Ascending {
            order.sort();
        }
        Ok(order)
    }

    fn acquire(&self, ctx: &mut OperationContext<'_>, resource: ResourceId) -> Result<()> {
        let timeout = self.config.acquisition_timeout;
        if ctx.acquire(resource, timeout)? {
            Ok(())
        } else {
            Err(Error::Unavailable {
                resource,
                waited: timeout,
            })
        }
    }

    // Called while `ctx` already holds at least one lock, so this wait is
    // the one that could close a cycle. The wait is cut into slices and the
    // holder re-read before each one, so a hint that was empty or stale at
    // the start does not leave the wait unchecked for the whole timeout.
    fn acquire_blocking(&self, ctx: &mut OperationContext<'_>, resource: ResourceId) -> Result<()> {
        let timeout = self.config.acquisition_timeout;
        let deadline = Instant::now() + timeout;

        loop {
            let _edge = match self.locks.holder(resource) {
                Some(holder) if holder != ctx.id() => {
                    Some(self.detector.enter_wait(ctx.id(), holder, resource)?)
                }
                // Free, or no hint: the timeout is the only guard.
                _ => None,
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if ctx.acquire(resource, remaining.min(self.config.holder_recheck_interval))? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Unavailable {
                    resource,
                    waited: timeout,
                });
            }
        }
    }

    fn finish<T>(&self, ctx: &OperationContext<'_>, resources: &[ResourceId], result: &Result<T>) {
        let (outcome, detail) = match result {
            Ok(_) => (Outcome::Success, None),
            Err(e) => (e.outcome(), Some(e.to_string())),
        };

        if let Err(e @ Error::InvariantViolation(_)) = result {
            error!(context = %ctx.id(), error = %e, "invariant violation");
        }

        self.stats.record(outcome);
        self.sink.record(&OperationEvent {
            operation_id: ctx.id(),
            kind: ctx.kind(),
            outcome,
            resources: resources.to_vec(),
            elapsed: ctx.elapsed(),
            detail,
        });
    }
}

fn ensure_room(resource: ResourceId, balance: i64, amount: i64) -> Result<()> {
    if balance.checked_add(amount).is_none() {
        return Err(Error::InvalidRequest(format!(
            "Crediting {} to {} would overflow its balance {}",
            amount, resource, balance
        )));
    }
    Ok(())
}

fn ensure_funds(resource: ResourceId, balance: i64, amount: i64) -> Result<()> {
    if balance < amount {
        return Err(Error::InvalidRequest(format!(
            "Insufficient funds in {}: balance {}, requested {}",
            resource, balance, amount
        )));
    }
    Ok(())
}

/// Shorthand for tests and tools that need a coordinator over numbered
/// accounts with a custom timeout.
pub fn coordinator_for(
    accounts: &[(u64, i64)],
    timeout: Duration,
    strategy: DetectionStrategy,
) -> Result<TransactionCoordinator> {
    let config = ManagerConfig {
        acquisition_timeout: timeout,
        detection_strategy: strategy,
        max_concurrent_contexts: match strategy {
            DetectionStrategy::TransitiveClosure => Some(64),
            DetectionStrategy::IncrementalDfs => None,
        },
        ..ManagerConfig::default()
    };
    TransactionCoordinator::with_balances(
        config,
        accounts.iter().map(|&(id, value)| (ResourceId(id), value)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::ChannelSink;

    fn bank(strategy: DetectionStrategy) -> TransactionCoordinator {
        coordinator_for(&[(1, 1000), (2, 1000)], Duration::from_millis(200), strategy).unwrap()
    }

    #[test]
    fn test_transfer_moves_value() {
        for strategy in [DetectionStrategy::IncrementalDfs, DetectionStrategy::TransitiveClosure] {
            let bank = bank(strategy);
            let receipt = bank.transfer(ResourceId(1), ResourceId(2), 200).unwrap();

            assert_eq!(receipt.from_balance, 800);
            assert_eq!(receipt.to_balance, 1200);
            assert_eq!(bank.balance(ResourceId(1)).unwrap(), 800);
            assert_eq!(bank.ledger().total(), 2000);
            bank.assert_quiescent().unwrap();
        }
    }

    #[test]
    fn test_execute_descriptor() {
        let bank = bank(DetectionStrategy::IncrementalDfs);
        let effect = bank
            .execute(&Operation::Transfer {
                from: ResourceId(2),
                to: ResourceId(1),
                amount: 300,
            })
            .unwrap();

        let Effect::Transferred(receipt) = effect;
        assert_eq!(receipt.from_balance, 700);
        assert_eq!(receipt.to_balance, 1300);
    }

    #[test]
    fn test_invalid_requests_take_no_locks() {
        let bank = bank(DetectionStrategy::IncrementalDfs);
        let cases = [
            (ResourceId(1), ResourceId(2), 0),
            (ResourceId(1), ResourceId(2), -5),
            (ResourceId(1), ResourceId(2), 1001),
            (ResourceId(1), ResourceId(1), 10),
            (ResourceId(1), ResourceId(9), 10),
        ];

        for (from, to, amount) in cases {
            let err = bank.transfer(from, to, amount).unwrap_err();
            assert!(matches!(err, Error::InvalidRequest(_)), "{from}->{to} {amount}: {err}");
        }

        assert_eq!(bank.lock_table().acquisition_count(), 0);
        assert_eq!(bank.stats().invalid, cases.len() as u64);
        assert_eq!(bank.ledger().get_value(ResourceId(1)).unwrap(), 1000);
    }

    #[test]
    fn test_execute_with_rejects_duplicates_and_empty() {
        let bank = bank(DetectionStrategy::IncrementalDfs);
        assert!(matches!(
            bank.execute_with(&[], |_| Ok(())),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            bank.execute_with(&[ResourceId(1), ResourceId(1)], |_| Ok(())),
            Err(Error::InvalidRequest(_))
        ));
        assert_eq!(bank.lock_table().acquisition_count(), 0);
    }

    #[test]
    fn test_effect_error_releases_locks() {
        let bank = bank(DetectionStrategy::IncrementalDfs);
        let result: Result<()> = bank.execute_with(&[ResourceId(1), ResourceId(2)], |held| {
            held.apply_delta(ResourceId(1), -5000)?;
            Ok(())
        });

        assert!(result.is_err());
        bank.assert_quiescent().unwrap();
        assert_eq!(bank.ledger().total(), 2000);
    }

    #[test]
    fn test_failed_effect_is_invariant_violation() {
        let (sink, events) = ChannelSink::unbounded();
        let bank = bank(DetectionStrategy::IncrementalDfs).with_sink(Arc::new(sink));

        // Mutates one resource, then fails on the other.
        let result: Result<()> = bank.execute_with(&[ResourceId(1), ResourceId(2)], |held| {
            held.apply_delta(ResourceId(1), 10)?;
            held.apply_delta(ResourceId(2), -5000)?;
            Ok(())
        });

        let err = result.unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)), "{err:?}");
        assert!(!err.is_retryable());
        assert_eq!(bank.stats().invariant_violations, 1);
        assert_eq!(bank.stats().invalid, 0);

        let event = events.try_recv().unwrap();
        assert_eq!(event.outcome, Outcome::InvariantViolation);
        assert_eq!(event.kind, "custom");
        bank.assert_quiescent().unwrap();
    }

    #[test]
    fn test_credit_overflow_is_invalid_request() {
        let bank = coordinator_for(
            &[(1, 10), (2, i64::MAX)],
            Duration::from_millis(200),
            DetectionStrategy::IncrementalDfs,
        )
        .unwrap();

        let err = bank.transfer(ResourceId(1), ResourceId(2), 5).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)), "{err:?}");

        let stats = bank.stats();
        assert_eq!(stats.invalid, 1);
        assert_eq!(stats.invariant_violations, 0);
        assert_eq!(bank.lock_table().acquisition_count(), 0);
        assert_eq!(bank.ledger().get_value(ResourceId(1)).unwrap(), 10);
        assert_eq!(bank.ledger().get_value(ResourceId(2)).unwrap(), i64::MAX);
    }

    /// Credits `target` behind the coordinator's back once the first lock
    /// of an operation is taken.
    struct CreditOnFirstLock {
        ledger: Arc<InMemoryLedger>,
        target: ResourceId,
        delta: i64,
    }

    impl EventSink for CreditOnFirstLock {
        fn record(&self, _event: &OperationEvent) {}

        fn lock_acquired(&self, _context: ContextId, _resource: ResourceId, position: usize) {
            if position == 0 {
                self.ledger.apply_delta(self.target, self.delta).unwrap();
            }
        }
    }

    #[test]
    fn test_credit_overflow_rechecked_under_lock() {
        let ledger = Arc::new(
            InMemoryLedger::new([(ResourceId(1), 10), (ResourceId(2), i64::MAX - 10)]).unwrap(),
        );
        let bank = TransactionCoordinator::new(ManagerConfig::default(), ledger.clone())
            .unwrap()
            .with_sink(Arc::new(CreditOnFirstLock {
                ledger: Arc::clone(&ledger),
                target: ResourceId(2),
                delta: 8,
            }));

        // Passes the precheck; `to` fills up between the two locks.
        let err = bank.transfer(ResourceId(1), ResourceId(2), 5).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)), "{err:?}");
        assert_eq!(bank.stats().invariant_violations, 0);
        assert_eq!(ledger.get_value(ResourceId(1)).unwrap(), 10);
        assert_eq!(ledger.get_value(ResourceId(2)).unwrap(), i64::MAX - 2);
        bank.assert_quiescent().unwrap();
    }

    #[test]
    fn test_blocked_wait_rechecks_new_holder() {
        let bank = Arc::new(
            coordinator_for(
                &[(1, 1000), (2, 1000)],
                Duration::from_secs(5),
                DetectionStrategy::IncrementalDfs,
            )
            .unwrap(),
        );
        let first_holder = ContextId::new();
        let next_holder = ContextId::new();
        assert!(bank
            .lock_table()
            .try_acquire(ResourceId(2), first_holder, Duration::ZERO)
            .unwrap());

        let waiter = {
            let bank = Arc::clone(&bank);
            std::thread::spawn(move || {
                let started = Instant::now();
                (bank.transfer(ResourceId(1), ResourceId(2), 100), started.elapsed())
            })
        };

        // The waiter holds 1 and waits on the first holder of 2.
        let started = Instant::now();
        let waiter_id = loop {
            let snapshot = bank.inspect_graph();
            if let Some(edge) = snapshot.edges.first() {
                assert_eq!(edge.holder, first_holder);
                break edge.waiter;
            }
            assert!(started.elapsed() < Duration::from_secs(2), "waiter never blocked");
            std::thread::sleep(Duration::from_millis(1));
        };

        // The next holder of 2 is itself waiting on the waiter. Handing the
        // lock over leaves the waiter asleep with an edge to a stale holder.
        let reverse = bank
            .detector()
            .enter_wait(next_holder, waiter_id, ResourceId(1))
            .unwrap();
        bank.lock_table()
            .hand_over(ResourceId(2), first_holder, next_holder)
            .unwrap();

        let (result, waited) = waiter.join().unwrap();
        match result {
            Err(Error::DeadlockDetected {
                context, holder, resource, ..
            }) => {
                assert_eq!(context, waiter_id);
                assert_eq!(holder, next_holder);
                assert_eq!(resource, ResourceId(2));
            }
            other => panic!("expected deadlock, got {other:?}"),
        }
        assert!(waited < Duration::from_secs(1), "waited {waited:?}");
        assert!(!bank.lock_table().is_held(ResourceId(1)));
        assert_eq!(bank.ledger().get_value(ResourceId(1)).unwrap(), 1000);

        drop(reverse);
        bank.lock_table().release(ResourceId(2), next_holder).unwrap();
        bank.assert_quiescent().unwrap();
    }

    #[test]
    fn test_ascending_order_sorts_acquisitions() {
        let config = ManagerConfig {
            acquisition_order: AcquisitionOrder::Ascending,
            ..ManagerConfig::default()
        };
        let bank = TransactionCoordinator::with_balances(
            config,
            [(ResourceId(1), 10), (ResourceId(2), 10)],
        )
        .unwrap();

        let order = bank
            .execute_with(&[ResourceId(2), ResourceId(1)], |held| {
                Ok(held.resources().to_vec())
            })
            .unwrap();
        assert_eq!(order, vec![ResourceId(1), ResourceId(2)]);
    }

    #[test]
    fn test_events_emitted_per_operation() {
        let (sink, events) = ChannelSink::unbounded();
        let bank = bank(DetectionStrategy::IncrementalDfs).with_sink(Arc::new(sink));

        bank.transfer(ResourceId(1), ResourceId(2), 10).unwrap();
        let _ = bank.transfer(ResourceId(1), ResourceId(2), 0);

        let outcomes: Vec<(Outcome, &'static str)> =
            events.try_iter().map(|e| (e.outcome, e.kind)).collect();
        assert_eq!(
            outcomes,
            vec![(Outcome::Success, "transfer"), (Outcome::InvalidRequest, "transfer")]
        );
    }

    #[test]
    fn test_closure_config_without_bound_fails() {
        let config = ManagerConfig {
            detection_strategy: DetectionStrategy::TransitiveClosure,
            ..ManagerConfig::default()
        };
        let result = TransactionCoordinator::with_balances(config, [(ResourceId(1), 1)]);
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }
}

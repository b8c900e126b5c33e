// Operation Context
use super::lock_manager::ResourceLockTable;
use super::types::*;
use crate::error::{Error, Result};
use crate::ledger::Ledger;
use std::time::{Duration, Instant};
use tracing::error;

/// One attempt at a multi-resource operation. Owned by the calling thread;
/// every lock it still holds is released, newest first, when it is dropped.
pub struct OperationContext<'a> {
    id: ContextId,
    kind: &'static str,
    table: &'a ResourceLockTable,
    held: Vec<ResourceId>,
    waiting_on: Option<ResourceId>,
    started: Instant,
}

impl<'a> OperationContext<'a> {
    pub fn new(table: &'a ResourceLockTable, kind: &'static str) -> Self {
        OperationContext {
            id: ContextId::new(),
            kind,
            table,
            held: Vec::new(),
            waiting_on: None,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Held resources in acquisition order.
    pub fn held(&self) -> &[ResourceId] {
        &self.held
    }

    pub fn waiting_on(&self) -> Option<ResourceId> {
        self.waiting_on
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Bounded wait for `resource`. `Ok(false)` means the timeout expired.
    pub fn acquire(&mut self, resource: ResourceId, timeout: Duration) -> Result<bool> {
        self.waiting_on = Some(resource);
        let acquired = self.table.try_acquire(resource, self.id, timeout);
        self.waiting_on = None;

        if acquired? {
            self.held.push(resource);
            return Ok(true);
        }
        Ok(false)
    }

    /// Releases everything in reverse acquisition order. Every lock is
    /// attempted even if an earlier release fails; the first failure is
    /// returned.
    pub fn release_all(&mut self) -> Result<()> {
        let mut first_err = None;
        while let Some(resource) = self.held.pop() {
            if let Err(e) = self.table.release(resource, self.id) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for OperationContext<'_> {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        if let Err(e) = self.release_all() {
            error!(context = %self.id, error = %e, "failed to release locks on drop");
            debug_assert!(false, "lock release failed on drop: {e}");
        }
    }
}

/// Ledger access limited to the resources an operation holds.
pub struct HeldResources<'a> {
    ledger: &'a dyn Ledger,
    held: &'a [ResourceId],
}

impl<'a> HeldResources<'a> {
    pub fn new(ledger: &'a dyn Ledger, held: &'a [ResourceId]) -> Self {
        HeldResources { ledger, held }
    }

    pub fn resources(&self) -> &[ResourceId] {
        self.held
    }

    fn check(&self, resource: ResourceId) -> Result<()> {
        if self.held.contains(&resource) {
            Ok(())
        } else {
            Err(Error::InvariantViolation(format!(
                "{} accessed without holding its lock",
                resource
            )))
        }
    }

    pub fn value(&self, resource: ResourceId) -> Result<i64> {
        self.check(resource)?;
        self.ledger.get_value(resource)
    }

    pub fn apply_delta(&self, resource: ResourceId, delta: i64) -> Result<i64> {
        self.check(resource)?;
        self.ledger.apply_delta(resource, delta)
    }
}

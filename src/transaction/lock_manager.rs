// Resource Lock Table
use super::types::*;
use crate::error::{Error, Result};
use ahash::AHashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// One exclusive lock per resource. The set of resources is fixed at
/// construction; locks live as long as the table.
pub struct ResourceLockTable {
    locks: AHashMap<ResourceId, ResourceLock>,
    acquisitions: AtomicU64,
}

struct ResourceLock {
    // Current owner. Doubles as the holder hint.
    owner: Mutex<Option<ContextId>>,
    released: Condvar,
}

impl ResourceLock {
    fn new() -> Self {
        ResourceLock {
            owner: Mutex::new(None),
            released: Condvar::new(),
        }
    }
}

impl ResourceLockTable {
    pub fn new(resources: impl IntoIterator<Item = ResourceId>) -> Self {
        let locks = resources
            .into_iter()
            .map(|id| (id, ResourceLock::new()))
            .collect();

        ResourceLockTable {
            locks,
            acquisitions: AtomicU64::new(0),
        }
    }

    pub fn contains(&self, resource: ResourceId) -> bool {
        self.locks.contains_key(&resource)
    }

    pub fn resources(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self.locks.keys().copied().collect();
        ids.sort();
        ids
    }

    fn lock(&self, resource: ResourceId) -> Result<&ResourceLock> {
        self.locks
            .get(&resource)
            .ok_or_else(|| Error::InvalidRequest(format!("Unknown resource {}", resource)))
    }

    /// Blocks for at most `timeout`. Returns `Ok(false)` on expiry, leaving
    /// the lock untouched.
    pub fn try_acquire(
        &self,
        resource: ResourceId,
        context: ContextId,
        timeout: Duration,
    ) -> Result<bool> {
        let lock = self.lock(resource)?;
        let deadline = Instant::now() + timeout;
        let mut owner = lock.owner.lock();

        if *owner == Some(context) {
            return Err(Error::InvariantViolation(format!(
                "{} already holds {}",
                context, resource
            )));
        }

        while owner.is_some() {
            if lock.released.wait_until(&mut owner, deadline).timed_out() && owner.is_some() {
                debug!(%resource, %context, ?timeout, "lock acquisition timed out");
                return Ok(false);
            }
        }

        *owner = Some(context);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        debug!(%resource, %context, "lock acquired");
        Ok(true)
    }

    /// Releasing a lock the caller does not hold is a bug, reported as
    /// `InvariantViolation`.
    pub fn release(&self, resource: ResourceId, context: ContextId) -> Result<()> {
        let lock = self.lock(resource)?;
        let mut owner = lock.owner.lock();

        if *owner != Some(context) {
            return Err(Error::InvariantViolation(format!(
                "{} released {} but the holder is {:?}",
                context, resource, *owner
            )));
        }

        *owner = None;
        drop(owner);
        lock.released.notify_one();
        debug!(%resource, %context, "lock released");
        Ok(())
    }

    /// Moves a held lock straight to another context without waking any
    /// waiter.
    #[cfg(test)]
    pub(crate) fn hand_over(&self, resource: ResourceId, from: ContextId, to: ContextId) -> Result<()> {
        let lock = self.lock(resource)?;
        let mut owner = lock.owner.lock();
        if *owner != Some(from) {
            return Err(Error::InvariantViolation(format!(
                "{} handed over {} but the holder is {:?}",
                from, resource, *owner
            )));
        }
        *owner = Some(to);
        Ok(())
    }

    /// Racy snapshot; may be stale as soon as it returns.
    pub fn is_held(&self, resource: ResourceId) -> bool {
        self.holder(resource).is_some()
    }

    /// Best-effort hint of the current holder.
    pub fn holder(&self, resource: ResourceId) -> Option<ContextId> {
        self.locks.get(&resource).and_then(|lock| *lock.owner.lock())
    }

    /// Total successful acquisitions since construction.
    pub fn acquisition_count(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }
}

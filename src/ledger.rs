//! Resource values (balances).
//!
//! The coordinator only calls into a ledger while holding the lock of the
//! resource it touches, so implementations need per-value atomicity and
//! nothing more.

use crate::error::{Error, Result};
use crate::transaction::types::ResourceId;
use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, Ordering};

pub trait Ledger: Send + Sync {
    fn contains(&self, resource: ResourceId) -> bool;

    fn get_value(&self, resource: ResourceId) -> Result<i64>;

    /// Adds `delta` and returns the new value. Fails without changing
    /// anything if the value would go negative or overflow.
    fn apply_delta(&self, resource: ResourceId, delta: i64) -> Result<i64>;

    fn resources(&self) -> Vec<ResourceId>;

    /// Sum over every resource. Only meaningful while no operation runs.
    fn total(&self) -> i64 {
        self.resources()
            .into_iter()
            .filter_map(|r| self.get_value(r).ok())
            .sum()
    }
}

/// Fixed set of balances created up front.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    balances: AHashMap<ResourceId, AtomicI64>,
}

impl InMemoryLedger {
    pub fn new(initial: impl IntoIterator<Item = (ResourceId, i64)>) -> Result<Self> {
        let mut balances = AHashMap::new();
        for (resource, value) in initial {
            if value < 0 {
                return Err(Error::InvalidRequest(format!(
                    "Initial value of {} is negative: {}",
                    resource, value
                )));
            }
            if balances.insert(resource, AtomicI64::new(value)).is_some() {
                return Err(Error::InvalidRequest(format!(
                    "Duplicate resource {}",
                    resource
                )));
            }
        }
        Ok(InMemoryLedger { balances })
    }

    fn slot(&self, resource: ResourceId) -> Result<&AtomicI64> {
        self.balances
            .get(&resource)
            .ok_or_else(|| Error::InvalidRequest(format!("Unknown resource {}", resource)))
    }
}

impl Ledger for InMemoryLedger {
    fn contains(&self, resource: ResourceId) -> bool {
        self.balances.contains_key(&resource)
    }

    fn get_value(&self, resource: ResourceId) -> Result<i64> {
        Ok(self.slot(resource)?.load(Ordering::SeqCst))
    }

    fn apply_delta(&self, resource: ResourceId, delta: i64) -> Result<i64> {
        let slot = self.slot(resource)?;
        let current = slot.load(Ordering::SeqCst);
        let next = current
            .checked_add(delta)
            .ok_or_else(|| Error::InvalidRequest(format!("Overflow applying {} to {}", delta, resource)))?;
        if next < 0 {
            return Err(Error::InvalidRequest(format!(
                "{} would go negative: {} + {}",
                resource, current, delta
            )));
        }
        slot.store(next, Ordering::SeqCst);
        Ok(next)
    }

    fn resources(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self.balances.keys().copied().collect();
        ids.sort();
        ids
    }
}

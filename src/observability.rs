//! Operation events, sinks and outcome counters
//!
//! Every coordinator call ends in exactly one `OperationEvent`. Sinks decide
//! where it goes: `TracingSink` logs it, `ChannelSink` hands it to another
//! thread.

use crate::config::LoggingConfig;
use crate::transaction::types::{ContextId, Outcome, ResourceId};
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationEvent {
    pub operation_id: ContextId,
    pub kind: &'static str,
    pub outcome: Outcome,
    pub resources: Vec<ResourceId>,
    #[serde(rename = "elapsed_us", serialize_with = "as_micros")]
    pub elapsed: Duration,
    /// Error message for failed operations
    pub detail: Option<String>,
}

fn as_micros<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_micros() as u64)
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: &OperationEvent);

    /// Called right after `context` takes the lock on `resource`, which was
    /// the `position`-th resource of its operation (0-based). The caller
    /// still holds the lock while this runs.
    fn lock_acquired(&self, _context: ContextId, _resource: ResourceId, _position: usize) {}
}

/// Default sink: one structured tracing event per operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &OperationEvent) {
        let id = event.operation_id;
        let resources = &event.resources;
        let elapsed_us = event.elapsed.as_micros() as u64;
        let detail = event.detail.as_deref().unwrap_or("");

        match event.outcome {
            Outcome::Success => {
                info!(operation_id = %id, kind = event.kind, ?resources, elapsed_us, "operation succeeded")
            }
            Outcome::Unavailable | Outcome::DeadlockDetected => warn!(
                operation_id = %id,
                kind = event.kind,
                outcome = %event.outcome,
                ?resources,
                elapsed_us,
                detail,
                "operation failed"
            ),
            Outcome::InvalidRequest | Outcome::ConfigurationError => debug!(
                operation_id = %id,
                kind = event.kind,
                outcome = %event.outcome,
                ?resources,
                detail,
                "operation rejected"
            ),
            Outcome::InvariantViolation => error!(
                operation_id = %id,
                kind = event.kind,
                ?resources,
                detail,
                "invariant violated"
            ),
        }
    }
}

/// Forwards events over a crossbeam channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: Sender<OperationEvent>,
}

impl ChannelSink {
    pub fn new(sender: Sender<OperationEvent>) -> Self {
        ChannelSink { sender }
    }

    pub fn unbounded() -> (Self, Receiver<OperationEvent>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Self::new(sender), receiver)
    }
}

impl EventSink for ChannelSink {
    fn record(&self, event: &OperationEvent) {
        if self.sender.send(event.clone()).is_err() {
            debug!(operation_id = %event.operation_id, "event receiver gone, dropping event");
        }
    }
}

/// Outcome counters.
#[derive(Debug, Default)]
pub struct ManagerStats {
    success: AtomicU64,
    unavailable: AtomicU64,
    deadlocks: AtomicU64,
    invalid: AtomicU64,
    config_errors: AtomicU64,
    invariant_violations: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub success: u64,
    pub unavailable: u64,
    pub deadlocks: u64,
    pub invalid: u64,
    pub config_errors: u64,
    pub invariant_violations: u64,
    pub detector_probes: u64,
    pub lock_acquisitions: u64,
}

impl StatsSnapshot {
    pub fn total_operations(&self) -> u64 {
        self.success
            + self.unavailable
            + self.deadlocks
            + self.invalid
            + self.config_errors
            + self.invariant_violations
    }
}

impl ManagerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Success => &self.success,
            Outcome::Unavailable => &self.unavailable,
            Outcome::DeadlockDetected => &self.deadlocks,
            Outcome::InvalidRequest => &self.invalid,
            Outcome::ConfigurationError => &self.config_errors,
            Outcome::InvariantViolation => &self.invariant_violations,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Counters only; the coordinator fills in detector and lock totals.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            success: self.success.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
            deadlocks: self.deadlocks.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            config_errors: self.config_errors.load(Ordering::Relaxed),
            invariant_violations: self.invariant_violations.load(Ordering::Relaxed),
            detector_probes: 0,
            lock_acquisitions: 0,
        }
    }
}

/// Installs the global tracing subscriber. `RUST_LOG` wins over the
/// configured level. Returns `false` if a subscriber was already set.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if config.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.is_ok()
}

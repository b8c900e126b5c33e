//! LedgerLock Core
//!
//! Multi-resource operations over exclusively locked resources with
//! proactive deadlock detection. Before an operation blocks on a lock held
//! by another operation, the wait is checked against a shared wait-for
//! graph; a wait that would close a cycle fails fast with
//! `Error::DeadlockDetected` instead of hanging.
//!
//! ```no_run
//! use ledgerlock_core::{ManagerConfig, ResourceId, TransactionCoordinator};
//!
//! let bank = TransactionCoordinator::with_balances(
//!     ManagerConfig::default(),
//!     [(ResourceId(1), 1000), (ResourceId(2), 1000)],
//! )?;
//! bank.transfer(ResourceId(1), ResourceId(2), 200)?;
//! assert_eq!(bank.balance(ResourceId(2))?, 1200);
//! # Ok::<(), ledgerlock_core::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod ledger;
pub mod observability;
pub mod transaction;

pub use config::{ConfigBuilder, LoggingConfig, ManagerConfig};
pub use error::{Error, Result};
pub use ledger::{InMemoryLedger, Ledger};
pub use observability::{init_tracing, ChannelSink, EventSink, OperationEvent, StatsSnapshot, TracingSink};
pub use transaction::{
    AcquisitionOrder, ContextId, DeadlockDetector, DetectionStrategy, Effect, GraphSnapshot,
    Operation, Outcome, ResourceId, TransactionCoordinator, TransferReceipt,
};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

// Transaction System Module
// Lock table, wait-for graph, deadlock detection, coordination

pub mod closure;
pub mod context;
pub mod coordinator;
pub mod deadlock;
pub mod lock_manager;
pub mod types;
pub mod wait_for;

pub use closure::*;
pub use context::*;
pub use coordinator::*;
pub use deadlock::*;
pub use lock_manager::*;
pub use types::*;
pub use wait_for::*;

// Transaction System Types
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static CONTEXT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identity of one operation attempt. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(pub u64);

impl ContextId {
    pub fn new() -> Self {
        ContextId(CONTEXT_ID_COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx:{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub u64);

impl ResourceId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ResourceId {
    fn from(id: u64) -> Self {
        ResourceId(id)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res:{}", self.0)
    }
}

/// Final classification of an operation, as reported to event sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Unavailable,
    DeadlockDetected,
    InvalidRequest,
    ConfigurationError,
    InvariantViolation,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Outcome::Success => "success",
            Outcome::Unavailable => "unavailable",
            Outcome::DeadlockDetected => "deadlock_detected",
            Outcome::InvalidRequest => "invalid_request",
            Outcome::ConfigurationError => "configuration_error",
            Outcome::InvariantViolation => "invariant_violation",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStrategy {
    /// Depth-first search from the new edge's source.
    IncrementalDfs,
    /// Warshall closure over a fixed number of context slots.
    TransitiveClosure,
}

impl Default for DetectionStrategy {
    fn default() -> Self {
        DetectionStrategy::IncrementalDfs
    }
}

impl fmt::Display for DetectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionStrategy::IncrementalDfs => f.write_str("incremental_dfs"),
            DetectionStrategy::TransitiveClosure => f.write_str("transitive_closure"),
        }
    }
}

impl std::str::FromStr for DetectionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_lowercase().as_str() {
            "incremental_dfs" | "dfs" => Ok(DetectionStrategy::IncrementalDfs),
            "transitive_closure" | "closure" | "matrix" => {
                Ok(DetectionStrategy::TransitiveClosure)
            }
            _ => Err(Error::ConfigError(format!("Invalid detection strategy: {}", s))),
        }
    }
}

/// Order in which an operation's resources are locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionOrder {
    /// Exactly the order the caller listed.
    Declared,
    /// Ascending resource id, regardless of how the caller listed them.
    Ascending,
}

impl Default for AcquisitionOrder {
    fn default() -> Self {
        AcquisitionOrder::Declared
    }
}

impl std::str::FromStr for AcquisitionOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_lowercase().as_str() {
            "declared" => Ok(AcquisitionOrder::Declared),
            "ascending" | "asc" => Ok(AcquisitionOrder::Ascending),
            _ => Err(Error::ConfigError(format!("Invalid acquisition order: {}", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_ids_are_unique_and_increasing() {
        let a = ContextId::new();
        let b = ContextId::new();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("dfs".parse::<DetectionStrategy>().unwrap(), DetectionStrategy::IncrementalDfs);
        assert_eq!(
            "Transitive_Closure".parse::<DetectionStrategy>().unwrap(),
            DetectionStrategy::TransitiveClosure
        );
        assert!("bfs".parse::<DetectionStrategy>().is_err());
    }

    #[test]
    fn test_display_formats() {
        assert_eq!(ResourceId(7).to_string(), "res:7");
        assert_eq!(ContextId(3).to_string(), "ctx:3");
        assert_eq!(Outcome::DeadlockDetected.to_string(), "deadlock_detected");
        assert_eq!(DetectionStrategy::TransitiveClosure.to_string(), "transitive_closure");
    }
}

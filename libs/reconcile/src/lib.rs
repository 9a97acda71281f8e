//! Reconciliation primitives.
//!
//! Pure, lock-free helpers used by the controller's per-specification
//! managers. Callers hold their own lock around every mutation:
//!
//! - **Shortfall**: `planned - (actual + pending)`, never negative.
//! - **Scale policy**: the two-tier (elastic / permanent) planned count and
//!   its ceiling.
//! - **Instance numbering**: per-specification numbers, lowest free first.
//!
//! # Invariants
//!
//! - An allocated instance number is never handed out twice until released
//! - `baseline <= planned` after every successful operation
//! - Decisions are deterministic given the same inputs

mod allocator;
mod scale;

use std::time::Duration;

use sha2::{Digest, Sha256};

pub use allocator::InstanceIdAllocator;
pub use scale::{ScaleError, ScalePolicy};

/// Convergence status of one specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// `actual == planned` with nothing pending.
    Converged,

    /// Work is outstanding and expected to land.
    Converging,

    /// Actual state is off target with nothing that would fix it
    /// (uninstantiable requests, or more instances than planned).
    Diverged,

    /// The manager is not running.
    Unknown,
}

impl ConvergenceStatus {
    /// Classify a specification's counts.
    pub fn assess(planned: u32, actual: u32, pending: u32, uninstantiable: u32) -> Self {
        if actual == planned && pending == 0 {
            Self::Converged
        } else if actual > planned || (uninstantiable > 0 && pending <= uninstantiable) {
            Self::Diverged
        } else {
            Self::Converging
        }
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    pub fn is_converging(&self) -> bool {
        matches!(self, Self::Converging)
    }
}

impl std::fmt::Display for ConvergenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Converged => "converged",
            Self::Converging => "converging",
            Self::Diverged => "diverged",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// How many more instances must be requested.
pub fn shortfall(planned: u32, actual: u32, pending: u32) -> u32 {
    planned.saturating_sub(actual.saturating_add(pending))
}

/// A content hash for deterministic comparison of specifications.
///
/// Used to detect when an update actually changes anything.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sorted keys, no whitespace.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}:{}", serde_json::Value::from(k.as_str()), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// Default interval between periodic `verify` passes.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Default priority of provisioning work; lower runs first.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Priority given to re-provisioning a failed instance.
pub const FAILURE_PRIORITY: u8 = 1;

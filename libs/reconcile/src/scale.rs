//! Two-tier planned count.
//!
//! Elastic increments raise `planned` only; permanent increments raise the
//! baseline too. An elastic increment is rolled back by the next
//! non-mandated decrement, which only succeeds while more instances run than
//! the baseline asks for. The ceiling applies to both tiers: an increment
//! that would exceed it is rejected and leaves the policy untouched.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScaleError {
    #[error("planned count is at its ceiling of {ceiling}")]
    CeilingReached { ceiling: u32 },

    #[error("{actual} running instances do not exceed the baseline of {baseline}")]
    AtBaseline { baseline: u32, actual: u32 },
}

/// Planned count plus the baseline elastic changes fall back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalePolicy {
    planned: u32,
    baseline: u32,
}

impl ScalePolicy {
    pub fn new(planned: u32) -> Self {
        Self {
            planned,
            baseline: planned,
        }
    }

    pub fn planned(&self) -> u32 {
        self.planned
    }

    pub fn baseline(&self) -> u32 {
        self.baseline
    }

    /// Replace both tiers, e.g. when a new specification is applied.
    pub fn reset(&mut self, planned: u32) {
        self.planned = planned;
        self.baseline = planned;
    }

    /// Raise `planned` by one; returns the new value.
    pub fn try_increment(&mut self, permanent: bool, ceiling: Option<u32>) -> Result<u32, ScaleError> {
        let next = self.planned.saturating_add(1);
        if let Some(ceiling) = ceiling {
            if next > ceiling {
                return Err(ScaleError::CeilingReached { ceiling });
            }
        }
        self.planned = next;
        if permanent {
            self.baseline = next;
        }
        Ok(next)
    }

    /// Lower `planned` by one given `actual` running instances.
    ///
    /// Without `mandate` this only succeeds while `actual > baseline`. A
    /// mandated decrement always succeeds and drags the baseline down with
    /// it when needed.
    pub fn try_decrement(&mut self, actual: u32, mandate: bool) -> Result<u32, ScaleError> {
        if !mandate && actual <= self.baseline {
            return Err(ScaleError::AtBaseline {
                baseline: self.baseline,
                actual,
            });
        }
        self.planned = self.planned.saturating_sub(1);
        self.baseline = self.baseline.min(self.planned);
        Ok(self.planned)
    }

    /// Lower `planned` by `removed`, the number of requests actually trimmed.
    pub fn trim(&mut self, removed: u32) -> u32 {
        self.planned = self.planned.saturating_sub(removed);
        self.baseline = self.baseline.min(self.planned);
        self.planned
    }
}

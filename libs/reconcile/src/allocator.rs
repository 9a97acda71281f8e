//! Per-specification instance numbering.

use std::collections::BTreeSet;

/// Issues instance numbers starting at 1, lowest free number first.
///
/// A number returns to the free pool only through [`release`], which the
/// owner calls once the instance holding it is fully removed.
///
/// [`release`]: InstanceIdAllocator::release
#[derive(Debug, Clone, Default)]
pub struct InstanceIdAllocator {
    allocated: BTreeSet<u64>,
}

impl InstanceIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lowest unallocated number.
    pub fn allocate(&mut self) -> u64 {
        let mut candidate = 1;
        for taken in &self.allocated {
            if *taken != candidate {
                break;
            }
            candidate += 1;
        }
        self.allocated.insert(candidate);
        candidate
    }

    /// Mark a number as taken, e.g. for a discovered instance.
    /// Returns false if it was already allocated.
    pub fn reserve(&mut self, number: u64) -> bool {
        self.allocated.insert(number)
    }

    pub fn release(&mut self, number: u64) -> bool {
        self.allocated.remove(&number)
    }

    pub fn contains(&self, number: u64) -> bool {
        self.allocated.contains(&number)
    }

    pub fn len(&self) -> usize {
        self.allocated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocated.is_empty()
    }

    pub fn clear(&mut self) {
        self.allocated.clear();
    }
}

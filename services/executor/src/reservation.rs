//! Per-node reservation ledger shared by all containers on a host.
//!
//! A reservation is taken before any startup work and released on
//! teardown. It enforces the per-node caps and tracks the resources the
//! node has promised away.

use std::collections::BTreeMap;
use std::sync::Mutex;

use fleet_proto::{DeployedService, ServiceSpec, SpecKey};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct LedgerState {
    per_spec: BTreeMap<SpecKey, u32>,
    total: u32,
    cpu: f64,
    memory: u64,
}

/// Reservation ledger.
#[derive(Debug)]
pub struct ReservationLedger {
    service_limit: u32,
    state: Mutex<LedgerState>,
}

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Granted,
    /// The node already hosts as many instances of the spec as allowed.
    SpecCapReached { cap: u32 },
    /// The node hosts as many instances as its service limit allows.
    NodeFull { limit: u32 },
}

impl ReservationLedger {
    pub fn new(service_limit: u32) -> Self {
        Self {
            service_limit,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn service_limit(&self) -> u32 {
        self.service_limit
    }

    /// Per-node cap for `spec`: the smaller of max-per-node and planned.
    pub fn cap_for(spec: &ServiceSpec) -> u32 {
        spec.max_per_node.unwrap_or(u32::MAX).min(spec.planned)
    }

    /// Reserve a slot for one instance of `spec`.
    pub fn try_reserve(&self, spec: &ServiceSpec) -> Reservation {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        if state.total >= self.service_limit {
            return Reservation::NodeFull {
                limit: self.service_limit,
            };
        }

        let key = spec.key();
        let cap = Self::cap_for(spec);
        let current = state.per_spec.get(&key).copied().unwrap_or(0);
        if current >= cap {
            return Reservation::SpecCapReached { cap };
        }

        state.per_spec.insert(key.clone(), current + 1);
        state.total += 1;
        state.cpu += spec.constraints.cpu_cores;
        state.memory = state.memory.saturating_add(spec.constraints.memory_bytes);
        debug!(spec = %key, count = current + 1, total = state.total, "Reserved instance slot");
        Reservation::Granted
    }

    /// Return a slot taken by [`try_reserve`](Self::try_reserve).
    pub fn release(&self, spec: &ServiceSpec) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        let key = spec.key();
        match state.per_spec.get_mut(&key) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    state.per_spec.remove(&key);
                }
            }
            _ => {
                warn!(spec = %key, "Released a reservation that was not held");
                return;
            }
        }
        state.total = state.total.saturating_sub(1);
        state.cpu = (state.cpu - spec.constraints.cpu_cores).max(0.0);
        state.memory = state.memory.saturating_sub(spec.constraints.memory_bytes);
    }

    /// Re-price a held reservation after a live update changed constraints.
    pub fn adjust(&self, previous: &ServiceSpec, current: &ServiceSpec) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.cpu = (state.cpu - previous.constraints.cpu_cores + current.constraints.cpu_cores)
            .max(0.0);
        state.memory = state
            .memory
            .saturating_sub(previous.constraints.memory_bytes)
            .saturating_add(current.constraints.memory_bytes);
    }

    pub fn count(&self, key: &SpecKey) -> u32 {
        self.state
            .lock()
            .map(|s| s.per_spec.get(key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.state.lock().map(|s| s.total).unwrap_or(0)
    }

    /// Reserved CPU cores and memory bytes.
    pub fn reserved(&self) -> (f64, u64) {
        self.state
            .lock()
            .map(|s| (s.cpu, s.memory))
            .unwrap_or((0.0, 0))
    }

    /// Per-specification instance counts.
    pub fn deployments(&self) -> Vec<DeployedService> {
        self.state
            .lock()
            .map(|s| {
                s.per_spec
                    .iter()
                    .map(|(key, instances)| DeployedService {
                        key: key.clone(),
                        instances: *instances,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

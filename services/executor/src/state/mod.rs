//! Local state persistence for the executor.
//!
//! This module provides SQLite-based storage for:
//! - The implementation identity and format version that wrote the file
//! - Instance records (specification, instance number, phase)
//!
//! Opening a store written by a different implementation or format is a
//! hard error. Instance rows left behind by a previous run are stale by
//! definition and are cleared at startup.

mod store;

pub use store::{
    implementation_identity, InstancePhase, StateStore, StateStoreError, StoredInstance,
    FORMAT_VERSION,
};

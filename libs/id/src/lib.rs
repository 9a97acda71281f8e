//! # fleet-id
//!
//! Typed identifiers shared by the fleet controller and its executors.
//!
//! ## ID Format
//!
//! ULID-backed identifiers use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `node_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `inst_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `lease_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! The prefix keeps a lease id from ever being accepted where an instance id
//! is expected, and the ULID keeps ids sortable by creation time, which the
//! selector relies on for deterministic tie-breaking.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

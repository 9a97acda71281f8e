//! # fleet-events
//!
//! Lifecycle events published by reconciliation managers and the notifier
//! that fans them out.
//!
//! ## Design Principles
//!
//! - The notifier is an ordinary value owned by process bootstrap and passed
//!   by `Arc` to every component that publishes or subscribes; there is no
//!   process-wide channel.
//! - Every transition (provisioned, failed, terminated) is delivered at most
//!   once to each registered listener. A failing listener is logged and
//!   skipped; delivery is never retried.
//! - Internal consumers that want a stream instead of a callback subscribe to
//!   a broadcast receiver; lagging receivers lose events rather than block
//!   publishers.

mod error;
mod notifier;
mod types;

pub use error::EventError;
pub use notifier::{EventListener, EventNotifier, ListenerHandle, LoggingListener};
pub use types::*;

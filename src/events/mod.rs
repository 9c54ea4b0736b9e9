//! Cluster events: types and broadcast bus.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: the supervisor control loop (`core::supervisor`), spawners
//!   (`process::*`) and `SubscriberSet` workers (overflow/panic).
//! - **Consumers**: the fan-out listener started by `ClusterBuilder::start`.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};

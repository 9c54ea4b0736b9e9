//! # Inside a child: the worker runtime.
//!
//! [`WorkerRuntime`] is the whole life of one child, agent or app worker:
//! boot the hosted unit, report readiness, listen (apps only), serve, and
//! finally resolve to an [`ExitReason`](crate::ExitReason).

mod connection;
mod listen;
mod runtime;

use std::time::Duration;

pub use connection::Connection;
pub use listen::{ListenTarget, Listener};
pub use runtime::WorkerRuntime;

/// Timing knobs the supervisor hands to every child.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Bound on the close sequence after the graceful-stop signal.
    pub grace: Duration,
    /// App workers give up booting after this long (exit 1). The agent only
    /// reports what is still pending and keeps waiting.
    pub start_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(30),
            start_timeout: Duration::from_secs(10),
        }
    }
}

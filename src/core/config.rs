//! # Cluster-wide configuration.
//!
//! [`ClusterConfig`] holds the supervisor's own knobs; [`StartupOptions`](crate::StartupOptions)
//! are what children receive. Timing knobs that children need are derived with
//! [`ClusterConfig::worker_settings`].
//!
//! ## Field semantics
//! - `ready_timeout`: how long each start phase (agent, then the app pool) may take
//!   before cluster start fails with `BootstrapTimeout`.
//! - `start_timeout`: bound on an app worker's own readiness gate (exit 1 past it).
//! - `grace`: each child's close-sequence bound. The supervisor waits
//!   `grace` plus a one-second margin per role before killing, so a child that
//!   overruns exits with its own code 1 rather than racing the kill.
//! - `send_timeout`: bound on one message to a child, sticky handoffs included.
//!   An expired handoff counts as failed and dispatch moves to the next worker.
//! - `bus_capacity`: event ring buffer (minimum 1).
//! - `restart` / `backoff`: replacement of workers that die after start.
//! - `routing`: sticky-mode worker selection.

use std::time::Duration;

use crate::core::router::RoutingPolicy;
use crate::policies::{BackoffPolicy, RestartPolicy};
use crate::worker::WorkerSettings;

const STOP_MARGIN: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub ready_timeout: Duration,
    pub start_timeout: Duration,
    pub grace: Duration,
    pub send_timeout: Duration,
    pub bus_capacity: usize,
    pub restart: RestartPolicy,
    pub backoff: BackoffPolicy,
    pub routing: RoutingPolicy,
}

impl ClusterConfig {
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }

    /// How long the supervisor waits for one role to exit before killing it.
    pub fn stop_window(&self) -> Duration {
        self.grace + STOP_MARGIN
    }

    /// Settings handed to every child.
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            grace: self.grace,
            start_timeout: self.start_timeout,
        }
    }
}

impl Default for ClusterConfig {
    /// `ready_timeout = 10s`, `start_timeout = 10s`, `grace = 30s`,
    /// `send_timeout = 2s`, `bus_capacity = 1024`, `OnFailure` restarts, default backoff, round-robin routing.
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(10),
            start_timeout: Duration::from_secs(10),
            grace: Duration::from_secs(30),
            send_timeout: Duration::from_secs(2),
            bus_capacity: 1024,
            restart: RestartPolicy::default(),
            backoff: BackoffPolicy::default(),
            routing: RoutingPolicy::default(),
        }
    }
}

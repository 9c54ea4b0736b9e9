//! # clustervisor
//!
//! **Clustervisor** runs a server as a small cluster of processes: one master,
//! one agent process for background duties, and N application workers that
//! accept connections. It provides the readiness handshake between them, sticky
//! connection dispatch, crash replacement, and a graceful exit contract that
//! every process follows.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!                       ┌──────────────────────────────────────────┐
//!   Cluster handle ───► │  master: Supervisor control loop         │
//!   (stop, workers,     │  - Pool (live children by id)            │
//!    reload_logs)       │  - ReadinessGate per start phase         │
//!                       │  - Router (sticky mode)                  │
//!                       │  - Bus ──► SubscriberSet ──► Subscribe   │
//!                       └───────┬─────────────────┬────────────────┘
//!                        spawn  │ IPC             │ IPC (+ fd handoff)
//!                               ▼                 ▼
//!                     ┌────────────────┐  ┌────────────────┐ ┌────────────────┐
//!                     │ agent_worker#0 │  │ app_worker#1   │ │ app_worker#N   │
//!                     │ WorkerRuntime  │  │ WorkerRuntime  │ │ WorkerRuntime  │
//!                     │ + HostedUnit   │  │ + HostedUnit   │ │ + HostedUnit   │
//!                     │ GracefulExit   │  │ GracefulExit   │ │ GracefulExit   │
//!                     └────────────────┘  └────────────────┘ └────────────────┘
//! ```
//!
//! ### Lifecycle
//! ```text
//! validate options
//!   └─► spawn agent ─► worker-ready ─► spawn N apps ─► N × (worker-ready, realport)
//!         └─► ClusterReady                          (any failure ─► teardown ─► Err)
//!
//! steady state: crash ─► RestartPolicy ─► backoff ─► respawn into the same slot
//!               sticky accept ─► Router ─► handoff (SCM_RIGHTS) ─► worker serves
//!
//! stop: SIGTERM apps ─► ≤ grace ─► SIGTERM agent ─► ≤ grace ─► kill stragglers
//! ```
//!
//! Children exit `0` after a graceful stop, `1` on a startup error or an
//! overrun grace window, and `110` when their parent channel disappears.
//!
//! ## Features
//! | Area              | Description                                                  | Key types / traits                          |
//! |-------------------|--------------------------------------------------------------|---------------------------------------------|
//! | **Cluster**       | Start, inspect, reload logs, stop.                           | [`Cluster`], [`ClusterBuilder`]             |
//! | **Hosted code**   | What a child runs and how it reports readiness.              | [`Framework`], [`HostedUnit`], [`ReadinessGate`] |
//! | **Exit contract** | Close callbacks, grace window, exit codes.                   | [`GracefulExit`], [`ExitReason`]            |
//! | **Policies**      | Replacement of crashed workers.                              | [`RestartPolicy`], [`BackoffPolicy`]        |
//! | **Events**        | Lifecycle events for logging, metrics, tests.                | [`Subscribe`], [`Event`], [`LogWriter`]     |
//! | **Configuration** | Child-visible options and master knobs.                      | [`StartupOptions`], [`ClusterConfig`]       |
//!
//! ## Example
//! ```rust
//! use clustervisor::{Cluster, RawOptions, WorkerState};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = RawOptions {
//!         framework: Some("echo".into()),
//!         port: Some("0".into()),
//!         workers: Some(2),
//!         ..Default::default()
//!     }
//!     .normalize()?;
//!
//!     // In-process children: no fork, same runtime.
//!     let cluster = Cluster::builder(options).in_process().start().await?;
//!     let listening = cluster
//!         .workers()
//!         .await
//!         .iter()
//!         .filter(|w| w.state == WorkerState::Listening)
//!         .count();
//!     assert_eq!(listening, 2);
//!
//!     cluster.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! Binaries that use real child processes must call [`run_if_child`] first
//! thing in `main`; see the [`child`] module docs.

pub mod child;
mod core;
mod error;
mod events;
pub mod frameworks;
mod gate;
mod graceful;
pub mod ipc;
mod options;
mod policies;
pub mod process;
mod subscribers;
mod unit;
pub mod worker;

#[cfg(test)]
mod testing;

// ---- Public re-exports ----

pub use child::run_if_child;
pub use core::{Cluster, ClusterBuilder, ClusterConfig, RoutingPolicy, WorkerInfo, WorkerState};
pub use error::{BootError, GateError, IpcError, ShutdownError, StartupError, ValidationError};
pub use events::{Bus, Event, EventKind};
pub use gate::{GateOutcome, ReadinessGate};
pub use graceful::{CloseError, CloseRegistry, ExitReason, ExitTrigger, GracefulExit};
pub use options::{RawOptions, StartupOptions};
pub use policies::{BackoffPolicy, JitterPolicy, RestartPolicy};
pub use subscribers::{LogWriter, Subscribe, SubscriberSet};
pub use unit::{Framework, Frameworks, HostedUnit, ListenConfig, TlsMaterial, UnitContext};

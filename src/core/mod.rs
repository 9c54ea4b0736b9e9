//! Master-side core: the supervisor and its public handle.
//!
//! Internal modules:
//! - [`builder`]: validates options, wires the bus and the spawner, runs start;
//! - [`cluster`]: the [`Cluster`] handle (stop, snapshots, log reload);
//! - [`supervisor`]: the single control loop that owns every child;
//! - [`pool`]: the supervisor's table of live children;
//! - [`router`]: sticky-mode worker selection.

mod builder;
mod cluster;
mod config;
mod pool;
mod router;
mod supervisor;

#[cfg(test)]
mod tests;

pub use builder::ClusterBuilder;
pub use cluster::Cluster;
pub use config::ClusterConfig;
pub use pool::{WorkerInfo, WorkerState};
pub use router::RoutingPolicy;

//! Respawn policies for workers that die after the cluster is ready.
//!
//! - [`RestartPolicy`]: whether a dead worker is replaced.
//! - [`BackoffPolicy`]: how long to wait before replacing it.
//! - [`JitterPolicy`]: randomization of that wait.
//!
//! ## Defaults
//! `OnFailure`, first=500ms, factor=2.0, max=30s, `Equal` jitter, stable after 60s.

mod backoff;
mod jitter;
mod restart;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
pub use restart::RestartPolicy;

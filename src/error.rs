//! Error types used by the cluster supervisor, the child runtime and IPC.
//!
//! - [`StartupError`] / [`ValidationError`]: surfaced synchronously by cluster start.
//! - [`ShutdownError`]: the memoized outcome of `Cluster::stop`.
//! - [`BootError`]: a hosted unit failed (or timed out) while booting inside a child.
//! - [`GateError`]: misuse of a [`ReadinessGate`](crate::ReadinessGate).
//! - [`IpcError`]: parent/child channel failures.
//!
//! Every enum exposes `as_label()`, a short stable snake_case label for logs.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Bad [`StartupOptions`](crate::StartupOptions); nothing was spawned.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// `workers` resolved to zero.
    #[error("workers should be at least 1")]
    NoWorkers,

    /// `https` is on but a key or cert path is missing.
    #[error("options.{which} should be set when https is enabled")]
    MissingTls { which: &'static str },

    /// The key or cert path does not exist or cannot be read.
    #[error("options.{which} should exist and be readable: {}", .path.display())]
    UnreadableTls { which: &'static str, path: PathBuf },

    /// The framework identifier did not resolve.
    #[error("framework '{0}' cannot be resolved")]
    UnknownFramework(String),

    /// `baseDir` is not a directory.
    #[error("baseDir {} should exist", .0.display())]
    BaseDirMissing(PathBuf),

    /// `port` is not a valid TCP port.
    #[error("port should be a number in 0..=65535, got {0}")]
    InvalidPort(String),
}

impl ValidationError {
    pub fn as_label(&self) -> &'static str {
        match self {
            ValidationError::NoWorkers => "validation_no_workers",
            ValidationError::MissingTls { .. } => "validation_missing_tls",
            ValidationError::UnreadableTls { .. } => "validation_unreadable_tls",
            ValidationError::UnknownFramework(_) => "validation_unknown_framework",
            ValidationError::BaseDirMissing(_) => "validation_base_dir_missing",
            ValidationError::InvalidPort(_) => "validation_invalid_port",
        }
    }
}

/// # Errors returned by cluster start.
///
/// Whenever one of these is returned after children were spawned, every child
/// has already been torn down.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum StartupError {
    /// Options rejected before any spawn.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The OS (or the in-process spawner) refused to start a child.
    #[error("[{who}] spawn failed: {reason}")]
    Spawn { who: String, reason: String },

    /// A child failed (exited, or reported an error) before it was ready.
    #[error("[{who}] start error: {reason}")]
    Bootstrap { who: String, reason: String },

    /// Readiness did not arrive within the configured window.
    #[error("[{who}] start timeout after {timeout:?}; pending: {pending:?}")]
    BootstrapTimeout {
        who: String,
        timeout: Duration,
        pending: Vec<String>,
    },

    /// The sticky listening socket could not be bound.
    #[error("sticky listener on port {port} failed: {reason}")]
    Listen { port: u16, reason: String },
}

impl StartupError {
    pub fn as_label(&self) -> &'static str {
        match self {
            StartupError::Validation(v) => v.as_label(),
            StartupError::Spawn { .. } => "startup_spawn_failed",
            StartupError::Bootstrap { .. } => "startup_bootstrap_error",
            StartupError::BootstrapTimeout { .. } => "startup_bootstrap_timeout",
            StartupError::Listen { .. } => "startup_listen_failed",
        }
    }
}

/// # Errors produced by cluster shutdown.
///
/// `Clone` so that repeated `stop()` calls can return the first outcome.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
    /// Some children did not exit within the grace window and were killed.
    #[error("shutdown timeout {grace:?} exceeded; stuck: {stuck:?}; killed")]
    GraceExceeded { grace: Duration, stuck: Vec<String> },

    /// The supervisor control loop is gone (panicked or already torn down).
    #[error("supervisor control loop is gone")]
    SupervisorGone,
}

impl ShutdownError {
    pub fn as_label(&self) -> &'static str {
        match self {
            ShutdownError::GraceExceeded { .. } => "shutdown_grace_exceeded",
            ShutdownError::SupervisorGone => "shutdown_supervisor_gone",
        }
    }
}

/// # Hosted-unit bootstrap failures inside a child.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BootError {
    /// Construction or readiness emitted an error.
    #[error("start error: {reason}")]
    Failed { reason: String },

    /// The unit's readiness gate expired (`startTimeout`).
    #[error("start timeout; pending: {pending:?}")]
    StartTimeout { pending: Vec<String> },
}

impl BootError {
    /// Shorthand for [`BootError::Failed`].
    pub fn failed(reason: impl Into<String>) -> Self {
        BootError::Failed {
            reason: reason.into(),
        }
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            BootError::Failed { .. } => "boot_failed",
            BootError::StartTimeout { .. } => "boot_start_timeout",
        }
    }
}

/// # Readiness gate misuse.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("[{gate}] task '{key}' already completed")]
    AlreadyCompleted { gate: String, key: String },

    #[error("[{gate}] task '{key}' already registered")]
    AlreadyRegistered { gate: String, key: String },

    #[error("[{gate}] task '{key}' was never registered")]
    UnknownKey { gate: String, key: String },

    #[error("[{gate}] gate already fired")]
    AlreadyFired { gate: String },
}

impl GateError {
    pub fn as_label(&self) -> &'static str {
        match self {
            GateError::AlreadyCompleted { .. } => "gate_already_completed",
            GateError::AlreadyRegistered { .. } => "gate_already_registered",
            GateError::UnknownKey { .. } => "gate_unknown_key",
            GateError::AlreadyFired { .. } => "gate_already_fired",
        }
    }
}

/// # Parent/child channel failures.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum IpcError {
    /// The peer is gone (EOF, dropped receiver, exited handle).
    #[error("channel closed")]
    Closed,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),

    /// The peer did not take the message in time.
    #[error("send timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Encoded message does not fit in one datagram.
    #[error("message of {0} bytes exceeds the datagram limit")]
    Oversized(usize),
}

impl IpcError {
    pub fn as_label(&self) -> &'static str {
        match self {
            IpcError::Closed => "ipc_closed",
            IpcError::Io(_) => "ipc_io",
            IpcError::Codec(_) => "ipc_codec",
            IpcError::Timeout(_) => "ipc_timeout",
            IpcError::Oversized(_) => "ipc_oversized",
        }
    }
}

impl From<nix::Error> for IpcError {
    fn from(e: nix::Error) -> Self {
        IpcError::Io(std::io::Error::from(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_diagnostic_names_the_child() {
        let err = StartupError::Bootstrap {
            who: "app_worker#2".into(),
            reason: "exited with code 1".into(),
        };
        assert_eq!(err.as_label(), "startup_bootstrap_error");
        assert!(err.to_string().contains("app_worker#2"));
    }

    #[test]
    fn validation_label_passes_through() {
        let err: StartupError = ValidationError::NoWorkers.into();
        assert_eq!(err.as_label(), "validation_no_workers");
    }
}

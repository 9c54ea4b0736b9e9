//! # Child processes as the supervisor sees them.
//!
//! A [`Spawner`] starts one child of a given [`Role`] and returns a
//! [`ChildControl`] handle. Everything the child says afterwards, and finally its
//! exit, arrives on the supervisor's single [`ProcessEvent`] queue:
//!
//! ```text
//! Spawner::spawn(role, id) ──► ChildControl { send, stop, kill }
//!         │
//!         └── forwarder ──► ProcessEvent { id, Message(..) }*  then  { id, Exited(code) }
//! ```
//!
//! ## Rules
//! - Per child, messages are delivered in order and `Exited` is always last.
//! - `Exited(None)` means the child was killed (no exit status).
//! - [`ProcessSpawner`] re-executes the current binary; [`LocalSpawner`] hosts
//!   the child runtime on tokio tasks in this process.

mod local;
mod os;

use std::fmt;
use std::io;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::IpcError;
use crate::ipc::{Envelope, Message};
use crate::options::StartupOptions;

pub use local::LocalSpawner;
pub use os::{ENV_GRACE_MS, ENV_IPC_FD, ENV_ROLE, ENV_START_TIMEOUT_MS, ENV_WORKER_ID, ProcessSpawner};

/// Child kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    /// The single background process, started before any app worker.
    Agent,
    /// One of `workers` connection-serving processes.
    App,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Agent => "agent",
            Role::App => "app",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agent" => Some(Role::Agent),
            "app" => Some(Role::App),
            _ => None,
        }
    }

    /// `agent_worker#0` / `app_worker#3`.
    pub fn worker_label(self, id: WorkerId) -> String {
        format!("{}_worker#{}", self.as_str(), id)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supervisor-assigned child id; never reused within one supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug)]
pub enum ChildEvent {
    Message(Message),
    Exited(Option<i32>),
}

/// One entry of the supervisor's event queue.
#[derive(Debug)]
pub struct ProcessEvent {
    pub id: WorkerId,
    pub event: ChildEvent,
}

/// Handle to one running child.
#[async_trait]
pub trait ChildControl: Send + Sync {
    /// OS pid, or a synthetic pid for in-process children.
    fn pid(&self) -> u32;

    async fn send(&self, envelope: Envelope) -> Result<(), IpcError>;

    /// Delivers the graceful-stop signal.
    fn stop(&self) -> io::Result<()>;

    /// Terminates the child without giving it a chance to clean up.
    fn kill(&self) -> io::Result<()>;
}

/// Starts children.
#[async_trait]
pub trait Spawner: Send + Sync + 'static {
    async fn spawn(
        &self,
        role: Role,
        id: WorkerId,
        options: &StartupOptions,
        events: mpsc::Sender<ProcessEvent>,
    ) -> io::Result<Box<dyn ChildControl>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels() {
        assert_eq!(Role::App.worker_label(WorkerId(3)), "app_worker#3");
        assert_eq!(Role::Agent.worker_label(WorkerId(0)), "agent_worker#0");
        assert_eq!(Role::parse("agent"), Some(Role::Agent));
        assert_eq!(Role::parse("master"), None);
    }
}

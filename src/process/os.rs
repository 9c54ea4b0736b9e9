//! Real child processes: the current binary re-executed with a role.
//!
//! The child finds its role, id and channel in the environment and the
//! serialized [`StartupOptions`] as its only argument. Its end of the socketpair
//! is installed as fd [`CHILD_IPC_FD`] between `fork` and `exec`.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, dup2};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ChildControl, ChildEvent, ProcessEvent, Role, Spawner, WorkerId};
use crate::error::IpcError;
use crate::ipc::{Envelope, Outbound, socket};
use crate::options::StartupOptions;
use crate::worker::WorkerSettings;

pub const ENV_ROLE: &str = "CLUSTERVISOR_ROLE";
pub const ENV_WORKER_ID: &str = "CLUSTERVISOR_WORKER_ID";
pub const ENV_IPC_FD: &str = "CLUSTERVISOR_IPC_FD";
pub const ENV_GRACE_MS: &str = "CLUSTERVISOR_GRACE_MS";
pub const ENV_START_TIMEOUT_MS: &str = "CLUSTERVISOR_START_TIMEOUT_MS";

/// Fd number of the parent channel inside every child.
pub(crate) const CHILD_IPC_FD: RawFd = 3;

/// Spawns children by re-executing `program`.
#[derive(Clone, Debug)]
pub struct ProcessSpawner {
    program: PathBuf,
    settings: WorkerSettings,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>, settings: WorkerSettings) -> Self {
        Self {
            program: program.into(),
            settings,
        }
    }

    /// Re-executes the running binary, which must call
    /// [`run_if_child`](crate::run_if_child) first thing in `main`.
    pub fn current_exe(settings: WorkerSettings) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, settings))
    }
}

#[async_trait]
impl Spawner for ProcessSpawner {
    async fn spawn(
        &self,
        role: Role,
        id: WorkerId,
        options: &StartupOptions,
        events: mpsc::Sender<ProcessEvent>,
    ) -> io::Result<Box<dyn ChildControl>> {
        let arg = options.to_arg().map_err(io::Error::other)?;
        let (parent_fd, child_fd) = socket::pair()?;

        let mut cmd = Command::new(&self.program);
        cmd.arg(arg)
            .env(ENV_ROLE, role.as_str())
            .env(ENV_WORKER_ID, id.to_string())
            .env(ENV_IPC_FD, CHILD_IPC_FD.to_string())
            .env(ENV_GRACE_MS, self.settings.grace.as_millis().to_string())
            .env(
                ENV_START_TIMEOUT_MS,
                self.settings.start_timeout.as_millis().to_string(),
            )
            .current_dir(&options.base_dir)
            .stdin(Stdio::null());

        let raw = child_fd.as_raw_fd();
        // SAFETY: the hook only calls fcntl/dup2, both async-signal-safe.
        unsafe {
            cmd.pre_exec(move || install_channel(raw));
        }
        let mut child = cmd.spawn()?;
        drop(child_fd);

        let pid = child.id().unwrap_or_default();
        let link = socket::endpoint(parent_fd)?;
        let tx = link.tx;
        let mut inbox = link.rx;
        debug!(worker = %role.worker_label(id), pid, "child process started");

        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                let event = ProcessEvent {
                    id,
                    event: ChildEvent::Message(envelope.message),
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(_) => None,
            };
            let _ = events
                .send(ProcessEvent {
                    id,
                    event: ChildEvent::Exited(code),
                })
                .await;
        });

        Ok(Box::new(OsChild { pid, tx }))
    }
}

/// Makes the child's end of the socketpair survive `exec` as fd 3.
fn install_channel(raw: RawFd) -> io::Result<()> {
    if raw == CHILD_IPC_FD {
        socket::set_cloexec(raw, false)?;
    } else {
        dup2(raw, CHILD_IPC_FD)?;
    }
    Ok(())
}

struct OsChild {
    pid: u32,
    tx: Arc<dyn Outbound>,
}

impl OsChild {
    fn signal(&self, sig: Signal) -> io::Result<()> {
        let pid = i32::try_from(self.pid).map_err(io::Error::other)?;
        kill(Pid::from_raw(pid), sig).map_err(io::Error::from)
    }
}

#[async_trait]
impl ChildControl for OsChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn send(&self, envelope: Envelope) -> Result<(), IpcError> {
        self.tx.send(envelope).await
    }

    fn stop(&self) -> io::Result<()> {
        self.signal(Signal::SIGTERM)
    }

    fn kill(&self) -> io::Result<()> {
        self.signal(Signal::SIGKILL)
    }
}

//! In-process children: the real [`WorkerRuntime`] on tokio tasks.
//!
//! Used by embedders that want one process and by the test-suite. The mapping to
//! process semantics:
//! - `stop()` feeds [`ExitTrigger::Signal`] to the child's graceful-exit machine.
//! - `kill()` aborts the child task (and with it every task it owns); the exit
//!   code is `None`, like a `SIGKILL`ed process.
//! - The exit code is the child's [`ExitReason::code`](crate::ExitReason::code).

use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::{ChildControl, ChildEvent, ProcessEvent, Role, Spawner, WorkerId};
use crate::error::IpcError;
use crate::graceful::ExitTrigger;
use crate::ipc::{self, Envelope, Outbound};
use crate::options::StartupOptions;
use crate::unit::Frameworks;
use crate::worker::{WorkerRuntime, WorkerSettings};

/// First synthetic pid; far above what tests could confuse with real ones.
const FIRST_PID: u32 = 1 << 22;

/// Hosts children as tasks of the current runtime.
#[derive(Clone)]
pub struct LocalSpawner {
    frameworks: Frameworks,
    settings: WorkerSettings,
    next_pid: Arc<AtomicU32>,
    alive: Arc<AtomicUsize>,
}

impl LocalSpawner {
    pub fn new(frameworks: Frameworks, settings: WorkerSettings) -> Self {
        Self {
            frameworks,
            settings,
            next_pid: Arc::new(AtomicU32::new(FIRST_PID)),
            alive: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Children spawned by this spawner that have not exited yet.
    pub fn alive(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Spawner for LocalSpawner {
    async fn spawn(
        &self,
        role: Role,
        id: WorkerId,
        options: &StartupOptions,
        events: mpsc::Sender<ProcessEvent>,
    ) -> io::Result<Box<dyn ChildControl>> {
        let (parent, child) = ipc::local::pair();
        let (triggers_tx, triggers_rx) = mpsc::channel(8);

        let runtime = WorkerRuntime::new(
            role,
            id,
            Arc::new(options.clone()),
            self.frameworks.clone(),
            self.settings.clone(),
        );
        let mut task = tokio::spawn(runtime.run(child, triggers_tx.clone(), triggers_rx));
        let abort = task.abort_handle();

        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        self.alive.fetch_add(1, Ordering::SeqCst);
        let alive = self.alive.clone();
        let mut inbox = parent.rx;

        tokio::spawn(async move {
            let joined = loop {
                tokio::select! {
                    biased;
                    envelope = inbox.recv() => match envelope {
                        Some(envelope) => {
                            let _ = events.send(ProcessEvent { id, event: ChildEvent::Message(envelope.message) }).await;
                        }
                        None => break (&mut task).await,
                    },
                    joined = &mut task => break joined,
                }
            };
            // messages sent right before exiting still go first
            while let Ok(envelope) = inbox.try_recv() {
                let _ = events
                    .send(ProcessEvent {
                        id,
                        event: ChildEvent::Message(envelope.message),
                    })
                    .await;
            }
            let code = joined.ok().map(|reason| reason.code());
            alive.fetch_sub(1, Ordering::SeqCst);
            let _ = events
                .send(ProcessEvent {
                    id,
                    event: ChildEvent::Exited(code),
                })
                .await;
        });

        Ok(Box::new(LocalChild {
            pid,
            tx: parent.tx,
            triggers: triggers_tx,
            abort,
        }))
    }
}

struct LocalChild {
    pid: u32,
    tx: Arc<dyn Outbound>,
    triggers: mpsc::Sender<ExitTrigger>,
    abort: AbortHandle,
}

#[async_trait]
impl ChildControl for LocalChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn send(&self, envelope: Envelope) -> Result<(), IpcError> {
        self.tx.send(envelope).await
    }

    fn stop(&self) -> io::Result<()> {
        self.triggers
            .try_send(ExitTrigger::Signal)
            .map_err(|_| io::Error::from(io::ErrorKind::NotConnected))
    }

    fn kill(&self) -> io::Result<()> {
        self.abort.abort();
        Ok(())
    }
}

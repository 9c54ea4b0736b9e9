use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::sync::{OnceCell, broadcast, mpsc, oneshot};
use tracing::{error, info};

use super::builder::{ClusterBuilder, Fanout};
use super::pool::WorkerInfo;
use super::supervisor::Command;
use crate::error::ShutdownError;
use crate::events::{Bus, Event};
use crate::graceful::wait_for_shutdown_signal;
use crate::options::StartupOptions;

/// Handle to a started cluster.
///
/// Dropping the handle stops the cluster in the background; call
/// [`stop`](Cluster::stop) to wait for it and learn how it went.
pub struct Cluster {
    commands: mpsc::Sender<Command>,
    bus: Bus,
    sticky_addr: Option<SocketAddr>,
    fanout: Mutex<Option<Fanout>>,
    stopped: OnceCell<Result<(), ShutdownError>>,
}

impl Cluster {
    pub fn builder(options: StartupOptions) -> ClusterBuilder {
        ClusterBuilder::new(options)
    }

    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        bus: Bus,
        sticky_addr: Option<SocketAddr>,
        fanout: Fanout,
    ) -> Self {
        Self {
            commands,
            bus,
            sticky_addr,
            fanout: Mutex::new(Some(fanout)),
            stopped: OnceCell::new(),
        }
    }

    /// Address of the supervisor-owned listener in sticky mode.
    pub fn sticky_addr(&self) -> Option<SocketAddr> {
        self.sticky_addr
    }

    /// Raw event stream. Subscribers registered on the builder are the
    /// non-blocking alternative.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    /// Snapshot of every live child; empty once the cluster is stopped.
    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Workers(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Asks every child to reopen its logs.
    pub async fn reload_logs(&self) {
        let _ = self.commands.send(Command::ReloadLogs).await;
    }

    /// Stops app workers, then the agent, each within the grace window.
    ///
    /// Idempotent: later calls (concurrent ones included) wait for and return
    /// the outcome of the first.
    pub async fn stop(&self) -> Result<(), ShutdownError> {
        self.stopped
            .get_or_init(|| async {
                let (tx, rx) = oneshot::channel();
                let res = match self.commands.send(Command::Stop(tx)).await {
                    Ok(()) => rx.await.unwrap_or(Err(ShutdownError::SupervisorGone)),
                    Err(_) => Err(ShutdownError::SupervisorGone),
                };
                let fanout = self.fanout.lock().ok().and_then(|mut f| f.take());
                if let Some(fanout) = fanout {
                    fanout.flush().await;
                }
                res
            })
            .await
            .clone()
    }

    /// Serves until SIGINT/SIGTERM, then stops.
    pub async fn run_until_signal(&self) -> Result<(), ShutdownError> {
        match wait_for_shutdown_signal().await {
            Ok(()) => info!("[master] stop signal received"),
            Err(e) => error!(error = %e, "[master] cannot watch stop signals, stopping"),
        }
        self.stop().await
    }
}

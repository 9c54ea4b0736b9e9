use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use super::cluster::Cluster;
use super::config::ClusterConfig;
use super::supervisor::Supervisor;
use crate::error::StartupError;
use crate::events::Bus;
use crate::frameworks;
use crate::options::StartupOptions;
use crate::process::{LocalSpawner, ProcessSpawner, Spawner};
use crate::subscribers::{Subscribe, SubscriberSet};
use crate::unit::Frameworks;

const COMMAND_QUEUE: usize = 16;

/// Builder for a [`Cluster`].
///
/// ```no_run
/// use clustervisor::{Cluster, RawOptions};
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let options = RawOptions {
///     framework: Some("echo".into()),
///     workers: Some(2),
///     ..Default::default()
/// }
/// .normalize()?;
///
/// let cluster = Cluster::builder(options).start().await?;
/// cluster.run_until_signal().await?;
/// # Ok(())
/// # }
/// ```
pub struct ClusterBuilder {
    options: StartupOptions,
    cfg: ClusterConfig,
    frameworks: Frameworks,
    spawner: Option<Arc<dyn Spawner>>,
    in_process: bool,
    subscribers: Vec<Arc<dyn Subscribe>>,
}

impl ClusterBuilder {
    pub fn new(options: StartupOptions) -> Self {
        Self {
            options,
            cfg: ClusterConfig::default(),
            frameworks: frameworks::builtin(),
            spawner: None,
            in_process: false,
            subscribers: Vec::new(),
        }
    }

    pub fn with_config(mut self, cfg: ClusterConfig) -> Self {
        self.cfg = cfg;
        self
    }

    /// Frameworks that `options.framework` is resolved against. Children resolve
    /// the name again on their side, so a re-executed binary must register the
    /// same set.
    pub fn with_frameworks(mut self, frameworks: Frameworks) -> Self {
        self.frameworks = frameworks;
        self
    }

    /// Event subscribers; each gets its own bounded queue and worker task.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Custom child spawner. The default re-executes the current binary.
    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Hosts every child as tasks of this process ([`LocalSpawner`]).
    pub fn in_process(mut self) -> Self {
        self.in_process = true;
        self
    }

    /// Validates, spawns and waits for the whole cluster to be ready.
    ///
    /// On `Err`, no child is left running.
    pub async fn start(self) -> Result<Cluster, StartupError> {
        self.options.validate(&self.frameworks)?;

        let bus = Bus::new(self.cfg.bus_capacity_clamped());
        let fanout = Fanout::spawn(&bus, SubscriberSet::new(self.subscribers, bus.clone()));

        let spawner: Arc<dyn Spawner> = match (self.spawner, self.in_process) {
            (Some(spawner), _) => spawner,
            (None, true) => Arc::new(LocalSpawner::new(
                self.frameworks.clone(),
                self.cfg.worker_settings(),
            )),
            (None, false) => match ProcessSpawner::current_exe(self.cfg.worker_settings()) {
                Ok(spawner) => Arc::new(spawner),
                Err(e) => {
                    fanout.flush().await;
                    return Err(StartupError::Spawn {
                        who: "master".into(),
                        reason: e.to_string(),
                    });
                }
            },
        };

        let listener = if self.options.sticky {
            match TcpListener::bind(("0.0.0.0", self.options.port)).await {
                Ok(l) => Some(l),
                Err(e) => {
                    fanout.flush().await;
                    return Err(StartupError::Listen {
                        port: self.options.port,
                        reason: e.to_string(),
                    });
                }
            }
        } else {
            None
        };
        let sticky_addr: Option<SocketAddr> = listener.as_ref().and_then(|l| l.local_addr().ok());

        let (mut sup, mut inputs) =
            Supervisor::new(Arc::new(self.options), self.cfg, spawner, bus.clone());
        if let Err(e) = sup.start(&mut inputs).await {
            drop(sup);
            fanout.flush().await;
            return Err(e);
        }

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        tokio::spawn(sup.run(inputs, listener, commands_rx));
        Ok(Cluster::new(commands_tx, bus, sticky_addr, fanout))
    }
}

/// Bus → subscriber fan-out task, flushable on demand.
pub(crate) struct Fanout {
    flush: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Fanout {
    fn spawn(bus: &Bus, set: SubscriberSet) -> Self {
        let mut rx = bus.subscribe();
        let (flush, mut flush_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    ev = rx.recv() => match ev {
                        Ok(ev) => set.emit(&ev),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "subscriber fan-out lagged behind the bus");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = &mut flush_rx => {
                        while let Ok(ev) = rx.try_recv() {
                            set.emit(&ev);
                        }
                        break;
                    }
                }
            }
            set.shutdown().await;
        });
        Self { flush, task }
    }

    /// Delivers everything published so far, then stops the subscriber workers.
    pub(crate) async fn flush(self) {
        let _ = self.flush.send(());
        let _ = self.task.await;
    }
}

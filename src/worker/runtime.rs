//! # WorkerRuntime: boot → ready → listen → serve, raced against GracefulExit.
//!
//! ```text
//!  run()
//!   ├─ GracefulExit::watch(triggers) ─────────────────────────────► ExitReason
//!   ├─ inbox loop: sticky handoffs → adopt queue, log-reload → unit,
//!   │              inbox closed → ExitTrigger::Disconnect
//!   └─ start:
//!        framework → unit → boot(ctx) → gate
//!          Ready          → send worker-ready
//!          Failed/TimedOut → exit 1
//!        (app) bind → register "server" closer → send realport → accept/adopt loop
//! ```
//!
//! ## Rules
//! - The graceful-exit machine is installed first and is never bypassed, so a
//!   stop or a lost parent is honored even mid-boot.
//! - Startup failures (unit construction, `boot`, gate failure, app start timeout,
//!   bind) end the process with code 1. Once ready is sent they are no longer watched.
//! - The server closer is registered after the unit's own closers, so the server
//!   stops accepting before anything else closes.
//! - Adopted connections are served exactly like accepted ones, also after the
//!   server closer shut the listener: a draining worker still serves what the
//!   supervisor already handed it.
//! - The inbox never waits on the adopt queue; a handoff that finds it full is
//!   dropped so `log-reload` and parent loss are still noticed.

use std::convert::Infallible;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Connection, ListenTarget, Listener, WorkerSettings};
use crate::error::BootError;
use crate::gate::{GateOutcome, ReadinessGate};
use crate::graceful::{CloseRegistry, ExitReason, ExitTrigger, GracefulExit};
use crate::ipc::{Endpoint, Envelope, Message, Outbound, Target};
use crate::options::StartupOptions;
use crate::process::{Role, WorkerId};
use crate::unit::{Frameworks, HostedUnit, TlsMaterial, UnitContext};

const ADOPT_QUEUE: usize = 256;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type UnitSlot = Arc<OnceLock<Arc<dyn HostedUnit>>>;

pub struct WorkerRuntime {
    role: Role,
    id: WorkerId,
    options: Arc<StartupOptions>,
    frameworks: Frameworks,
    settings: WorkerSettings,
}

impl WorkerRuntime {
    pub fn new(
        role: Role,
        id: WorkerId,
        options: Arc<StartupOptions>,
        frameworks: Frameworks,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            role,
            id,
            options,
            frameworks,
            settings,
        }
    }

    /// Runs the child to completion.
    ///
    /// `triggers_tx` is the sending side of `triggers`; the runtime uses it to
    /// report a closed parent channel.
    pub async fn run(
        self,
        link: Endpoint,
        triggers_tx: mpsc::Sender<ExitTrigger>,
        triggers: mpsc::Receiver<ExitTrigger>,
    ) -> ExitReason {
        let label = self.role.worker_label(self.id);
        let closers = CloseRegistry::new();
        let graceful =
            GracefulExit::new(label.clone(), closers.clone(), self.settings.grace).watch(triggers);

        let Endpoint { tx: parent, rx: inbox } = link;
        let (adopt_tx, adopt_rx) = mpsc::channel(ADOPT_QUEUE);
        let unit: UnitSlot = Arc::new(OnceLock::new());

        let mut background = JoinSet::new();
        background.spawn(inbox_loop(
            label.clone(),
            inbox,
            triggers_tx,
            adopt_tx,
            unit.clone(),
        ));

        info!(worker = %label, pid = std::process::id(), "starting");
        tokio::select! {
            reason = graceful => reason,
            res = self.start(&label, parent, closers, adopt_rx, unit) => match res {
                Ok(never) => match never {},
                Err(e) => {
                    error!(worker = %label, error = %e, "start error, exit with code 1");
                    ExitReason::Failure
                }
            },
        }
    }

    async fn start(
        &self,
        label: &str,
        parent: Arc<dyn Outbound>,
        closers: CloseRegistry,
        adopt_rx: mpsc::Receiver<std::net::TcpStream>,
        slot: UnitSlot,
    ) -> Result<Infallible, BootError> {
        let tls = match (self.role, self.options.https) {
            (Role::App, true) => Some(Arc::new(load_tls(&self.options).await?)),
            _ => None,
        };
        let gate_timeout = match self.role {
            Role::App => Some(self.settings.start_timeout),
            Role::Agent => None,
        };
        let ctx = UnitContext {
            role: self.role,
            worker: self.id,
            options: self.options.clone(),
            gate: ReadinessGate::new(label, gate_timeout),
            closers: closers.clone(),
            tls,
        };

        let framework = self.frameworks.get(&self.options.framework).ok_or_else(|| {
            BootError::failed(format!("framework '{}' cannot be resolved", self.options.framework))
        })?;
        let unit = match self.role {
            Role::Agent => framework.agent(&ctx)?,
            Role::App => framework.application(&ctx)?,
        };
        let _ = slot.set(unit.clone());

        unit.boot(&ctx).await?;
        self.await_ready(label, &ctx.gate).await?;

        info!(worker = %label, "ready");
        report(label, &*parent, Message::WorkerReady { to: Target::Master }).await;

        match self.role {
            Role::Agent => std::future::pending().await,
            Role::App => self.serve(label, unit, &*parent, &closers, adopt_rx).await,
        }
    }

    async fn await_ready(&self, label: &str, gate: &ReadinessGate) -> Result<(), BootError> {
        let slow_agent = async {
            if self.role == Role::Agent {
                tokio::time::sleep(self.settings.start_timeout).await;
                warn!(
                    worker = %label,
                    timeout = ?self.settings.start_timeout,
                    pending = ?gate.pending(),
                    "agent is slow to become ready; still waiting"
                );
            }
            std::future::pending::<Infallible>().await
        };

        let outcome = tokio::select! {
            outcome = gate.wait() => outcome,
            never = slow_agent => match never {},
        };
        match outcome {
            GateOutcome::Ready => Ok(()),
            GateOutcome::Failed { key, error } => Err(BootError::failed(format!("{key}: {error}"))),
            GateOutcome::TimedOut { pending } => Err(BootError::StartTimeout { pending }),
        }
    }

    async fn serve(
        &self,
        label: &str,
        unit: Arc<dyn HostedUnit>,
        parent: &dyn Outbound,
        closers: &CloseRegistry,
        mut adopt_rx: mpsc::Receiver<std::net::TcpStream>,
    ) -> Result<Infallible, BootError> {
        let target = ListenTarget::resolve(&self.options, &unit.listen());
        let listener = Listener::bind(&target)
            .await
            .map_err(|e| BootError::failed(format!("listen on {target:?}: {e}")))?;
        let port = listener.port();

        if target.is_ephemeral() {
            warn!(worker = %label, port, "no port configured, serving on an ephemeral port");
        }

        let stop = CancellationToken::new();
        closers.register("server", {
            let stop = stop.clone();
            move || async move {
                stop.cancel();
                Ok(())
            }
        });

        info!(worker = %label, ?target, port, "server started");
        report(label, parent, Message::RealPort { to: Target::Master, data: port }).await;

        // The closer only shuts the listener; handed-off connections keep
        // arriving until the process is gone and are served like before.
        let mut listener = Some(listener);
        let mut conns = JoinSet::new();
        loop {
            tokio::select! {
                _ = stop.cancelled(), if listener.is_some() => {
                    listener = None;
                    debug!(worker = %label, in_flight = conns.len(), "server closed to new clients");
                }
                accepted = accept(listener.as_ref()) => match accepted {
                    Ok(conn) => spawn_serve(&mut conns, &unit, conn),
                    Err(e) => {
                        warn!(worker = %label, error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(stream) = adopt_rx.recv() => match Connection::adopt(stream) {
                    Ok(conn) => spawn_serve(&mut conns, &unit, conn),
                    Err(e) => warn!(worker = %label, error = %e, "cannot adopt handed-off connection"),
                },
                Some(_) = conns.join_next(), if !conns.is_empty() => {}
            }
        }
    }
}

async fn accept(listener: Option<&Listener>) -> std::io::Result<Connection> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

fn spawn_serve(conns: &mut JoinSet<()>, unit: &Arc<dyn HostedUnit>, conn: Connection) {
    let unit = unit.clone();
    conns.spawn(async move { unit.serve(conn).await });
}

async fn report(label: &str, parent: &dyn Outbound, message: Message) {
    let action = message.as_label();
    if let Err(e) = parent.send(Envelope::new(message)).await {
        warn!(worker = %label, action, error = %e, "cannot reach the supervisor");
    }
}

async fn load_tls(options: &StartupOptions) -> Result<TlsMaterial, BootError> {
    async fn read(which: &str, path: Option<&std::path::Path>) -> Result<Vec<u8>, BootError> {
        let path = path.ok_or_else(|| BootError::failed(format!("options.{which} is not set")))?;
        tokio::fs::read(path)
            .await
            .map_err(|e| BootError::failed(format!("reading {}: {e}", path.display())))
    }
    Ok(TlsMaterial {
        key: read("key", options.key.as_deref()).await?,
        cert: read("cert", options.cert.as_deref()).await?,
    })
}

async fn inbox_loop(
    label: String,
    mut inbox: mpsc::Receiver<Envelope>,
    triggers: mpsc::Sender<ExitTrigger>,
    adopt: mpsc::Sender<std::net::TcpStream>,
    unit: UnitSlot,
) {
    while let Some(envelope) = inbox.recv().await {
        match envelope.message {
            Message::StickyConnection => match envelope.connection {
                Some(stream) => match adopt.try_send(stream) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(worker = %label, "adopt queue full, handed-off connection dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(worker = %label, "not serving, handed-off connection dropped");
                    }
                },
                None => warn!(worker = %label, "sticky handoff without a connection"),
            },
            Message::LogReload => match unit.get() {
                Some(unit) => unit.on_log_reload().await,
                None => debug!(worker = %label, "log-reload before the unit exists"),
            },
            other => debug!(worker = %label, action = other.as_label(), "ignoring message"),
        }
    }
    let _ = triggers.send(ExitTrigger::Disconnect).await;
}

//! # Supervisor: the control loop that owns every child.
//!
//! ```text
//! start():
//!   spawn agent ──► gate "agent" (ready_timeout) ──► spawn N apps concurrently
//!       ──► gate "app_workers" (ready_timeout, keyed by worker label, done on realport)
//!       └─ any failure/timeout ──► StartFailed ──► stop everything ──► Err(StartupError)
//!
//! run():  one loop, one owner of the worker table
//!   ProcessEvent ──► state transitions, crash → RespawnScheduled
//!   respawn due  ──► spawn into the same slot
//!   accept       ──► Router order ──► handoff (fail over on error)
//!   Command      ──► Workers | ReloadLogs | Stop
//!
//! stop:  SIGTERM apps ─► wait ≤ grace + margin ─► kill stragglers
//!        SIGTERM agent ─► wait ≤ grace + margin ─► kill stragglers
//! ```
//!
//! ## Rules
//! - Agent before apps on start; apps before agent on stop.
//! - During start, a child that exits, or fails before it is listening, fails the
//!   whole start; nothing is respawned until the cluster is ready.
//! - After start, an unexpected exit is a crash; replacement follows
//!   [`RestartPolicy`](crate::RestartPolicy) with per-slot backoff.
//! - Messages to a child that already exited are dropped with a warning.
//! - No send to a child may hold the loop longer than `send_timeout`; a handoff
//!   that fails or expires takes the worker out of routing.
//! - A sticky connection is handed to exactly one worker; the supervisor keeps no
//!   copy after a successful handoff.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::core::config::ClusterConfig;
use crate::core::pool::{Pool, Worker, WorkerInfo, WorkerState};
use crate::core::router::Router;
use crate::error::{IpcError, ShutdownError, StartupError};
use crate::events::{Bus, Event, EventKind};
use crate::gate::{GateOutcome, ReadinessGate};
use crate::ipc::{Envelope, Message};
use crate::options::StartupOptions;
use crate::process::{ChildEvent, ProcessEvent, Role, Spawner, WorkerId};

const EVENT_QUEUE: usize = 1024;
/// How long killed children get to report their exit.
const KILL_WAIT: Duration = Duration::from_secs(5);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) enum Command {
    Stop(oneshot::Sender<Result<(), ShutdownError>>),
    Workers(oneshot::Sender<Vec<WorkerInfo>>),
    ReloadLogs,
}

struct Respawn {
    role: Role,
    slot: usize,
}

/// Receivers drained by whoever currently drives the supervisor.
pub(crate) struct Inputs {
    events: mpsc::Receiver<ProcessEvent>,
    respawns: mpsc::UnboundedReceiver<Respawn>,
}

/// Start-phase barrier: which state completes a key.
struct Phase<'a> {
    gate: &'a ReadinessGate,
    target: WorkerState,
}

pub(crate) struct Supervisor {
    options: Arc<StartupOptions>,
    cfg: ClusterConfig,
    spawner: Arc<dyn Spawner>,
    bus: Bus,
    pool: Pool,
    router: Router,
    events_tx: mpsc::Sender<ProcessEvent>,
    respawn_tx: mpsc::UnboundedSender<Respawn>,
    next_id: u64,
    generations: HashMap<(Role, usize), u32>,
    /// Consecutive respawns per slot, reset once a replacement proves stable.
    crashes: HashMap<(Role, usize), u32>,
    /// A child died during start after its phase key was already completed.
    start_crash: Option<StartupError>,
    stopping: bool,
}

impl Supervisor {
    pub fn new(
        options: Arc<StartupOptions>,
        cfg: ClusterConfig,
        spawner: Arc<dyn Spawner>,
        bus: Bus,
    ) -> (Self, Inputs) {
        let (events_tx, events) = mpsc::channel(EVENT_QUEUE);
        let (respawn_tx, respawns) = mpsc::unbounded_channel();
        let router = Router::new(cfg.routing);
        (
            Self {
                options,
                cfg,
                spawner,
                bus,
                pool: Pool::default(),
                router,
                events_tx,
                respawn_tx,
                next_id: 0,
                generations: HashMap::new(),
                crashes: HashMap::new(),
                start_crash: None,
                stopping: false,
            },
            Inputs { events, respawns },
        )
    }

    // ---- start ----

    /// Brings the cluster up, or tears everything down and reports why not.
    pub async fn start(&mut self, inputs: &mut Inputs) -> Result<(), StartupError> {
        match self.bootstrap(inputs).await {
            Ok(()) => {
                info!(
                    workers = self.options.workers,
                    port = self.options.port,
                    sticky = self.options.sticky,
                    "[master] cluster started"
                );
                self.bus.publish(Event::new(EventKind::ClusterReady));
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "[master] cluster start failed, stopping every worker");
                self.bus
                    .publish(Event::new(EventKind::StartFailed).with_reason(e.to_string()));
                if let Err(stuck) = self.stop_all(inputs).await {
                    warn!(error = %stuck, "[master] teardown after failed start was not clean");
                }
                Err(e)
            }
        }
    }

    async fn bootstrap(&mut self, inputs: &mut Inputs) -> Result<(), StartupError> {
        let agent = self.spawn_slots(Role::Agent, vec![0]).await?;
        self.await_phase("agent", &agent, WorkerState::Ready, inputs)
            .await?;

        let apps = self
            .spawn_slots(Role::App, (0..self.options.workers).collect())
            .await?;
        self.await_phase("app_workers", &apps, WorkerState::Listening, inputs)
            .await
    }

    async fn await_phase(
        &mut self,
        name: &str,
        ids: &[WorkerId],
        target: WorkerState,
        inputs: &mut Inputs,
    ) -> Result<(), StartupError> {
        let gate = ReadinessGate::new(name, Some(self.cfg.ready_timeout));
        for id in ids {
            if let Some(w) = self.pool.get(*id) {
                if let Err(e) = gate.register(w.info.label.clone()) {
                    debug!(error = %e, "phase key already registered");
                }
            }
        }

        let wait = gate.wait();
        tokio::pin!(wait);
        let outcome = loop {
            tokio::select! {
                outcome = &mut wait => break outcome,
                Some(ev) = inputs.events.recv() => {
                    self.on_process_event(ev, Some(Phase { gate: &gate, target })).await;
                    if let Some(e) = self.start_crash.take() {
                        return Err(e);
                    }
                }
            }
        };

        match outcome {
            GateOutcome::Ready => Ok(()),
            GateOutcome::Failed { key, error } => Err(StartupError::Bootstrap {
                who: key,
                reason: error,
            }),
            GateOutcome::TimedOut { pending } => Err(StartupError::BootstrapTimeout {
                who: name.to_string(),
                timeout: self.cfg.ready_timeout,
                pending,
            }),
        }
    }

    /// Spawns one child per slot concurrently. Children that did start are in the
    /// pool even when another spawn failed, so teardown reaches them.
    async fn spawn_slots(
        &mut self,
        role: Role,
        slots: Vec<usize>,
    ) -> Result<Vec<WorkerId>, StartupError> {
        let planned: Vec<(usize, WorkerId)> = slots
            .into_iter()
            .map(|slot| {
                let id = WorkerId(self.next_id);
                self.next_id += 1;
                (slot, id)
            })
            .collect();

        let spawner = self.spawner.clone();
        let options = self.options.clone();
        let results = futures::future::join_all(planned.iter().map(|&(_, id)| {
            spawner.spawn(role, id, &options, self.events_tx.clone())
        }))
        .await;

        let mut first_err = None;
        let mut ids = Vec::with_capacity(planned.len());
        for ((slot, id), res) in planned.into_iter().zip(results) {
            let label = role.worker_label(id);
            match res {
                Ok(control) => {
                    let generation = self.generations.entry((role, slot)).or_insert(0);
                    *generation += 1;
                    let pid = control.pid();
                    self.bus.publish(
                        Event::new(EventKind::ProcessSpawned)
                            .with_worker(label.as_str())
                            .with_pid(pid)
                            .with_attempt(*generation),
                    );
                    self.pool.insert(Worker {
                        info: WorkerInfo {
                            id,
                            role,
                            slot,
                            label,
                            pid,
                            state: WorkerState::Starting,
                            port: None,
                            generation: *generation,
                        },
                        control,
                        spawned_at: Instant::now(),
                        routable: true,
                    });
                    ids.push(id);
                }
                Err(e) => {
                    error!(worker = %label, error = %e, "[master] spawn failed");
                    first_err.get_or_insert(StartupError::Spawn {
                        who: label,
                        reason: e.to_string(),
                    });
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(ids),
        }
    }

    // ---- steady state ----

    /// Serves until stopped (or until the handle is dropped).
    pub async fn run(
        mut self,
        mut inputs: Inputs,
        mut listener: Option<TcpListener>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        loop {
            tokio::select! {
                Some(ev) = inputs.events.recv() => self.on_process_event(ev, None).await,
                Some(due) = inputs.respawns.recv() => self.respawn(due).await,
                accepted = accept(listener.as_ref()) => match accepted {
                    Ok((stream, peer)) => self.dispatch(stream, peer).await,
                    Err(e) => {
                        warn!(error = %e, "[master] sticky accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                cmd = commands.recv() => match cmd {
                    Some(Command::Workers(reply)) => {
                        let _ = reply.send(self.pool.snapshot());
                    }
                    Some(Command::ReloadLogs) => self.relay_log_reload(None).await,
                    Some(Command::Stop(reply)) => {
                        drop(listener.take());
                        let res = self.shutdown(&mut inputs).await;
                        let _ = reply.send(res);
                        return;
                    }
                    None => {
                        debug!("[master] cluster handle dropped, stopping");
                        drop(listener.take());
                        let _ = self.shutdown(&mut inputs).await;
                        return;
                    }
                },
            }
        }
    }

    async fn on_process_event(&mut self, ev: ProcessEvent, phase: Option<Phase<'_>>) {
        match ev.event {
            ChildEvent::Message(msg) => self.on_message(ev.id, msg, phase).await,
            ChildEvent::Exited(code) => self.on_exit(ev.id, code, phase),
        }
    }

    async fn on_message(&mut self, id: WorkerId, msg: Message, phase: Option<Phase<'_>>) {
        let Some(worker) = self.pool.get_mut(id) else {
            debug!(%id, action = msg.as_label(), "[master] message from a worker no longer tracked");
            return;
        };
        let info = &mut worker.info;

        match msg {
            Message::WorkerReady { .. } => {
                if info.state == WorkerState::Starting {
                    info.state = WorkerState::Ready;
                }
                if info.role == Role::Agent {
                    info!("[master] {}:{} started", info.label, info.pid);
                }
                self.bus.publish(
                    Event::new(EventKind::ProcessReady)
                        .with_worker(info.label.as_str())
                        .with_pid(info.pid),
                );
                if let Some(p) = phase.filter(|p| p.target == WorkerState::Ready) {
                    complete(p.gate, &info.label, None, &mut self.start_crash);
                }
            }
            Message::RealPort { data, .. } => {
                info.port = Some(data);
                if info.state != WorkerState::Closing {
                    info.state = WorkerState::Listening;
                }
                info!("[master] {}:{} started at {}", info.label, info.pid, data);
                self.bus.publish(
                    Event::new(EventKind::ProcessListening)
                        .with_worker(info.label.as_str())
                        .with_pid(info.pid)
                        .with_port(data),
                );
                if let Some(p) = phase.filter(|p| p.target == WorkerState::Listening) {
                    complete(p.gate, &info.label, None, &mut self.start_crash);
                }
            }
            Message::LogReload => self.relay_log_reload(Some(id)).await,
            Message::StickyConnection => {
                warn!(worker = %info.label, "[master] unexpected sticky handoff from a child");
            }
        }
    }

    fn on_exit(&mut self, id: WorkerId, code: Option<i32>, phase: Option<Phase<'_>>) {
        let Some(worker) = self.pool.remove(id) else {
            return;
        };
        let info = worker.info;
        self.bus.publish(
            Event::new(EventKind::ProcessExited)
                .with_worker(info.label.as_str())
                .with_pid(info.pid)
                .with_code(code),
        );

        if info.state == WorkerState::Closing {
            info!("[master] {}:{} exited with code {}", info.label, info.pid, fmt_code(code));
            return;
        }

        if let Some(p) = phase {
            let reason = format!("exited with code {}", fmt_code(code));
            complete(p.gate, &info.label, Some(reason), &mut self.start_crash);
            return;
        }
        if self.stopping {
            return;
        }

        error!(
            "[master] {}:{} died (code {}); {} left",
            info.label,
            info.pid,
            fmt_code(code),
            self.pool.count(info.role)
        );
        self.bus.publish(
            Event::new(EventKind::ProcessCrashed)
                .with_worker(info.label.as_str())
                .with_pid(info.pid)
                .with_code(code),
        );

        if self.cfg.restart.should_respawn(code) {
            let lived = worker.spawned_at.elapsed();
            self.schedule_respawn(info.role, info.slot, &info.label, lived);
        }
    }

    fn schedule_respawn(&mut self, role: Role, slot: usize, label: &str, lived: Duration) {
        let key = (role, slot);
        let attempt = if lived >= self.cfg.backoff.stable_after {
            0
        } else {
            self.crashes.get(&key).copied().unwrap_or(0)
        };
        self.crashes.insert(key, attempt.saturating_add(1));
        let delay = self.cfg.backoff.next(attempt);

        self.bus.publish(
            Event::new(EventKind::RespawnScheduled)
                .with_worker(label)
                .with_attempt(attempt + 1)
                .with_delay(delay),
        );
        let tx = self.respawn_tx.clone();
        let due = Respawn { role, slot };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(due);
        });
    }

    async fn respawn(&mut self, due: Respawn) {
        if self.stopping {
            return;
        }
        if let Err(e) = self.spawn_slots(due.role, vec![due.slot]).await {
            warn!(error = %e, "[master] respawn failed, retrying");
            let label = format!("{}_worker slot {}", due.role, due.slot);
            self.schedule_respawn(due.role, due.slot, &label, Duration::ZERO);
        }
    }

    // ---- messaging ----

    /// Sends `log-reload` to every live child except `origin`.
    async fn relay_log_reload(&mut self, origin: Option<WorkerId>) {
        let origin_label = origin
            .and_then(|id| self.pool.get(id))
            .map(|w| w.info.label.clone());
        let mut targets = self.pool.ids(Role::Agent);
        targets.extend(self.pool.ids(Role::App));
        for id in targets.into_iter().filter(|id| Some(*id) != origin) {
            self.send(id, Message::LogReload.into()).await;
        }
        let mut ev = Event::new(EventKind::LogReload);
        if let Some(label) = origin_label {
            ev = ev.with_worker(label);
        }
        self.bus.publish(ev);
    }

    /// Sends to one child; sending to a child that is gone is a logged no-op.
    async fn send(&mut self, id: WorkerId, envelope: Envelope) -> bool {
        let action = envelope.message.as_label();
        let Some(worker) = self.pool.get_mut(id) else {
            warn!(%id, action, "[master] worker already exited, message dropped");
            self.bus.publish(
                Event::new(EventKind::MessageDropped)
                    .with_worker(format!("#{id}"))
                    .with_reason(action),
            );
            return false;
        };
        let sent = tokio::time::timeout(self.cfg.send_timeout, worker.control.send(envelope))
            .await
            .unwrap_or(Err(IpcError::Timeout(self.cfg.send_timeout)));
        match sent {
            Ok(()) => true,
            Err(e) => {
                warn!(worker = %worker.info.label, action, error = %e, "[master] message dropped");
                self.bus.publish(
                    Event::new(EventKind::MessageDropped)
                        .with_worker(worker.info.label.as_str())
                        .with_reason(format!("{action}: {e}")),
                );
                false
            }
        }
    }

    async fn dispatch(&mut self, stream: TcpStream, peer: SocketAddr) {
        let live = self.pool.routable();
        let slots: Vec<usize> = live.iter().map(|&(slot, _)| slot).collect();
        let order = self.router.order(peer.ip(), &slots);

        let stream = match stream.into_std() {
            Ok(s) => s,
            Err(e) => {
                warn!(%peer, error = %e, "[master] cannot detach accepted connection");
                return;
            }
        };

        for slot in order {
            let Some(&(_, id)) = live.iter().find(|&&(s, _)| s == slot) else {
                continue;
            };
            let handle = match stream.try_clone() {
                Ok(h) => h,
                Err(e) => {
                    warn!(%peer, error = %e, "[master] cannot duplicate connection handle");
                    break;
                }
            };
            let Some(worker) = self.pool.get_mut(id) else {
                continue;
            };
            let sent = tokio::time::timeout(
                self.cfg.send_timeout,
                worker.control.send(Envelope::handoff(handle)),
            )
            .await
            .unwrap_or(Err(IpcError::Timeout(self.cfg.send_timeout)));
            match sent {
                Ok(()) => {
                    self.bus.publish(
                        Event::new(EventKind::ConnectionDispatched)
                            .with_worker(worker.info.label.as_str())
                            .with_reason(peer.to_string()),
                    );
                    return;
                }
                Err(e) => {
                    warn!(worker = %worker.info.label, %peer, error = %e, "[master] handoff failed, trying the next worker");
                    worker.routable = false;
                    self.bus.publish(
                        Event::new(EventKind::DispatchFailover)
                            .with_worker(worker.info.label.as_str())
                            .with_reason(e.to_string()),
                    );
                }
            }
        }

        self.bus
            .publish(Event::new(EventKind::ConnectionDropped).with_reason(peer.to_string()));
    }

    // ---- stop ----

    async fn shutdown(&mut self, inputs: &mut Inputs) -> Result<(), ShutdownError> {
        self.bus.publish(Event::new(EventKind::ShutdownRequested));
        let res = self.stop_all(inputs).await;
        match &res {
            Ok(()) => self.bus.publish(Event::new(EventKind::AllStoppedWithin)),
            Err(ShutdownError::GraceExceeded { stuck, .. }) => self.bus.publish(
                Event::new(EventKind::GraceExceeded).with_reason(stuck.join(", ")),
            ),
            Err(_) => {}
        }
        res
    }

    /// Stops app workers, then the agent. Stragglers are killed after `grace`.
    async fn stop_all(&mut self, inputs: &mut Inputs) -> Result<(), ShutdownError> {
        self.stopping = true;
        let mut stuck = self.stop_role(Role::App, inputs).await;
        stuck.extend(self.stop_role(Role::Agent, inputs).await);
        if stuck.is_empty() {
            Ok(())
        } else {
            Err(ShutdownError::GraceExceeded {
                grace: self.cfg.grace,
                stuck,
            })
        }
    }

    async fn stop_role(&mut self, role: Role, inputs: &mut Inputs) -> Vec<String> {
        let ids = self.pool.ids(role);
        if ids.is_empty() {
            return Vec::new();
        }
        for id in &ids {
            if let Some(w) = self.pool.get_mut(*id) {
                w.info.state = WorkerState::Closing;
                if let Err(e) = w.control.stop() {
                    debug!(worker = %w.info.label, error = %e, "[master] stop signal not delivered");
                }
            }
        }

        self.drain_until_gone(role, self.cfg.stop_window(), inputs).await;
        let stuck: Vec<String> = self
            .pool
            .ids(role)
            .into_iter()
            .filter_map(|id| self.pool.get(id).map(|w| w.info.label.clone()))
            .collect();
        if stuck.is_empty() {
            return stuck;
        }

        warn!(?stuck, grace = ?self.cfg.grace, "[master] killing workers that did not stop in time");
        for id in self.pool.ids(role) {
            if let Some(w) = self.pool.get(id) {
                if let Err(e) = w.control.kill() {
                    debug!(worker = %w.info.label, error = %e, "[master] kill failed");
                }
            }
        }
        self.drain_until_gone(role, KILL_WAIT, inputs).await;
        for id in self.pool.ids(role) {
            if let Some(w) = self.pool.remove(id) {
                error!(worker = %w.info.label, pid = w.info.pid, "[master] worker did not report its exit after kill");
            }
        }
        stuck
    }

    async fn drain_until_gone(&mut self, role: Role, within: Duration, inputs: &mut Inputs) {
        let deadline = Instant::now() + within;
        while self.pool.count(role) > 0 {
            match tokio::time::timeout_at(deadline, inputs.events.recv()).await {
                Ok(Some(ev)) => self.on_process_event(ev, None).await,
                Ok(None) | Err(_) => break,
            }
        }
    }
}

/// Completes a start-phase key; a key that cannot complete (already done,
/// unknown) after a failure still fails the start.
fn complete(
    gate: &ReadinessGate,
    label: &str,
    error: Option<String>,
    start_crash: &mut Option<StartupError>,
) {
    let failed = error.clone();
    if gate.done(label, error).is_err() {
        if let Some(reason) = failed {
            start_crash.get_or_insert(StartupError::Bootstrap {
                who: label.to_string(),
                reason,
            });
        }
    }
}

fn fmt_code(code: Option<i32>) -> String {
    code.map_or_else(|| "none (killed)".to_string(), |c| c.to_string())
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

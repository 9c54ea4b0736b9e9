use std::collections::HashMap;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use super::*;
use crate::error::{IpcError, ShutdownError, StartupError};
use crate::events::{Event, EventKind};
use crate::ipc::Envelope;
use crate::options::StartupOptions;
use crate::policies::{BackoffPolicy, JitterPolicy};
use crate::process::{ChildControl, LocalSpawner, ProcessEvent, Role, Spawner, WorkerId};
use crate::subscribers::Subscribe;
use crate::testing::{Boot, Scripted};

fn config() -> ClusterConfig {
    ClusterConfig {
        ready_timeout: Duration::from_secs(3),
        start_timeout: Duration::from_secs(3),
        grace: Duration::from_secs(2),
        backoff: BackoffPolicy {
            first: Duration::from_millis(10),
            max: Duration::from_millis(50),
            jitter: JitterPolicy::None,
            ..BackoffPolicy::default()
        },
        ..ClusterConfig::default()
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<Event>>);

impl Recorder {
    fn kinds(&self, kind: EventKind) -> Vec<Event> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Subscribe for Recorder {
    async fn on_event(&self, event: &Event) {
        self.0.lock().unwrap().push(event.clone());
    }

    fn name(&self) -> &'static str {
        "recorder"
    }
}

/// How a tracked child's channel misbehaves.
#[derive(Clone, Copy, Debug)]
enum Fault {
    /// Every send fails as if the child were gone.
    Refuse,
    /// Sends never complete, like a child that stopped reading.
    Stall,
}

/// Keeps a handle on every child so tests can kill one behind the supervisor's back.
#[derive(Clone)]
struct Tracking {
    inner: LocalSpawner,
    children: Arc<Mutex<Vec<(WorkerId, Arc<dyn ChildControl>)>>>,
    faults: Arc<Mutex<HashMap<WorkerId, Fault>>>,
}

impl Tracking {
    fn new(inner: LocalSpawner) -> Self {
        Self {
            inner,
            children: Arc::default(),
            faults: Arc::default(),
        }
    }

    fn child(&self, id: WorkerId) -> Arc<dyn ChildControl> {
        let children = self.children.lock().unwrap();
        children.iter().find(|(i, _)| *i == id).unwrap().1.clone()
    }

    fn kill(&self, id: WorkerId) {
        self.child(id).kill().unwrap();
    }

    /// Graceful stop of one child, not requested by the supervisor.
    fn stop(&self, id: WorkerId) {
        self.child(id).stop().unwrap();
    }

    fn inject(&self, id: WorkerId, fault: Fault) {
        self.faults.lock().unwrap().insert(id, fault);
    }
}

struct Shared {
    id: WorkerId,
    child: Arc<dyn ChildControl>,
    faults: Arc<Mutex<HashMap<WorkerId, Fault>>>,
}

#[async_trait]
impl ChildControl for Shared {
    fn pid(&self) -> u32 {
        self.child.pid()
    }

    async fn send(&self, envelope: Envelope) -> Result<(), IpcError> {
        let fault = self.faults.lock().unwrap().get(&self.id).copied();
        match fault {
            Some(Fault::Refuse) => Err(IpcError::Closed),
            Some(Fault::Stall) => std::future::pending().await,
            None => self.child.send(envelope).await,
        }
    }

    fn stop(&self) -> io::Result<()> {
        self.child.stop()
    }

    fn kill(&self) -> io::Result<()> {
        self.child.kill()
    }
}

#[async_trait]
impl Spawner for Tracking {
    async fn spawn(
        &self,
        role: Role,
        id: WorkerId,
        options: &StartupOptions,
        events: mpsc::Sender<ProcessEvent>,
    ) -> io::Result<Box<dyn ChildControl>> {
        let child: Arc<dyn ChildControl> =
            Arc::from(self.inner.spawn(role, id, options, events).await?);
        self.children.lock().unwrap().push((id, child.clone()));
        Ok(Box::new(Shared {
            id,
            child,
            faults: self.faults.clone(),
        }))
    }
}

struct Harness {
    scripted: Scripted,
    cfg: ClusterConfig,
    spawner: LocalSpawner,
    tracking: Tracking,
    recorder: Arc<Recorder>,
}

impl Harness {
    fn new(scripted: Scripted) -> Self {
        Self::with_config(scripted, config())
    }

    /// `cfg` reaches both the supervisor and the children's settings.
    fn with_config(scripted: Scripted, cfg: ClusterConfig) -> Self {
        let spawner = LocalSpawner::new(scripted.frameworks(), cfg.worker_settings());
        Self {
            tracking: Tracking::new(spawner.clone()),
            scripted,
            cfg,
            spawner,
            recorder: Arc::default(),
        }
    }

    fn builder(&self, options: StartupOptions) -> ClusterBuilder {
        Cluster::builder(options)
            .with_config(self.cfg.clone())
            .with_frameworks(self.scripted.frameworks())
            .with_spawner(Arc::new(self.spawner.clone()))
            .with_subscribers(vec![self.recorder.clone() as Arc<dyn Subscribe>])
    }

    /// Like [`Harness::builder`], with children reachable through `self.tracking`.
    fn tracked(&self, options: StartupOptions) -> ClusterBuilder {
        self.builder(options)
            .with_spawner(Arc::new(self.tracking.clone()))
    }

    fn targets(&self, kind: EventKind) -> Vec<String> {
        self.recorder
            .kinds(kind)
            .iter()
            .filter_map(|e| e.worker.as_deref().map(str::to_string))
            .collect()
    }
}

/// One echo round trip through the cluster's public port.
async fn echo(port: u16, payload: &[u8]) -> Vec<u8> {
    let mut conn = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    conn.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    conn.read_exact(&mut buf).await.unwrap();
    buf
}

async fn first_app(cluster: &Cluster) -> WorkerInfo {
    cluster
        .workers()
        .await
        .into_iter()
        .filter(|w| w.role == Role::App)
        .min_by_key(|w| w.slot)
        .unwrap()
}

const SETTLE: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(20);

#[tokio::test]
async fn starts_agent_and_workers_and_stops_once() {
    let h = Harness::new(Scripted::default());
    let cluster = h.builder(h.scripted.options(0, false)).start().await.unwrap();

    let workers = cluster.workers().await;
    assert_eq!(workers.len(), 3);
    let agents: Vec<_> = workers.iter().filter(|w| w.role == Role::Agent).collect();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].state, WorkerState::Ready);
    for app in workers.iter().filter(|w| w.role == Role::App) {
        assert_eq!(app.state, WorkerState::Listening);
        assert!(app.port.is_some_and(|p| p != 0));
        assert_eq!(app.generation, 1);
    }
    assert_eq!(h.spawner.alive(), 3);

    assert_eq!(cluster.stop().await, Ok(()));
    assert_eq!(cluster.stop().await, Ok(()));
    assert_eq!(h.scripted.probe.closes.load(Ordering::SeqCst), 3);
    assert_eq!(h.spawner.alive(), 0);
    assert!(cluster.workers().await.is_empty());

    assert_eq!(h.recorder.kinds(EventKind::ClusterReady).len(), 1);
    assert_eq!(h.recorder.kinds(EventKind::ShutdownRequested).len(), 1);
    assert_eq!(h.recorder.kinds(EventKind::AllStoppedWithin).len(), 1);
    assert_eq!(h.recorder.kinds(EventKind::ProcessSpawned).len(), 3);
}

#[tokio::test]
async fn apps_stop_before_the_agent() {
    let h = Harness::new(Scripted::default());
    let cluster = h.builder(h.scripted.options(0, false)).start().await.unwrap();
    cluster.stop().await.unwrap();

    let closed = h.scripted.probe.closed();
    assert_eq!(closed.len(), 3);
    assert_eq!(closed.last().map(String::as_str), Some("agent_worker#0"));

    let exits: Vec<String> = h
        .recorder
        .kinds(EventKind::ProcessExited)
        .iter()
        .filter_map(|e| e.worker.as_deref().map(str::to_string))
        .collect();
    assert_eq!(exits.len(), 3);
    assert_eq!(exits.last().map(String::as_str), Some("agent_worker#0"));
    assert!(
        h.recorder
            .kinds(EventKind::ProcessExited)
            .iter()
            .all(|e| e.code == Some(0))
    );
}

#[tokio::test]
async fn worker_boot_failure_tears_everything_down() {
    let h = Harness::new(Scripted {
        app: Boot::FailWorker(2),
        ..Scripted::default()
    });
    let err = h
        .builder(h.scripted.options(0, false))
        .start()
        .await
        .err()
        .unwrap();

    match err {
        StartupError::Bootstrap { who, reason } => {
            assert_eq!(who, "app_worker#2");
            assert!(reason.contains("code 1"), "{reason}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(h.spawner.alive(), 0);
    assert_eq!(h.recorder.kinds(EventKind::StartFailed).len(), 1);
    assert!(h.recorder.kinds(EventKind::ClusterReady).is_empty());
}

#[tokio::test]
async fn agent_that_never_gets_ready_times_out_start() {
    let h = Harness::new(Scripted {
        agent: Boot::Hang,
        ..Scripted::default()
    });
    let cfg = ClusterConfig {
        ready_timeout: Duration::from_millis(200),
        ..config()
    };
    let err = h
        .builder(h.scripted.options(0, false))
        .with_config(cfg)
        .start()
        .await
        .err()
        .unwrap();

    match err {
        StartupError::BootstrapTimeout { who, pending, .. } => {
            assert_eq!(who, "agent");
            assert_eq!(pending, vec!["agent_worker#0".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(h.spawner.alive(), 0);
    assert_eq!(h.recorder.kinds(EventKind::ProcessSpawned).len(), 1);
}

#[tokio::test]
async fn unknown_framework_is_rejected_before_spawning() {
    let h = Harness::new(Scripted::default());
    let options = StartupOptions {
        framework: "nope".into(),
        ..h.scripted.options(0, false)
    };
    let err = h.builder(options).start().await.err().unwrap();
    assert_eq!(err.as_label(), "validation_unknown_framework");
    assert_eq!(h.spawner.alive(), 0);
}

#[tokio::test]
async fn workers_share_one_port() {
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let h = Harness::new(Scripted::default());
    let options = StartupOptions {
        workers: 3,
        ..h.scripted.options(port, false)
    };
    let cluster = h.builder(options).start().await.unwrap();

    let ports: Vec<Option<u16>> = cluster
        .workers()
        .await
        .iter()
        .filter(|w| w.role == Role::App)
        .map(|w| w.port)
        .collect();
    assert_eq!(ports, vec![Some(port); 3]);

    let mut conn = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    conn.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
    drop(conn);

    cluster.stop().await.unwrap();
}

#[tokio::test]
async fn sticky_connections_follow_the_peer() {
    let h = Harness::new(Scripted::default());
    let cfg = ClusterConfig {
        routing: RoutingPolicy::PeerHash { seed: 7 },
        ..config()
    };
    let cluster = h
        .builder(h.scripted.options(0, true))
        .with_config(cfg)
        .start()
        .await
        .unwrap();
    let addr = cluster.sticky_addr().unwrap();

    for round in 0..3u8 {
        let mut conn = tokio::net::TcpStream::connect(("127.0.0.1", addr.port()))
            .await
            .unwrap();
        let payload = [b'p', round];
        conn.write_all(&payload).await.unwrap();
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, payload);
    }
    cluster.stop().await.unwrap();

    let targets: Vec<String> = h
        .recorder
        .kinds(EventKind::ConnectionDispatched)
        .iter()
        .filter_map(|e| e.worker.as_deref().map(str::to_string))
        .collect();
    assert_eq!(targets.len(), 3);
    assert!(targets.iter().all(|t| t == &targets[0]), "{targets:?}");
    assert!(h.recorder.kinds(EventKind::ConnectionDropped).is_empty());
}

#[tokio::test]
async fn crashed_worker_is_replaced_in_its_slot() {
    let h = Harness::new(Scripted::default());
    let cluster = h.tracked(h.scripted.options(0, false)).start().await.unwrap();
    let recorder = h.recorder.clone();

    let victim = first_app(&cluster).await;
    h.tracking.kill(victim.id);

    tokio::time::timeout(SETTLE, async {
        loop {
            let replaced = cluster.workers().await.iter().any(|w| {
                w.role == Role::App
                    && w.slot == victim.slot
                    && w.generation == 2
                    && w.state == WorkerState::Listening
            });
            if replaced {
                break;
            }
            tokio::time::sleep(POLL).await;
        }
    })
    .await
    .expect("no listening replacement");
    assert_eq!(cluster.workers().await.len(), 3);

    cluster.stop().await.unwrap();
    let crashed = recorder.kinds(EventKind::ProcessCrashed);
    assert_eq!(crashed.len(), 1);
    assert_eq!(crashed[0].worker.as_deref(), Some(victim.label.as_str()));
    assert_eq!(crashed[0].code, None);
    assert_eq!(recorder.kinds(EventKind::RespawnScheduled).len(), 1);
}

#[tokio::test]
async fn log_reload_reaches_every_child() {
    let h = Harness::new(Scripted::default());
    let cluster = h.builder(h.scripted.options(0, false)).start().await.unwrap();

    cluster.reload_logs().await;
    tokio::time::timeout(SETTLE, async {
        while h.scripted.probe.reloads.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(POLL).await;
        }
    })
    .await
    .expect("log-reload did not reach every child");

    cluster.stop().await.unwrap();
    assert_eq!(h.recorder.kinds(EventKind::LogReload).len(), 1);
}

#[tokio::test]
async fn dropping_the_handle_stops_the_cluster() {
    let h = Harness::new(Scripted::default());
    let cluster = h.builder(h.scripted.options(0, false)).start().await.unwrap();
    assert_eq!(h.spawner.alive(), 3);
    drop(cluster);

    tokio::time::timeout(SETTLE, async {
        while h.spawner.alive() > 0 {
            tokio::time::sleep(POLL).await;
        }
    })
    .await
    .expect("children outlived the dropped handle");
}

#[tokio::test]
async fn draining_worker_serves_connections_handed_to_it() {
    let h = Harness::new(Scripted {
        close_delay: Duration::from_millis(1500),
        ..Scripted::default()
    });
    let cluster = h.tracked(h.scripted.options(0, true)).start().await.unwrap();
    let port = cluster.sticky_addr().unwrap().port();

    let victim = first_app(&cluster).await;
    h.tracking.stop(victim.id);
    tokio::time::sleep(Duration::from_millis(100)).await;

    for round in 0..4u8 {
        let payload = [b'd', round];
        let echoed = tokio::time::timeout(Duration::from_secs(1), echo(port, &payload))
            .await
            .expect("client hung");
        assert_eq!(echoed, payload);
    }
    assert!(h.targets(EventKind::ConnectionDispatched).contains(&victim.label));
    assert!(h.recorder.kinds(EventKind::ConnectionDropped).is_empty());

    cluster.stop().await.unwrap();
}

#[tokio::test]
async fn refused_handoff_fails_over_to_the_next_worker() {
    let h = Harness::new(Scripted::default());
    let cluster = h.tracked(h.scripted.options(0, true)).start().await.unwrap();
    let port = cluster.sticky_addr().unwrap().port();

    let victim = first_app(&cluster).await;
    h.tracking.inject(victim.id, Fault::Refuse);

    for round in 0..2u8 {
        assert_eq!(echo(port, &[b'f', round]).await, [b'f', round]);
    }
    cluster.stop().await.unwrap();

    assert_eq!(h.targets(EventKind::DispatchFailover), vec![victim.label.clone()]);
    let served = h.targets(EventKind::ConnectionDispatched);
    assert_eq!(served.len(), 2);
    assert!(!served.contains(&victim.label), "{served:?}");
    assert!(h.recorder.kinds(EventKind::ConnectionDropped).is_empty());
}

#[tokio::test]
async fn stalled_handoff_does_not_block_the_supervisor() {
    let h = Harness::with_config(
        Scripted::default(),
        ClusterConfig {
            send_timeout: Duration::from_millis(200),
            ..config()
        },
    );
    let cluster = h.tracked(h.scripted.options(0, true)).start().await.unwrap();
    let port = cluster.sticky_addr().unwrap().port();

    let victim = first_app(&cluster).await;
    h.tracking.inject(victim.id, Fault::Stall);

    for round in 0..3u8 {
        let echoed = tokio::time::timeout(Duration::from_secs(2), echo(port, &[b's', round]))
            .await
            .expect("client hung behind a stalled worker");
        assert_eq!(echoed, [b's', round]);
    }
    let workers = tokio::time::timeout(Duration::from_secs(1), cluster.workers())
        .await
        .expect("supervisor stopped answering");
    assert_eq!(workers.len(), 3);

    let failovers = h.recorder.kinds(EventKind::DispatchFailover);
    assert_eq!(failovers.len(), 1);
    assert_eq!(failovers[0].worker.as_deref(), Some(victim.label.as_str()));
    assert!(
        failovers[0]
            .reason
            .as_deref()
            .is_some_and(|r| r.contains("timed out")),
        "{:?}",
        failovers[0].reason
    );

    cluster.stop().await.unwrap();
}

#[tokio::test]
async fn stragglers_are_killed_after_the_grace_window() {
    let h = Harness::new(Scripted {
        close_delay: Duration::from_secs(10),
        ..Scripted::default()
    });
    let cfg = ClusterConfig {
        grace: Duration::from_millis(200),
        ..config()
    };
    let cluster = h
        .builder(h.scripted.options(0, false))
        .with_config(cfg)
        .start()
        .await
        .unwrap();

    let first = cluster.stop().await;
    match &first {
        Err(ShutdownError::GraceExceeded { stuck, .. }) => assert_eq!(
            stuck,
            &["app_worker#1", "app_worker#2", "agent_worker#0"].map(String::from)
        ),
        other => panic!("unexpected stop result: {other:?}"),
    }
    assert_eq!(cluster.stop().await, first);
    assert_eq!(h.spawner.alive(), 0);
    assert_eq!(h.scripted.probe.closes.load(Ordering::SeqCst), 0);

    assert_eq!(h.recorder.kinds(EventKind::GraceExceeded).len(), 1);
    let exits = h.recorder.kinds(EventKind::ProcessExited);
    assert_eq!(exits.len(), 3);
    assert!(exits.iter().all(|e| e.code.is_none()), "{exits:?}");
}

#[tokio::test]
async fn overrunning_child_exits_with_its_own_code_before_the_kill() {
    let h = Harness::with_config(
        Scripted {
            close_delay: Duration::from_secs(10),
            ..Scripted::default()
        },
        ClusterConfig {
            grace: Duration::from_millis(300),
            ..config()
        },
    );
    let cluster = h.builder(h.scripted.options(0, false)).start().await.unwrap();

    assert_eq!(cluster.stop().await, Ok(()));
    let exits = h.recorder.kinds(EventKind::ProcessExited);
    assert_eq!(exits.len(), 3);
    assert!(exits.iter().all(|e| e.code == Some(1)), "{exits:?}");
    assert!(h.recorder.kinds(EventKind::GraceExceeded).is_empty());
}

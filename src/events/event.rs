//! # Cluster events emitted by the supervisor and its child handles.
//!
//! The [`EventKind`] enum classifies what happened across four groups:
//! - **Process lifecycle**: a child was spawned, became ready, started listening, exited
//! - **Cluster lifecycle**: the whole cluster became ready, failed to start, is shutting down
//! - **Dispatch**: sticky connections handed to workers (and failovers)
//! - **Subscriber health**: overflow and panics inside subscriber workers
//!
//! The [`Event`] struct carries optional metadata such as the worker label,
//! pid, exit code and bound port.
//!
//! ## Ordering guarantees
//! Each event gets a process-wide sequence number (`seq`) that increases monotonically.
//! Subscribers can sort by `seq` to restore emission order (e.g. a shutdown trace).
//!
//! ## Example
//! ```rust
//! use clustervisor::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::ProcessExited)
//!     .with_worker("app_worker#2")
//!     .with_pid(4242)
//!     .with_code(110);
//!
//! assert_eq!(ev.kind, EventKind::ProcessExited);
//! assert_eq!(ev.worker.as_deref(), Some("app_worker#2"));
//! assert_eq!(ev.code, Some(110));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Classification of cluster events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets: `worker` (subscriber name), `reason` (panic message).
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets: `worker` (subscriber name), `reason` ("full" / "closed").
    SubscriberOverflow,

    // === Process lifecycle ===
    /// A child process was spawned.
    ///
    /// Sets: `worker`, `pid`, `attempt` (spawn count for this slot).
    ProcessSpawned,

    /// A child sent `worker-ready`.
    ///
    /// Sets: `worker`, `pid`.
    ProcessReady,

    /// An application worker reported its bound port (`realport`).
    ///
    /// Sets: `worker`, `pid`, `port`.
    ProcessListening,

    /// A child process exited (any reason).
    ///
    /// Sets: `worker`, `pid`, `code` (`None` when killed by a signal).
    ProcessExited,

    /// A child exited after reaching steady state without being asked to.
    ///
    /// Sets: `worker`, `pid`, `code`.
    ProcessCrashed,

    /// A crashed slot will be respawned after a delay.
    ///
    /// Sets: `worker`, `attempt`, `delay_ms`.
    RespawnScheduled,

    /// A message to an exited handle was dropped.
    ///
    /// Sets: `worker`, `reason`.
    MessageDropped,

    // === Cluster lifecycle ===
    /// Agent is ready and every application worker is listening.
    ClusterReady,

    /// Cluster start failed; `reason` carries the diagnostic.
    StartFailed,

    /// Stop was requested (API call or OS signal).
    ShutdownRequested,

    /// Every child exited within the grace window.
    AllStoppedWithin,

    /// Grace window exceeded; survivors were killed.
    ///
    /// Sets: `reason` (stuck worker labels).
    GraceExceeded,

    // === Dispatch ===
    /// A sticky connection was handed to a worker.
    ///
    /// Sets: `worker`, `reason` (peer address).
    ConnectionDispatched,

    /// A handoff failed and the connection moved to another worker.
    ///
    /// Sets: `worker` (failed target), `reason`.
    DispatchFailover,

    /// No live worker could take an accepted connection.
    ConnectionDropped,

    /// `log-reload` was relayed to the children.
    ///
    /// Sets: `worker` (origin, if a child asked for it).
    LogReload,
}

/// Cluster event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,
    /// Worker label (`agent_worker#0`, `app_worker#3`) or subscriber name.
    pub worker: Option<Arc<str>>,
    /// OS process id of the child, if known.
    pub pid: Option<u32>,
    /// Exit code of the child.
    pub code: Option<i32>,
    /// Port a worker bound.
    pub port: Option<u16>,
    /// Spawn attempt for the worker slot (starting from 1).
    pub attempt: Option<u32>,
    /// Respawn delay in milliseconds.
    pub delay_ms: Option<u32>,
    /// Human-readable detail.
    pub reason: Option<Arc<str>>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            worker: None,
            pid: None,
            code: None,
            port: None,
            attempt: None,
            delay_ms: None,
            reason: None,
        }
    }

    #[inline]
    pub fn with_worker(mut self, worker: impl Into<Arc<str>>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    #[inline]
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Attaches an exit code; `None` leaves the field unset (signal death).
    #[inline]
    pub fn with_code(mut self, code: impl Into<Option<i32>>) -> Self {
        self.code = code.into();
        self
    }

    #[inline]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    #[inline]
    pub fn with_attempt(mut self, n: u32) -> Self {
        self.attempt = Some(n);
        self
    }

    /// Attaches a delay (stored as milliseconds, saturating).
    #[inline]
    pub fn with_delay(mut self, d: Duration) -> Self {
        let ms = d.as_millis().min(u128::from(u32::MAX)) as u32;
        self.delay_ms = Some(ms);
        self
    }

    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_worker(subscriber)
            .with_reason(reason)
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_worker(subscriber)
            .with_reason(info)
    }
}

//! # LogWriter: renders cluster events through `tracing`.
//!
//! ## Example output (fmt layer)
//! ```text
//! INFO spawned worker="app_worker#1" pid=4242 attempt=1
//! INFO listening worker="app_worker#1" port=7001
//! WARN crashed worker="app_worker#1" pid=4242 code=Some(1)
//! INFO respawn scheduled worker="app_worker#1" attempt=2 delay_ms=100
//! ```

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Event subscriber that writes every event as a structured `tracing` record.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let worker = e.worker.as_deref().unwrap_or("-");
        let reason = e.reason.as_deref().unwrap_or("");
        match e.kind {
            EventKind::ProcessSpawned => {
                info!(worker, pid = e.pid, attempt = e.attempt, "spawned");
            }
            EventKind::ProcessReady => info!(worker, pid = e.pid, "ready"),
            EventKind::ProcessListening => info!(worker, port = e.port, "listening"),
            EventKind::ProcessExited => info!(worker, pid = e.pid, code = e.code, "exited"),
            EventKind::ProcessCrashed => {
                warn!(worker, pid = e.pid, code = e.code, "crashed");
            }
            EventKind::RespawnScheduled => {
                info!(worker, attempt = e.attempt, delay_ms = e.delay_ms, "respawn scheduled");
            }
            EventKind::MessageDropped => warn!(worker, reason, "message to exited worker dropped"),
            EventKind::ClusterReady => info!("cluster ready"),
            EventKind::StartFailed => error!(reason, "cluster start failed"),
            EventKind::ShutdownRequested => info!("shutdown requested"),
            EventKind::AllStoppedWithin => info!("all workers stopped within grace"),
            EventKind::GraceExceeded => warn!(stuck = reason, "grace exceeded"),
            EventKind::ConnectionDispatched => {
                tracing::debug!(worker, peer = reason, "connection dispatched");
            }
            EventKind::DispatchFailover => warn!(worker, reason, "dispatch failover"),
            EventKind::ConnectionDropped => warn!(reason, "no live worker, connection dropped"),
            EventKind::LogReload => info!(origin = worker, "log-reload relayed"),
            EventKind::SubscriberOverflow => {
                warn!(subscriber = worker, reason, "subscriber dropped event");
            }
            EventKind::SubscriberPanicked => {
                error!(subscriber = worker, info = reason, "subscriber panicked");
            }
        }
    }

    fn name(&self) -> &'static str {
        "LogWriter"
    }
}

//! # GracefulExit: the shutdown state machine shared by every process kind.
//!
//! ```text
//!             Signal                      callbacks done ──► Exited(0)
//!  running ───────────► draining ───────► grace exceeded ──► Exited(1)
//!     │                  │    ▲
//!     │ Disconnect       │    └── Signal (ignored, no second close sequence)
//!     ▼                  ▼
//!  Exited(110) ◄──── Disconnect (close sequence abandoned)
//! ```
//!
//! ## Rules
//! - Close callbacks come from the process's [`CloseRegistry`] and run newest first.
//! - Losing the parent channel is never a clean stop: exit 110, no callbacks,
//!   since the parent cannot be assumed reachable.
//! - The drain is bounded by `grace`; past it the process force-exits with 1.
//! - The machine resolves to an [`ExitReason`]; the process entry turns that into
//!   the OS exit status, which keeps the machine itself testable in-process.

mod close;
mod signals;

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub use close::{CloseError, CloseRegistry};
pub use signals::{forward_signals, wait_for_shutdown_signal};

/// Input to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitTrigger {
    /// The graceful-stop signal (SIGTERM, or the in-process equivalent).
    Signal,
    /// The parent channel was severed.
    Disconnect,
}

/// Why a process ended; maps to the exit codes operational tooling greps for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Graceful stop completed.
    Clean,
    /// Startup error, startup timeout, or drain exceeded its grace window.
    Failure,
    /// Parent channel disconnected unexpectedly.
    ParentLost,
}

impl ExitReason {
    /// The process exit status: `0`, `1` or `110`.
    pub const fn code(self) -> i32 {
        match self {
            ExitReason::Clean => 0,
            ExitReason::Failure => 1,
            ExitReason::ParentLost => 110,
        }
    }
}

/// One process's graceful-exit handler.
pub struct GracefulExit {
    label: String,
    closers: CloseRegistry,
    grace: Duration,
}

impl GracefulExit {
    pub fn new(label: impl Into<String>, closers: CloseRegistry, grace: Duration) -> Self {
        Self {
            label: label.into(),
            closers,
            grace,
        }
    }

    /// Drives the state machine until the process should exit.
    ///
    /// A closed trigger channel while `running` means nobody can stop this process
    /// through it any more; the machine then stays `running` forever.
    pub async fn watch(self, mut triggers: mpsc::Receiver<ExitTrigger>) -> ExitReason {
        let label = self.label.as_str();

        // running
        loop {
            match triggers.recv().await {
                Some(ExitTrigger::Signal) => break,
                Some(ExitTrigger::Disconnect) => return parent_lost(label),
                None => std::future::pending::<()>().await,
            }
        }

        // draining
        info!(label, grace = ?self.grace, "received stop signal, closing");
        let drain = tokio::time::timeout(self.grace, self.closers.close_all(label));
        tokio::pin!(drain);
        loop {
            tokio::select! {
                res = &mut drain => return self.drained(res.is_ok()),
                trig = triggers.recv() => match trig {
                    Some(ExitTrigger::Signal) => {
                        debug!(label, "already draining, stop signal ignored");
                    }
                    Some(ExitTrigger::Disconnect) => return parent_lost(label),
                    None => {
                        let res = (&mut drain).await;
                        return self.drained(res.is_ok());
                    }
                }
            }
        }
    }

    fn drained(&self, in_time: bool) -> ExitReason {
        if in_time {
            info!(label = %self.label, "exit with code 0");
            ExitReason::Clean
        } else {
            error!(
                label = %self.label,
                grace = ?self.grace,
                "close callbacks did not finish in time, exit with code 1"
            );
            ExitReason::Failure
        }
    }
}

fn parent_lost(label: &str) -> ExitReason {
    warn!(label, "parent channel disconnected, exit with code 110");
    ExitReason::ParentLost
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(reg: &CloseRegistry, count: &Arc<AtomicUsize>, delay: Duration) {
        let count = count.clone();
        reg.register("counter", move || async move {
            tokio::time::sleep(delay).await;
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }

    #[tokio::test(start_paused = true)]
    async fn signal_drains_once_and_exits_clean() {
        let reg = CloseRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        counting(&reg, &count, Duration::from_millis(50));

        let (tx, rx) = mpsc::channel(4);
        tx.send(ExitTrigger::Signal).await.unwrap();
        tx.send(ExitTrigger::Signal).await.unwrap();

        let reason = GracefulExit::new("app_worker", reg, Duration::from_secs(5))
            .watch(rx)
            .await;
        assert_eq!(reason, ExitReason::Clean);
        assert_eq!(reason.code(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_skips_callbacks() {
        let reg = CloseRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        counting(&reg, &count, Duration::ZERO);

        let (tx, rx) = mpsc::channel(4);
        tx.send(ExitTrigger::Disconnect).await.unwrap();

        let reason = GracefulExit::new("agent_worker", reg, Duration::from_secs(5))
            .watch(rx)
            .await;
        assert_eq!(reason.code(), 110);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_draining_abandons_close() {
        let reg = CloseRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        counting(&reg, &count, Duration::from_secs(3));

        let (tx, rx) = mpsc::channel(4);
        let machine = tokio::spawn(
            GracefulExit::new("app_worker", reg, Duration::from_secs(10)).watch(rx),
        );
        tx.send(ExitTrigger::Signal).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(ExitTrigger::Disconnect).await.unwrap();

        assert_eq!(machine.await.unwrap(), ExitReason::ParentLost);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_drain_force_exits_with_failure() {
        let reg = CloseRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        counting(&reg, &count, Duration::from_secs(60));

        let (tx, rx) = mpsc::channel(4);
        tx.send(ExitTrigger::Signal).await.unwrap();

        let reason = GracefulExit::new("app_worker", reg, Duration::from_secs(2))
            .watch(rx)
            .await;
        assert_eq!(reason, ExitReason::Failure);
        assert_eq!(reason.code(), 1);
    }
}

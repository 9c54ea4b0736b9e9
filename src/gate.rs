//! # ReadinessGate: a named, timeout-bounded barrier.
//!
//! Callers [`register`](ReadinessGate::register) pending tasks by key and later
//! report them [`done`](ReadinessGate::done). Waiters resolve with exactly one
//! [`GateOutcome`] per gate lifetime:
//!
//! ```text
//! register("db") register("cache")
//!        │              │
//! done("db", None) ─────┼──────────────► all done ─────► Ready
//! done("cache", Some(e)) ──────────────► first error ──► Failed { key, error }
//! deadline reached with "cache" pending ───────────────► TimedOut { pending }
//! ```
//!
//! ## Rules
//! - The outcome fires **once**; later completions are recorded but do not re-fire.
//! - A failure fires immediately (fail fast) without waiting for the other keys.
//! - Timeout only stops *waiting*; pending work is not cancelled. The keys still
//!   pending are logged so operators can see which subsystem never became ready.
//! - The deadline is anchored at gate construction, not at the first `wait()`.
//! - An empty gate is ready as soon as someone waits on it.
//! - Re-registering a key (pending or completed) is a programming error.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::GateError;

/// Terminal result of a [`ReadinessGate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateOutcome {
    /// Every registered key completed without error.
    Ready,
    /// A key completed with an error.
    Failed { key: String, error: String },
    /// The deadline passed; `pending` lists keys that never completed (sorted).
    TimedOut { pending: Vec<String> },
}

#[derive(Default)]
struct Entry {
    done: bool,
}

struct Inner {
    name: String,
    deadline: Option<Instant>,
    tasks: Mutex<BTreeMap<String, Entry>>,
    fired: watch::Sender<Option<GateOutcome>>,
}

/// Cloneable handle to one readiness barrier.
#[derive(Clone)]
pub struct ReadinessGate {
    inner: Arc<Inner>,
}

impl ReadinessGate {
    /// Creates a gate; `timeout = None` waits forever.
    pub fn new(name: impl Into<String>, timeout: Option<Duration>) -> Self {
        let (fired, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                deadline: timeout.map(|t| Instant::now() + t),
                tasks: Mutex::new(BTreeMap::new()),
                fired,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Records a pending task.
    pub fn register(&self, key: impl Into<String>) -> Result<(), GateError> {
        let key = key.into();
        let mut tasks = self.lock();
        if self.inner.fired.borrow().is_some() {
            return Err(GateError::AlreadyFired {
                gate: self.inner.name.clone(),
            });
        }
        match tasks.get(&key) {
            Some(e) if e.done => Err(GateError::AlreadyCompleted {
                gate: self.inner.name.clone(),
                key,
            }),
            Some(_) => Err(GateError::AlreadyRegistered {
                gate: self.inner.name.clone(),
                key,
            }),
            None => {
                debug!(gate = %self.inner.name, key = %key, "task registered");
                tasks.insert(key, Entry::default());
                Ok(())
            }
        }
    }

    /// Marks `key` complete, optionally carrying a failure.
    pub fn done(&self, key: &str, error: Option<String>) -> Result<(), GateError> {
        let mut tasks = self.lock();
        let entry = tasks.get_mut(key).ok_or_else(|| GateError::UnknownKey {
            gate: self.inner.name.clone(),
            key: key.to_string(),
        })?;
        if entry.done {
            return Err(GateError::AlreadyCompleted {
                gate: self.inner.name.clone(),
                key: key.to_string(),
            });
        }
        entry.done = true;

        let fired = match error {
            Some(error) => self.fire(GateOutcome::Failed {
                key: key.to_string(),
                error,
            }),
            None if tasks.values().all(|e| e.done) => self.fire(GateOutcome::Ready),
            None => false,
        };
        if !fired && self.outcome().is_some() {
            debug!(gate = %self.inner.name, key, "late completion after gate fired");
        }
        Ok(())
    }

    /// Keys registered but not yet done, sorted.
    pub fn pending(&self) -> Vec<String> {
        Self::pending_of(&self.lock())
    }

    /// The outcome, if the gate already fired.
    pub fn outcome(&self) -> Option<GateOutcome> {
        self.inner.fired.borrow().clone()
    }

    /// Waits for the gate to fire (or its deadline to pass).
    pub async fn wait(&self) -> GateOutcome {
        {
            let tasks = self.lock();
            if tasks.values().all(|e| e.done) {
                self.fire(GateOutcome::Ready);
            }
        }

        let mut rx = self.inner.fired.subscribe();
        let fired = async {
            match rx.wait_for(Option::is_some).await {
                Ok(outcome) => (*outcome).clone(),
                Err(_) => None,
            }
        };
        let outcome = match self.inner.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fired).await.ok().flatten(),
            None => fired.await,
        };
        match outcome {
            Some(o) => o,
            None => self.expire(),
        }
    }

    /// Fires `TimedOut` (if nothing fired yet) and returns the final outcome.
    fn expire(&self) -> GateOutcome {
        let tasks = self.lock();
        let pending = Self::pending_of(&tasks);
        if self.fire(GateOutcome::TimedOut {
            pending: pending.clone(),
        }) {
            warn!(gate = %self.inner.name, ?pending, "readiness timeout, still pending");
        }
        self.outcome().unwrap_or(GateOutcome::TimedOut { pending })
    }

    /// Sets the outcome once; returns whether this call fired it.
    fn fire(&self, outcome: GateOutcome) -> bool {
        self.inner.fired.send_if_modified(|cur| {
            if cur.is_some() {
                return false;
            }
            *cur = Some(outcome);
            true
        })
    }

    fn pending_of(tasks: &BTreeMap<String, Entry>) -> Vec<String> {
        tasks
            .iter()
            .filter(|(_, e)| !e.done)
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_ready_when_all_done() {
        let gate = ReadinessGate::new("app", Some(Duration::from_secs(10)));
        gate.register("db").unwrap();
        gate.register("cache").unwrap();

        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait().await }
        });
        gate.done("db", None).unwrap();
        assert_eq!(gate.pending(), vec!["cache".to_string()]);
        gate.done("cache", None).unwrap();

        assert_eq!(waiter.await.unwrap(), GateOutcome::Ready);
    }

    #[tokio::test]
    async fn empty_gate_is_ready() {
        let gate = ReadinessGate::new("empty", None);
        assert_eq!(gate.wait().await, GateOutcome::Ready);
    }

    #[tokio::test]
    async fn first_error_fires_immediately() {
        let gate = ReadinessGate::new("pool", None);
        gate.register("w1").unwrap();
        gate.register("w2").unwrap();
        gate.done("w2", Some("exit 1".into())).unwrap();

        assert_eq!(
            gate.wait().await,
            GateOutcome::Failed {
                key: "w2".into(),
                error: "exit 1".into()
            }
        );
        // late success does not re-fire
        gate.done("w1", None).unwrap();
        assert!(matches!(gate.outcome(), Some(GateOutcome::Failed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reports_pending_keys() {
        let gate = ReadinessGate::new("app", Some(Duration::from_secs(10)));
        gate.register("loader").unwrap();
        gate.register("schedule").unwrap();
        gate.done("loader", None).unwrap();

        assert_eq!(
            gate.wait().await,
            GateOutcome::TimedOut {
                pending: vec!["schedule".into()]
            }
        );
        // the work itself is not cancelled; completing it later is still accepted
        gate.done("schedule", None).unwrap();
        assert!(gate.pending().is_empty());
        assert!(matches!(gate.outcome(), Some(GateOutcome::TimedOut { .. })));
    }

    #[test]
    fn re_registering_is_rejected() {
        let gate = ReadinessGate::new("app", None);
        gate.register("a").unwrap();
        gate.register("b").unwrap();
        assert_eq!(
            gate.register("a").unwrap_err().as_label(),
            "gate_already_registered"
        );
        gate.done("a", None).unwrap();
        assert_eq!(
            gate.register("a").unwrap_err().as_label(),
            "gate_already_completed"
        );
        assert_eq!(
            gate.done("nope", None).unwrap_err().as_label(),
            "gate_unknown_key"
        );
    }
}

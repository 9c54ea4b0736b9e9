//! The supervisor's table of live children.
//!
//! An entry exists from a successful spawn until the child's exit event has been
//! processed; exited children are removed, never kept around as "dead".

use std::collections::BTreeMap;

use tokio::time::Instant;

use crate::process::{ChildControl, Role, WorkerId};

/// Lifecycle of a child as tracked by the supervisor.
///
/// There is no exited state: once the exit is processed the entry leaves the
/// pool, so snapshots only list live children, and the exit itself is reported
/// as [`EventKind::ProcessExited`](crate::EventKind::ProcessExited).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, readiness not reported yet.
    Starting,
    /// Sent `worker-ready`.
    Ready,
    /// Sent `realport`; eligible for sticky dispatch.
    Listening,
    /// Graceful stop requested by the supervisor.
    Closing,
}

/// Public snapshot of one child.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub role: Role,
    /// Stable position in the pool; a replacement inherits its predecessor's slot.
    pub slot: usize,
    pub label: String,
    pub pid: u32,
    pub state: WorkerState,
    pub port: Option<u16>,
    /// How many children this slot has had, this one included.
    pub generation: u32,
}

pub(crate) struct Worker {
    pub info: WorkerInfo,
    pub control: Box<dyn ChildControl>,
    pub spawned_at: Instant,
    /// Cleared after a failed handoff; the child is presumably on its way out.
    pub routable: bool,
}

#[derive(Default)]
pub(crate) struct Pool {
    workers: BTreeMap<WorkerId, Worker>,
}

impl Pool {
    pub fn insert(&mut self, worker: Worker) {
        self.workers.insert(worker.info.id, worker);
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut Worker> {
        self.workers.get_mut(&id)
    }

    pub fn get(&self, id: WorkerId) -> Option<&Worker> {
        self.workers.get(&id)
    }

    pub fn remove(&mut self, id: WorkerId) -> Option<Worker> {
        self.workers.remove(&id)
    }

    pub fn ids(&self, role: Role) -> Vec<WorkerId> {
        self.workers
            .values()
            .filter(|w| w.info.role == role)
            .map(|w| w.info.id)
            .collect()
    }

    pub fn count(&self, role: Role) -> usize {
        self.workers.values().filter(|w| w.info.role == role).count()
    }

    /// `(slot, id)` of app workers that may receive connections, by slot.
    pub fn routable(&self) -> Vec<(usize, WorkerId)> {
        let mut out: Vec<(usize, WorkerId)> = self
            .workers
            .values()
            .filter(|w| {
                w.info.role == Role::App && w.info.state == WorkerState::Listening && w.routable
            })
            .map(|w| (w.info.slot, w.info.id))
            .collect();
        out.sort_unstable();
        out
    }

    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        self.workers.values().map(|w| w.info.clone()).collect()
    }
}

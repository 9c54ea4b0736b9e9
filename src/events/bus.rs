//! # Event bus for cluster events.
//!
//! [`Bus`] wraps [`tokio::sync::broadcast`]: the supervisor control loop, the
//! spawners and the subscriber workers publish; the fan-out listener and tests
//! subscribe.
//!
//! ```text
//! control loop ──┐
//! spawners     ──┼──► Bus ──► listener ──► SubscriberSet ──► LogWriter, ...
//! subscribers  ──┘
//! ```
//!
//! ## Rules
//! - `publish()` never blocks and never fails; with no receivers the event is dropped.
//! - A receiver only sees events sent after it subscribed.
//! - Receivers that fall more than `capacity` events behind get `Lagged(n)`.

use tokio::sync::broadcast;

use super::event::Event;

/// Cloneable broadcast handle for [`Event`]s.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a bus with a ring buffer of `capacity` events (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fire-and-forget publish.
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Creates an independent receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

//! # Parent/child channels.
//!
//! A channel is an [`Endpoint`]: an [`Outbound`] half that sends [`Envelope`]s to
//! the peer, and an inbox that yields the peer's envelopes. The inbox ends
//! (`recv()` returns `None`) when the peer is gone, which is how children detect
//! a disconnected parent and how the supervisor notices a dead child.
//!
//! Two transports share this shape:
//! - [`socket`]: a `SOCK_SEQPACKET` socketpair; one JSON message per datagram,
//!   connection handles travel as `SCM_RIGHTS`. Used between real processes.
//! - [`local`]: tokio channels, for children hosted as tasks in one process.

pub mod local;
mod message;
pub mod socket;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::IpcError;

pub use message::{Envelope, Message, Target};

/// Sending half of a channel.
#[async_trait]
pub trait Outbound: Send + Sync + 'static {
    /// Delivers one envelope; ownership of any attached connection moves to the peer.
    async fn send(&self, envelope: Envelope) -> Result<(), IpcError>;
}

/// One side of a parent/child channel.
pub struct Endpoint {
    pub tx: Arc<dyn Outbound>,
    pub rx: mpsc::Receiver<Envelope>,
}

/// Inbox depth of both transports.
pub(crate) const INBOX_CAPACITY: usize = 64;

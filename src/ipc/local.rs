//! In-process transport over tokio channels.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Endpoint, Envelope, INBOX_CAPACITY, Outbound};
use crate::error::IpcError;

struct LocalOutbound {
    tx: mpsc::Sender<Envelope>,
}

#[async_trait]
impl Outbound for LocalOutbound {
    async fn send(&self, envelope: Envelope) -> Result<(), IpcError> {
        self.tx.send(envelope).await.map_err(|_| IpcError::Closed)
    }
}

/// Two connected endpoints: `(parent, child)`.
///
/// Dropping every handle of one side ends the other side's inbox.
pub fn pair() -> (Endpoint, Endpoint) {
    let (to_child, child_rx) = mpsc::channel(INBOX_CAPACITY);
    let (to_parent, parent_rx) = mpsc::channel(INBOX_CAPACITY);
    (
        Endpoint {
            tx: Arc::new(LocalOutbound { tx: to_child }),
            rx: parent_rx,
        },
        Endpoint {
            tx: Arc::new(LocalOutbound { tx: to_parent }),
            rx: child_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{Message, Target};

    #[tokio::test]
    async fn dropping_one_side_ends_the_other_inbox() {
        let (parent, mut child) = pair();
        parent
            .tx
            .send(Message::LogReload.into())
            .await
            .unwrap();
        assert_eq!(child.rx.recv().await.unwrap().message, Message::LogReload);

        child
            .tx
            .send(Message::WorkerReady { to: Target::Master }.into())
            .await
            .unwrap();
        drop(parent);
        assert!(child.rx.recv().await.is_none());
    }
}

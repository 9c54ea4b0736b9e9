//! Built-in `echo` framework: every app worker echoes bytes back to the client.
//!
//! The agent has nothing to serve; it only marks a `heartbeat` task ready so the
//! readiness path is exercised end to end.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::BootError;
use crate::unit::{Framework, HostedUnit, UnitContext};
use crate::worker::Connection;

#[derive(Debug, Default, Clone, Copy)]
pub struct EchoFramework;

impl Framework for EchoFramework {
    fn agent(&self, _ctx: &UnitContext) -> Result<Arc<dyn HostedUnit>, BootError> {
        Ok(Arc::new(EchoAgent))
    }

    fn application(&self, _ctx: &UnitContext) -> Result<Arc<dyn HostedUnit>, BootError> {
        Ok(Arc::new(EchoApp))
    }
}

struct EchoAgent;

#[async_trait]
impl HostedUnit for EchoAgent {
    async fn boot(&self, ctx: &UnitContext) -> Result<(), BootError> {
        ctx.gate
            .register("heartbeat")
            .map_err(|e| BootError::failed(e.to_string()))?;
        let gate = ctx.gate.clone();
        tokio::spawn(async move {
            let _ = gate.done("heartbeat", None);
        });
        Ok(())
    }

    async fn on_log_reload(&self) {
        info!("echo agent reopened its logs");
    }
}

struct EchoApp;

#[async_trait]
impl HostedUnit for EchoApp {
    async fn boot(&self, ctx: &UnitContext) -> Result<(), BootError> {
        if ctx.tls.is_some() {
            debug!(worker = %ctx.label(), "tls material loaded; echo serves plaintext");
        }
        Ok(())
    }

    async fn serve(&self, conn: Connection) {
        let peer = conn.peer();
        let (mut reader, mut writer) = tokio::io::split(conn);
        match tokio::io::copy(&mut reader, &mut writer).await {
            Ok(n) => debug!(%peer, bytes = n, "echo connection finished"),
            Err(e) => debug!(%peer, error = %e, "echo connection failed"),
        }
        let _ = writer.shutdown().await;
    }

    async fn on_log_reload(&self) {
        info!("echo app reopened its logs");
    }
}

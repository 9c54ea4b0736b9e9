//! Scripted framework shared by the in-crate tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BootError;
use crate::frameworks::echo::EchoFramework;
use crate::options::StartupOptions;
use crate::process::Role;
use crate::unit::{Framework, Frameworks, HostedUnit, UnitContext};
use crate::worker::Connection;

/// How a unit boots.
#[derive(Clone, Debug, Default)]
pub(crate) enum Boot {
    #[default]
    Ready,
    /// Gate key completes after the delay.
    ReadyAfter(Duration),
    /// Gate key never completes.
    Hang,
    /// `boot` returns an error.
    Fail,
    /// `boot` fails only in the worker with this id.
    FailWorker(u64),
}

/// What the scripted units did.
#[derive(Default)]
pub(crate) struct Probe {
    pub closes: AtomicUsize,
    pub reloads: AtomicUsize,
    /// Labels in close-callback order.
    pub closed: Mutex<Vec<String>>,
}

impl Probe {
    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }
}

#[derive(Clone, Default)]
pub(crate) struct Scripted {
    pub agent: Boot,
    pub app: Boot,
    pub close_delay: Duration,
    pub probe: Arc<Probe>,
}

impl Scripted {
    pub fn frameworks(&self) -> Frameworks {
        let mut frameworks = Frameworks::new();
        frameworks
            .register("scripted", Arc::new(self.clone()))
            .register("echo", Arc::new(EchoFramework));
        frameworks
    }

    /// Two workers on `port` (use `0` for ephemeral ports).
    pub fn options(&self, port: u16, sticky: bool) -> StartupOptions {
        StartupOptions {
            framework: "scripted".into(),
            base_dir: PathBuf::from("."),
            port,
            workers: 2,
            https: false,
            key: None,
            cert: None,
            sticky,
        }
    }

    fn unit(&self, boot: &Boot) -> Arc<dyn HostedUnit> {
        Arc::new(ScriptedUnit {
            boot: boot.clone(),
            close_delay: self.close_delay,
            probe: self.probe.clone(),
        })
    }
}

impl Framework for Scripted {
    fn agent(&self, _ctx: &UnitContext) -> Result<Arc<dyn HostedUnit>, BootError> {
        Ok(self.unit(&self.agent))
    }

    fn application(&self, _ctx: &UnitContext) -> Result<Arc<dyn HostedUnit>, BootError> {
        Ok(self.unit(&self.app))
    }
}

struct ScriptedUnit {
    boot: Boot,
    close_delay: Duration,
    probe: Arc<Probe>,
}

#[async_trait]
impl HostedUnit for ScriptedUnit {
    async fn boot(&self, ctx: &UnitContext) -> Result<(), BootError> {
        let probe = self.probe.clone();
        let delay = self.close_delay;
        let label = ctx.label();
        ctx.closers.register("probe", move || async move {
            tokio::time::sleep(delay).await;
            probe.closes.fetch_add(1, Ordering::SeqCst);
            probe.closed.lock().unwrap().push(label);
            Ok(())
        });

        match &self.boot {
            Boot::Ready => Ok(()),
            Boot::ReadyAfter(delay) => {
                ctx.gate.register("warmup").unwrap();
                let gate = ctx.gate.clone();
                let delay = *delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = gate.done("warmup", None);
                });
                Ok(())
            }
            Boot::Hang => {
                ctx.gate.register("never").unwrap();
                Ok(())
            }
            Boot::Fail => Err(BootError::failed("scripted failure")),
            Boot::FailWorker(id) if ctx.worker.0 == *id && ctx.role == Role::App => {
                Err(BootError::failed(format!("scripted failure in worker {id}")))
            }
            Boot::FailWorker(_) => Ok(()),
        }
    }

    async fn serve(&self, conn: Connection) {
        let (mut reader, mut writer) = tokio::io::split(conn);
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
    }

    async fn on_log_reload(&self) {
        self.probe.reloads.fetch_add(1, Ordering::SeqCst);
    }
}

//! # Hosted units: the code a child process exists to run.
//!
//! A [`Framework`] is resolved by name from the [`Frameworks`] registry and
//! builds one [`HostedUnit`] per child: the agent flavour in the agent process,
//! the application flavour in every app worker.
//!
//! ```text
//! Framework::application(ctx) ──► HostedUnit
//!                                   ├─ boot(ctx)        register gate keys, start loading
//!                                   ├─ listen()         where to listen, if options.port is 0
//!                                   ├─ serve(conn)      one accepted or adopted connection
//!                                   └─ on_log_reload()  reopen log outputs
//! ```
//!
//! ## Rules
//! - `boot` returning `Err` is a startup error (exit 1). Asynchronous loading is
//!   expressed by registering keys on [`UnitContext::gate`] and completing them later.
//! - Close callbacks go to [`UnitContext::closers`]; they run on graceful stop,
//!   newest first, and never on parent loss.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BootError;
use crate::gate::ReadinessGate;
use crate::graceful::CloseRegistry;
use crate::options::StartupOptions;
use crate::process::{Role, WorkerId};
use crate::worker::Connection;

/// Listen preferences of an application unit.
///
/// `path` wins over any port; `port` only applies when `options.port` is `0`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListenConfig {
    pub port: Option<u16>,
    pub path: Option<PathBuf>,
    pub hostname: Option<String>,
}

/// Key and certificate bytes loaded for an HTTPS cluster.
#[derive(Clone)]
pub struct TlsMaterial {
    pub key: Vec<u8>,
    pub cert: Vec<u8>,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("key", &format_args!("<{} bytes>", self.key.len()))
            .field("cert", &format_args!("<{} bytes>", self.cert.len()))
            .finish()
    }
}

/// Everything a unit may touch while booting.
pub struct UnitContext {
    pub role: Role,
    pub worker: WorkerId,
    pub options: Arc<StartupOptions>,
    /// This process's readiness barrier.
    pub gate: ReadinessGate,
    pub closers: CloseRegistry,
    /// Present when `options.https` is on (app workers only).
    pub tls: Option<Arc<TlsMaterial>>,
}

impl UnitContext {
    /// `app_worker#3`-style label used in logs.
    pub fn label(&self) -> String {
        self.role.worker_label(self.worker)
    }
}

#[async_trait]
pub trait HostedUnit: Send + Sync + 'static {
    /// Starts the unit. Register readiness keys on `ctx.gate` for work that
    /// finishes later.
    async fn boot(&self, ctx: &UnitContext) -> Result<(), BootError>;

    fn listen(&self) -> ListenConfig {
        ListenConfig::default()
    }

    /// Handles one connection until it is done.
    async fn serve(&self, conn: Connection) {
        drop(conn);
    }

    async fn on_log_reload(&self) {}
}

/// Builds hosted units for both child kinds.
pub trait Framework: Send + Sync + 'static {
    fn agent(&self, ctx: &UnitContext) -> Result<Arc<dyn HostedUnit>, BootError>;

    fn application(&self, ctx: &UnitContext) -> Result<Arc<dyn HostedUnit>, BootError>;
}

/// Name → framework registry shared by the supervisor (validation) and children
/// (construction).
#[derive(Clone, Default)]
pub struct Frameworks {
    by_name: HashMap<String, Arc<dyn Framework>>,
}

impl Frameworks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `framework` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, framework: Arc<dyn Framework>) -> &mut Self {
        self.by_name.insert(name.into(), framework);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Framework>> {
        self.by_name.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for Frameworks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

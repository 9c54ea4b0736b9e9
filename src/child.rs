//! # Child-process entry.
//!
//! A binary that hosts a cluster re-executes itself for every child. The first
//! thing its `main` does is hand control to [`run_if_child`]:
//!
//! ```no_run
//! fn main() -> std::process::ExitCode {
//!     let frameworks = clustervisor::frameworks::builtin();
//!     if let Some(code) = clustervisor::run_if_child(&frameworks) {
//!         return std::process::ExitCode::from(code as u8);
//!     }
//!     // master-side startup
//!     std::process::ExitCode::SUCCESS
//! }
//! ```
//!
//! Children log to stderr. The filter comes from `CLUSTERVISOR_AGENT_LOG` or
//! `CLUSTERVISOR_APP_LOG`, then `RUST_LOG`, then `info`.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::graceful::{ExitReason, forward_signals};
use crate::ipc::socket;
use crate::options::StartupOptions;
use crate::process::{ENV_GRACE_MS, ENV_IPC_FD, ENV_ROLE, ENV_START_TIMEOUT_MS, ENV_WORKER_ID};
use crate::process::{Role, WorkerId};
use crate::unit::Frameworks;
use crate::worker::{WorkerRuntime, WorkerSettings};

const ENV_AGENT_LOG: &str = "CLUSTERVISOR_AGENT_LOG";
const ENV_APP_LOG: &str = "CLUSTERVISOR_APP_LOG";

struct ChildEnv {
    role: Role,
    id: WorkerId,
    fd: RawFd,
    settings: WorkerSettings,
    options: StartupOptions,
}

/// Runs the child side when this process was spawned as a cluster child.
///
/// Returns `None` in the master (no role in the environment), otherwise the
/// exit status the process should end with.
pub fn run_if_child(frameworks: &Frameworks) -> Option<i32> {
    let role = std::env::var(ENV_ROLE).ok()?;
    let env = match read_env(&role) {
        Ok(env) => env,
        Err(reason) => {
            eprintln!("[{role}_worker] invalid child environment: {reason}");
            return Some(ExitReason::Failure.code());
        }
    };

    init_tracing(env.role);
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "cannot build the child runtime");
            return Some(ExitReason::Failure.code());
        }
    };

    let reason = runtime.block_on(run(env, frameworks.clone()));
    Some(reason.code())
}

async fn run(env: ChildEnv, frameworks: Frameworks) -> ExitReason {
    let label = env.role.worker_label(env.id);
    // SAFETY: the spawner installed our end of the socketpair at this fd and
    // nothing else in this process owns it.
    let fd = unsafe { OwnedFd::from_raw_fd(env.fd) };
    let link = match socket::endpoint(fd) {
        Ok(link) => link,
        Err(e) => {
            error!(worker = %label, error = %e, "cannot open the parent channel");
            return ExitReason::Failure;
        }
    };

    let (triggers_tx, triggers_rx) = mpsc::channel(8);
    if let Err(e) = forward_signals(triggers_tx.clone()) {
        error!(worker = %label, error = %e, "cannot install signal handlers");
        return ExitReason::Failure;
    }

    WorkerRuntime::new(
        env.role,
        env.id,
        Arc::new(env.options),
        frameworks,
        env.settings,
    )
    .run(link, triggers_tx, triggers_rx)
    .await
}

fn read_env(role: &str) -> Result<ChildEnv, String> {
    let role = Role::parse(role).ok_or_else(|| format!("unknown role '{role}'"))?;
    let id = WorkerId(number(ENV_WORKER_ID)?);
    let fd = RawFd::try_from(number(ENV_IPC_FD)?).map_err(|e| format!("{ENV_IPC_FD}: {e}"))?;
    let defaults = WorkerSettings::default();
    let settings = WorkerSettings {
        grace: millis(ENV_GRACE_MS)?.unwrap_or(defaults.grace),
        start_timeout: millis(ENV_START_TIMEOUT_MS)?.unwrap_or(defaults.start_timeout),
    };
    let arg = std::env::args()
        .nth(1)
        .ok_or_else(|| "missing options argument".to_string())?;
    let options = StartupOptions::from_arg(&arg).map_err(|e| format!("options: {e}"))?;
    Ok(ChildEnv {
        role,
        id,
        fd,
        settings,
        options,
    })
}

fn number(key: &str) -> Result<u64, String> {
    let raw = std::env::var(key).map_err(|_| format!("{key} is not set"))?;
    raw.parse().map_err(|_| format!("{key}={raw} is not a number"))
}

fn millis(key: &str) -> Result<Option<Duration>, String> {
    match std::env::var(key) {
        Ok(_) => number(key).map(|ms| Some(Duration::from_millis(ms))),
        Err(_) => Ok(None),
    }
}

fn init_tracing(role: Role) {
    let key = match role {
        Role::Agent => ENV_AGENT_LOG,
        Role::App => ENV_APP_LOG,
    };
    let filter = EnvFilter::try_from_env(key)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

//! Real child processes: the `clustervisor` binary re-executed as an agent or
//! app worker, talking to this test over a socketpair installed at fd 3.
//!
//! Covers what in-process children cannot: the spawner's fd setup, the
//! environment contract read by `run_if_child`, and the exit codes an operator
//! sees (0 after SIGTERM, 1 on a broken environment, 110 once the parent
//! channel is gone). Every wait is bounded so a regression fails instead of
//! hanging.

use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use clustervisor::ipc::{Endpoint, Message, socket};
use clustervisor::process::{
    ChildControl, ChildEvent, ENV_GRACE_MS, ENV_IPC_FD, ENV_ROLE, ENV_START_TIMEOUT_MS, ENV_WORKER_ID,
    ProcessEvent, ProcessSpawner, Role, Spawner, WorkerId,
};
use clustervisor::worker::WorkerSettings;
use clustervisor::{RawOptions, StartupOptions};
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::unistd::dup2;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(15);
const CHILD_FD: RawFd = 3;

fn clustervisor_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_clustervisor"))
}

fn settings() -> WorkerSettings {
    WorkerSettings {
        grace: Duration::from_secs(2),
        start_timeout: Duration::from_secs(5),
    }
}

fn echo_options(dir: &std::path::Path) -> StartupOptions {
    RawOptions {
        framework: Some("echo".into()),
        base_dir: Some(dir.to_path_buf()),
        port: Some("0".into()),
        workers: Some(1),
        ..Default::default()
    }
    .normalize()
    .expect("echo options are valid")
}

async fn next_event(rx: &mut mpsc::Receiver<ProcessEvent>) -> ChildEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("child went silent")
        .expect("event queue closed")
        .event
}

async fn echo(port: u16, payload: &[u8]) -> Vec<u8> {
    let mut conn = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("connect to the worker");
    conn.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    conn.read_exact(&mut buf).await.unwrap();
    buf
}

#[tokio::test]
async fn spawned_app_worker_serves_and_exits_0_on_sigterm() {
    let dir = tempfile::tempdir().unwrap();
    let options = echo_options(dir.path());
    let spawner = ProcessSpawner::new(clustervisor_bin(), settings());
    let (tx, mut rx) = mpsc::channel(16);

    let child = spawner
        .spawn(Role::App, WorkerId(1), &options, tx)
        .await
        .expect("spawn the worker process");
    assert_ne!(child.pid(), 0);

    assert!(matches!(
        next_event(&mut rx).await,
        ChildEvent::Message(Message::WorkerReady { .. })
    ));
    let ChildEvent::Message(Message::RealPort { data: port, .. }) = next_event(&mut rx).await
    else {
        panic!("expected realport");
    };
    assert_ne!(port, 0);
    assert_eq!(echo(port, b"over fd 3").await, b"over fd 3");

    child.stop().expect("deliver SIGTERM");
    match next_event(&mut rx).await {
        ChildEvent::Exited(code) => assert_eq!(code, Some(0)),
        other => panic!("expected exit, got {other:?}"),
    }
}

#[tokio::test]
async fn spawned_agent_reports_ready() {
    let dir = tempfile::tempdir().unwrap();
    let options = echo_options(dir.path());
    let spawner = ProcessSpawner::new(clustervisor_bin(), settings());
    let (tx, mut rx) = mpsc::channel(16);

    let child = spawner
        .spawn(Role::Agent, WorkerId(0), &options, tx)
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut rx).await,
        ChildEvent::Message(Message::WorkerReady { .. })
    ));

    child.stop().unwrap();
    assert!(matches!(next_event(&mut rx).await, ChildEvent::Exited(Some(0))));
}

/// Starts an app worker by hand so the test owns the parent end of its channel.
fn launch_app(options: &StartupOptions) -> (tokio::process::Child, std::os::fd::OwnedFd) {
    let (parent_fd, child_fd) = socket::pair().unwrap();
    let raw = child_fd.as_raw_fd();

    let mut cmd = Command::new(clustervisor_bin());
    cmd.arg(options.to_arg().unwrap())
        .env(ENV_ROLE, "app")
        .env(ENV_WORKER_ID, "7")
        .env(ENV_IPC_FD, CHILD_FD.to_string())
        .env(ENV_GRACE_MS, "2000")
        .env(ENV_START_TIMEOUT_MS, "5000")
        .current_dir(&options.base_dir)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    // SAFETY: only fcntl/dup2 run between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            if raw == CHILD_FD {
                fcntl(raw, FcntlArg::F_SETFD(FdFlag::empty()))?;
            } else {
                dup2(raw, CHILD_FD)?;
            }
            Ok(())
        });
    }
    let child = cmd.spawn().expect("spawn the worker process");
    drop(child_fd);
    (child, parent_fd)
}

async fn next_message(link: &mut Endpoint) -> Message {
    tokio::time::timeout(WAIT, link.rx.recv())
        .await
        .expect("child went silent")
        .expect("channel closed early")
        .message
}

#[tokio::test]
async fn worker_exits_110_when_the_parent_channel_closes() {
    let dir = tempfile::tempdir().unwrap();
    let options = echo_options(dir.path());
    let (mut child, parent_fd) = launch_app(&options);

    let mut link = socket::endpoint(parent_fd).unwrap();
    assert!(matches!(next_message(&mut link).await, Message::WorkerReady { .. }));
    assert!(matches!(next_message(&mut link).await, Message::RealPort { .. }));
    drop(link);

    let status = tokio::time::timeout(WAIT, child.wait())
        .await
        .expect("child outlived its parent channel")
        .unwrap();
    assert_eq!(status.code(), Some(110));
}

#[tokio::test]
async fn broken_child_environment_exits_1() {
    let dir = tempfile::tempdir().unwrap();
    let status = tokio::time::timeout(
        WAIT,
        Command::new(clustervisor_bin())
            .env(ENV_ROLE, "app")
            .env_remove(ENV_WORKER_ID)
            .current_dir(dir.path())
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .status(),
    )
    .await
    .expect("child hung on a broken environment")
    .unwrap();
    assert_eq!(status.code(), Some(1));
}

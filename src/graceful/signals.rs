//! # OS termination signals.
//!
//! `SIGTERM` is the graceful-stop signal sent by the supervisor; `SIGINT` and
//! `SIGQUIT` are treated the same way.

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::ExitTrigger;

/// Waits for one termination signal.
///
/// Each call creates independent listeners; `Err` if registration fails.
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

/// Forwards **every** termination signal as [`ExitTrigger::Signal`].
///
/// Listeners are installed before this returns, so a signal arriving right after
/// is not lost. Repeated signals are forwarded too; `GracefulExit` ignores them
/// while draining.
pub fn forward_signals(tx: mpsc::Sender<ExitTrigger>) -> std::io::Result<JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigint.recv()  => {},
                _ = sigterm.recv() => {},
                _ = sigquit.recv() => {},
            }
            if tx.send(ExitTrigger::Signal).await.is_err() {
                break;
            }
        }
    }))
}

//! # CloseRegistry: `beforeClose`-style callbacks of one process.
//!
//! ## Rules
//! - Callbacks run in **reverse registration order** (last registered closes first).
//! - Each callback is awaited before the next one starts.
//! - A failing callback is logged; the remaining callbacks still run.
//! - Callbacks run at most once: `close_all` drains the registry.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tracing::{debug, error};

/// Error type returned by close callbacks.
pub type CloseError = Box<dyn std::error::Error + Send + Sync>;

type CloseFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), CloseError>> + Send>;

/// Cloneable, shared list of close callbacks.
#[derive(Clone, Default)]
pub struct CloseRegistry {
    callbacks: Arc<Mutex<Vec<(String, CloseFn)>>>,
}

impl CloseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback; `name` only appears in logs.
    pub fn register<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), CloseError>> + Send + 'static,
    {
        let boxed: CloseFn = Box::new(move || Box::pin(f()));
        self.lock().push((name.into(), boxed));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Runs every registered callback, newest first. Returns the number of failures.
    pub async fn close_all(&self, label: &str) -> usize {
        let mut callbacks = std::mem::take(&mut *self.lock());
        let mut failures = 0;
        while let Some((name, f)) = callbacks.pop() {
            debug!(label, callback = %name, "closing");
            if let Err(e) = f().await {
                failures += 1;
                error!(label, callback = %name, error = %e, "close callback failed, continuing");
            }
        }
        failures
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(String, CloseFn)>> {
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

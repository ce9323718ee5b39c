//! Run-level cancellation signalling.
//!
//! A [`CancelHandle`] lets an embedding caller (a UI stop button, a
//! signal handler) abort the test currently in flight. The engine
//! derives a fresh [`CancelToken`] per run and plumbs it into the
//! probe and transfer phases, which race their work against it.

use std::sync::Arc;

use tokio::sync::watch;

/// Cloneable handle for aborting a running test from another task.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation of the run in flight.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Clear a previous request so the next run starts clean.
    pub(crate) fn reset(&self) {
        let _ = self.tx.send(false);
    }

    /// A token observing this handle.
    pub fn token(&self) -> CancelToken {
        CancelToken { rx: self.tx.subscribe() }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver side handed to the probe and transfer phases.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Pends forever if no
    /// request ever arrives (including after every handle is dropped),
    /// so it is safe to race against real work in a `select!`.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

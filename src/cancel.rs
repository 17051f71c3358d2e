//! Cooperative cancellation shared between the archive producer and the
//! upload consumer.
//!
//! A [`CancelToken`] is cloned into every task of a backup run. Cancellation
//! is one-shot: once triggered it stays set, and every suspension point that
//! observes the token returns a [`Cancelled`] error promptly. The token is
//! wired to Ctrl-C and to the end-to-end backup timeout by the pipeline
//! driver.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

/// Error value used for cancelled operations.
///
/// Kept as a distinct type so callers can tell cancellation apart from
/// ordinary I/O failures via [`is_cancelled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Returns true if the error chain contains a [`Cancelled`].
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|c| c.downcast_ref::<Cancelled>().is_some())
}

/// One-shot cancellation signal shared across tasks.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Trigger cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Non-blocking poll, for synchronous code such as the walker.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the token has been cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            // The sender lives in self, so changed() cannot fail here.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Shorthand for producing the cancellation error.
    pub fn error() -> anyhow::Error {
        anyhow::Error::new(Cancelled)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

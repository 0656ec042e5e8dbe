//! Run-wide cancellation signal

use std::sync::Arc;

use tokio::sync::watch;

/// Once-settable cancellation signal shared by every task and probe of a run.
///
/// Clones observe the same signal. Nothing is ever forcibly aborted: holders
/// poll [`Shutdown::is_cancelled`] or race their work against
/// [`Shutdown::cancelled`] and bail out on their own.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation. Later calls are no-ops.
    pub fn trigger(&self) {
        let first = self.tx.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        });
        if first {
            tracing::debug!("Cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once cancellation has been requested (immediately if it already was).
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this can only return Ok.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

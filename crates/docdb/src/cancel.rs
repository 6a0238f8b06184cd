//! Cooperative cancellation for store operations.
//!
//! Every public operation takes a [`CancellationSignal`]. When the signal
//! fires, the in-flight store call is dropped and the operation returns
//! [`StoreError::Cancelled`]. Atomicity of partial work is the store's
//! concern: a dropped procedure call either committed entirely or not at all.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{StoreError, StoreResult};

/// Shared, clonable cancellation flag.
///
/// Clones observe the same flag; cancelling any clone cancels all of them.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSignal {
    /// Creates a signal that has not fired.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Fires the signal. Idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Returns `true` once the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Completes when the signal fires.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }

    /// Drives `operation` unless the signal fires first.
    pub async fn run<T, F>(&self, operation: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        if self.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = self.cancelled() => Err(StoreError::Cancelled),
            result = operation => result,
        }
    }

    /// Sleeps for `duration`, returning early with an error on cancellation.
    pub async fn sleep(&self, duration: Duration) -> StoreResult<()> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

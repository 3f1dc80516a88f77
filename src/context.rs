//! Per-run context shared by the scheduler and providers.

use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// Context of a single plan/apply run.
///
/// Cloning is cheap; every clone observes the same cancellation signal.
#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: Uuid,
    timeout: Duration,
    cancel: watch::Receiver<bool>,
}

/// Raises the cancellation signal of a [`RunContext`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl RunContext {
    /// Creates a context with the given per-call timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            run_id: Uuid::new_v4(),
            timeout,
            cancel: rx,
        };
        (ctx, CancelHandle { tx })
    }

    /// Unique identifier of this run.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Deadline for each provider call.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns true once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves when cancellation is requested.
    ///
    /// Never resolves if the handle is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl CancelHandle {
    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_is_observed_by_clones() {
        let (ctx, handle) = RunContext::new(Duration::from_secs(5));
        let clone = ctx.clone();
        assert!(!clone.is_cancelled());

        let waiter = tokio::spawn(async move { clone.cancelled().await });
        handle.cancel();
        handle.cancel();

        waiter.await.unwrap();
        assert!(ctx.is_cancelled());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_handle_never_cancels() {
        let (ctx, handle) = RunContext::new(Duration::from_secs(5));
        drop(handle);
        let waited = tokio::time::timeout(Duration::from_millis(20), ctx.cancelled()).await;
        assert!(waited.is_err());
        assert!(!ctx.is_cancelled());
    }
}

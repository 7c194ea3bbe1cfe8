//! One cancellation primitive, composed everywhere a worker can block.
//!
//! Every suspension point in the engine — queue claim, semaphore acquire,
//! leaky-bucket wait, the provider HTTP call, the batch-writer submit —
//! takes the same [`Cancellation`] handle. There is no per-call timeout
//! type; callers compose deadlines by racing a `tokio::time::sleep`
//! against the same token if they need one (see [`Cancellation::child_with_deadline`]).

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Cheaply cloneable cancellation handle. Firing it (directly or via a
/// parent) wakes every pending `wait_for_cancel()` caller.
#[derive(Clone, Debug)]
pub struct Cancellation(CancellationToken);

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        Self(CancellationToken::new())
    }

    /// A child token that is cancelled when either this token or the child
    /// itself is cancelled, and that additionally fires after `deadline`
    /// elapses. Used to compose a handler's per-attempt timeout with the
    /// run-wide cancellation, per spec.md S5 ("overall deadline = min(handler
    /// deadline, lease deadline)").
    pub fn child_with_deadline(&self, deadline: Duration) -> Self {
        let child = Cancellation(self.0.child_token());
        let trigger = child.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            trigger.cancel();
        });
        child
    }

    pub fn child(&self) -> Self {
        Cancellation(self.0.child_token())
    }

    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.0.cancelled().await
    }

    /// Race `fut` against cancellation. Returns `None` if cancellation won.
    pub async fn race<F, T>(&self, fut: F) -> Option<T>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.cancelled() => None,
            out = fut => Some(out),
        }
    }
}

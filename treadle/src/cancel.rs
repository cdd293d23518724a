//! Cooperative cancellation: a single token propagates to every handler
//! invocation and every parallel sub-traversal.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::sync::Notify;

struct Inner {
    cancelled: Mutex<bool>,
    notify: Notify,
    parent: Option<CancelToken>,
}

/// A cloneable, hierarchical cancellation signal.
///
/// Cancelling a token also cancels every token derived from it via
/// [`CancelToken::child_token`] — used by `error_policy=fail_fast` in the
/// parallel executor to tear down sibling branches from the first failure.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: Mutex::new(false),
                notify: Notify::new(),
                parent: None,
            }),
        }
    }

    /// A derived token: cancelling `self` cancels this child too, but
    /// cancelling the child has no effect on `self` or its siblings.
    pub fn child_token(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: Mutex::new(false),
                notify: Notify::new(),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        *self.inner.cancelled.lock().expect("cancel token mutex poisoned") = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        if *self.inner.cancelled.lock().expect("cancel token mutex poisoned") {
            return true;
        }
        match &self.inner.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }

    /// A future that resolves once this token (or an ancestor) is cancelled.
    pub fn cancelled(&self) -> Cancelled {
        Cancelled { token: self.clone() }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Cancelled {
    token: CancelToken,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.token.is_cancelled() {
            return Poll::Ready(());
        }
        let notified = self.token.inner.notify.notified();
        tokio::pin!(notified);
        notified.poll(cx)
    }
}

/// Sleeps for `duration`, waking early if `token` is cancelled before the
/// timer elapses. Returns `Err(())` when cancellation won the race.
pub async fn cancellable_sleep(duration: std::time::Duration, token: &CancelToken) -> Result<(), ()> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = token.cancelled() => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// **Scenario**: cancelling a parent token also cancels a derived child token.
    #[tokio::test]
    async fn cancelling_parent_cancels_child() {
        let parent = CancelToken::new();
        let child = parent.child_token();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    /// **Scenario**: cancelling a child does not affect its parent.
    #[tokio::test]
    async fn cancelling_child_does_not_affect_parent() {
        let parent = CancelToken::new();
        let child = parent.child_token();
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    /// **Scenario**: cancellable_sleep wakes early on cancellation.
    #[tokio::test]
    async fn cancellable_sleep_wakes_early_on_cancel() {
        let token = CancelToken::new();
        let token_clone = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            token_clone.cancel();
        });
        let result = cancellable_sleep(Duration::from_secs(60), &token).await;
        assert!(result.is_err());
    }
}

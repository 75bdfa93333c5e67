//! Hierarchical cancellation tokens.

use parking_lot::Mutex;
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::Notify;
use tracing::debug;

/// A token for cooperative cancellation.
///
/// A run owns one root token and hands every dispatched instance a child.
/// Cancelling a token cancels all of its live descendants with the same
/// reason; cancelling a child leaves its parent and siblings running.
///
/// Stage bodies either poll [`CancellationToken::is_cancelled`] or await
/// [`CancellationToken::cancelled`]. Only the first reason is kept.
#[derive(Default)]
pub struct CancellationToken {
    reason: OnceLock<String>,
    children: Mutex<Vec<Weak<CancellationToken>>>,
    notify: Notify,
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token that is cancelled whenever `self` is.
    ///
    /// A child created after its parent was cancelled starts cancelled.
    #[must_use]
    pub fn child(&self) -> Arc<Self> {
        let child = Arc::new(Self::new());
        {
            let mut children = self.children.lock();
            if self.reason.get().is_none() {
                children.retain(|c| c.strong_count() > 0);
                children.push(Arc::downgrade(&child));
                return child;
            }
        }
        if let Some(reason) = self.reason() {
            child.cancel(reason);
        }
        child
    }

    /// Requests cancellation with a reason.
    ///
    /// Returns false if the token was already cancelled.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        // Holding the lock orders this against `child`.
        let children = {
            let mut children = self.children.lock();
            if self.reason.set(reason.clone()).is_err() {
                return false;
            }
            std::mem::take(&mut *children)
        };
        self.notify.notify_waiters();

        let live: Vec<_> = children.iter().filter_map(Weak::upgrade).collect();
        if !live.is_empty() {
            debug!(children = live.len(), reason = %reason, "Propagating cancellation");
        }
        for child in live {
            child.cancel(reason.clone());
        }
        true
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.reason.get().is_some()
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.get().cloned()
    }

    /// Completes once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent cancel is not missed.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("reason", &self.reason.get())
            .field("children", &self.children.lock().len())
            .finish()
    }
}

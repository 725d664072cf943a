// Cooperative cancellation module
// A token is polled at well-defined checkpoints (per batch, per item, before a
// database operation); nothing is preempted. Tokens form a tree: cancelling a
// parent cancels every child, so an external signal and an internal deadline can
// be combined by linking a child under both.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
            children: Mutex::new(Vec::new()),
        })
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return; // already cancelled, children already signalled
        }
        let children = {
            let mut guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
        self.notify.notify_waiters();
    }

    fn attach_child(&self, child: &Arc<Inner>) {
        if self.cancelled.load(Ordering::SeqCst) {
            child.cancel();
            return;
        }
        let mut guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
        // Re-check under the lock: cancel() takes the list before signalling.
        if self.cancelled.load(Ordering::SeqCst) {
            drop(guard);
            child.cancel();
        } else {
            guard.retain(|w| w.strong_count() > 0);
            guard.push(Arc::downgrade(child));
        }
    }
}

/// Cancellation signal shared between a caller and the work it scheduled.
///
/// Cloning is cheap (shared state); cancellation is cooperative and permanent:
/// once cancelled a token never resets.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Create a fresh, un-cancelled token.
    pub fn new() -> Self {
        Self { inner: Inner::new() }
    }

    /// Create a token that cancels when this one does, but can also be
    /// cancelled on its own without affecting the parent.
    pub fn child_token(&self) -> Self {
        let child = Self::new();
        self.inner.attach_child(&child.inner);
        child
    }

    /// Create a token that fires as soon as *any* of the given tokens fires.
    pub fn linked(tokens: &[&CancellationToken]) -> Self {
        let child = Self::new();
        for token in tokens {
            token.inner.attach_child(&child.inner);
        }
        child
    }

    /// Request cancellation. Idempotent; propagates to all child tokens.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the token is cancelled. Safe to call from multiple tasks.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register the waiter before checking the flag so a cancel() racing
            // with this call cannot be missed.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Identity comparison: true iff both tokens share the same state.
    /// Used by the scheduler to match queued requests against a cancel signal.
    pub fn same(a: &CancellationToken, b: &CancellationToken) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

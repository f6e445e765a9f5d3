//! Cancellation scopes for the launcher's worker threads.
//!
//! A [`CancelScope`] is a cloneable flag that threads can block on. Scopes
//! form a tree: cancelling a scope cancels every scope derived from it with
//! [`CancelScope::child`], never the other way round.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct State {
    cancelled: bool,
    children: Vec<Weak<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    signal: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking holder cannot leave `State` half-updated, so recover the guard.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn cancel(&self) {
        let children = {
            let mut state = self.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            std::mem::take(&mut state.children)
        };
        self.signal.notify_all();
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelScope {
    inner: Arc<Inner>,
}

impl CancelScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new scope that is cancelled whenever `self` is.
    pub fn child(&self) -> Self {
        let child = Self::new();
        let mut state = self.inner.lock();
        if state.cancelled {
            drop(state);
            child.cancel();
        } else {
            state.children.retain(|c| c.strong_count() > 0);
            state.children.push(Arc::downgrade(&child.inner));
        }
        child
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    /// Block for up to `timeout`. Returns `true` if the scope was cancelled
    /// before the timeout elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock();
        while !state.cancelled {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            state = self
                .inner
                .signal
                .wait_timeout(state, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        true
    }

    /// Block until the scope is cancelled.
    pub fn wait(&self) {
        let mut state = self.inner.lock();
        while !state.cancelled {
            state = self
                .inner
                .signal
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }
}

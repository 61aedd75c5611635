//! Cancellation tokens for running workers.
//!
//! A token is checked at every suspension point of the worker loop and
//! inside streaming processors. Cancelling releases the thread lease at
//! the next quiescent point; in-flight provider streams are dropped,
//! which aborts the underlying request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cancellation flag shared between a run handle and its worker.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Composite cancellation: a worker-owned token plus every caller
/// supplied abort signal. Cancelled when any member is.
#[derive(Clone, Default)]
pub struct CancelSet {
    own: CancelToken,
    signals: Arc<parking_lot::Mutex<Vec<CancelToken>>>,
}

impl CancelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the worker-owned token.
    pub fn cancel(&self) {
        self.own.cancel();
    }

    /// Add a caller's abort signal to the set.
    pub fn add_signal(&self, signal: CancelToken) {
        self.signals.lock().push(signal);
    }

    pub fn is_cancelled(&self) -> bool {
        self.own.is_cancelled() || self.signals.lock().iter().any(CancelToken::is_cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn cancel_set_trips_on_any_member() {
        let set = CancelSet::new();
        assert!(!set.is_cancelled());

        let signal = CancelToken::new();
        set.add_signal(signal.clone());
        assert!(!set.is_cancelled());

        signal.cancel();
        assert!(set.is_cancelled());

        let set2 = CancelSet::new();
        set2.cancel();
        assert!(set2.is_cancelled());
    }
}

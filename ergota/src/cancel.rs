//! Cooperative cancellation of an update session.
//!
//! Each call to [`OtaEngine::perform_update`](crate::OtaEngine::perform_update)
//! creates a fresh [`CancelToken`]. The transfer loop checks it before every
//! Package write and after every acknowledgment; a write already handed to the
//! transport is never interrupted. Cancelling one session cannot affect the
//! next, because the next session owns a different token.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared cancellation flag for one session.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Calling this again has no further effect.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_default_not_cancelled() {
        assert!(!CancelToken::new().is_cancelled());
    }

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let observer = token.clone();
        token.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_tokens_are_independent() {
        let first = CancelToken::new();
        let second = CancelToken::new();
        first.cancel();
        assert!(!second.is_cancelled());
    }
}

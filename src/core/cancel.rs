/*!
 * Cooperative cancellation
 *
 * The caller owns a [`CancellationToken`]. Each run derives a child token
 * from it, so the run stops when the caller cancels and can also stop itself
 * through an [`AbortLatch`] without touching the caller's token.
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::FreightError;

/// Shared flag raised by the caller and polled by the engine
///
/// Checked at file start in both lanes, before every chunk and before each
/// retry attempt. A chunk write in progress is never interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    /// Flags of every ancestor token
    parents: Vec<Arc<AtomicBool>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled with this one, but cancellable on its own
    pub fn child(&self) -> Self {
        let mut parents = self.parents.clone();
        parents.push(Arc::clone(&self.flag));
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parents,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.parents.iter().any(|flag| flag.load(Ordering::SeqCst))
    }
}

/// Keeps the first fatal error of a run and stops the run when tripped
#[derive(Debug)]
pub struct AbortLatch {
    token: CancellationToken,
    error: Mutex<Option<FreightError>>,
}

impl AbortLatch {
    /// Latch that cancels `token` when tripped
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            error: Mutex::new(None),
        }
    }

    /// Record `err` unless an earlier error is already held, then stop the run
    pub fn trip(&self, err: FreightError) {
        let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
        drop(slot);
        self.token.cancel();
    }

    pub fn is_tripped(&self) -> bool {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Take the recorded error, leaving the latch empty
    pub fn take(&self) -> Option<FreightError> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn test_child_follows_parent_only_downwards() {
        let parent = CancellationToken::new();
        let child = parent.child();
        let grandchild = child.child();

        child.cancel();
        assert!(grandchild.is_cancelled());
        assert!(!parent.is_cancelled());

        let other = parent.child();
        assert!(!other.is_cancelled());
        parent.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_latch_keeps_first_error_and_cancels() {
        let caller = CancellationToken::new();
        let run = caller.child();
        let latch = AbortLatch::new(run.clone());
        assert!(!latch.is_tripped());

        latch.trip(FreightError::SinkUnavailable("first".to_string()));
        latch.trip(FreightError::SinkUnavailable("second".to_string()));

        assert!(latch.is_tripped());
        assert!(run.is_cancelled());
        assert!(!caller.is_cancelled());
        match latch.take() {
            Some(FreightError::SinkUnavailable(message)) => assert_eq!(message, "first"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(latch.take().is_none());
    }
}

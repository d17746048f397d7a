//! Caller-owned cancellation signal for a batch.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Terminal state of a [`CancellationTrigger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    /// Not fired yet.
    Pending,
    /// Fired by [`CancellationTrigger::cancel`].
    Cancelled,
    /// Fired by [`CancellationTrigger::complete`]. The execution contract
    /// requires triggers to resolve exceptionally; completing one normally
    /// fails the batch with [`crate::Error::IllegalTrigger`].
    Completed,
}

type Observer = Box<dyn FnOnce(TriggerState) + Send>;

struct Inner {
    state: TriggerState,
    observers: Vec<Observer>,
}

/// Cancellation signal handed to [`crate::Scheduler::submit`].
///
/// The caller keeps one end and fires it at most once; the scheduler
/// observes the other. Clones share the same underlying signal.
#[derive(Clone)]
pub struct CancellationTrigger {
    inner: Arc<Mutex<Inner>>,
}

impl CancellationTrigger {
    /// A fresh, unfired trigger.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: TriggerState::Pending,
                observers: Vec::new(),
            })),
        }
    }

    /// Request cancellation of every batch observing this trigger.
    ///
    /// Returns `true` if this call fired the trigger, `false` if it had
    /// already fired.
    pub fn cancel(&self) -> bool {
        self.fire(TriggerState::Cancelled)
    }

    /// Resolve the trigger normally. This violates the execution contract
    /// and fails observing batches with [`crate::Error::IllegalTrigger`];
    /// it exists so the violation is loud instead of silently swallowed.
    pub fn complete(&self) -> bool {
        self.fire(TriggerState::Completed)
    }

    /// Current state.
    pub fn state(&self) -> TriggerState {
        self.inner.lock().state
    }

    /// Whether the trigger has fired, in either direction.
    pub fn is_fired(&self) -> bool {
        self.state() != TriggerState::Pending
    }

    // First transition wins. Observers run after the lock is released and
    // may themselves touch the trigger.
    fn fire(&self, state: TriggerState) -> bool {
        let drained = {
            let mut inner = self.inner.lock();
            if inner.state != TriggerState::Pending {
                return false;
            }
            inner.state = state;
            std::mem::take(&mut inner.observers)
        };
        for observer in drained {
            observer(state);
        }
        true
    }

    /// Run `f` when the trigger fires. Runs inline if it already has.
    pub(crate) fn observe<F>(&self, f: F)
    where
        F: FnOnce(TriggerState) + Send + 'static,
    {
        let fired = {
            let mut inner = self.inner.lock();
            match inner.state {
                TriggerState::Pending => {
                    inner.observers.push(Box::new(f));
                    return;
                }
                state => state,
            }
        };
        f(fired);
    }
}

impl Default for CancellationTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationTrigger")
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_first_transition_wins() {
        let trigger = CancellationTrigger::new();
        assert_eq!(trigger.state(), TriggerState::Pending);

        assert!(trigger.cancel());
        assert!(!trigger.complete());
        assert!(!trigger.cancel());
        assert_eq!(trigger.state(), TriggerState::Cancelled);
    }

    #[test]
    fn test_observer_runs_on_fire() {
        let trigger = CancellationTrigger::new();
        let seen = Arc::new(Mutex::new(None));

        let sink = seen.clone();
        trigger.observe(move |state| *sink.lock() = Some(state));
        assert_eq!(*seen.lock(), None);

        trigger.complete();
        assert_eq!(*seen.lock(), Some(TriggerState::Completed));
    }

    #[test]
    fn test_observer_runs_inline_when_already_fired() {
        let trigger = CancellationTrigger::new();
        trigger.cancel();

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        trigger.observe(move |state| *sink.lock() = Some(state));
        assert_eq!(*seen.lock(), Some(TriggerState::Cancelled));
    }

    #[test]
    fn test_clones_share_state() {
        let trigger = CancellationTrigger::new();
        let other = trigger.clone();

        let fired = Arc::new(AtomicUsize::new(0));
        let sink = fired.clone();
        other.observe(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        trigger.cancel();
        assert!(other.is_fired());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}

//! Batch completion handles.
//!
//! [`CompletionHandle`] is the read-only view a caller gets back from
//! [`crate::Scheduler::submit`]. Only the scheduler can resolve it, through
//! the crate-internal [`CompletionPromise`]. The mutating methods exist on
//! the handle solely to refuse: external completion would corrupt the
//! batch's bookkeeping, so they all return [`Error::Unsupported`].

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Shared {
    outcome: Mutex<Option<Result<()>>>,
    resolved: Condvar,
    cancel_requested: AtomicBool,
}

/// Read-only view of a batch's completion.
///
/// Clones observe the same batch. The handle resolves exactly once: `Ok(())`
/// when every tasklet finished, or the batch's first failure.
#[derive(Clone)]
pub struct CompletionHandle {
    shared: Arc<Shared>,
}

impl CompletionHandle {
    /// Block until the batch resolves and return its outcome.
    pub fn wait(&self) -> Result<()> {
        let mut outcome = self.shared.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            self.shared.resolved.wait(&mut outcome);
        }
    }

    /// Block for at most `timeout`. `None` means the batch is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.shared.outcome.lock();
        while outcome.is_none() {
            if self
                .shared
                .resolved
                .wait_until(&mut outcome, deadline)
                .timed_out()
            {
                break;
            }
        }
        outcome.clone()
    }

    /// The outcome, if the batch has resolved.
    pub fn outcome(&self) -> Option<Result<()>> {
        self.shared.outcome.lock().clone()
    }

    /// Whether the batch has resolved.
    pub fn is_resolved(&self) -> bool {
        self.shared.outcome.lock().is_some()
    }

    /// Whether cancellation has been requested for this batch. The handle
    /// may still be unresolved while in-flight cooperative calls finish.
    pub fn cancellation_requested(&self) -> bool {
        self.shared.cancel_requested.load(Ordering::Acquire)
    }

    /// Always refused: only the scheduler resolves a batch.
    pub fn complete(&self) -> Result<()> {
        Err(Error::Unsupported("complete"))
    }

    /// Always refused: only the scheduler resolves a batch.
    pub fn fail(&self, _cause: Error) -> Result<()> {
        Err(Error::Unsupported("fail"))
    }

    /// Always refused: cancellation goes through the batch's
    /// [`crate::CancellationTrigger`], not its handle.
    pub fn cancel(&self) -> Result<()> {
        Err(Error::Unsupported("cancel"))
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Resolving side of a [`CompletionHandle`].
pub(crate) struct CompletionPromise {
    shared: Arc<Shared>,
}

impl CompletionPromise {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                outcome: Mutex::new(None),
                resolved: Condvar::new(),
                cancel_requested: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn handle(&self) -> CompletionHandle {
        CompletionHandle {
            shared: self.shared.clone(),
        }
    }

    /// Resolve once. Returns whether this call did the resolving.
    pub(crate) fn resolve(&self, outcome: Result<()>) -> bool {
        let mut slot = self.shared.outcome.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        drop(slot);
        self.shared.resolved.notify_all();
        true
    }

    pub(crate) fn mark_cancel_requested(&self) {
        self.shared.cancel_requested.store(true, Ordering::Release);
    }
}

impl fmt::Debug for CompletionPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionPromise")
            .field("resolved", &self.shared.outcome.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_unresolved_queries() {
        let promise = CompletionPromise::new();
        let handle = promise.handle();

        assert!(!handle.is_resolved());
        assert!(handle.outcome().is_none());
        assert!(!handle.cancellation_requested());
        assert!(handle
            .wait_timeout(Duration::from_millis(10))
            .is_none());
    }

    #[test]
    fn test_resolve_once() {
        let promise = CompletionPromise::new();
        let handle = promise.handle();

        assert!(promise.resolve(Ok(())));
        assert!(!promise.resolve(Err(Error::Cancelled)));

        assert!(handle.is_resolved());
        assert!(handle.wait().is_ok());
        assert!(handle.outcome().is_some_and(|o| o.is_ok()));
    }

    #[test]
    fn test_wait_blocks_until_resolved() {
        let promise = CompletionPromise::new();
        let handle = promise.handle();

        let waiter = thread::spawn(move || handle.wait());
        thread::sleep(Duration::from_millis(20));
        promise.resolve(Err(Error::Cancelled));

        let outcome = waiter.join().unwrap();
        assert!(matches!(outcome, Err(Error::Cancelled)));
    }

    #[test]
    fn test_mutations_refused() {
        let promise = CompletionPromise::new();
        let handle = promise.handle();

        assert!(matches!(handle.complete(), Err(Error::Unsupported(_))));
        assert!(matches!(
            handle.fail(Error::Cancelled),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(handle.cancel(), Err(Error::Unsupported(_))));
        assert!(!handle.is_resolved());
    }

    #[test]
    fn test_clones_share_outcome() {
        let promise = CompletionPromise::new();
        let handle = promise.handle();
        let other = handle.clone();

        promise.mark_cancel_requested();
        promise.resolve(Err(Error::Cancelled));

        assert!(other.cancellation_requested());
        assert!(matches!(other.wait(), Err(Error::Cancelled)));
    }
}

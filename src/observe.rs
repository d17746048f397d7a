//! Hooks for watching batch lifecycles.

use crate::error::Error;
use crate::scheduler::BatchId;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, warn};

/// Facts about a submitted batch, passed to every observer callback.
#[derive(Debug, Clone)]
pub struct BatchInfo {
    /// Scheduler-assigned id.
    pub id: BatchId,
    /// Name from the batch's [`crate::ExecutionContext`].
    pub name: String,
    /// Total tasklet count.
    pub tasklets: usize,
    /// How many tasklets run cooperatively.
    pub cooperative: usize,
    /// How many tasklets run on dedicated threads.
    pub blocking: usize,
}

/// Callbacks fired as batches move through the scheduler.
///
/// All callbacks run on scheduler or worker threads and are panic-isolated:
/// a misbehaving observer never affects execution. Implementations should
/// still return quickly.
pub trait ExecutionObserver: Send + Sync {
    /// A batch passed admission and is about to initialize.
    fn batch_submitted(&self, info: &BatchInfo) {
        let _ = info;
    }

    /// Every tasklet in the batch completed.
    fn batch_completed(&self, info: &BatchInfo) {
        let _ = info;
    }

    /// The batch resolved with a failure.
    fn batch_failed(&self, info: &BatchInfo, error: &Error) {
        let _ = (info, error);
    }
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl ExecutionObserver for NullObserver {}

/// Observer that emits `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl ExecutionObserver for LogObserver {
    fn batch_submitted(&self, info: &BatchInfo) {
        debug!(
            batch = %info.id,
            name = %info.name,
            tasklets = info.tasklets,
            cooperative = info.cooperative,
            blocking = info.blocking,
            "batch submitted"
        );
    }

    fn batch_completed(&self, info: &BatchInfo) {
        debug!(batch = %info.id, name = %info.name, "batch completed");
    }

    fn batch_failed(&self, info: &BatchInfo, error: &Error) {
        warn!(batch = %info.id, name = %info.name, error = %error, "batch failed");
    }
}

// Panic isolation for observer callbacks.
pub(crate) fn guarded<F: FnOnce()>(f: F) {
    let _ = catch_unwind(AssertUnwindSafe(f));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_swallows_panics() {
        guarded(|| panic!("observer bug"));
    }

    #[test]
    fn test_default_callbacks_are_noops() {
        let info = BatchInfo {
            id: BatchId::next(),
            name: "batch".into(),
            tasklets: 3,
            cooperative: 2,
            blocking: 1,
        };
        NullObserver.batch_submitted(&info);
        NullObserver.batch_completed(&info);
        NullObserver.batch_failed(&info, &Error::Cancelled);
    }
}

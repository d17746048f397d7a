//! Per-batch bookkeeping.
//!
//! A [`BatchState`] tracks one submission: a countdown of unfinished
//! tasklets, a first-failure slot, and the promise behind the caller's
//! completion handle. Workers and blocking runners report into it; it
//! resolves the handle exactly once, when the countdown hits zero or the
//! batch is failed without ever dispatching.

use crate::error::{Error, Result};
use crate::handle::{CompletionHandle, CompletionPromise};
use crate::observe::{self, BatchInfo, ExecutionObserver};
use crate::trigger::TriggerState;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

static BATCH_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId(u64);

impl BatchId {
    pub(crate) fn next() -> Self {
        BatchId(BATCH_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-supplied context for a submission.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    name: String,
}

impl ExecutionContext {
    /// Context with a name that shows up in logs and observer callbacks.
    pub fn named<S: Into<String>>(name: S) -> Self {
        Self { name: name.into() }
    }

    /// The batch name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::named("unnamed")
    }
}

pub(crate) struct BatchState {
    pub(crate) id: BatchId,
    remaining: AtomicUsize,
    failed: AtomicBool,
    failure: Mutex<Option<Error>>,
    promise: CompletionPromise,
    blocking_slots: Mutex<Vec<Arc<BlockingSlot>>>,
    registry: Weak<BatchRegistry>,
    observer: Arc<dyn ExecutionObserver>,
    info: BatchInfo,
}

impl BatchState {
    pub(crate) fn new(
        info: BatchInfo,
        registry: &Arc<BatchRegistry>,
        observer: Arc<dyn ExecutionObserver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: info.id,
            remaining: AtomicUsize::new(info.tasklets),
            failed: AtomicBool::new(false),
            failure: Mutex::new(None),
            promise: CompletionPromise::new(),
            blocking_slots: Mutex::new(Vec::new()),
            registry: Arc::downgrade(registry),
            observer,
            info,
        })
    }

    pub(crate) fn handle(&self) -> CompletionHandle {
        self.promise.handle()
    }

    /// Fast check workers use to dismiss trackers of a failed batch.
    pub(crate) fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Record a failure; the first one wins and becomes the handle outcome.
    pub(crate) fn record_failure(&self, error: Error) {
        if error.is_cancelled() {
            self.promise.mark_cancel_requested();
        }
        {
            let mut slot = self.failure.lock();
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        self.failed.store(true, Ordering::Release);
    }

    /// One tasklet will never be called again. The last report resolves the
    /// handle.
    pub(crate) fn tasklet_done(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.resolve_now();
        }
    }

    /// Resolve the handle with the recorded failure, or success if none.
    pub(crate) fn resolve_now(&self) {
        let outcome = match self.failure.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        };
        self.finish(outcome);
    }

    fn finish(&self, outcome: Result<()>) {
        if !self.promise.resolve(outcome.clone()) {
            return;
        }
        // Slots point back at this batch; dropping our copies breaks the
        // cycle. Runners keep their own handles for late reports.
        self.blocking_slots.lock().clear();
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        match outcome {
            Ok(()) => {
                debug!(batch = %self.id, name = %self.info.name, "batch completed");
                observe::guarded(|| self.observer.batch_completed(&self.info));
            }
            Err(error) => {
                debug!(batch = %self.id, name = %self.info.name, error = %error, "batch failed");
                observe::guarded(|| self.observer.batch_failed(&self.info, &error));
            }
        }
    }

    /// The batch's trigger fired. Cancellation is a normal failure;
    /// completing the trigger is a contract violation and is reported as
    /// one. Blocking tasklets are abandoned either way.
    pub(crate) fn trigger_fired(&self, state: TriggerState) {
        let error = match state {
            TriggerState::Cancelled => Error::Cancelled,
            TriggerState::Completed => {
                warn!(batch = %self.id, "cancellation trigger completed normally");
                Error::IllegalTrigger
            }
            TriggerState::Pending => return,
        };
        self.record_failure(error);
        self.abandon_blocking();
    }

    /// Cancel on behalf of scheduler shutdown.
    pub(crate) fn abandon(&self) {
        self.record_failure(Error::Cancelled);
        self.abandon_blocking();
    }

    /// Install the batch's blocking slots once dispatch has decided them.
    pub(crate) fn set_blocking_slots(&self, slots: Vec<Arc<BlockingSlot>>) {
        *self.blocking_slots.lock() = slots;
        // A trigger that fired between dispatch and this store must still
        // abandon the new slots.
        if self.has_failed() {
            self.abandon_blocking();
        }
    }

    /// Report every blocking tasklet done without waiting for its thread.
    fn abandon_blocking(&self) {
        let slots: Vec<Arc<BlockingSlot>> = self.blocking_slots.lock().clone();
        for slot in slots {
            slot.report_done();
        }
    }
}

/// Done-reporting token for one blocking tasklet.
///
/// Both the dedicated thread and cancellation-driven abandonment call
/// [`report_done`](Self::report_done); the swap guard makes sure the batch
/// countdown sees each tasklet at most once.
pub(crate) struct BlockingSlot {
    batch: Arc<BatchState>,
    reported: AtomicBool,
}

impl BlockingSlot {
    pub(crate) fn new(batch: Arc<BatchState>) -> Arc<Self> {
        Arc::new(Self {
            batch,
            reported: AtomicBool::new(false),
        })
    }

    pub(crate) fn batch(&self) -> &Arc<BatchState> {
        &self.batch
    }

    pub(crate) fn report_done(&self) {
        if !self.reported.swap(true, Ordering::AcqRel) {
            self.batch.tasklet_done();
        }
    }
}

/// Live batches, keyed by id. Drain-style shutdown waits on emptiness.
pub(crate) struct BatchRegistry {
    live: Mutex<HashMap<BatchId, Arc<BatchState>>>,
    drained: Condvar,
}

impl BatchRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            live: Mutex::new(HashMap::new()),
            drained: Condvar::new(),
        })
    }

    pub(crate) fn register(&self, batch: &Arc<BatchState>) {
        self.live.lock().insert(batch.id, batch.clone());
    }

    pub(crate) fn remove(&self, id: BatchId) {
        let mut live = self.live.lock();
        live.remove(&id);
        if live.is_empty() {
            self.drained.notify_all();
        }
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<BatchState>> {
        self.live.lock().values().cloned().collect()
    }

    pub(crate) fn wait_empty(&self) {
        let mut live = self.live.lock();
        while !live.is_empty() {
            self.drained.wait(&mut live);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::NullObserver;

    fn test_batch(tasklets: usize) -> (Arc<BatchState>, Arc<BatchRegistry>) {
        let registry = BatchRegistry::new();
        let info = BatchInfo {
            id: BatchId::next(),
            name: "test".into(),
            tasklets,
            cooperative: tasklets,
            blocking: 0,
        };
        let batch = BatchState::new(info, &registry, Arc::new(NullObserver));
        registry.register(&batch);
        (batch, registry)
    }

    #[test]
    fn test_countdown_resolves_success() {
        let (batch, registry) = test_batch(3);
        let handle = batch.handle();

        batch.tasklet_done();
        batch.tasklet_done();
        assert!(!handle.is_resolved());

        batch.tasklet_done();
        assert!(handle.wait().is_ok());
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_first_failure_wins() {
        let (batch, _registry) = test_batch(2);
        let handle = batch.handle();

        batch.record_failure(Error::call("a", "first".into()));
        batch.record_failure(Error::call("b", "second".into()));
        assert!(batch.has_failed());

        batch.tasklet_done();
        batch.tasklet_done();

        match handle.wait() {
            Err(Error::Call { tasklet, .. }) => assert_eq!(tasklet, "a"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_trigger_cancel_marks_request() {
        let (batch, _registry) = test_batch(1);
        let handle = batch.handle();

        batch.trigger_fired(TriggerState::Cancelled);
        assert!(handle.cancellation_requested());
        assert!(!handle.is_resolved());

        batch.tasklet_done();
        assert!(matches!(handle.wait(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_trigger_complete_is_illegal() {
        let (batch, _registry) = test_batch(1);
        let handle = batch.handle();

        batch.trigger_fired(TriggerState::Completed);
        batch.tasklet_done();
        assert!(matches!(handle.wait(), Err(Error::IllegalTrigger)));
    }

    #[test]
    fn test_blocking_slot_reports_once() {
        let (batch, _registry) = test_batch(1);
        let handle = batch.handle();

        let slot = BlockingSlot::new(batch.clone());
        batch.set_blocking_slots(vec![slot.clone()]);

        slot.report_done();
        slot.report_done();
        assert!(handle.wait().is_ok());
    }

    #[test]
    fn test_resolved_batch_releases_its_slots() {
        let (batch, _registry) = test_batch(1);
        let handle = batch.handle();

        let slot = BlockingSlot::new(batch.clone());
        batch.set_blocking_slots(vec![slot.clone()]);
        slot.report_done();
        assert!(handle.wait().is_ok());

        // slot and batch reference each other until resolution drops the
        // batch's copy; after that nothing keeps the state alive
        let weak = Arc::downgrade(&batch);
        drop(batch);
        drop(slot);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_abandon_resolves_before_thread_reports() {
        let (batch, _registry) = test_batch(2);
        let handle = batch.handle();

        let slots = vec![
            BlockingSlot::new(batch.clone()),
            BlockingSlot::new(batch.clone()),
        ];
        batch.set_blocking_slots(slots.clone());

        batch.trigger_fired(TriggerState::Cancelled);
        assert!(matches!(handle.wait(), Err(Error::Cancelled)));

        // late reports from the abandoned threads are no-ops
        for slot in slots {
            slot.report_done();
        }
        assert!(matches!(handle.wait(), Err(Error::Cancelled)));

        let weak = Arc::downgrade(&batch);
        drop(batch);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_slots_installed_after_failure_are_abandoned() {
        let (batch, _registry) = test_batch(1);
        let handle = batch.handle();

        batch.trigger_fired(TriggerState::Cancelled);
        batch.set_blocking_slots(vec![BlockingSlot::new(batch.clone())]);

        assert!(matches!(handle.wait(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_registry_wait_empty() {
        let (batch, registry) = test_batch(1);
        assert_eq!(registry.live_count(), 1);

        let waiter = {
            let registry = registry.clone();
            std::thread::spawn(move || registry.wait_empty())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        batch.tasklet_done();
        waiter.join().unwrap();
        assert_eq!(registry.live_count(), 0);
    }
}

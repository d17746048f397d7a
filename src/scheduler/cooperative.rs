//! Cooperative worker threads.
//!
//! Each worker owns a private set of trackers and polls them in passes.
//! Trackers arrive through a mutex-protected inbox, both at dispatch and
//! when a peer donates one, so a tracker is owned by exactly one worker at
//! any instant and a tasklet's `call` is never concurrent with itself.
//!
//! Stealing is request-based: an underloaded worker tags the most loaded
//! peer's `steal_request` slot; the owner notices at the top of its next
//! pass and moves one tracker into the thief's inbox itself. The handoff is
//! synchronized entirely through the owner.

use crate::error::{Error, Panicked};
use crate::scheduler::batch::BatchState;
use crate::tasklet::Tasklet;
use crate::util::{panic_message, Backoff, CachePadded};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, Thread};
use std::time::Duration;
use tracing::{trace, warn};

// stats for each worker
pub(crate) struct WorkerStats {
    pub(crate) assigned: AtomicU64,
    pub(crate) retired: AtomicU64,
    pub(crate) calls: AtomicU64,
    pub(crate) stolen_in: AtomicU64,
    pub(crate) stolen_out: AtomicU64,
}

impl WorkerStats {
    fn new() -> Self {
        Self {
            assigned: AtomicU64::new(0),
            retired: AtomicU64::new(0),
            calls: AtomicU64::new(0),
            stolen_in: AtomicU64::new(0),
            stolen_out: AtomicU64::new(0),
        }
    }
}

/// Point-in-time copy of one worker's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    /// Worker index within the pool.
    pub worker: usize,
    /// Trackers handed to this worker at dispatch.
    pub assigned: u64,
    /// Trackers this worker dismissed, for any reason.
    pub retired: u64,
    /// Tasklet `call` invocations.
    pub calls: u64,
    /// Trackers gained through stealing.
    pub stolen_in: u64,
    /// Trackers donated to thieves.
    pub stolen_out: u64,
}

/// One tasklet owned by a cooperative worker.
pub(crate) struct CoopTracker {
    pub(crate) tasklet: Box<dyn Tasklet>,
    pub(crate) name: String,
    pub(crate) batch: Arc<BatchState>,
}

/// The slice of a worker visible to the scheduler and to peer workers.
pub(crate) struct WorkerShared {
    pub(crate) index: usize,
    inbox: Mutex<Vec<CoopTracker>>,
    // owned trackers plus inbox arrivals; peers read this to pick victims
    load: CachePadded<AtomicUsize>,
    // thief index + 1; 0 means no pending request
    steal_request: AtomicUsize,
    unparker: OnceLock<Thread>,
    stats: WorkerStats,
}

impl WorkerShared {
    pub(crate) fn new(index: usize) -> Arc<Self> {
        Arc::new(Self {
            index,
            inbox: Mutex::new(Vec::new()),
            load: CachePadded::new(AtomicUsize::new(0)),
            steal_request: AtomicUsize::new(0),
            unparker: OnceLock::new(),
            stats: WorkerStats::new(),
        })
    }

    /// Hand a freshly dispatched tracker to this worker.
    pub(crate) fn assign(&self, tracker: CoopTracker) {
        self.stats.assigned.fetch_add(1, Ordering::Relaxed);
        self.push_tracker(tracker);
    }

    fn push_tracker(&self, tracker: CoopTracker) {
        self.inbox.lock().push(tracker);
        self.load.fetch_add(1, Ordering::AcqRel);
        self.unpark();
    }

    pub(crate) fn set_unparker(&self, thread: Thread) {
        let _ = self.unparker.set(thread);
    }

    pub(crate) fn unpark(&self) {
        if let Some(thread) = self.unparker.get() {
            thread.unpark();
        }
    }

    pub(crate) fn load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    /// Dismiss every tracker still in the inbox, resolving each batch as
    /// cancelled. Only sound once the owning worker has run its final drain
    /// and can no longer pick trackers up.
    pub(crate) fn drain_stranded(&self) {
        let stranded = std::mem::take(&mut *self.inbox.lock());
        for tracker in stranded {
            let batch = tracker.batch.clone();
            batch.record_failure(Error::Cancelled);
            drop(tracker);
            self.load.fetch_sub(1, Ordering::AcqRel);
            self.stats.retired.fetch_add(1, Ordering::Relaxed);
            batch.tasklet_done();
        }
    }

    pub(crate) fn stats_snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            worker: self.index,
            assigned: self.stats.assigned.load(Ordering::Relaxed),
            retired: self.stats.retired.load(Ordering::Relaxed),
            calls: self.stats.calls.load(Ordering::Relaxed),
            stolen_in: self.stats.stolen_in.load(Ordering::Relaxed),
            stolen_out: self.stats.stolen_out.load(Ordering::Relaxed),
        }
    }
}

enum Step {
    Retain(bool),
    Dismiss,
}

pub(crate) struct CoopWorker {
    shared: Arc<WorkerShared>,
    peers: Vec<Arc<WorkerShared>>,
    shutdown: Arc<AtomicBool>,
    steal_margin: usize,
    idle_park: Duration,
}

impl CoopWorker {
    pub(crate) fn new(
        shared: Arc<WorkerShared>,
        peers: Vec<Arc<WorkerShared>>,
        shutdown: Arc<AtomicBool>,
        steal_margin: usize,
        idle_park: Duration,
    ) -> Self {
        Self {
            shared,
            peers,
            shutdown,
            steal_margin,
            idle_park,
        }
    }

    // main loop
    pub(crate) fn run(self) {
        let mut local: Vec<CoopTracker> = Vec::new();
        let mut backoff = Backoff::new(self.idle_park);

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            self.drain_inbox(&mut local);
            self.donate_if_requested(&mut local);

            let mut made_progress = false;
            let mut dismissed = false;
            let mut i = 0;
            while i < local.len() {
                match self.step(&mut local[i]) {
                    Step::Retain(progressed) => {
                        made_progress |= progressed;
                        i += 1;
                    }
                    Step::Dismiss => {
                        self.dismiss(local.swap_remove(i));
                        dismissed = true;
                    }
                }
            }

            if dismissed {
                self.request_steal();
            }

            if made_progress || dismissed {
                backoff.reset();
            } else if local.is_empty() && self.shared.load() == 0 {
                self.request_steal();
                thread::park();
            } else {
                self.request_steal();
                backoff.idle();
            }
        }

        // trackers still owned here will never be called again
        self.drain_inbox(&mut local);
        for tracker in local.drain(..) {
            tracker.batch.record_failure(Error::Cancelled);
            self.dismiss(tracker);
        }
    }

    fn drain_inbox(&self, local: &mut Vec<CoopTracker>) {
        let mut inbox = self.shared.inbox.lock();
        if !inbox.is_empty() {
            local.append(&mut inbox);
        }
    }

    // Move one tracker to the thief named in our steal_request slot. A
    // request stays pending until we have a surplus to donate from.
    fn donate_if_requested(&self, local: &mut Vec<CoopTracker>) {
        let request = self.shared.steal_request.load(Ordering::Acquire);
        if request == 0 || local.len() < 2 {
            return;
        }
        self.shared.steal_request.store(0, Ordering::Release);

        let thief = &self.peers[request - 1];
        if let Some(tracker) = local.pop() {
            thief.stats.stolen_in.fetch_add(1, Ordering::Relaxed);
            self.shared.stats.stolen_out.fetch_add(1, Ordering::Relaxed);
            // destination gains the tracker before our load drops
            thief.push_tracker(tracker);
            self.shared.load.fetch_sub(1, Ordering::AcqRel);
            trace!(
                victim = self.shared.index,
                thief = request - 1,
                "tasklet donated"
            );
        }
    }

    fn step(&self, tracker: &mut CoopTracker) -> Step {
        if tracker.batch.has_failed() {
            return Step::Dismiss;
        }
        self.shared.stats.calls.fetch_add(1, Ordering::Relaxed);
        match catch_unwind(AssertUnwindSafe(|| tracker.tasklet.call())) {
            Ok(Ok(progress)) => {
                if progress.is_done() {
                    Step::Dismiss
                } else {
                    Step::Retain(progress.made_progress())
                }
            }
            Ok(Err(error)) => {
                warn!(
                    tasklet = %tracker.name,
                    batch = %tracker.batch.id,
                    error = %error,
                    "tasklet call failed"
                );
                tracker
                    .batch
                    .record_failure(Error::call(tracker.name.clone(), error));
                Step::Dismiss
            }
            Err(payload) => {
                let message = panic_message(payload);
                warn!(
                    tasklet = %tracker.name,
                    batch = %tracker.batch.id,
                    panic = %message,
                    "tasklet call panicked"
                );
                tracker.batch.record_failure(Error::call(
                    tracker.name.clone(),
                    Box::new(Panicked(message)),
                ));
                Step::Dismiss
            }
        }
    }

    fn dismiss(&self, tracker: CoopTracker) {
        let batch = tracker.batch.clone();
        // tasklet teardown precedes the done-signal
        drop(tracker);
        self.shared.load.fetch_sub(1, Ordering::AcqRel);
        self.shared.stats.retired.fetch_add(1, Ordering::Relaxed);
        batch.tasklet_done();
    }

    // Tag the most loaded peer, if any peer is loaded enough that taking
    // one tracker leaves both sides better balanced.
    fn request_steal(&self) {
        let own = self.shared.load();
        let mut victim: Option<(usize, usize)> = None;
        for peer in &self.peers {
            if peer.index == self.shared.index {
                continue;
            }
            let load = peer.load();
            if load >= own + self.steal_margin && victim.map_or(true, |(best, _)| load > best) {
                victim = Some((load, peer.index));
            }
        }
        let Some((_, index)) = victim else {
            return;
        };

        let thief_tag = self.shared.index + 1;
        let peer = &self.peers[index];
        if peer
            .steal_request
            .compare_exchange(0, thief_tag, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            trace!(thief = self.shared.index, victim = index, "steal requested");
        }
        peer.unpark();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::{BatchInfo, NullObserver};
    use crate::scheduler::batch::{BatchId, BatchRegistry, BatchState};
    use crate::tasklet::{from_fn, Progress};

    fn spinner_batch() -> (Arc<BatchState>, Arc<BatchRegistry>) {
        let registry = BatchRegistry::new();
        let info = BatchInfo {
            id: BatchId::next(),
            name: "stranded".into(),
            tasklets: 1,
            cooperative: 1,
            blocking: 0,
        };
        let batch = BatchState::new(info, &registry, Arc::new(NullObserver));
        registry.register(&batch);
        (batch, registry)
    }

    #[test]
    fn test_drain_stranded_resolves_the_batch() {
        let (batch, registry) = spinner_batch();
        let handle = batch.handle();

        let shared = WorkerShared::new(0);
        shared.assign(CoopTracker {
            tasklet: Box::new(from_fn("orphan", || Ok(Progress::MadeProgress))),
            name: "orphan".into(),
            batch,
        });
        assert_eq!(shared.load(), 1);

        // no worker thread will ever drain this inbox
        shared.drain_stranded();
        assert_eq!(shared.load(), 0);
        assert!(matches!(handle.wait(), Err(Error::Cancelled)));
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_drain_stranded_on_empty_inbox_is_noop() {
        let shared = WorkerShared::new(0);
        shared.drain_stranded();
        assert_eq!(shared.load(), 0);
        assert_eq!(shared.stats_snapshot().retired, 0);
    }
}

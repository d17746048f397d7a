//! The execution service: submission entry point and worker pool owner.

use crate::config::{Config, ShutdownPolicy};
use crate::error::{Error, Panicked, Result, TaskletError};
use crate::fanout::FanoutExecutor;
use crate::handle::CompletionHandle;
use crate::observe::{self, BatchInfo, ExecutionObserver, NullObserver};
use crate::scheduler::batch::{BatchId, BatchRegistry, BatchState, BlockingSlot, ExecutionContext};
use crate::scheduler::blocking::BlockingRunner;
use crate::scheduler::cooperative::{CoopTracker, CoopWorker, WorkerShared, WorkerStatsSnapshot};
use crate::tasklet::{ExecutionMode, Tasklet};
use crate::trigger::CancellationTrigger;
use crate::util::panic_message;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(target_os = "linux")]
fn pin_thread_to_core(core_id: usize) {
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core_id, &mut cpuset);
        let result = libc::sched_setaffinity(
            0, // current thread
            std::mem::size_of::<libc::cpu_set_t>(),
            &cpuset,
        );
        if result != 0 {
            warn!(core = core_id, "failed to pin worker to core");
        }
    }
}

struct WorkerHandle {
    thread: Option<JoinHandle<()>>,
}

/// Drives batches of tasklets to completion on a fixed worker pool.
///
/// Cooperative tasklets share the pool's threads and are rebalanced by work
/// stealing; blocking tasklets each get a dedicated detached thread. `init`
/// calls run on the fan-out executor supplied at construction, whose
/// lifecycle stays with the caller.
pub struct Scheduler {
    worker_shared: Vec<Arc<WorkerShared>>,
    workers: Mutex<Vec<WorkerHandle>>,
    shutdown: Arc<AtomicBool>,
    accepting: AtomicBool,
    registry: Arc<BatchRegistry>,
    init_executor: Arc<dyn FanoutExecutor>,
    observer: Arc<dyn ExecutionObserver>,
    next_worker: Mutex<usize>,
    blocking_seq: AtomicU64,
    thread_name_prefix: String,
    stack_size: Option<usize>,
    idle_park: Duration,
    shutdown_policy: ShutdownPolicy,
    max_live_batches: Option<usize>,
}

impl Scheduler {
    /// Start a scheduler with no observer.
    pub fn new(config: &Config, init_executor: Arc<dyn FanoutExecutor>) -> Result<Self> {
        Self::with_observer(config, init_executor, Arc::new(NullObserver))
    }

    /// Start a scheduler that reports batch lifecycles to `observer`.
    pub fn with_observer(
        config: &Config,
        init_executor: Arc<dyn FanoutExecutor>,
        observer: Arc<dyn ExecutionObserver>,
    ) -> Result<Self> {
        config.validate()?;
        let num_threads = config.worker_threads();

        let shutdown = Arc::new(AtomicBool::new(false));
        let worker_shared: Vec<Arc<WorkerShared>> =
            (0..num_threads).map(WorkerShared::new).collect();

        let mut workers = Vec::with_capacity(num_threads);
        for shared in &worker_shared {
            let worker = CoopWorker::new(
                shared.clone(),
                worker_shared.clone(),
                shutdown.clone(),
                config.steal_margin,
                config.idle_park,
            );
            let name = format!("{}-{}", config.thread_name_prefix, shared.index);
            let mut builder = thread::Builder::new().name(name);
            if let Some(stack_size) = config.stack_size {
                builder = builder.stack_size(stack_size);
            }

            let pin_workers = config.pin_workers;
            let index = shared.index;
            let thread = builder
                .spawn(move || {
                    // Pin worker to core if requested
                    #[cfg(target_os = "linux")]
                    if pin_workers {
                        pin_thread_to_core(index);
                    }
                    #[cfg(not(target_os = "linux"))]
                    let _ = (pin_workers, index);

                    worker.run();
                })
                .map_err(|e| Error::scheduler(format!("worker spawn failed: {}", e)))?;

            shared.set_unparker(thread.thread().clone());
            workers.push(WorkerHandle {
                thread: Some(thread),
            });
        }

        debug!(workers = num_threads, "scheduler started");

        Ok(Self {
            worker_shared,
            workers: Mutex::new(workers),
            shutdown,
            accepting: AtomicBool::new(true),
            registry: BatchRegistry::new(),
            init_executor,
            observer,
            next_worker: Mutex::new(0),
            blocking_seq: AtomicU64::new(0),
            thread_name_prefix: config.thread_name_prefix.clone(),
            stack_size: config.stack_size,
            idle_park: config.idle_park,
            shutdown_policy: config.shutdown_policy,
            max_live_batches: config.max_live_batches,
        })
    }

    /// Submit one batch of tasklets.
    ///
    /// Blocks through the init phase: every tasklet's `init` runs on the
    /// fan-out executor and all of them are awaited, even when some fail.
    /// Any init failure fails the returned handle with the first failure in
    /// submission order, and no tasklet is ever called. Otherwise the batch
    /// starts running and the handle resolves when every tasklet finishes
    /// or the batch fails.
    ///
    /// `trigger` is the only way to cancel the batch. Cancellation is
    /// cooperative: in-flight `call`s are never interrupted, and blocking
    /// tasklets are abandoned to their dedicated threads.
    ///
    /// Rejections (empty batch, shut-down scheduler, live-batch cap) are
    /// reported as [`Error::Rejected`] without creating a handle.
    pub fn submit(
        &self,
        tasklets: Vec<Box<dyn Tasklet>>,
        trigger: &CancellationTrigger,
        context: ExecutionContext,
    ) -> Result<CompletionHandle> {
        if tasklets.is_empty() {
            return Err(Error::rejected("batch has no tasklets"));
        }
        if !self.accepting.load(Ordering::Acquire) {
            return Err(Error::rejected("scheduler is shut down"));
        }
        if let Some(cap) = self.max_live_batches {
            if self.registry.live_count() >= cap {
                return Err(Error::rejected(format!("live batch cap {} reached", cap)));
            }
        }

        let blocking = tasklets
            .iter()
            .filter(|t| t.mode() == ExecutionMode::Blocking)
            .count();
        let info = BatchInfo {
            id: BatchId::next(),
            name: context.name().to_string(),
            tasklets: tasklets.len(),
            cooperative: tasklets.len() - blocking,
            blocking,
        };
        let batch = BatchState::new(info.clone(), &self.registry, self.observer.clone());
        let handle = batch.handle();
        self.registry.register(&batch);

        // A drain that started before this registration is not waiting for
        // us; report the rejection instead of returning an orphan handle.
        if !self.accepting.load(Ordering::Acquire) {
            self.registry.remove(batch.id);
            return Err(Error::rejected("scheduler is shut down"));
        }

        observe::guarded(|| self.observer.batch_submitted(&info));
        debug!(
            batch = %batch.id,
            name = %info.name,
            tasklets = info.tasklets,
            cooperative = info.cooperative,
            blocking = info.blocking,
            "batch submitted"
        );

        {
            let batch = batch.clone();
            trigger.observe(move |state| batch.trigger_fired(state));
        }

        let survivors = self.run_init_phase(&batch, tasklets);

        if batch.has_failed() {
            batch.resolve_now();
            return Ok(handle);
        }

        self.dispatch(&batch, survivors);
        Ok(handle)
    }

    // Fan out every init and await them all, even when some fail early.
    // Returns the tasklets that initialized, in submission order; the first
    // failure in submission order is recorded on the batch.
    fn run_init_phase(
        &self,
        batch: &Arc<BatchState>,
        tasklets: Vec<Box<dyn Tasklet>>,
    ) -> Vec<Box<dyn Tasklet>> {
        type InitReport = (usize, Box<dyn Tasklet>, std::result::Result<(), TaskletError>);

        let total = tasklets.len();
        let (tx, rx) = crossbeam_channel::bounded::<InitReport>(total);

        for (index, mut tasklet) in tasklets.into_iter().enumerate() {
            let tx = tx.clone();
            self.init_executor.execute(Box::new(move || {
                let outcome = match catch_unwind(AssertUnwindSafe(|| tasklet.init())) {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(error)) => Err(error),
                    Err(payload) => {
                        Err(Box::new(Panicked(panic_message(payload))) as TaskletError)
                    }
                };
                let _ = tx.send((index, tasklet, outcome));
            }));
        }
        drop(tx);

        let mut reports: Vec<Option<InitReport>> =
            std::iter::repeat_with(|| None).take(total).collect();
        let mut received = 0;
        while received < total {
            match rx.recv() {
                Ok(report) => {
                    let index = report.0;
                    reports[index] = Some(report);
                    received += 1;
                }
                // the executor dropped jobs unrun; their slots stay empty
                Err(_) => break,
            }
        }

        let mut survivors = Vec::with_capacity(total);
        let mut first_failure: Option<Error> = None;
        let mut failures = 0usize;
        for (index, report) in reports.into_iter().enumerate() {
            match report {
                Some((_, tasklet, Ok(()))) => survivors.push(tasklet),
                Some((_, tasklet, Err(error))) => {
                    failures += 1;
                    if first_failure.is_none() {
                        first_failure = Some(Error::init(tasklet.name(), error));
                    }
                }
                None => {
                    failures += 1;
                    if first_failure.is_none() {
                        let lost: TaskletError = Box::new(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            "init job dropped by the fan-out executor",
                        ));
                        first_failure = Some(Error::init(format!("tasklet #{}", index), lost));
                    }
                }
            }
        }

        if let Some(error) = first_failure {
            warn!(
                batch = %batch.id,
                failed = failures,
                total,
                error = %error,
                "tasklets failed to initialize"
            );
            batch.record_failure(error);
        }

        survivors
    }

    fn dispatch(&self, batch: &Arc<BatchState>, tasklets: Vec<Box<dyn Tasklet>>) {
        let mut cooperative = Vec::new();
        let mut blocking = Vec::new();
        for tasklet in tasklets {
            match tasklet.mode() {
                ExecutionMode::Cooperative => cooperative.push(tasklet),
                ExecutionMode::Blocking => blocking.push(tasklet),
            }
        }

        let slots: Vec<Arc<BlockingSlot>> = blocking
            .iter()
            .map(|_| BlockingSlot::new(batch.clone()))
            .collect();
        batch.set_blocking_slots(slots.clone());
        for (tasklet, slot) in blocking.into_iter().zip(slots) {
            self.spawn_blocking(tasklet, slot);
        }

        // The cursor persists across batches so concurrent submissions
        // spread over the pool instead of clustering on worker 0.
        {
            let mut cursor = self.next_worker.lock();
            for tasklet in cooperative {
                let name = tasklet.name().to_string();
                let tracker = CoopTracker {
                    tasklet,
                    name,
                    batch: batch.clone(),
                };
                self.worker_shared[*cursor].assign(tracker);
                *cursor = (*cursor + 1) % self.worker_shared.len();
            }
        }

        // idle workers may want to pull from the new load
        for shared in &self.worker_shared {
            shared.unpark();
        }

        // A shutdown that landed during the assign loop may have joined
        // workers before they saw the new trackers. By the time the flag is
        // stored every live batch has drained or been abandoned, so this
        // never sweeps a healthy batch.
        if self.shutdown.load(Ordering::Acquire) {
            self.drain_stranded_inboxes();
        }
    }

    fn drain_stranded_inboxes(&self) {
        for shared in &self.worker_shared {
            shared.drain_stranded();
        }
    }

    fn spawn_blocking(&self, tasklet: Box<dyn Tasklet>, slot: Arc<BlockingSlot>) {
        let name = tasklet.name().to_string();
        let seq = self.blocking_seq.fetch_add(1, Ordering::Relaxed);
        let runner = BlockingRunner::new(tasklet, name.clone(), slot.clone(), self.idle_park);

        let mut builder =
            thread::Builder::new().name(format!("{}-blocking-{}", self.thread_name_prefix, seq));
        if let Some(stack_size) = self.stack_size {
            builder = builder.stack_size(stack_size);
        }
        // detached; nothing joins blocking threads
        if let Err(error) = builder.spawn(move || runner.run()) {
            warn!(tasklet = %name, error = %error, "blocking thread spawn failed");
            slot.batch().record_failure(Error::call(name, Box::new(error)));
            slot.report_done();
        }
    }

    /// Stop accepting batches and wind the pool down.
    ///
    /// [`ShutdownPolicy::Drain`] blocks until live batches resolve on their
    /// own; [`ShutdownPolicy::Abandon`] cancels them first. Either way the
    /// cooperative workers are joined before this returns. Must not be
    /// called from a tasklet or observer callback.
    pub fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!("scheduler shutting down");

        match self.shutdown_policy {
            ShutdownPolicy::Drain => self.registry.wait_empty(),
            ShutdownPolicy::Abandon => {
                for batch in self.registry.snapshot() {
                    batch.abandon();
                }
            }
        }

        self.shutdown.store(true, Ordering::Release);

        // wake everyone up to check the shutdown flag
        for shared in &self.worker_shared {
            shared.unpark();
        }

        let mut workers = self.workers.lock();
        for worker in workers.iter_mut() {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
        drop(workers);

        // A donation or a racing dispatch can land a tracker in the inbox
        // of a worker that had already run its final drain. The pool is
        // joined, so nothing else will dismiss those.
        self.drain_stranded_inboxes();
        debug!("scheduler shut down");
    }

    /// Number of cooperative worker threads.
    pub fn worker_count(&self) -> usize {
        self.worker_shared.len()
    }

    /// Number of batches submitted but not yet resolved.
    pub fn live_batches(&self) -> usize {
        self.registry.live_count()
    }

    /// Per-worker counters, indexed by worker.
    pub fn worker_stats(&self) -> Vec<WorkerStatsSnapshot> {
        self.worker_shared
            .iter()
            .map(|shared| shared.stats_snapshot())
            .collect()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.worker_shared.len())
            .field("accepting", &self.accepting.load(Ordering::Relaxed))
            .field("live_batches", &self.registry.live_count())
            .finish()
    }
}

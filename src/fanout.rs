//! The executor that fans out tasklet `init` calls.
//!
//! Init work is bursty and potentially slow, so it runs outside the worker
//! pool on an executor the embedding application supplies. The scheduler
//! does not manage that executor's lifecycle; it only hands jobs over.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::warn;

/// A fan-out job.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Sink for tasklet `init` jobs.
///
/// Every job handed to `execute` must eventually run exactly once, on any
/// thread. A job that is dropped unrun is reported as an init failure for
/// its tasklet.
pub trait FanoutExecutor: Send + Sync {
    /// Accept one job.
    fn execute(&self, job: Job);
}

impl<F> FanoutExecutor for F
where
    F: Fn(Job) + Send + Sync,
{
    fn execute(&self, job: Job) {
        self(job)
    }
}

/// Fan-out executor that spawns one short-lived thread per job.
///
/// Falls back to running the job on the caller's thread when the spawn
/// fails.
#[derive(Debug, Default)]
pub struct OnDemandExecutor {
    seq: AtomicU64,
}

impl OnDemandExecutor {
    /// New executor with no threads running.
    pub fn new() -> Self {
        Self::default()
    }
}

impl FanoutExecutor for OnDemandExecutor {
    fn execute(&self, job: Job) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        // The slot keeps the job recoverable when the spawn fails.
        let slot = Arc::new(Mutex::new(Some(job)));
        let runner = slot.clone();
        let spawned = thread::Builder::new()
            .name(format!("spindle-init-{}", seq))
            .spawn(move || {
                if let Some(job) = runner.lock().take() {
                    job();
                }
            });
        if let Err(err) = spawned {
            warn!(error = %err, "init thread spawn failed, running inline");
            if let Some(job) = slot.lock().take() {
                job();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_on_demand_runs_every_job() {
        let executor = OnDemandExecutor::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = crossbeam_channel::bounded(8);

        for _ in 0..8 {
            let ran = ran.clone();
            let tx = tx.clone();
            executor.execute(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            }));
        }

        for _ in 0..8 {
            rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        }
        assert_eq!(ran.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_closure_executor() {
        let inline = |job: Job| job();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        inline.execute(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}

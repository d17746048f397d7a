//! The tasklet contract.
//!
//! A tasklet is a small, non-preemptible unit of pipeline computation that a
//! worker drives by calling [`Tasklet::call`] repeatedly until it reports
//! [`Progress::Done`]. The scheduler guarantees that `call` never runs
//! concurrently with itself; everything else about scheduling (which thread,
//! when, interleaved with whom) is unspecified.

use crate::error::TaskletError;
use std::fmt;

/// How the scheduler drives a tasklet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// Polled on a shared worker thread. `call` must return quickly and must
    /// never block; a stalled cooperative tasklet stalls its whole worker.
    Cooperative,
    /// Driven by a dedicated thread. `call` may block for as long as it
    /// likes; cancellation abandons the thread instead of waiting for it.
    Blocking,
}

/// Outcome of one `call` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// No work was available this step.
    NoProgress,
    /// Some work was done; poll again.
    MadeProgress,
    /// The tasklet is finished and must not be called again.
    Done,
}

impl Progress {
    /// Whether this step finished the tasklet.
    pub fn is_done(self) -> bool {
        matches!(self, Progress::Done)
    }

    /// Whether this step did any work. Completion counts as work.
    pub fn made_progress(self) -> bool {
        !matches!(self, Progress::NoProgress)
    }
}

/// Accumulates the progress of several sub-steps into one [`Progress`].
///
/// Tasklets that poll multiple internal sources use one of these per `call`:
/// reset it, merge each sub-step, and report the aggregate.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    made_progress: bool,
}

impl ProgressTracker {
    /// Fresh tracker, reporting no progress.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything merged so far.
    pub fn reset(&mut self) {
        self.made_progress = false;
    }

    /// Record that work was done.
    pub fn mark_progress(&mut self) {
        self.made_progress = true;
    }

    /// Fold one sub-step's outcome into the aggregate.
    pub fn merge(&mut self, progress: Progress) {
        self.made_progress |= progress.made_progress();
    }

    /// The aggregate outcome of the current step.
    pub fn progress(&self) -> Progress {
        if self.made_progress {
            Progress::MadeProgress
        } else {
            Progress::NoProgress
        }
    }

    /// Whether any merged sub-step did work.
    pub fn made_progress(&self) -> bool {
        self.made_progress
    }
}

/// A unit of computation driven to completion by the scheduler.
///
/// Exactly one thread owns a tasklet at any instant, so implementations
/// never need internal synchronization for their own state.
pub trait Tasklet: Send {
    /// Execution mode. Must stay constant for the tasklet's lifetime.
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Cooperative
    }

    /// Name used for error attribution and logs.
    fn name(&self) -> &str {
        "tasklet"
    }

    /// One-time setup, run on the fan-out executor before any `call`.
    ///
    /// An error here fails the whole batch; no tasklet in the batch will be
    /// called.
    fn init(&mut self) -> Result<(), TaskletError> {
        Ok(())
    }

    /// Perform one step of work.
    fn call(&mut self) -> Result<Progress, TaskletError>;
}

/// Wrap a closure as a cooperative [`Tasklet`].
pub fn from_fn<F>(name: impl Into<String>, f: F) -> FnTasklet<F>
where
    F: FnMut() -> Result<Progress, TaskletError> + Send,
{
    FnTasklet {
        name: name.into(),
        mode: ExecutionMode::Cooperative,
        f,
    }
}

/// Closure-backed tasklet returned by [`from_fn`].
pub struct FnTasklet<F> {
    name: String,
    mode: ExecutionMode,
    f: F,
}

impl<F> FnTasklet<F> {
    /// Switch the tasklet to [`ExecutionMode::Blocking`].
    pub fn blocking(mut self) -> Self {
        self.mode = ExecutionMode::Blocking;
        self
    }
}

impl<F> Tasklet for FnTasklet<F>
where
    F: FnMut() -> Result<Progress, TaskletError> + Send,
{
    fn mode(&self) -> ExecutionMode {
        self.mode
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn call(&mut self) -> Result<Progress, TaskletError> {
        (self.f)()
    }
}

impl<F> fmt::Debug for FnTasklet<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTasklet")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish()
    }
}

//! One-line import for the common surface.

pub use crate::config::{Config, ConfigBuilder, ShutdownPolicy};
pub use crate::error::{Error, Result, TaskletError};
pub use crate::fanout::{FanoutExecutor, OnDemandExecutor};
pub use crate::handle::CompletionHandle;
pub use crate::observe::{BatchInfo, ExecutionObserver, LogObserver, NullObserver};
pub use crate::scheduler::{BatchId, ExecutionContext, Scheduler, WorkerStatsSnapshot};
pub use crate::tasklet::{from_fn, ExecutionMode, Progress, ProgressTracker, Tasklet};
pub use crate::trigger::{CancellationTrigger, TriggerState};

//! SPINDLE - cooperative tasklet execution core
//!
//! The local execution engine of a dataflow pipeline: batches of small
//! polled computations ("tasklets") are driven to completion on a fixed
//! pool of worker threads, with dedicated threads for tasklets that
//! genuinely block.
//!
//! # Quick Start
//!
//! ```no_run
//! use spindle::prelude::*;
//! use std::sync::Arc;
//!
//! let scheduler = Scheduler::new(
//!     &Config::default(),
//!     Arc::new(OnDemandExecutor::new()),
//! ).unwrap();
//!
//! let mut rows = 0..3;
//! let tasklet = from_fn("rows", move || {
//!     Ok(match rows.next() {
//!         Some(row) => {
//!             println!("row {row}");
//!             Progress::MadeProgress
//!         }
//!         None => Progress::Done,
//!     })
//! });
//!
//! let tasklets: Vec<Box<dyn Tasklet>> = vec![Box::new(tasklet)];
//! let trigger = CancellationTrigger::new();
//! let handle = scheduler
//!     .submit(tasklets, &trigger, ExecutionContext::named("demo"))
//!     .unwrap();
//!
//! handle.wait().unwrap();
//! ```
//!
//! # Guarantees
//!
//! - **Single caller**: a tasklet's `call` never runs concurrently with
//!   itself; exactly one worker owns a tasklet at any instant
//! - **Quiesced init**: every `init` in a batch is awaited before the
//!   batch starts or fails, even when some inits fail
//! - **Non-blocking workers**: worker threads never block on a tasklet;
//!   blocking tasklets run on dedicated detached threads
//! - **Read-only handles**: batch outcomes are resolved only by the
//!   scheduler; handle-side completion attempts are refused
//! - **Asymmetric cancellation**: cooperative tasklets finish their
//!   in-flight call, blocking tasklets are abandoned

// Lint configuration
#![warn(missing_docs, missing_debug_implementations)]
#![allow(dead_code)] // During development

pub mod config;
pub mod error;
pub mod fanout;
pub mod handle;
pub mod observe;
pub mod prelude;
pub mod scheduler;
pub mod tasklet;
pub mod trigger;
pub mod util;

// Re-export key types at crate root
pub use config::{Config, ConfigBuilder, ShutdownPolicy};
pub use error::{Error, Result, TaskletError};
pub use fanout::{FanoutExecutor, OnDemandExecutor};
pub use handle::CompletionHandle;
pub use scheduler::{ExecutionContext, Scheduler};
pub use tasklet::{ExecutionMode, Progress, Tasklet};
pub use trigger::CancellationTrigger;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasklet::from_fn;
    use std::sync::Arc;

    #[test]
    fn test_smoke_batch() {
        let config = Config::builder().num_threads(2).build().unwrap();
        let scheduler = Scheduler::new(&config, Arc::new(OnDemandExecutor::new())).unwrap();

        let tasklets: Vec<Box<dyn Tasklet>> = (0..4)
            .map(|i| {
                let mut left = 3;
                Box::new(from_fn(format!("t{}", i), move || {
                    left -= 1;
                    Ok(if left == 0 {
                        Progress::Done
                    } else {
                        Progress::MadeProgress
                    })
                })) as Box<dyn Tasklet>
            })
            .collect();

        let trigger = CancellationTrigger::new();
        let handle = scheduler
            .submit(tasklets, &trigger, ExecutionContext::default())
            .unwrap();

        assert!(handle.wait().is_ok());
        scheduler.shutdown();
    }

    #[test]
    fn test_smoke_cancel() {
        let config = Config::builder().num_threads(2).build().unwrap();
        let scheduler = Scheduler::new(&config, Arc::new(OnDemandExecutor::new())).unwrap();

        let endless: Vec<Box<dyn Tasklet>> =
            vec![Box::new(from_fn("endless", || Ok(Progress::NoProgress)))];

        let trigger = CancellationTrigger::new();
        let handle = scheduler
            .submit(endless, &trigger, ExecutionContext::default())
            .unwrap();

        trigger.cancel();
        assert!(matches!(handle.wait(), Err(Error::Cancelled)));
        scheduler.shutdown();
    }
}

//! Batch scheduling and execution.
//!
//! [`Scheduler`] accepts batches of tasklets, runs their init phase on an
//! external fan-out executor, distributes cooperative tasklets round-robin
//! over a fixed pool of worker threads, and gives every blocking tasklet a
//! dedicated thread. Load imbalances between workers are corrected by a
//! request-based work stealing protocol in which the owning worker hands
//! trackers over itself.

pub mod batch;
pub mod cooperative;
pub mod service;

mod blocking;

pub use batch::{BatchId, ExecutionContext};
pub use cooperative::WorkerStatsSnapshot;
pub use service::Scheduler;

//! Dedicated threads for blocking tasklets.
//!
//! A blocking tasklet's `call` may sleep or wait indefinitely, so each one
//! gets its own detached thread. Nothing ever joins these threads: on
//! cancellation the batch abandons the slot (reporting the tasklet done
//! early) and the thread finds the failed batch at its next loop check.

use crate::error::{Error, Panicked};
use crate::scheduler::batch::BlockingSlot;
use crate::tasklet::Tasklet;
use crate::util::{panic_message, Backoff};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub(crate) struct BlockingRunner {
    tasklet: Box<dyn Tasklet>,
    name: String,
    slot: Arc<BlockingSlot>,
    idle_park: Duration,
}

impl BlockingRunner {
    pub(crate) fn new(
        tasklet: Box<dyn Tasklet>,
        name: String,
        slot: Arc<BlockingSlot>,
        idle_park: Duration,
    ) -> Self {
        Self {
            tasklet,
            name,
            slot,
            idle_park,
        }
    }

    pub(crate) fn run(self) {
        let BlockingRunner {
            mut tasklet,
            name,
            slot,
            idle_park,
        } = self;
        let batch = slot.batch().clone();
        let mut backoff = Backoff::new(idle_park);

        loop {
            if batch.has_failed() {
                break;
            }
            match catch_unwind(AssertUnwindSafe(|| tasklet.call())) {
                Ok(Ok(progress)) => {
                    if progress.is_done() {
                        break;
                    }
                    if progress.made_progress() {
                        backoff.reset();
                    } else {
                        backoff.idle();
                    }
                }
                Ok(Err(error)) => {
                    warn!(
                        tasklet = %name,
                        batch = %batch.id,
                        error = %error,
                        "blocking tasklet failed"
                    );
                    batch.record_failure(Error::call(name.clone(), error));
                    break;
                }
                Err(payload) => {
                    let message = panic_message(payload);
                    warn!(
                        tasklet = %name,
                        batch = %batch.id,
                        panic = %message,
                        "blocking tasklet panicked"
                    );
                    batch.record_failure(Error::call(name.clone(), Box::new(Panicked(message))));
                    break;
                }
            }
        }

        // tasklet teardown precedes the done-signal
        drop(tasklet);
        slot.report_done();
    }
}

//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Delayed operation submission."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::operation::QueuedOp;
use crate::queue::OpQueue;

/// Timers re-submitting operations to a queue after a delay.
///
/// The comm task never blocks on these; each delay runs on its own tokio timer task.
#[derive(Debug)]
pub struct FutureOps {
    queue: Weak<OpQueue>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl FutureOps {
    /// Timers feeding `queue`.
    pub fn new(queue: &Arc<OpQueue>) -> Self {
        Self {
            queue: Arc::downgrade(queue),
            timers: Mutex::new(Vec::new()),
        }
    }

    /// Submit `op` once `delay` has elapsed.
    pub fn schedule(&self, delay: Duration, op: QueuedOp) {
        let queue = self.queue.clone();
        let sleep = tokio::time::sleep(delay);
        let handle = tokio::spawn(async move {
            sleep.await;
            if let Some(queue) = queue.upgrade() {
                trace!(op = %op.id(), name = op.name(), "future operation due");
                queue.add(op);
            }
        });
        let mut timers = self.timers.lock();
        timers.retain(|timer| !timer.is_finished());
        timers.push(handle);
    }

    /// Timers not yet fired.
    pub fn pending(&self) -> usize {
        self.timers
            .lock()
            .iter()
            .filter(|timer| !timer.is_finished())
            .count()
    }

    /// Abort every pending timer.
    pub fn cancel_all(&self) {
        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }
    }
}

impl Drop for FutureOps {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Batch completion barrier for periodic polling cycles."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{CommError, Result};

/// Acceptance window of sample timestamps around a cycle stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SanityWindow {
    /// How far before the cycle stamp a sample may be.
    pub before: chrono::Duration,
    /// How far after the cycle stamp a sample may be.
    pub after: chrono::Duration,
}

impl Default for SanityWindow {
    fn default() -> Self {
        Self {
            before: chrono::Duration::hours(4),
            after: chrono::Duration::minutes(5),
        }
    }
}

/// Counts the outstanding operations of one polling cycle.
///
/// Each accepted operation increments the count and decrements it in cleanup. Once the
/// dispatcher calls [`Completer::make_ready`] the cycle is complete when the count
/// returns to zero.
#[derive(Debug)]
pub struct Completer {
    name: String,
    stamp: DateTime<Utc>,
    window: SanityWindow,
    count: AtomicUsize,
    ready: AtomicBool,
    notify: Notify,
}

impl Completer {
    /// Completer for a cycle stamped `stamp` with the default window.
    pub fn new(name: impl Into<String>, stamp: DateTime<Utc>) -> Self {
        Self::with_window(name, stamp, SanityWindow::default())
    }

    /// Completer with a custom window.
    pub fn with_window(
        name: impl Into<String>,
        stamp: DateTime<Utc>,
        window: SanityWindow,
    ) -> Self {
        Self {
            name: name.into(),
            stamp,
            window,
            count: AtomicUsize::new(0),
            ready: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Cycle name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cycle stamp.
    pub fn stamp(&self) -> DateTime<Utc> {
        self.stamp
    }

    /// Count one more outstanding operation.
    pub fn begin(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Count one operation as finished.
    pub fn complete(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if self.is_complete() {
            debug!(completer = %self.name, stamp = %self.stamp, "polling cycle complete");
        }
        self.notify.notify_waiters();
    }

    /// Mark the whole cycle as dispatched.
    pub fn make_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Operations still outstanding.
    pub fn pending(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Whether the cycle was dispatched and every operation has finished.
    pub fn is_complete(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && self.pending() == 0
    }

    /// Wait for completion; `false` on timeout.
    pub async fn wait(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_complete() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    /// Whether an observation time lies inside the cycle window.
    pub fn accepts(&self, observed: DateTime<Utc>) -> bool {
        observed >= self.stamp - self.window.before && observed <= self.stamp + self.window.after
    }

    /// Reject observations outside the cycle window as controller faults.
    pub fn check_stamp(&self, observed: DateTime<Utc>) -> Result<()> {
        if self.accepts(observed) {
            Ok(())
        } else {
            Err(CommError::Controller(format!(
                "sample stamp {observed} outside cycle {}",
                self.stamp
            )))
        }
    }
}

/// Periodic job driving one completer per cycle.
///
/// A cycle is skipped while the previous one still has operations outstanding.
#[derive(Debug)]
pub struct PollCycle {
    name: String,
    window: SanityWindow,
    current: Mutex<Option<Arc<Completer>>>,
}

impl PollCycle {
    /// Job with the default sanity window.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            window: SanityWindow::default(),
            current: Mutex::new(None),
        }
    }

    /// Replace the sanity window used for new cycles.
    pub fn with_window(mut self, window: SanityWindow) -> Self {
        self.window = window;
        self
    }

    /// Completer of the latest cycle.
    pub fn current(&self) -> Option<Arc<Completer>> {
        self.current.lock().clone()
    }

    /// Start a cycle stamped `stamp`, dispatching its operations through `dispatch`.
    ///
    /// Returns `None` when the previous cycle is still outstanding.
    pub fn run<F>(&self, stamp: DateTime<Utc>, dispatch: F) -> Option<Arc<Completer>>
    where
        F: FnOnce(&Arc<Completer>),
    {
        let completer = {
            let mut current = self.current.lock();
            if let Some(previous) = current.as_ref() {
                if !previous.is_complete() {
                    warn!(
                        job = %self.name,
                        pending = previous.pending(),
                        stamp = %previous.stamp(),
                        "previous polling cycle still outstanding, skipping"
                    );
                    return None;
                }
            }
            let completer = Arc::new(Completer::with_window(
                self.name.clone(),
                stamp,
                self.window,
            ));
            *current = Some(completer.clone());
            completer
        };
        dispatch(&completer);
        completer.make_ready();
        Some(completer)
    }
}

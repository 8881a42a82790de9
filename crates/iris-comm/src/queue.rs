//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Per-link priority queue with de-duplication and controller exclusivity."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::controller::ControllerId;
use crate::operation::{OpId, OpKey, QueuedOp};
use crate::priority::PriorityLevel;

/// Result of submitting an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The operation was queued.
    Queued,
    /// An equal operation is already pending or running; the new one was discarded.
    Duplicate,
    /// The link is shutting down.
    Closed,
}

/// A dequeued operation together with its original arrival sequence.
#[derive(Debug)]
pub struct Ticket {
    seq: u64,
    /// The operation.
    pub op: QueuedOp,
}

/// Summary of a queued operation for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedSummary {
    /// Operation identifier.
    pub id: OpId,
    /// Operation name.
    pub name: &'static str,
    /// Target controller.
    pub controller: ControllerId,
    /// Current priority.
    pub priority: PriorityLevel,
    /// Exclusivity flag.
    pub exclusive: bool,
}

#[derive(Debug, Clone, Copy)]
struct Lock {
    op: OpId,
    priority: PriorityLevel,
}

#[derive(Debug, Default)]
struct State {
    closed: bool,
    next_seq: u64,
    entries: Vec<Ticket>,
    working: HashSet<(ControllerId, OpKey)>,
    locks: HashMap<ControllerId, Lock>,
}

impl State {
    fn insert(&mut self, ticket: Ticket) {
        let rank = (ticket.op.priority(), ticket.seq);
        let pos = self
            .entries
            .partition_point(|entry| (entry.op.priority(), entry.seq) <= rank);
        self.entries.insert(pos, ticket);
    }

    fn eligible(&self, ticket: &Ticket) -> bool {
        if !ticket.op.is_exclusive() {
            return true;
        }
        self.locks
            .get(&ticket.op.controller())
            .map_or(true, |lock| lock.op == ticket.op.id())
    }

    /// Raise the lock holder of every contended controller to the blocked priority.
    fn bump_contended(&mut self) {
        let mut bumps: Vec<(ControllerId, PriorityLevel)> = Vec::new();
        for entry in self.entries.iter().filter(|e| e.op.is_exclusive()) {
            if let Some(lock) = self.locks.get(&entry.op.controller()) {
                if lock.op != entry.op.id() && entry.op.priority().outranks(lock.priority) {
                    bumps.push((entry.op.controller(), entry.op.priority()));
                }
            }
        }
        if bumps.is_empty() {
            return;
        }
        for (controller, priority) in bumps {
            let Some(lock) = self.locks.get_mut(&controller) else {
                continue;
            };
            lock.priority = lock.priority.raise_to(priority);
            let holder = lock.op;
            if let Some(entry) = self.entries.iter_mut().find(|e| e.op.id() == holder) {
                if priority.outranks(entry.op.priority()) {
                    debug!(
                        op = %holder,
                        controller = %controller,
                        priority = %priority,
                        "raising priority of contended operation"
                    );
                    entry.op.inner.set_priority(priority);
                }
            }
        }
        self.entries
            .sort_by_key(|entry| (entry.op.priority(), entry.seq));
    }

    fn take_next(&mut self) -> Option<Ticket> {
        self.bump_contended();
        let pos = self.entries.iter().position(|entry| self.eligible(entry))?;
        let ticket = self.entries.remove(pos);
        if ticket.op.is_exclusive() {
            self.locks.entry(ticket.op.controller()).or_insert(Lock {
                op: ticket.op.id(),
                priority: ticket.op.priority(),
            });
        }
        Some(ticket)
    }
}

/// Priority-ordered queue of operations for one comm link.
///
/// An operation stays in the working set from [`OpQueue::add`] until
/// [`OpQueue::finish`], so an equal operation submitted meanwhile is discarded. At most
/// one exclusive operation per controller is in flight at a time; it keeps its lock
/// across requeues between phases.
#[derive(Debug)]
pub struct OpQueue {
    name: String,
    state: Mutex<State>,
    notify: Notify,
}

impl OpQueue {
    /// Create an open, empty queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    /// Submit a new operation.
    pub fn add(&self, op: QueuedOp) -> AddOutcome {
        let mut state = self.state.lock();
        if state.closed {
            debug!(queue = %self.name, op = %op.id(), "queue closed, dropping operation");
            return AddOutcome::Closed;
        }
        let key = (op.controller(), op.key().clone());
        if state.working.contains(&key) {
            trace!(
                queue = %self.name,
                op = op.name(),
                controller = %op.controller(),
                "duplicate operation discarded"
            );
            return AddOutcome::Duplicate;
        }
        state.working.insert(key);
        if let Some(completer) = op.inner.completer() {
            completer.begin();
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.insert(Ticket { seq, op });
        drop(state);
        self.notify.notify_waiters();
        AddOutcome::Queued
    }

    /// Return an in-progress operation to the queue, keeping its arrival order.
    ///
    /// Hands the ticket back when the queue is closed.
    pub fn requeue(&self, mut ticket: Ticket) -> Result<(), Ticket> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ticket);
        }
        if let Some(lock) = state.locks.get(&ticket.op.controller()) {
            if lock.op == ticket.op.id() && lock.priority.outranks(ticket.op.priority()) {
                ticket.op.inner.set_priority(lock.priority);
            }
        }
        state.insert(ticket);
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Return an interrupted operation behind the work now queued for its controller.
    ///
    /// The controller lock is released and the operation takes a fresh arrival slot, so
    /// an operation submitted on its behalf runs first. Hands the ticket back when the
    /// queue is closed.
    pub fn defer(&self, mut ticket: Ticket) -> Result<(), Ticket> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ticket);
        }
        let controller = ticket.op.controller();
        if state
            .locks
            .get(&controller)
            .is_some_and(|lock| lock.op == ticket.op.id())
        {
            state.locks.remove(&controller);
        }
        ticket.seq = state.next_seq;
        state.next_seq += 1;
        state.insert(ticket);
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Release the working-set entry and controller lock of a finished operation.
    pub fn finish(&self, op: &QueuedOp) {
        let mut state = self.state.lock();
        let controller = op.controller();
        state.working.remove(&(controller, op.key().clone()));
        if state
            .locks
            .get(&controller)
            .is_some_and(|lock| lock.op == op.id())
        {
            state.locks.remove(&controller);
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Highest-priority eligible operation, if any.
    pub fn try_next(&self) -> Option<Ticket> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.take_next()
    }

    /// Wait for the next eligible operation; `None` once the queue is closed.
    pub async fn next(&self) -> Option<Ticket> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(ticket) = state.take_next() {
                    return Some(ticket);
                }
            }
            notified.await;
        }
    }

    /// Stop accepting operations and wake the consumer.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Whether [`OpQueue::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Remove every queued operation.
    pub fn drain(&self) -> Vec<QueuedOp> {
        let mut state = self.state.lock();
        state.entries.drain(..).map(|ticket| ticket.op).collect()
    }

    /// Number of queued operations, excluding the one in flight.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued operations in service order.
    pub fn snapshot(&self) -> Vec<QueuedSummary> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|ticket| QueuedSummary {
                id: ticket.op.id(),
                name: ticket.op.name(),
                controller: ticket.op.controller(),
                priority: ticket.op.priority(),
                exclusive: ticket.op.is_exclusive(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::testing::{marker, shared_marker};
    use std::sync::Arc;
    use std::time::Duration;

    fn priorities(queue: &OpQueue) -> Vec<PriorityLevel> {
        queue.snapshot().into_iter().map(|s| s.priority).collect()
    }

    #[test]
    fn duplicates_collapse_until_finished() {
        let queue = OpQueue::new("line-1");
        assert_eq!(
            queue.add(marker(1, PriorityLevel::PollLow, "status")),
            AddOutcome::Queued
        );
        assert_eq!(
            queue.add(marker(1, PriorityLevel::PollLow, "status")),
            AddOutcome::Duplicate
        );
        assert_eq!(
            queue.add(marker(2, PriorityLevel::PollLow, "status")),
            AddOutcome::Queued
        );
        assert_eq!(queue.len(), 2);

        let ticket = queue.try_next().unwrap();
        assert_eq!(
            queue.add(marker(1, PriorityLevel::PollLow, "status")),
            AddOutcome::Duplicate
        );
        queue.finish(&ticket.op);
        assert_eq!(
            queue.add(marker(1, PriorityLevel::PollLow, "status")),
            AddOutcome::Queued
        );
    }

    #[test]
    fn services_by_priority_then_arrival() {
        let queue = OpQueue::new("line-1");
        queue.add(marker(1, PriorityLevel::PollLow, "low"));
        queue.add(marker(2, PriorityLevel::Command, "cmd"));
        queue.add(marker(3, PriorityLevel::Data30Sec, "sample"));
        queue.add(marker(4, PriorityLevel::Command, "cmd-2"));
        assert_eq!(
            priorities(&queue),
            vec![
                PriorityLevel::Command,
                PriorityLevel::Command,
                PriorityLevel::Data30Sec,
                PriorityLevel::PollLow
            ]
        );
        let order: Vec<u32> = std::iter::from_fn(|| queue.try_next())
            .map(|t| t.op.controller().0)
            .collect();
        assert_eq!(order, vec![2, 4, 3, 1]);
    }

    #[test]
    fn exclusive_operations_wait_for_cleanup() {
        let queue = OpQueue::new("line-1");
        queue.add(marker(1, PriorityLevel::PollLow, "first"));
        queue.add(marker(1, PriorityLevel::PollLow, "second"));
        queue.add(shared_marker(1, PriorityLevel::PollLow, "shared"));

        let first = queue.try_next().unwrap();
        let shared = queue.try_next().unwrap();
        assert_eq!(shared.op.key().detail, "shared");
        assert!(queue.try_next().is_none());

        queue.requeue(first).unwrap();
        let first = queue.try_next().unwrap();
        assert_eq!(first.op.key().detail, "first");
        queue.finish(&first.op);
        let second = queue.try_next().unwrap();
        assert_eq!(second.op.key().detail, "second");
    }

    #[test]
    fn other_controllers_proceed_while_one_is_locked() {
        let queue = OpQueue::new("line-1");
        queue.add(marker(1, PriorityLevel::Command, "a"));
        queue.add(marker(1, PriorityLevel::Command, "b"));
        queue.add(marker(2, PriorityLevel::PollLow, "c"));
        let _a = queue.try_next().unwrap();
        let c = queue.try_next().unwrap();
        assert_eq!(c.op.controller(), ControllerId(2));
    }

    #[test]
    fn blocked_command_raises_lock_holder() {
        let queue = OpQueue::new("line-1");
        queue.add(marker(1, PriorityLevel::PollLow, "slow"));
        let slow = queue.try_next().unwrap();
        queue.add(marker(2, PriorityLevel::DeviceData, "other"));
        queue.add(marker(1, PriorityLevel::Command, "urgent"));
        queue.requeue(slow).unwrap();

        let next = queue.try_next().unwrap();
        assert_eq!(next.op.key().detail, "slow");
        assert_eq!(next.op.priority(), PriorityLevel::Command);
    }

    #[test]
    fn deferred_operation_yields_to_newer_work() {
        let queue = OpQueue::new("line-1");
        queue.add(marker(1, PriorityLevel::DeviceData, "poll"));
        let poll = queue.try_next().unwrap();
        queue.add(marker(1, PriorityLevel::DeviceData, "settings"));
        queue.defer(poll).unwrap();

        let settings = queue.try_next().unwrap();
        assert_eq!(settings.op.key().detail, "settings");
        assert!(queue.try_next().is_none());
        queue.finish(&settings.op);
        let poll = queue.try_next().unwrap();
        assert_eq!(poll.op.key().detail, "poll");
        assert_eq!(
            queue.add(marker(1, PriorityLevel::DeviceData, "poll")),
            AddOutcome::Duplicate
        );
    }

    #[test]
    fn requeue_is_refused_after_close() {
        let queue = OpQueue::new("line-1");
        queue.add(marker(1, PriorityLevel::PollLow, "a"));
        queue.add(marker(2, PriorityLevel::PollLow, "b"));
        let ticket = queue.try_next().unwrap();
        queue.close();
        assert!(queue.requeue(ticket).is_err());
        assert!(queue.try_next().is_none());
        assert_eq!(queue.drain().len(), 1);
        assert_eq!(
            queue.add(marker(3, PriorityLevel::PollLow, "c")),
            AddOutcome::Closed
        );
    }

    #[tokio::test]
    async fn next_blocks_until_work_arrives() {
        let queue = Arc::new(OpQueue::new("line-1"));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await.map(|t| t.op.controller()) })
        };
        tokio::task::yield_now().await;
        assert!(!consumer.is_finished());
        queue.add(marker(5, PriorityLevel::PollLow, "a"));
        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Some(ControllerId(5)));
    }

    #[tokio::test]
    async fn close_releases_waiting_consumer() {
        let queue = Arc::new(OpQueue::new("line-1"));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await.is_none() })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert!(consumer.await.unwrap());
    }
}

//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Operations, their phase chains and cleanup bookkeeping."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::completer::Completer;
use crate::controller::{ControllerId, ControllerSetup};
use crate::error::{CommError, Result};
use crate::message::CommMessage;
use crate::poller::LinkHandle;
use crate::priority::PriorityLevel;
use crate::queue::AddOutcome;

static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

/// Unique operation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OpId(u64);

impl OpId {
    fn next() -> Self {
        OpId(NEXT_OP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Semantic identity of an operation, used to collapse duplicates per controller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpKey {
    /// Operation kind.
    pub kind: &'static str,
    /// Parameters distinguishing operations of the same kind.
    pub detail: String,
}

impl OpKey {
    /// Key without parameters.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            detail: String::new(),
        }
    }

    /// Key with a distinguishing parameter.
    pub fn with_detail(kind: &'static str, detail: impl fmt::Display) -> Self {
        Self {
            kind,
            detail: detail.to_string(),
        }
    }
}

/// Outcome of one phase: the next phase, or `None` when the chain is finished.
pub type PhaseStep<L> = Result<Option<Box<dyn Phase<L>>>>;

/// Continue with `phase`.
pub fn next<L, P>(phase: P) -> PhaseStep<L>
where
    P: Phase<L> + 'static,
{
    Ok(Some(Box::new(phase)))
}

/// One request/response step of an operation.
#[async_trait]
pub trait Phase<L>: Send {
    /// Perform one round trip and choose the successor.
    async fn poll(&mut self, op: &mut L, mess: &mut CommMessage<'_>) -> PhaseStep<L>;
}

/// Driver-specific operation state and behaviour.
pub trait OpLogic: Sized + Send + 'static {
    /// Operation name for logs.
    fn name(&self) -> &'static str;

    /// Equality key; operations with equal keys on one controller are collapsed.
    fn key(&self) -> OpKey {
        OpKey::new(self.name())
    }

    /// First phase, or `None` when there is nothing to exchange.
    fn begin(&mut self) -> Option<Box<dyn Phase<Self>>>;

    /// Called for every fault raised by a phase, before retry classification.
    fn on_fault(&mut self, _err: &CommError) {}

    /// Called exactly once when the operation is finished, whether or not it succeeded.
    /// Side effects belong behind `done.success()`.
    fn cleanup(&mut self, _done: &mut Cleanup<'_>) {}
}

/// A unit of work bound to one controller.
pub struct Operation<L: OpLogic> {
    id: OpId,
    controller: ControllerId,
    priority: PriorityLevel,
    exclusive: bool,
    logic: L,
    phase: Option<Box<dyn Phase<L>>>,
    begun: bool,
    success: bool,
    attempts: u32,
    settings_requested: bool,
    error_status: Option<String>,
    completer: Option<Arc<Completer>>,
}

impl<L: OpLogic> Operation<L> {
    /// Exclusive operation on `controller`.
    pub fn new(controller: ControllerId, priority: PriorityLevel, logic: L) -> Self {
        Self {
            id: OpId::next(),
            controller,
            priority,
            exclusive: true,
            logic,
            phase: None,
            begun: false,
            success: false,
            attempts: 0,
            settings_requested: false,
            error_status: None,
            completer: None,
        }
    }

    /// Allow the operation to interleave with other operations on the same controller.
    pub fn non_exclusive(mut self) -> Self {
        self.exclusive = false;
        self
    }

    /// Count the operation against a batch completer.
    pub fn with_completer(mut self, completer: Arc<Completer>) -> Self {
        self.completer = Some(completer);
        self
    }

    /// Operation identifier.
    pub fn id(&self) -> OpId {
        self.id
    }

    /// Driver state.
    pub fn logic(&self) -> &L {
        &self.logic
    }
}

#[async_trait]
pub(crate) trait DynOperation: Send {
    fn id(&self) -> OpId;
    fn name(&self) -> &'static str;
    fn controller(&self) -> ControllerId;
    fn priority(&self) -> PriorityLevel;
    fn set_priority(&mut self, priority: PriorityLevel);
    fn is_exclusive(&self) -> bool;
    fn is_done(&self) -> bool;
    fn succeeded(&self) -> bool;
    fn attempts(&self) -> u32;
    fn error_status(&self) -> Option<&str>;
    fn completer(&self) -> Option<&Arc<Completer>>;
    fn record_attempt(&mut self) -> u32;
    fn mark_settings_requested(&mut self) -> bool;
    fn observe_fault(&mut self, err: &CommError);
    fn fail(&mut self, message: String);
    async fn step(&mut self, mess: &mut CommMessage<'_>) -> Result<()>;
    fn cleanup(&mut self, done: &mut Cleanup<'_>);
}

#[async_trait]
impl<L: OpLogic> DynOperation for Operation<L> {
    fn id(&self) -> OpId {
        self.id
    }

    fn name(&self) -> &'static str {
        self.logic.name()
    }

    fn controller(&self) -> ControllerId {
        self.controller
    }

    fn priority(&self) -> PriorityLevel {
        self.priority
    }

    fn set_priority(&mut self, priority: PriorityLevel) {
        self.priority = priority;
    }

    fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    fn is_done(&self) -> bool {
        self.begun && self.phase.is_none()
    }

    fn succeeded(&self) -> bool {
        self.success
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }

    fn error_status(&self) -> Option<&str> {
        self.error_status.as_deref()
    }

    fn completer(&self) -> Option<&Arc<Completer>> {
        self.completer.as_ref()
    }

    fn record_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    fn mark_settings_requested(&mut self) -> bool {
        !std::mem::replace(&mut self.settings_requested, true)
    }

    fn observe_fault(&mut self, err: &CommError) {
        self.error_status = Some(err.to_string());
        self.logic.on_fault(err);
    }

    fn fail(&mut self, message: String) {
        self.begun = true;
        self.phase = None;
        self.success = false;
        self.error_status = Some(message);
    }

    async fn step(&mut self, mess: &mut CommMessage<'_>) -> Result<()> {
        if !self.begun {
            self.begun = true;
            self.phase = self.logic.begin();
            if self.phase.is_none() {
                self.success = true;
                return Ok(());
            }
        }
        let Some(mut phase) = self.phase.take() else {
            return Ok(());
        };
        match phase.poll(&mut self.logic, mess).await {
            Ok(next) => {
                self.success = next.is_none();
                self.phase = next;
                Ok(())
            }
            Err(err) => {
                self.phase = Some(phase);
                Err(err)
            }
        }
    }

    fn cleanup(&mut self, done: &mut Cleanup<'_>) {
        self.logic.cleanup(done);
        if let Some(completer) = &self.completer {
            completer.complete();
        }
    }
}

/// Type-erased operation as stored in an [`crate::OpQueue`].
pub struct QueuedOp {
    key: OpKey,
    pub(crate) inner: Box<dyn DynOperation>,
}

impl QueuedOp {
    /// Operation identifier.
    pub fn id(&self) -> OpId {
        self.inner.id()
    }

    /// Operation name.
    pub fn name(&self) -> &'static str {
        self.inner.name()
    }

    /// Equality key.
    pub fn key(&self) -> &OpKey {
        &self.key
    }

    /// Target controller.
    pub fn controller(&self) -> ControllerId {
        self.inner.controller()
    }

    /// Current priority.
    pub fn priority(&self) -> PriorityLevel {
        self.inner.priority()
    }

    /// Whether the operation excludes other exclusive operations on its controller.
    pub fn is_exclusive(&self) -> bool {
        self.inner.is_exclusive()
    }

    /// Whether the phase chain has finished.
    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    /// Whether the phase chain finished without a fault.
    pub fn succeeded(&self) -> bool {
        self.inner.succeeded()
    }

    /// Failed attempts so far.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts()
    }

    /// Last fault message.
    pub fn error_status(&self) -> Option<&str> {
        self.inner.error_status()
    }
}

impl<L: OpLogic> From<Operation<L>> for QueuedOp {
    fn from(op: Operation<L>) -> Self {
        QueuedOp {
            key: op.logic.key(),
            inner: Box::new(op),
        }
    }
}

impl fmt::Debug for QueuedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedOp")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("controller", &self.controller())
            .field("priority", &self.priority())
            .finish_non_exhaustive()
    }
}

/// Context handed to [`OpLogic::cleanup`].
pub struct Cleanup<'a> {
    link: &'a LinkHandle,
    controller: ControllerId,
    priority: PriorityLevel,
    success: bool,
    error_status: Option<&'a str>,
}

impl<'a> Cleanup<'a> {
    pub(crate) fn new(
        link: &'a LinkHandle,
        controller: ControllerId,
        priority: PriorityLevel,
        success: bool,
        error_status: Option<&'a str>,
    ) -> Self {
        Self {
            link,
            controller,
            priority,
            success,
            error_status,
        }
    }

    /// Whether every phase completed.
    pub fn success(&self) -> bool {
        self.success
    }

    /// Controller the operation ran against.
    pub fn controller(&self) -> ControllerId {
        self.controller
    }

    /// Priority the operation finished at.
    pub fn priority(&self) -> PriorityLevel {
        self.priority
    }

    /// Last fault message when the operation failed.
    pub fn error_status(&self) -> Option<&str> {
        self.error_status
    }

    /// Link the operation ran on.
    pub fn link(&self) -> &LinkHandle {
        self.link
    }

    /// Current setup blob of the controller.
    pub fn setup(&self) -> Option<ControllerSetup> {
        self.link.registry().setup(self.controller)
    }

    /// Replace the setup blob of the controller.
    pub fn set_setup(&self, setup: ControllerSetup) {
        self.link.registry().set_setup(self.controller, setup);
    }

    /// Replace the maintenance status of the controller.
    pub fn set_maint_status(&self, maint: impl Into<String>) {
        self.link
            .registry()
            .set_maint_status(self.controller, maint.into());
    }

    /// Submit a follow-up operation now.
    pub fn submit(&self, op: impl Into<QueuedOp>) -> AddOutcome {
        self.link.submit(op)
    }

    /// Submit a follow-up operation after `delay`.
    pub fn queue_op(&self, delay: Duration, op: impl Into<QueuedOp>) {
        self.link.queue_op(delay, op);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Phase-less operation for queue tests.
    #[derive(Debug, Clone)]
    pub(crate) struct Marker(pub &'static str);

    impl OpLogic for Marker {
        fn name(&self) -> &'static str {
            "marker"
        }

        fn key(&self) -> OpKey {
            OpKey::with_detail("marker", self.0)
        }

        fn begin(&mut self) -> Option<Box<dyn Phase<Self>>> {
            None
        }
    }

    pub(crate) fn marker(ctl: u32, priority: PriorityLevel, tag: &'static str) -> QueuedOp {
        Operation::new(ControllerId(ctl), priority, Marker(tag)).into()
    }

    pub(crate) fn shared_marker(ctl: u32, priority: PriorityLevel, tag: &'static str) -> QueuedOp {
        Operation::new(ControllerId(ctl), priority, Marker(tag))
            .non_exclusive()
            .into()
    }
}

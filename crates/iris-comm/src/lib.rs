//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Generic operation/poller engine for device controller links."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
//! Every protocol driver plugs into the same engine: operations are queued on a
//! per-link [`OpQueue`], a dedicated comm task drains the queue by priority, and each
//! operation advances one [`Phase`] (one request/response round trip) per dequeue.
#![warn(missing_docs)]

pub mod completer;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod future;
pub mod log;
pub mod message;
pub mod messenger;
pub mod metrics;
pub mod operation;
pub mod poller;
pub mod priority;
pub mod property;
pub mod queue;

pub use completer::{Completer, PollCycle, SanityWindow};
pub use config::{CommConfig, ConfigError, ControllerConfig, LinkConfig, RetryPolicy};
pub use controller::{
    ControllerId, ControllerInfo, ControllerRegistry, ControllerSetup, ControllerStatus,
};
pub use driver::{DeviceRequest, DispatchTarget, Driver};
pub use error::{CommError, CommEvent, FaultClass, Result};
pub use future::FutureOps;
pub use log::{CommLog, LogLevel, NoopCommLog, SharedCommLog, TracingCommLog};
pub use message::{CommMessage, PropHandle};
pub use messenger::{Messenger, MessengerFactory, Reply, Responder};
pub use metrics::{new_registry, PollerMetrics, SharedRegistry};
pub use operation::{next, Cleanup, OpId, OpKey, OpLogic, Operation, Phase, PhaseStep, QueuedOp};
pub use poller::{LinkHandle, LoadSampler, Poller, PollerBuilder, PollerState};
pub use priority::PriorityLevel;
pub use property::{ControllerProperty, DecodeStatus, Direction};
pub use queue::{AddOutcome, OpQueue, QueuedSummary, Ticket};

/// Commonly used items for protocol driver implementations.
pub mod prelude {
    pub use crate::completer::Completer;
    pub use crate::controller::{ControllerId, ControllerInfo, ControllerSetup};
    pub use crate::driver::{DeviceRequest, DispatchTarget, Driver};
    pub use crate::error::{CommError, Result};
    pub use crate::message::CommMessage;
    pub use crate::operation::{
        next, Cleanup, OpKey, OpLogic, Operation, Phase, PhaseStep, QueuedOp,
    };
    pub use crate::priority::PriorityLevel;
    pub use crate::property::{ControllerProperty, DecodeStatus, Direction};
    pub use async_trait::async_trait;
    pub use bytes::{Buf, BufMut, BytesMut};
}

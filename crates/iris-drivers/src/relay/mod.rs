//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Multidrop ASCII relay board driver."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use iris_comm::prelude::*;
use parking_lot::RwLock;
use serde::Serialize;

pub mod ops;
pub mod property;
pub mod sim;

pub use ops::{BoardCommand, QuerySamples, QuerySetup, QueryStatus, SetRelay};
pub use sim::RelaySim;

/// Relay outputs a board drives when its identity does not say otherwise.
pub const DEFAULT_RELAYS: u8 = 8;
/// Highest valid drop address on a relay line.
pub const MAX_DROP: u16 = 99;

/// Last known state of one relay board.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RelayState {
    /// Output bitmask.
    pub relays: u16,
    /// Cabinet temperature.
    pub temperature: Option<f32>,
    /// Count of the latest sample bin.
    pub count: Option<u64>,
    /// End of the latest sample bin.
    pub sampled: Option<DateTime<Utc>>,
    /// Last status update.
    pub updated: Option<DateTime<Utc>>,
}

/// State of every relay board, updated by operation cleanup.
#[derive(Debug, Clone, Default)]
pub struct RelayBoard {
    states: Arc<RwLock<IndexMap<ControllerId, RelayState>>>,
}

impl RelayBoard {
    /// Empty board store.
    pub fn new() -> Self {
        Self::default()
    }

    /// State of one board.
    pub fn get(&self, id: ControllerId) -> Option<RelayState> {
        self.states.read().get(&id).cloned()
    }

    /// Every known board in first-seen order.
    pub fn snapshot(&self) -> Vec<(ControllerId, RelayState)> {
        self.states
            .read()
            .iter()
            .map(|(id, state)| (*id, state.clone()))
            .collect()
    }

    pub(crate) fn update(&self, id: ControllerId, f: impl FnOnce(&mut RelayState)) {
        f(self.states.write().entry(id).or_default());
    }
}

/// Driver for multidrop relay boards speaking the `@<drop> <cmd>` line protocol.
#[derive(Debug, Clone, Default)]
pub struct RelayDriver {
    board: RelayBoard,
}

impl RelayDriver {
    /// Driver with an empty board store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Board store updated by this driver's operations.
    pub fn board(&self) -> &RelayBoard {
        &self.board
    }

    /// Command one relay output. Rejects indices beyond the relay count in the board's setup.
    pub fn set_relay(&self, target: &DispatchTarget, index: u8, on: bool) -> Result<QueuedOp> {
        let relays = target
            .setup
            .as_ref()
            .and_then(|setup| setup.capability_u64("relays"))
            .map_or(DEFAULT_RELAYS, |count| count.min(16) as u8);
        if index >= relays {
            return Err(CommError::InvalidAddress(format!(
                "relay {index} on {} with {relays} relays",
                target.info.name
            )));
        }
        Ok(Operation::new(
            target.id,
            PriorityLevel::Command,
            SetRelay::new(self.board.clone(), index, on),
        )
        .into())
    }

    /// Sample collection counted against a polling cycle.
    pub fn query_samples(&self, target: &DispatchTarget, completer: Arc<Completer>) -> QueuedOp {
        Operation::new(
            target.id,
            DeviceRequest::QuerySamples.default_priority(),
            QuerySamples::new(self.board.clone(), Some(completer.clone())),
        )
        .non_exclusive()
        .with_completer(completer)
        .into()
    }
}

impl Driver for RelayDriver {
    fn protocol(&self) -> &'static str {
        "relay"
    }

    fn is_address_valid(&self, drop: u16) -> bool {
        (1..=MAX_DROP).contains(&drop)
    }

    fn dispatch(
        &self,
        target: &DispatchTarget,
        request: DeviceRequest,
        priority: PriorityLevel,
    ) -> Option<QueuedOp> {
        let id = target.id;
        let op: QueuedOp = match request {
            DeviceRequest::QueryStatus => {
                Operation::new(id, priority, QueryStatus::new(self.board.clone())).into()
            }
            DeviceRequest::QueryConfiguration => {
                Operation::new(id, priority, QuerySetup::new()).into()
            }
            DeviceRequest::SendSettings => {
                Operation::new(id, priority, BoardCommand::store_defaults()).into()
            }
            DeviceRequest::ResetDevice => {
                Operation::new(id, priority, BoardCommand::reset()).into()
            }
            DeviceRequest::QuerySamples => Operation::new(
                id,
                priority,
                QuerySamples::new(self.board.clone(), None),
            )
            .non_exclusive()
            .into(),
            DeviceRequest::ResetStatus
            | DeviceRequest::QueryGpsLocation
            | DeviceRequest::QueryMessage => return None,
        };
        Some(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(setup: Option<ControllerSetup>) -> DispatchTarget {
        DispatchTarget {
            id: ControllerId(4),
            info: Arc::new(ControllerInfo::new("relay-4", "line-1", 4)),
            setup,
        }
    }

    #[test]
    fn unsupported_requests_are_ignored() {
        let driver = RelayDriver::new();
        let target = target(None);
        assert!(driver
            .dispatch(&target, DeviceRequest::QueryGpsLocation, PriorityLevel::DeviceData)
            .is_none());
        let op = driver
            .dispatch(&target, DeviceRequest::SendSettings, PriorityLevel::Download)
            .unwrap();
        assert_eq!(op.name(), "relay.store_defaults");
        assert_eq!(op.priority(), PriorityLevel::Download);
    }

    #[test]
    fn relay_index_is_bounded_by_setup() {
        let driver = RelayDriver::new();
        let small = target(Some(ControllerSetup::default().with_capability("relays", 4u64)));
        assert!(driver.set_relay(&small, 3, true).is_ok());
        assert!(matches!(
            driver.set_relay(&small, 4, true),
            Err(CommError::InvalidAddress(_))
        ));
        assert!(driver.set_relay(&target(None), 7, false).is_ok());
    }

    #[test]
    fn opposite_commands_for_one_relay_both_queue() {
        use iris_comm::{AddOutcome, OpQueue};

        let driver = RelayDriver::new();
        let target = target(None);
        let queue = OpQueue::new("line-1");
        let on = driver.set_relay(&target, 3, true).unwrap();
        let off = driver.set_relay(&target, 3, false).unwrap();
        assert_ne!(on.key(), off.key());
        assert_eq!(queue.add(on), AddOutcome::Queued);
        assert_eq!(queue.add(off), AddOutcome::Queued);
        assert_eq!(
            queue.add(driver.set_relay(&target, 3, false).unwrap()),
            AddOutcome::Duplicate
        );
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn drop_zero_is_not_addressable() {
        let driver = RelayDriver::new();
        assert!(!driver.is_address_valid(0));
        assert!(driver.is_address_valid(42));
        assert!(!driver.is_address_valid(100));
    }
}

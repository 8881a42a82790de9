//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Relay board operations."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use iris_comm::prelude::*;
use tracing::{info, warn};

use super::property::{
    CommandProp, CounterProp, IdentityProp, RelaySetProp, RelayStateProp, TemperatureProp,
};
use super::RelayBoard;

/// Delay before re-reading a board after a relay command.
pub const VERIFY_DELAY: Duration = Duration::from_secs(2);
/// Delay before re-reading the identity of a board after a reset.
pub const RESET_SETTLE: Duration = Duration::from_secs(5);

/// Capability advertised by boards with a cabinet temperature sensor.
const SENSOR_CAPABILITY: &str = "sensor";

/// Read relay outputs and cabinet temperature in one round trip.
pub struct QueryStatus {
    board: RelayBoard,
    relays: u16,
    temperature: Option<f32>,
}

impl QueryStatus {
    /// Status poll updating `board`.
    pub fn new(board: RelayBoard) -> Self {
        Self {
            board,
            relays: 0,
            temperature: None,
        }
    }
}

struct ReadStatus;

#[async_trait]
impl Phase<QueryStatus> for ReadStatus {
    async fn poll(
        &mut self,
        op: &mut QueryStatus,
        mess: &mut CommMessage<'_>,
    ) -> PhaseStep<QueryStatus> {
        let relays = mess.add(RelayStateProp::default());
        let temperature = mess.add(TemperatureProp::default());
        mess.query_props().await?;
        op.relays = mess.take(relays).map_or(0, |prop| prop.bits);
        op.temperature = mess.take(temperature).and_then(|prop| prop.celsius);
        Ok(None)
    }
}

impl OpLogic for QueryStatus {
    fn name(&self) -> &'static str {
        "relay.query_status"
    }

    fn begin(&mut self) -> Option<Box<dyn Phase<Self>>> {
        Some(Box::new(ReadStatus))
    }

    fn cleanup(&mut self, done: &mut Cleanup<'_>) {
        if !done.success() {
            return;
        }
        let (relays, temperature) = (self.relays, self.temperature);
        self.board.update(done.controller(), |state| {
            state.relays = relays;
            state.temperature = temperature;
            state.updated = Some(Utc::now());
        });
        done.set_maint_status(format!("relays={relays:04x}"));
    }
}

/// Read board identity, reading the temperature sensor when one is advertised.
pub struct QuerySetup {
    setup: ControllerSetup,
}

impl QuerySetup {
    /// Configuration query.
    pub fn new() -> Self {
        Self {
            setup: ControllerSetup::default(),
        }
    }
}

impl Default for QuerySetup {
    fn default() -> Self {
        Self::new()
    }
}

struct ReadIdentity;

#[async_trait]
impl Phase<QuerySetup> for ReadIdentity {
    async fn poll(
        &mut self,
        op: &mut QuerySetup,
        mess: &mut CommMessage<'_>,
    ) -> PhaseStep<QuerySetup> {
        let identity = mess.query(IdentityProp::default()).await?;
        op.setup = identity
            .setup
            .ok_or_else(|| CommError::Parsing("empty identity".into()))?;
        if op.setup.capability_u64(SENSOR_CAPABILITY) == Some(1) {
            next(ReadSensor)
        } else {
            Ok(None)
        }
    }
}

struct ReadSensor;

#[async_trait]
impl Phase<QuerySetup> for ReadSensor {
    async fn poll(
        &mut self,
        op: &mut QuerySetup,
        mess: &mut CommMessage<'_>,
    ) -> PhaseStep<QuerySetup> {
        let reading = mess.query(TemperatureProp::default()).await?;
        op.setup
            .capabilities
            .insert("temperature".into(), reading.celsius.is_some().into());
        Ok(None)
    }
}

impl OpLogic for QuerySetup {
    fn name(&self) -> &'static str {
        "relay.query_setup"
    }

    fn begin(&mut self) -> Option<Box<dyn Phase<Self>>> {
        Some(Box::new(ReadIdentity))
    }

    fn cleanup(&mut self, done: &mut Cleanup<'_>) {
        if !done.success() {
            return;
        }
        if let Some(previous) = done.setup() {
            if previous.serial != self.setup.serial {
                info!(
                    controller = %done.controller(),
                    previous = ?previous.serial,
                    current = ?self.setup.serial,
                    "relay board replaced"
                );
            }
        }
        done.set_setup(std::mem::take(&mut self.setup));
    }
}

/// Drive one relay, then read the outputs back to confirm it latched.
pub struct SetRelay {
    board: RelayBoard,
    index: u8,
    on: bool,
    relays: u16,
}

impl SetRelay {
    /// Command relay `index` to `on`.
    pub fn new(board: RelayBoard, index: u8, on: bool) -> Self {
        Self {
            board,
            index,
            on,
            relays: 0,
        }
    }
}

struct StoreRelay;

#[async_trait]
impl Phase<SetRelay> for StoreRelay {
    async fn poll(&mut self, op: &mut SetRelay, mess: &mut CommMessage<'_>) -> PhaseStep<SetRelay> {
        mess.store(RelaySetProp {
            index: op.index,
            on: op.on,
        })
        .await?;
        next(VerifyRelay)
    }
}

struct VerifyRelay;

#[async_trait]
impl Phase<SetRelay> for VerifyRelay {
    async fn poll(&mut self, op: &mut SetRelay, mess: &mut CommMessage<'_>) -> PhaseStep<SetRelay> {
        let state = mess.query(RelayStateProp::default()).await?;
        let mask = 1u16.checked_shl(u32::from(op.index)).unwrap_or(0);
        let latched = state.bits & mask != 0;
        if latched != op.on {
            return Err(CommError::Controller(format!(
                "relay {} did not latch",
                op.index
            )));
        }
        op.relays = state.bits;
        Ok(None)
    }
}

impl OpLogic for SetRelay {
    fn name(&self) -> &'static str {
        "relay.set"
    }

    fn key(&self) -> OpKey {
        OpKey::with_detail("relay.set", format!("{}:{}", self.index, self.on))
    }

    fn begin(&mut self) -> Option<Box<dyn Phase<Self>>> {
        Some(Box::new(StoreRelay))
    }

    fn cleanup(&mut self, done: &mut Cleanup<'_>) {
        if !done.success() {
            warn!(
                controller = %done.controller(),
                relay = self.index,
                error = done.error_status().unwrap_or_default(),
                "relay command failed"
            );
            return;
        }
        let relays = self.relays;
        self.board.update(done.controller(), |state| {
            state.relays = relays;
            state.updated = Some(Utc::now());
        });
        done.queue_op(
            VERIFY_DELAY,
            Operation::new(
                done.controller(),
                DeviceRequest::QueryStatus.default_priority(),
                QueryStatus::new(self.board.clone()),
            ),
        );
    }
}

/// Collect the binned counter of one cycle, rejecting samples outside its window.
pub struct QuerySamples {
    board: RelayBoard,
    completer: Option<Arc<Completer>>,
    sample: Option<(chrono::DateTime<Utc>, u64)>,
}

impl QuerySamples {
    /// Sample collection, optionally checked against a cycle completer.
    pub fn new(board: RelayBoard, completer: Option<Arc<Completer>>) -> Self {
        Self {
            board,
            completer,
            sample: None,
        }
    }
}

struct ReadCounter;

#[async_trait]
impl Phase<QuerySamples> for ReadCounter {
    async fn poll(
        &mut self,
        op: &mut QuerySamples,
        mess: &mut CommMessage<'_>,
    ) -> PhaseStep<QuerySamples> {
        let counter = mess.query(CounterProp::default()).await?;
        let stamp = counter
            .stamp
            .ok_or_else(|| CommError::Parsing("sample without stamp".into()))?;
        if let Some(completer) = &op.completer {
            completer.check_stamp(stamp)?;
        }
        op.sample = Some((stamp, counter.count));
        Ok(None)
    }
}

impl OpLogic for QuerySamples {
    fn name(&self) -> &'static str {
        "relay.query_samples"
    }

    fn begin(&mut self) -> Option<Box<dyn Phase<Self>>> {
        Some(Box::new(ReadCounter))
    }

    fn cleanup(&mut self, done: &mut Cleanup<'_>) {
        let Some((stamp, count)) = self.sample.filter(|_| done.success()) else {
            return;
        };
        self.board.update(done.controller(), |state| {
            state.count = Some(count);
            state.sampled = Some(stamp);
        });
    }
}

/// Parameterless board command: `RST` resets, `DEF` downloads default settings.
pub struct BoardCommand {
    command: &'static str,
}

impl BoardCommand {
    /// Reset the board.
    pub fn reset() -> Self {
        Self { command: "RST" }
    }

    /// Download default settings.
    pub fn store_defaults() -> Self {
        Self { command: "DEF" }
    }
}

struct SendCommand;

#[async_trait]
impl Phase<BoardCommand> for SendCommand {
    async fn poll(
        &mut self,
        op: &mut BoardCommand,
        mess: &mut CommMessage<'_>,
    ) -> PhaseStep<BoardCommand> {
        mess.store(CommandProp {
            command: op.command,
        })
        .await?;
        Ok(None)
    }
}

impl OpLogic for BoardCommand {
    fn name(&self) -> &'static str {
        match self.command {
            "RST" => "relay.reset",
            _ => "relay.store_defaults",
        }
    }

    fn begin(&mut self) -> Option<Box<dyn Phase<Self>>> {
        Some(Box::new(SendCommand))
    }

    fn cleanup(&mut self, done: &mut Cleanup<'_>) {
        if done.success() && self.command == "RST" {
            done.queue_op(
                RESET_SETTLE,
                Operation::new(
                    done.controller(),
                    PriorityLevel::Configure,
                    QuerySetup::new(),
                ),
            );
        }
    }
}

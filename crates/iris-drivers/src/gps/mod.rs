//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "GPS modem driver reporting device positions."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
//! Modems answer `GPS?` with one or more NMEA sentences; the first `GPRMC` or
//! `GPGGA` sentence carries the position.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use iris_comm::prelude::*;
use iris_comm::property::split_line;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

pub mod nmea;
pub mod sim;

pub use nmea::GpsFix;
pub use sim::GpsSim;

/// Movement below this distance is treated as receiver jitter.
pub const JITTER_M: f64 = 25.0;

/// Last reported location of one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpsLocation {
    /// Stored position.
    pub fix: GpsFix,
    /// When the stored position was last changed.
    pub moved: DateTime<Utc>,
    /// When the modem last reported a lock.
    pub polled: DateTime<Utc>,
}

/// Locations of every polled device.
#[derive(Debug, Clone, Default)]
pub struct GpsBoard {
    locations: Arc<RwLock<IndexMap<ControllerId, GpsLocation>>>,
}

impl GpsBoard {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Location of one device.
    pub fn get(&self, id: ControllerId) -> Option<GpsLocation> {
        self.locations.read().get(&id).cloned()
    }

    /// Every known location.
    pub fn snapshot(&self) -> Vec<(ControllerId, GpsLocation)> {
        self.locations
            .read()
            .iter()
            .map(|(id, location)| (*id, location.clone()))
            .collect()
    }

    /// Record a locked fix, keeping the stored position when the move is within jitter.
    /// Returns whether the stored position changed.
    fn record(&self, id: ControllerId, fix: GpsFix, now: DateTime<Utc>) -> bool {
        let mut locations = self.locations.write();
        if let Some(location) = locations.get_mut(&id) {
            if location.fix.distance_m(&fix) < JITTER_M {
                location.polled = now;
                return false;
            }
        }
        locations.insert(
            id,
            GpsLocation {
                fix,
                moved: now,
                polled: now,
            },
        );
        true
    }
}

/// Position query (`GPS?`).
#[derive(Debug, Default)]
pub struct LocationProp {
    /// Decoded position.
    pub fix: Option<GpsFix>,
}

impl ControllerProperty for LocationProp {
    fn name(&self) -> &'static str {
        "gps-location"
    }

    fn encode_query(&self, _ctl: &ControllerInfo, out: &mut BytesMut) -> Result<()> {
        out.extend_from_slice(b"GPS?\r\n");
        Ok(())
    }

    fn decode_query(
        &mut self,
        _ctl: &ControllerInfo,
        input: &mut BytesMut,
    ) -> Result<DecodeStatus> {
        while let Some(line) = split_line(input, b"\r\n") {
            let text = String::from_utf8_lossy(&line);
            if text.trim().is_empty() {
                continue;
            }
            if let Some(fix) = nmea::parse(&text)? {
                self.fix = Some(fix);
                return Ok(DecodeStatus::Complete);
            }
        }
        Ok(DecodeStatus::Incomplete)
    }
}

/// Poll the modem position and store it when it moved.
pub struct QueryLocation {
    board: GpsBoard,
    fix: Option<GpsFix>,
}

impl QueryLocation {
    /// Location poll updating `board`.
    pub fn new(board: GpsBoard) -> Self {
        Self { board, fix: None }
    }
}

struct ReadLocation;

#[async_trait]
impl Phase<QueryLocation> for ReadLocation {
    async fn poll(
        &mut self,
        op: &mut QueryLocation,
        mess: &mut CommMessage<'_>,
    ) -> PhaseStep<QueryLocation> {
        op.fix = mess.query(LocationProp::default()).await?.fix;
        Ok(None)
    }
}

impl OpLogic for QueryLocation {
    fn name(&self) -> &'static str {
        "gps.query_location"
    }

    fn begin(&mut self) -> Option<Box<dyn Phase<Self>>> {
        Some(Box::new(ReadLocation))
    }

    fn cleanup(&mut self, done: &mut Cleanup<'_>) {
        let Some(fix) = self.fix.filter(|_| done.success()) else {
            return;
        };
        if !fix.lock {
            done.set_maint_status("no gps lock");
            return;
        }
        let moved = self.board.record(done.controller(), fix, Utc::now());
        debug!(
            controller = %done.controller(),
            lat = fix.lat,
            lon = fix.lon,
            moved,
            "gps location polled"
        );
        done.set_maint_status("gps lock");
    }
}

/// Driver for NMEA GPS modems.
#[derive(Debug, Clone, Default)]
pub struct GpsDriver {
    board: GpsBoard,
}

impl GpsDriver {
    /// Driver with an empty location store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Location store updated by this driver.
    pub fn board(&self) -> &GpsBoard {
        &self.board
    }
}

impl Driver for GpsDriver {
    fn protocol(&self) -> &'static str {
        "gps"
    }

    fn dispatch(
        &self,
        target: &DispatchTarget,
        request: DeviceRequest,
        priority: PriorityLevel,
    ) -> Option<QueuedOp> {
        match request {
            DeviceRequest::QueryGpsLocation | DeviceRequest::QueryStatus => Some(
                Operation::new(target.id, priority, QueryLocation::new(self.board.clone())).into(),
            ),
            _ => None,
        }
    }
}

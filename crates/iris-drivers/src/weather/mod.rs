//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Weather station feed published as a static JSON file."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
//! The feed is fetched whole on every poll; each controller picks its station out of
//! the file by controller name.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use iris_comm::prelude::*;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub mod sim;

pub use sim::WeatherSim;

/// One station reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Station name, matching the controller name.
    pub station: String,
    /// Observation time.
    pub observed: DateTime<Utc>,
    /// Air temperature.
    #[serde(default)]
    pub air_temp_c: Option<f32>,
    /// Average wind speed.
    #[serde(default)]
    pub wind_speed_kph: Option<f32>,
    /// Visibility.
    #[serde(default)]
    pub visibility_m: Option<u32>,
}

/// Whole feed document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feed {
    /// When the file was written.
    pub generated: DateTime<Utc>,
    /// Readings of every station.
    pub stations: Vec<Observation>,
}

/// Station reading extracted from the feed.
#[derive(Debug, Default)]
pub struct ObservationProp {
    /// Reading of the polled station.
    pub observation: Option<Observation>,
}

impl ControllerProperty for ObservationProp {
    fn name(&self) -> &'static str {
        "weather-feed"
    }

    fn encode_query(&self, _ctl: &ControllerInfo, _out: &mut BytesMut) -> Result<()> {
        Ok(())
    }

    fn decode_query(&mut self, ctl: &ControllerInfo, input: &mut BytesMut) -> Result<DecodeStatus> {
        let feed: Feed = match serde_json::from_slice(input) {
            Ok(feed) => feed,
            Err(err) if err.is_eof() => return Ok(DecodeStatus::Incomplete),
            Err(err) => return Err(CommError::Parsing(format!("weather feed: {err}"))),
        };
        input.clear();
        let observation = feed
            .stations
            .into_iter()
            .find(|obs| obs.station == ctl.name)
            .ok_or_else(|| CommError::Controller(format!("station {} not in feed", ctl.name)))?;
        self.observation = Some(observation);
        Ok(DecodeStatus::Complete)
    }
}

/// Latest readings per station.
#[derive(Debug, Clone, Default)]
pub struct WeatherBoard {
    readings: Arc<RwLock<IndexMap<ControllerId, Observation>>>,
}

impl WeatherBoard {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest reading of a station.
    pub fn get(&self, id: ControllerId) -> Option<Observation> {
        self.readings.read().get(&id).cloned()
    }

    /// Every stored reading.
    pub fn snapshot(&self) -> Vec<(ControllerId, Observation)> {
        self.readings
            .read()
            .iter()
            .map(|(id, obs)| (*id, obs.clone()))
            .collect()
    }

    fn store(&self, id: ControllerId, observation: Observation) {
        self.readings.write().insert(id, observation);
    }
}

/// Fetch the feed and store the station reading.
pub struct QueryObservation {
    board: WeatherBoard,
    completer: Option<Arc<Completer>>,
    observation: Option<Observation>,
}

impl QueryObservation {
    /// Feed poll, optionally checked against a cycle completer.
    pub fn new(board: WeatherBoard, completer: Option<Arc<Completer>>) -> Self {
        Self {
            board,
            completer,
            observation: None,
        }
    }
}

struct FetchFeed;

#[async_trait]
impl Phase<QueryObservation> for FetchFeed {
    async fn poll(
        &mut self,
        op: &mut QueryObservation,
        mess: &mut CommMessage<'_>,
    ) -> PhaseStep<QueryObservation> {
        let observation = mess
            .query(ObservationProp::default())
            .await?
            .observation
            .ok_or_else(|| CommError::Parsing("empty observation".into()))?;
        if let Some(completer) = &op.completer {
            completer.check_stamp(observation.observed)?;
        }
        op.observation = Some(observation);
        Ok(None)
    }
}

impl OpLogic for QueryObservation {
    fn name(&self) -> &'static str {
        "weather.query_observation"
    }

    fn begin(&mut self) -> Option<Box<dyn Phase<Self>>> {
        Some(Box::new(FetchFeed))
    }

    fn cleanup(&mut self, done: &mut Cleanup<'_>) {
        if !done.success() {
            return;
        }
        if let Some(observation) = self.observation.take() {
            self.board.store(done.controller(), observation);
        }
    }
}

/// Driver for weather stations published through one HTTP feed file.
#[derive(Debug, Clone, Default)]
pub struct WeatherDriver {
    board: WeatherBoard,
}

impl WeatherDriver {
    /// Driver with an empty reading store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reading store updated by this driver.
    pub fn board(&self) -> &WeatherBoard {
        &self.board
    }

    /// Feed poll counted against a polling cycle.
    pub fn query_samples(&self, target: &DispatchTarget, completer: Arc<Completer>) -> QueuedOp {
        Operation::new(
            target.id,
            DeviceRequest::QuerySamples.default_priority(),
            QueryObservation::new(self.board.clone(), Some(completer.clone())),
        )
        .non_exclusive()
        .with_completer(completer)
        .into()
    }
}

impl Driver for WeatherDriver {
    fn protocol(&self) -> &'static str {
        "weather"
    }

    fn default_scheme(&self) -> &'static str {
        "http"
    }

    fn dispatch(
        &self,
        target: &DispatchTarget,
        request: DeviceRequest,
        priority: PriorityLevel,
    ) -> Option<QueuedOp> {
        match request {
            DeviceRequest::QueryStatus | DeviceRequest::QuerySamples => Some(
                Operation::new(
                    target.id,
                    priority,
                    QueryObservation::new(self.board.clone(), None),
                )
                .non_exclusive()
                .into(),
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"{
        "generated": "2026-10-14T12:00:00Z",
        "stations": [
            {"station": "rwis-1", "observed": "2026-10-14T11:58:00Z", "air_temp_c": 8.5},
            {"station": "rwis-2", "observed": "2026-10-14T11:59:00Z", "visibility_m": 400}
        ]
    }"#;

    #[test]
    fn station_is_picked_by_controller_name() {
        let ctl = ControllerInfo::new("rwis-2", "feed", 2);
        let mut input = BytesMut::from(FEED.as_bytes());
        let mut prop = ObservationProp::default();
        assert_eq!(
            prop.decode_query(&ctl, &mut input).unwrap(),
            DecodeStatus::Complete
        );
        let obs = prop.observation.unwrap();
        assert_eq!(obs.visibility_m, Some(400));
        assert_eq!(obs.air_temp_c, None);
        assert!(input.is_empty());
    }

    #[test]
    fn truncated_feed_waits_for_more() {
        let ctl = ControllerInfo::new("rwis-1", "feed", 1);
        let mut input = BytesMut::from(&FEED.as_bytes()[..40]);
        let mut prop = ObservationProp::default();
        assert_eq!(
            prop.decode_query(&ctl, &mut input).unwrap(),
            DecodeStatus::Incomplete
        );
        assert_eq!(input.len(), 40);
    }

    #[test]
    fn missing_station_is_a_controller_fault() {
        let ctl = ControllerInfo::new("rwis-9", "feed", 9);
        let mut input = BytesMut::from(FEED.as_bytes());
        let mut prop = ObservationProp::default();
        assert!(matches!(
            prop.decode_query(&ctl, &mut input),
            Err(CommError::Controller(_))
        ));
    }

    #[test]
    fn garbage_is_a_parsing_fault() {
        let ctl = ControllerInfo::new("rwis-1", "feed", 1);
        let mut input = BytesMut::from(&b"<html>gateway timeout</html>"[..]);
        let mut prop = ObservationProp::default();
        assert!(matches!(
            prop.decode_query(&ctl, &mut input),
            Err(CommError::Parsing(_))
        ));
    }
}

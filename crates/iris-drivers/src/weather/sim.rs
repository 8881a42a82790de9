//! ---
//! iris_section: "11-simulation"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Simulated weather feed file."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use chrono::{Duration, Utc};
use indexmap::IndexMap;
use iris_comm::{ControllerInfo, Reply, Responder};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{Feed, Observation};

#[derive(Debug, Clone, Copy, Default)]
struct Station {
    stale: bool,
}

#[derive(Debug, Default)]
struct State {
    stations: IndexMap<String, Station>,
    garbled: bool,
    truncated: bool,
}

/// A feed file listing every simulated station; every request returns the whole file.
pub struct WeatherSim {
    state: Mutex<State>,
    rng: Mutex<StdRng>,
}

impl WeatherSim {
    /// Feed without stations.
    pub fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(State::default()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Add a station named like its controller.
    pub fn with_station(self, name: impl Into<String>) -> Self {
        self.state.lock().stations.insert(name.into(), Station::default());
        self
    }

    /// Make a station report an observation six hours old.
    pub fn set_stale(&self, name: &str, stale: bool) {
        if let Some(station) = self.state.lock().stations.get_mut(name) {
            station.stale = stale;
        }
    }

    /// Serve an error page instead of the feed.
    pub fn set_garbled(&self, garbled: bool) {
        self.state.lock().garbled = garbled;
    }

    /// Serve only the first half of the feed.
    pub fn set_truncated(&self, truncated: bool) {
        self.state.lock().truncated = truncated;
    }

    fn feed(&self, state: &State) -> Feed {
        let now = Utc::now();
        let mut rng = self.rng.lock();
        let stations = state
            .stations
            .iter()
            .map(|(name, station)| Observation {
                station: name.clone(),
                observed: if station.stale {
                    now - Duration::hours(6)
                } else {
                    now - Duration::seconds(rng.gen_range(0..120))
                },
                air_temp_c: Some(rng.gen_range(-200..=350) as f32 / 10.0),
                wind_speed_kph: Some(rng.gen_range(0..=600) as f32 / 10.0),
                visibility_m: Some(rng.gen_range(50..=16_000)),
            })
            .collect();
        Feed {
            generated: now,
            stations,
        }
    }
}

impl Responder for WeatherSim {
    fn respond(&self, _ctl: &ControllerInfo, _request: &[u8]) -> Reply {
        let state = self.state.lock();
        if state.garbled {
            return Reply::Frame(b"<html><body>502 Bad Gateway</body></html>".to_vec());
        }
        let Ok(mut body) = serde_json::to_vec(&self.feed(&state)) else {
            return Reply::Hangup;
        };
        if state.truncated {
            body.truncate(body.len() / 2);
        }
        Reply::Frame(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch(sim: &WeatherSim) -> Vec<u8> {
        let ctl = ControllerInfo::new("rwis-1", "feed", 1);
        match sim.respond(&ctl, b"") {
            Reply::Frame(bytes) => bytes,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn feed_lists_every_station() {
        let sim = WeatherSim::new(3).with_station("rwis-1").with_station("rwis-2");
        sim.set_stale("rwis-2", true);
        let feed: Feed = serde_json::from_slice(&fetch(&sim)).unwrap();
        assert_eq!(feed.stations.len(), 2);
        assert!(feed.generated - feed.stations[0].observed < Duration::minutes(5));
        assert!(feed.generated - feed.stations[1].observed >= Duration::hours(6));
    }

    #[test]
    fn truncated_feed_is_not_valid_json() {
        let sim = WeatherSim::new(3).with_station("rwis-1");
        sim.set_truncated(true);
        let err = serde_json::from_slice::<Feed>(&fetch(&sim)).unwrap_err();
        assert!(err.is_eof());
    }
}

//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Protocol drivers and device simulators bundled with the comm engine."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
//! Three drivers ship with the engine:
//!
//! * [`relay`]: multidrop ASCII relay boards with multi-phase command operations.
//! * [`gps`]: NMEA modems reporting device positions.
//! * [`weather`]: weather stations published together as one JSON file over HTTP.
//!
//! Each driver has a simulator implementing [`iris_comm::Responder`] so a link can be
//! pointed at `mem://<name>` instead of real hardware.
#![warn(missing_docs)]

use std::str::FromStr;
use std::sync::Arc;

use iris_comm::{Completer, DispatchTarget, Driver, MessengerFactory, QueuedOp};
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;

pub mod gps;
pub mod relay;
pub mod weather;

pub use gps::{GpsDriver, GpsSim};
pub use relay::{RelayDriver, RelaySim};
pub use weather::{WeatherDriver, WeatherSim};

/// Protocols with a bundled driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum Protocol {
    /// Relay boards.
    Relay,
    /// GPS modems.
    Gps,
    /// Weather feed.
    Weather,
}

/// Driver lookup failures.
#[derive(Debug, Error)]
pub enum DriverError {
    /// A link names a protocol without a bundled driver.
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),
}

/// One instance of every bundled driver, shared by all links of a protocol.
#[derive(Debug, Clone, Default)]
pub struct DriverSet {
    relay: Arc<RelayDriver>,
    gps: Arc<GpsDriver>,
    weather: Arc<WeatherDriver>,
}

impl DriverSet {
    /// Fresh drivers with empty state stores.
    pub fn new() -> Self {
        Self::default()
    }

    /// Relay driver.
    pub fn relay(&self) -> &Arc<RelayDriver> {
        &self.relay
    }

    /// GPS driver.
    pub fn gps(&self) -> &Arc<GpsDriver> {
        &self.gps
    }

    /// Weather driver.
    pub fn weather(&self) -> &Arc<WeatherDriver> {
        &self.weather
    }

    /// Driver for a protocol name from link configuration.
    pub fn for_protocol(&self, name: &str) -> Result<Arc<dyn Driver>, DriverError> {
        let protocol =
            Protocol::from_str(name).map_err(|_| DriverError::UnknownProtocol(name.to_owned()))?;
        Ok(self.driver(protocol))
    }

    /// Driver for a known protocol.
    pub fn driver(&self, protocol: Protocol) -> Arc<dyn Driver> {
        match protocol {
            Protocol::Relay => self.relay.clone(),
            Protocol::Gps => self.gps.clone(),
            Protocol::Weather => self.weather.clone(),
        }
    }

    /// Sampling operation counted against `completer`, for protocols that collect samples.
    pub fn query_samples(
        &self,
        protocol: Protocol,
        target: &DispatchTarget,
        completer: Arc<Completer>,
    ) -> Option<QueuedOp> {
        match protocol {
            Protocol::Relay => Some(self.relay.query_samples(target, completer)),
            Protocol::Weather => Some(self.weather.query_samples(target, completer)),
            Protocol::Gps => None,
        }
    }
}

/// Register simulators behind `mem://<name>` on a messenger factory.
#[derive(Default)]
pub struct Simulators {
    relay: Vec<(String, Arc<RelaySim>)>,
    gps: Vec<(String, Arc<GpsSim>)>,
    weather: Vec<(String, Arc<WeatherSim>)>,
}

impl Simulators {
    /// No simulators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a relay line.
    pub fn relay(mut self, name: impl Into<String>, sim: RelaySim) -> Self {
        self.relay.push((name.into(), Arc::new(sim)));
        self
    }

    /// Add a GPS modem pool.
    pub fn gps(mut self, name: impl Into<String>, sim: GpsSim) -> Self {
        self.gps.push((name.into(), Arc::new(sim)));
        self
    }

    /// Add a weather feed.
    pub fn weather(mut self, name: impl Into<String>, sim: WeatherSim) -> Self {
        self.weather.push((name.into(), Arc::new(sim)));
        self
    }

    /// Relay simulator registered as `name`.
    pub fn relay_sim(&self, name: &str) -> Option<Arc<RelaySim>> {
        lookup(&self.relay, name)
    }

    /// GPS simulator registered as `name`.
    pub fn gps_sim(&self, name: &str) -> Option<Arc<GpsSim>> {
        lookup(&self.gps, name)
    }

    /// Weather simulator registered as `name`.
    pub fn weather_sim(&self, name: &str) -> Option<Arc<WeatherSim>> {
        lookup(&self.weather, name)
    }

    /// Number of registered simulators.
    pub fn len(&self) -> usize {
        self.relay.len() + self.gps.len() + self.weather.len()
    }

    /// Whether no simulator was added.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every simulator reachable through `factory`.
    pub fn register(&self, factory: &MessengerFactory) {
        for (name, sim) in &self.relay {
            factory.register_responder(name.clone(), sim.clone());
        }
        for (name, sim) in &self.gps {
            factory.register_responder(name.clone(), sim.clone());
        }
        for (name, sim) in &self.weather {
            factory.register_responder(name.clone(), sim.clone());
        }
    }
}

fn lookup<T>(sims: &[(String, Arc<T>)], name: &str) -> Option<Arc<T>> {
    sims.iter()
        .find(|(registered, _)| registered == name)
        .map(|(_, sim)| sim.clone())
}

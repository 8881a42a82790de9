//! ---
//! iris_section: "01-core-functionality"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Daemon configuration: link layout, logging, metrics, jobs, simulators."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use iris_comm::CommConfig;
use iris_drivers::{GpsSim, RelaySim, Simulators, WeatherSim};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LoggingConfig;

/// Environment variable naming the configuration file.
pub const ENV_CONFIG_PATH: &str = "IRIS_COMMD_CONFIG";

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9464))
}

fn default_status_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_sample_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_seed() -> u64 {
    0x1815
}

/// Whole daemon configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Links and controllers.
    #[serde(flatten)]
    pub comm: CommConfig,
    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Prometheus exporter.
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Periodic polling jobs.
    #[serde(default)]
    pub polling: PollingConfig,
    /// Simulated devices behind `mem://` links.
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Serve `/metrics`.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// Listen address.
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

/// Intervals of the periodic jobs (seconds).
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Status poll of every controller.
    #[serde(default = "default_status_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub status_interval: Duration,
    /// Binned sample collection cycle.
    #[serde(default = "default_sample_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub sample_interval: Duration,
    /// Query configuration of every controller at startup.
    #[serde(default = "default_true")]
    pub query_setup: bool,
}

fn default_true() -> bool {
    true
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            status_interval: default_status_interval(),
            sample_interval: default_sample_interval(),
            query_setup: true,
        }
    }
}

/// Simulators registered on the messenger factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Seed for simulated readings and backoff jitter.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Relay lines.
    #[serde(default)]
    pub relay: Vec<RelayLineSim>,
    /// GPS modem pools.
    #[serde(default)]
    pub gps: Vec<GpsPoolSim>,
    /// Weather feeds.
    #[serde(default)]
    pub weather: Vec<WeatherFeedSim>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            relay: Vec::new(),
            gps: Vec::new(),
            weather: Vec::new(),
        }
    }
}

/// One simulated relay line (`mem://<name>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayLineSim {
    /// Responder name.
    pub name: String,
    /// Boards on the line.
    #[serde(default)]
    pub boards: Vec<RelayBoardSim>,
}

/// One simulated relay board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayBoardSim {
    /// Drop address.
    pub drop: u16,
    /// Relay outputs.
    #[serde(default = "default_relays")]
    pub relays: u8,
    /// Has a temperature sensor.
    #[serde(default)]
    pub sensor: bool,
    /// Starts without settings.
    #[serde(default)]
    pub unconfigured: bool,
    /// Relays that ignore commands.
    #[serde(default)]
    pub stuck: Vec<u8>,
}

fn default_relays() -> u8 {
    iris_drivers::relay::DEFAULT_RELAYS
}

/// One simulated GPS modem pool (`mem://<name>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpsPoolSim {
    /// Responder name.
    pub name: String,
    /// Random walk per poll (degrees).
    #[serde(default)]
    pub wander_deg: f64,
    /// Modems keyed by controller name.
    #[serde(default)]
    pub modems: Vec<GpsModemSim>,
}

/// One simulated modem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpsModemSim {
    /// Controller name.
    pub name: String,
    /// Latitude.
    pub lat: f64,
    /// Longitude.
    pub lon: f64,
}

/// One simulated weather feed (`mem://<name>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherFeedSim {
    /// Responder name.
    pub name: String,
    /// Station names, matching controller names.
    #[serde(default)]
    pub stations: Vec<String>,
}

impl SimulationConfig {
    /// Build the configured simulators.
    pub fn build(&self) -> Simulators {
        let mut sims = Simulators::new();
        for (index, line) in self.relay.iter().enumerate() {
            let mut sim = RelaySim::new(self.seed.wrapping_add(index as u64));
            for board in &line.boards {
                sim = sim.with_board(board.drop, board.relays, board.sensor);
                if board.unconfigured {
                    sim = sim.unconfigured(board.drop);
                }
                for relay in &board.stuck {
                    sim = sim.stuck_relay(board.drop, *relay);
                }
            }
            sims = sims.relay(line.name.clone(), sim);
        }
        for (index, pool) in self.gps.iter().enumerate() {
            let mut sim = GpsSim::new(self.seed.wrapping_add(index as u64), pool.wander_deg);
            for modem in &pool.modems {
                sim = sim.with_modem(modem.name.clone(), modem.lat, modem.lon);
            }
            sims = sims.gps(pool.name.clone(), sim);
        }
        for (index, feed) in self.weather.iter().enumerate() {
            let mut sim = WeatherSim::new(self.seed.wrapping_add(index as u64));
            for station in &feed.stations {
                sim = sim.with_station(station.clone());
            }
            sims = sims.weather(feed.name.clone(), sim);
        }
        sims
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let all = self
            .relay
            .iter()
            .map(|line| &line.name)
            .chain(self.gps.iter().map(|pool| &pool.name))
            .chain(self.weather.iter().map(|feed| &feed.name));
        for name in all {
            if !names.insert(name.as_str()) {
                return Err(anyhow!("simulator '{name}' declared twice"));
            }
        }
        for line in &self.relay {
            for board in &line.boards {
                if let Some(relay) = board.stuck.iter().find(|relay| **relay >= board.relays) {
                    return Err(anyhow!(
                        "simulator '{}' board {} has no relay {relay}",
                        line.name,
                        board.drop
                    ));
                }
            }
        }
        Ok(())
    }
}

impl DaemonConfig {
    /// Load the first existing file, preferring [`ENV_CONFIG_PATH`].
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<(Self, PathBuf)> {
        if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                return Ok((Self::from_path(&path)?, path));
            }
        }
        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                return Ok((Self::from_path(path)?, path.to_path_buf()));
            }
        }
        Err(anyhow!(
            "no configuration file found. inspected: {}",
            candidates
                .iter()
                .map(|path| path.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Read and validate one file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse()
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Check the link layout and the simulators it points at.
    pub fn validate(&self) -> Result<()> {
        self.comm.validate()?;
        self.simulation.validate()?;
        if self.polling.status_interval.is_zero() || self.polling.sample_interval.is_zero() {
            return Err(anyhow!("polling intervals must be positive"));
        }
        Ok(())
    }
}

impl std::str::FromStr for DaemonConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const LAYOUT: &str = r#"
        [[links]]
        name = "relays-1"
        uri = "mem://relay-line"
        protocol = "relay"
        timeout = 250

        [[links]]
        name = "wx"
        uri = "mem://wx-feed"
        protocol = "weather"

        [[controllers]]
        name = "relay-1"
        link = "relays-1"
        drop = 1

        [[controllers]]
        name = "rwis-1"
        link = "wx"
        drop = 1

        [polling]
        status_interval = 15

        [metrics]
        enabled = false

        [simulation]
        seed = 42

        [[simulation.relay]]
        name = "relay-line"
        boards = [{ drop = 1, sensor = true, stuck = [3] }]

        [[simulation.weather]]
        name = "wx-feed"
        stations = ["rwis-1"]
    "#;

    #[test]
    fn layout_and_sections_parse_together() {
        let config: DaemonConfig = LAYOUT.parse().unwrap();
        assert_eq!(config.comm.links.len(), 2);
        assert_eq!(
            config.comm.link("relays-1").unwrap().timeout,
            Duration::from_millis(250)
        );
        assert_eq!(config.polling.status_interval, Duration::from_secs(15));
        assert_eq!(config.polling.sample_interval, Duration::from_secs(30));
        assert!(!config.metrics.enabled);
        let board = &config.simulation.relay[0].boards[0];
        assert_eq!(board.relays, 8);
        assert_eq!(config.simulation.build().len(), 2);
    }

    #[test]
    fn stuck_relay_must_exist() {
        let broken = LAYOUT.replace("stuck = [3]", "relays = 2, stuck = [3]");
        assert!(broken.parse::<DaemonConfig>().is_err());
    }

    #[test]
    fn duplicate_simulator_names_are_rejected() {
        let broken = format!("{LAYOUT}\n[[simulation.gps]]\nname = \"wx-feed\"\n");
        let err = broken.parse::<DaemonConfig>().unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn shipped_layout_is_valid() {
        let config: DaemonConfig = include_str!("../../../configs/iris-commd.toml")
            .parse()
            .unwrap();
        assert_eq!(config.comm.links.len(), 3);
        assert_eq!(config.comm.controllers_on("relays-north").count(), 3);
        assert_eq!(config.simulation.build().len(), 3);
    }

    #[test]
    fn loads_first_existing_candidate() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(LAYOUT.as_bytes()).unwrap();
        let missing = PathBuf::from("/nonexistent/iris-commd.toml");
        let (config, source) =
            DaemonConfig::load_with_source(&[missing.clone(), file.path().to_path_buf()]).unwrap();
        assert_eq!(source, file.path());
        assert_eq!(config.simulation.seed, 42);
        assert!(DaemonConfig::load_with_source(&[missing]).is_err());
    }
}

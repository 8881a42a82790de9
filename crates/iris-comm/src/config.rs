//! ---
//! iris_section: "01-core-functionality"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Comm link, retry and controller layout configuration."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use thiserror::Error;

use crate::controller::ControllerInfo;
use crate::error::{CommError, FaultClass};

fn default_timeout() -> Duration {
    Duration::from_millis(750)
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_jitter() -> Duration {
    Duration::from_millis(50)
}

fn default_load_interval() -> Duration {
    Duration::from_secs(30)
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// Structural invariant violated.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Retry and backoff policy applied to faults on one link.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry, doubled for each further retry (milliseconds).
    #[serde(default = "default_base_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay: Duration,
    /// Upper bound on the backoff delay (milliseconds).
    #[serde(default = "default_max_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
    /// Maximum random jitter added to each delay (milliseconds).
    #[serde(default = "default_jitter")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub jitter: Duration,
    /// Treat checksum and parsing faults as final instead of retrying them.
    #[serde(default)]
    pub decode_faults_fatal: bool,
}

impl RetryPolicy {
    /// Policy without delays, mostly for tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
            decode_faults_fatal: false,
        }
    }

    /// Whether a fault warrants another attempt.
    pub fn is_retryable(&self, err: &CommError) -> bool {
        match err.class() {
            FaultClass::Transport => true,
            FaultClass::Decode => !self.decode_faults_fatal,
            FaultClass::Protocol | FaultClass::Configuration | FaultClass::Cancelled => false,
        }
    }

    /// Exponential backoff for a 1-indexed retry attempt.
    pub fn backoff_delay(&self, attempt: u32, rng: &mut StdRng) -> Duration {
        let exponent = attempt.saturating_sub(1).min(8);
        let base = self.base_delay.mul_f64(2u32.pow(exponent) as f64);
        let base = base.min(self.max_delay.max(self.base_delay));
        if self.jitter.is_zero() {
            base
        } else {
            let jitter_ms = rng.gen_range(0..=self.jitter.as_millis().max(1)) as u64;
            base + Duration::from_millis(jitter_ms)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
            decode_faults_fatal: false,
        }
    }
}

/// One comm link: a transport endpoint shared by one or more controllers.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Link name referenced by controllers.
    pub name: String,
    /// Transport URI; bare `host:port` takes the protocol's default scheme.
    pub uri: String,
    /// Protocol driver name.
    pub protocol: String,
    /// Per-read timeout (milliseconds).
    #[serde(default = "default_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,
    /// Fault retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Close the transport after this much idle time (seconds).
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub idle_disconnect: Option<Duration>,
    /// Line load sampling interval (seconds).
    #[serde(default = "default_load_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub load_interval: Duration,
    /// Record wire frames to the protocol log.
    #[serde(default)]
    pub log_protocol: bool,
}

impl LinkConfig {
    /// Link with default timing.
    pub fn new(
        name: impl Into<String>,
        uri: impl Into<String>,
        protocol: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            protocol: protocol.into(),
            timeout: default_timeout(),
            retry: RetryPolicy::default(),
            idle_disconnect: None,
            load_interval: default_load_interval(),
            log_protocol: false,
        }
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the read timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("link name must not be empty".into()));
        }
        if self.uri.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "link '{}' must declare a uri",
                self.name
            )));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid(format!(
                "link '{}' timeout must be positive",
                self.name
            )));
        }
        if self.load_interval.is_zero() {
            return Err(ConfigError::Invalid(format!(
                "link '{}' load interval must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// One controller bound to a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Controller name.
    pub name: String,
    /// Link name.
    pub link: String,
    /// Multidrop address.
    #[serde(default)]
    pub drop: u16,
    /// Optional credential.
    #[serde(default)]
    pub password: Option<String>,
}

impl From<&ControllerConfig> for ControllerInfo {
    fn from(config: &ControllerConfig) -> Self {
        ControllerInfo {
            name: config.name.clone(),
            link: config.link.clone(),
            drop: config.drop,
            password: config.password.clone(),
        }
    }
}

/// Links and controllers served by one comm engine instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommConfig {
    /// Comm links.
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    /// Controllers.
    #[serde(default)]
    pub controllers: Vec<ControllerConfig>,
}

impl CommConfig {
    /// Look up a link by name.
    pub fn link(&self, name: &str) -> Option<&LinkConfig> {
        self.links.iter().find(|link| link.name == name)
    }

    /// Controllers bound to a link.
    pub fn controllers_on<'a>(
        &'a self,
        link: &'a str,
    ) -> impl Iterator<Item = &'a ControllerConfig> + 'a {
        self.controllers.iter().filter(move |ctl| ctl.link == link)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for link in &self.links {
            link.validate()?;
            if !names.insert(link.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate link '{}'",
                    link.name
                )));
            }
        }
        let mut controllers = HashSet::new();
        for ctl in &self.controllers {
            if !names.contains(ctl.link.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "controller '{}' references unknown link '{}'",
                    ctl.name, ctl.link
                )));
            }
            if !controllers.insert((ctl.link.as_str(), ctl.drop)) {
                return Err(ConfigError::Invalid(format!(
                    "controller '{}' reuses drop {} on link '{}'",
                    ctl.name, ctl.drop, ctl.link
                )));
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for CommConfig {
    type Err = ConfigError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let config: CommConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

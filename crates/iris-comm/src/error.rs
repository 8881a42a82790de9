//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Fault taxonomy shared by messengers, properties and the poller."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::time::Duration;

use serde::Serialize;
use strum::{Display, IntoStaticStr};
use thiserror::Error;

use crate::config::ConfigError;
use crate::property::Direction;

/// Result alias used throughout the comm engine.
pub type Result<T> = std::result::Result<T, CommError>;

/// Errors raised while exchanging messages with a controller.
#[derive(Debug, Error)]
pub enum CommError {
    /// No response arrived within the link timeout.
    #[error("poll timeout after {0:?}")]
    Timeout(Duration),
    /// Underlying socket failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The peer closed the stream or the messenger is not connected.
    #[error("connection closed")]
    Disconnected,
    /// The transport could not be established.
    #[error("connect failed: {0}")]
    Connect(String),
    /// HTTP fetch failure.
    #[error("http error: {0}")]
    Http(String),
    /// Response frame failed checksum validation.
    #[error("checksum error: {0}")]
    Checksum(String),
    /// Response frame could not be parsed.
    #[error("parsing error: {0}")]
    Parsing(String),
    /// The device replied with a negative acknowledgement.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The device reported an error condition of its own.
    #[error("controller error: {0}")]
    Controller(String),
    /// The property has no encoding for the requested direction.
    #[error("{direction} not supported by {property}")]
    Unsupported {
        /// Property name.
        property: &'static str,
        /// Requested direction.
        direction: Direction,
    },
    /// Link URI or controller drop address is unusable.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// Link configuration rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The controller asked for its settings to be downloaded.
    #[error("settings download requested")]
    SettingsRequested,
    /// The operation was abandoned because the link shut down.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

/// Coarse fault classification driving retry and recovery decisions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Display, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FaultClass {
    /// Timeouts, resets, unreachable endpoints.
    Transport,
    /// Checksum and parsing failures.
    Decode,
    /// Device-reported negative acknowledgements and error conditions.
    Protocol,
    /// Unsupported verbs and invalid addresses.
    Configuration,
    /// Link teardown.
    Cancelled,
}

impl FaultClass {
    /// Stable label for metrics.
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Comm events recorded against a controller, mirroring the fault taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CommEvent {
    /// Generic communication error.
    CommError,
    /// Poll timed out.
    PollTimeout,
    /// Checksum validation failed.
    ChecksumError,
    /// Response could not be parsed.
    ParsingError,
    /// Device reported an error.
    ControllerError,
    /// Configuration problem on our side.
    ConfigError,
    /// Operation abandoned at shutdown.
    QueueDrained,
}

impl CommError {
    /// Classify the fault.
    pub fn class(&self) -> FaultClass {
        match self {
            CommError::Timeout(_)
            | CommError::Io(_)
            | CommError::Disconnected
            | CommError::Connect(_)
            | CommError::Http(_) => FaultClass::Transport,
            CommError::Checksum(_) | CommError::Parsing(_) => FaultClass::Decode,
            CommError::Protocol(_) | CommError::Controller(_) | CommError::SettingsRequested => {
                FaultClass::Protocol
            }
            CommError::Unsupported { .. }
            | CommError::InvalidAddress(_)
            | CommError::Config(_) => FaultClass::Configuration,
            CommError::Cancelled(_) => FaultClass::Cancelled,
        }
    }

    /// The comm event logged against the controller for this fault.
    pub fn event(&self) -> CommEvent {
        match self {
            CommError::Timeout(_) => CommEvent::PollTimeout,
            CommError::Checksum(_) => CommEvent::ChecksumError,
            CommError::Parsing(_) => CommEvent::ParsingError,
            CommError::Protocol(_) | CommError::Controller(_) | CommError::SettingsRequested => {
                CommEvent::ControllerError
            }
            CommError::Unsupported { .. }
            | CommError::InvalidAddress(_)
            | CommError::Config(_) => CommEvent::ConfigError,
            CommError::Cancelled(_) => CommEvent::QueueDrained,
            _ => CommEvent::CommError,
        }
    }

    /// Whether the fault leaves the messenger in an unknown state and it must be reopened.
    ///
    /// A read timeout leaves the line usable; other drops sharing it keep the connection.
    pub fn closes_transport(&self) -> bool {
        self.class() == FaultClass::Transport && !matches!(self, CommError::Timeout(_))
    }

    /// Whether buffered input must be discarded before the next exchange.
    pub fn drains_input(&self) -> bool {
        self.class() == FaultClass::Decode || matches!(self, CommError::Timeout(_))
    }
}

impl From<reqwest::Error> for CommError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CommError::Timeout(Duration::ZERO)
        } else if err.is_connect() {
            CommError::Connect(err.to_string())
        } else {
            CommError::Http(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_taxonomy() {
        assert_eq!(
            CommError::Timeout(Duration::from_secs(1)).class(),
            FaultClass::Transport
        );
        assert_eq!(CommError::Checksum("x".into()).class(), FaultClass::Decode);
        assert_eq!(CommError::Protocol("nak".into()).class(), FaultClass::Protocol);
        let unsupported = CommError::Unsupported {
            property: "relay",
            direction: Direction::Store,
        };
        assert_eq!(unsupported.class(), FaultClass::Configuration);
        assert_eq!(unsupported.to_string(), "store not supported by relay");
    }

    #[test]
    fn transport_faults_close_and_decode_faults_drain() {
        assert!(CommError::Disconnected.closes_transport());
        assert!(!CommError::Disconnected.drains_input());
        assert!(CommError::Parsing("bad".into()).drains_input());
        assert!(!CommError::Protocol("nak".into()).closes_transport());
    }

    #[test]
    fn timeouts_drain_without_closing() {
        let timeout = CommError::Timeout(Duration::from_millis(500));
        assert_eq!(timeout.class(), FaultClass::Transport);
        assert!(!timeout.closes_transport());
        assert!(timeout.drains_input());
        assert!(CommError::Connect("refused".into()).closes_transport());
        assert!(CommError::Io(std::io::ErrorKind::BrokenPipe.into()).closes_transport());
    }

    #[test]
    fn events_use_screaming_labels() {
        assert_eq!(
            CommError::Timeout(Duration::ZERO).event().to_string(),
            "POLL_TIMEOUT"
        );
        assert_eq!(CommError::Cancelled("x".into()).event(), CommEvent::QueueDrained);
    }
}

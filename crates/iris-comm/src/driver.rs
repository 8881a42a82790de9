//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Device request boundary and protocol driver dispatch."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::controller::{ControllerId, ControllerInfo, ControllerSetup};
use crate::operation::QueuedOp;
use crate::priority::PriorityLevel;

/// Protocol-independent requests the rest of the system sends to devices.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceRequest {
    /// Poll current device state.
    QueryStatus,
    /// Read hardware identity and capabilities.
    QueryConfiguration,
    /// Download all settings to the controller.
    SendSettings,
    /// Reset the device.
    ResetDevice,
    /// Clear latched status on the device.
    ResetStatus,
    /// Read the GPS position.
    QueryGpsLocation,
    /// Read the message currently displayed.
    QueryMessage,
    /// Collect binned samples.
    QuerySamples,
}

impl DeviceRequest {
    /// Priority used when the caller does not choose one.
    pub fn default_priority(self) -> PriorityLevel {
        match self {
            DeviceRequest::ResetDevice | DeviceRequest::ResetStatus => PriorityLevel::Command,
            DeviceRequest::QuerySamples => PriorityLevel::Data30Sec,
            DeviceRequest::QueryConfiguration => PriorityLevel::Configure,
            DeviceRequest::SendSettings => PriorityLevel::Download,
            DeviceRequest::QueryStatus | DeviceRequest::QueryGpsLocation => {
                PriorityLevel::DeviceData
            }
            DeviceRequest::QueryMessage => PriorityLevel::PollLow,
        }
    }
}

/// Controller a request is dispatched for.
#[derive(Debug, Clone)]
pub struct DispatchTarget {
    /// Controller id.
    pub id: ControllerId,
    /// Addressing details.
    pub info: Arc<ControllerInfo>,
    /// Hardware identity, if known.
    pub setup: Option<ControllerSetup>,
}

/// A protocol driver plugged into the engine.
pub trait Driver: Send + Sync + 'static {
    /// Protocol name.
    fn protocol(&self) -> &'static str;

    /// URI scheme applied to link URIs without one.
    fn default_scheme(&self) -> &'static str {
        "tcp"
    }

    /// Whether a drop address is valid for the protocol.
    fn is_address_valid(&self, _drop: u16) -> bool {
        true
    }

    /// Map a device request to an operation. Requests the driver does not handle
    /// return `None` and are ignored.
    fn dispatch(
        &self,
        target: &DispatchTarget,
        request: DeviceRequest,
        priority: PriorityLevel,
    ) -> Option<QueuedOp>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn request_names_match_wire_labels() {
        assert_eq!(DeviceRequest::QueryGpsLocation.to_string(), "QUERY_GPS_LOCATION");
        assert_eq!(
            DeviceRequest::from_str("SEND_SETTINGS").unwrap(),
            DeviceRequest::SendSettings
        );
    }

    #[test]
    fn commands_outrank_settings_downloads() {
        assert!(DeviceRequest::ResetDevice
            .default_priority()
            .outranks(DeviceRequest::SendSettings.default_priority()));
    }
}

//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Controller arena with per-controller comm status."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CommError, FaultClass};
use crate::operation::OpId;

/// Arena index of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ControllerId(pub u32);

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctl#{}", self.0)
    }
}

/// Immutable addressing details of a controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerInfo {
    /// Controller name.
    pub name: String,
    /// Name of the comm link serving the controller.
    pub link: String,
    /// Multidrop address on the link.
    pub drop: u16,
    /// Optional access credential.
    #[serde(default)]
    pub password: Option<String>,
}

impl ControllerInfo {
    /// Construct controller info without credentials.
    pub fn new(name: impl Into<String>, link: impl Into<String>, drop: u16) -> Self {
        Self {
            name: name.into(),
            link: link.into(),
            drop,
            password: None,
        }
    }

    /// Attach a password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

/// Hardware identity reported by a configuration query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerSetup {
    /// Serial number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    /// Hardware model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Firmware version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Protocol-specific capabilities (relay count, sensor list, ...).
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub capabilities: IndexMap<String, Value>,
}

impl ControllerSetup {
    /// Serialize to the setup string stored against the controller.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a setup string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Record a capability.
    pub fn with_capability(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.capabilities.insert(key.into(), value.into());
        self
    }

    /// Look up an integer capability.
    pub fn capability_u64(&self, key: &str) -> Option<u64> {
        self.capabilities.get(key).and_then(Value::as_u64)
    }
}

/// Comm status snapshot of a controller.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControllerStatus {
    /// Operations completed successfully.
    pub success_count: u64,
    /// Operations that failed.
    pub failure_count: u64,
    /// Faults observed, by class.
    pub fault_counts: IndexMap<FaultClass, u64>,
    /// Maintenance status reported by the device.
    pub maint_status: String,
    /// Last error message; cleared on success.
    pub error_status: String,
    /// Operation currently bound to the controller.
    pub active_op: Option<OpId>,
    /// Time of the last successful operation.
    pub last_success: Option<DateTime<Utc>>,
    /// Time of the last failed operation.
    pub last_failure: Option<DateTime<Utc>>,
    /// Hardware identity, once queried.
    pub setup: Option<ControllerSetup>,
}

impl ControllerStatus {
    /// Fault count for one class.
    pub fn faults(&self, class: FaultClass) -> u64 {
        self.fault_counts.get(&class).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
struct Entry {
    info: Arc<ControllerInfo>,
    status: ControllerStatus,
}

/// Shared arena of controllers.
///
/// Readers take snapshots from any task. Status mutators are crate-private and called
/// only from the comm task owning the controller's link.
#[derive(Debug, Clone, Default)]
pub struct ControllerRegistry {
    entries: Arc<RwLock<Vec<Entry>>>,
}

impl ControllerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a controller and return its id.
    pub fn insert(&self, info: ControllerInfo) -> ControllerId {
        let mut entries = self.entries.write();
        let id = ControllerId(entries.len() as u32);
        entries.push(Entry {
            info: Arc::new(info),
            status: ControllerStatus::default(),
        });
        id
    }

    /// Number of registered controllers.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no controllers are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Addressing details of a controller.
    pub fn info(&self, id: ControllerId) -> Option<Arc<ControllerInfo>> {
        self.entries
            .read()
            .get(id.0 as usize)
            .map(|entry| entry.info.clone())
    }

    /// Status snapshot of a controller.
    pub fn status(&self, id: ControllerId) -> Option<ControllerStatus> {
        self.entries
            .read()
            .get(id.0 as usize)
            .map(|entry| entry.status.clone())
    }

    /// Setup blob of a controller.
    pub fn setup(&self, id: ControllerId) -> Option<ControllerSetup> {
        self.entries
            .read()
            .get(id.0 as usize)
            .and_then(|entry| entry.status.setup.clone())
    }

    /// Find a controller by name.
    pub fn find(&self, name: &str) -> Option<ControllerId> {
        self.entries
            .read()
            .iter()
            .position(|entry| entry.info.name == name)
            .map(|idx| ControllerId(idx as u32))
    }

    /// Controllers served by a link, in registration order.
    pub fn ids_on_link(&self, link: &str) -> Vec<ControllerId> {
        self.entries
            .read()
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.info.link == link)
            .map(|(idx, _)| ControllerId(idx as u32))
            .collect()
    }

    fn update<F: FnOnce(&mut ControllerStatus)>(&self, id: ControllerId, f: F) {
        if let Some(entry) = self.entries.write().get_mut(id.0 as usize) {
            f(&mut entry.status);
        }
    }

    pub(crate) fn record_success(&self, id: ControllerId) {
        self.update(id, |status| {
            status.success_count += 1;
            status.error_status.clear();
            status.last_success = Some(Utc::now());
        });
    }

    pub(crate) fn record_failure(&self, id: ControllerId, message: &str) {
        self.update(id, |status| {
            status.failure_count += 1;
            status.error_status = message.to_owned();
            status.last_failure = Some(Utc::now());
        });
    }

    pub(crate) fn record_fault(&self, id: ControllerId, err: &CommError) {
        let class = err.class();
        self.update(id, |status| {
            *status.fault_counts.entry(class).or_insert(0) += 1;
        });
    }

    pub(crate) fn set_active_op(&self, id: ControllerId, op: Option<OpId>) {
        self.update(id, |status| status.active_op = op);
    }

    pub(crate) fn set_setup(&self, id: ControllerId, setup: ControllerSetup) {
        self.update(id, |status| status.setup = Some(setup));
    }

    pub(crate) fn set_maint_status(&self, id: ControllerId, maint: String) {
        self.update(id, |status| status.maint_status = maint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_tracks_link_membership() {
        let registry = ControllerRegistry::new();
        let a = registry.insert(ControllerInfo::new("a", "line-1", 1));
        let _b = registry.insert(ControllerInfo::new("b", "line-2", 1));
        let c = registry.insert(ControllerInfo::new("c", "line-1", 2));
        assert_eq!(registry.ids_on_link("line-1"), vec![a, c]);
        assert_eq!(registry.find("c"), Some(c));
        assert_eq!(registry.info(c).unwrap().drop, 2);
    }

    #[test]
    fn failure_then_success_clears_error_status() {
        let registry = ControllerRegistry::new();
        let id = registry.insert(ControllerInfo::new("a", "line-1", 1));
        registry.record_fault(id, &CommError::Disconnected);
        registry.record_failure(id, "connection closed");
        let status = registry.status(id).unwrap();
        assert_eq!(status.failure_count, 1);
        assert_eq!(status.faults(FaultClass::Transport), 1);
        assert_eq!(status.error_status, "connection closed");

        registry.record_success(id);
        let status = registry.status(id).unwrap();
        assert_eq!(status.success_count, 1);
        assert!(status.error_status.is_empty());
        assert!(status.last_success.is_some());
    }

    #[test]
    fn setup_blob_survives_json() {
        let setup = ControllerSetup {
            serial: Some("0042".into()),
            model: Some("RX-4".into()),
            ..Default::default()
        }
        .with_capability("relays", 4);
        let json = setup.to_json().unwrap();
        let parsed = ControllerSetup::from_json(&json).unwrap();
        assert_eq!(parsed.capability_u64("relays"), Some(4));
        assert_eq!(parsed, setup);
    }
}

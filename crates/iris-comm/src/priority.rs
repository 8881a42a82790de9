//! ---
//! iris_section: "05-networking-external-interfaces"
//! iris_subsection: "module"
//! iris_type: "source"
//! iris_scope: "code"
//! iris_description: "Operation priority levels used as the queue sort key."
//! iris_version: "v0.0.0-prealpha"
//! iris_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

/// Scheduling priority of an operation.
///
/// Variants are declared from most to least urgent, so the derived [`Ord`] sorts the
/// most urgent level first. Operations with equal priority are serviced in arrival order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PriorityLevel {
    /// Safety-critical requests which preempt everything else.
    Urgent,
    /// Operator commands.
    Command,
    /// Periodic 30-second data collection.
    #[serde(rename = "data-30-sec")]
    #[strum(serialize = "data-30-sec")]
    Data30Sec,
    /// High priority periodic polling.
    PollHigh,
    /// Controller configuration.
    Configure,
    /// Device status and data queries.
    DeviceData,
    /// Periodic 5-minute data collection.
    #[serde(rename = "data-5-min")]
    #[strum(serialize = "data-5-min")]
    Data5Min,
    /// Low priority periodic polling.
    PollLow,
    /// Settings downloads.
    Download,
    /// Diagnostics.
    Diagnostic,
    /// Background work.
    Idle,
}

impl PriorityLevel {
    /// Whether `self` should be serviced before `other`.
    pub fn outranks(self, other: PriorityLevel) -> bool {
        self < other
    }

    /// The more urgent of the two levels.
    pub fn raise_to(self, other: PriorityLevel) -> PriorityLevel {
        self.min(other)
    }

    /// Stable label for metrics and logs.
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn command_outranks_periodic_sampling() {
        assert!(PriorityLevel::Command.outranks(PriorityLevel::Data30Sec));
        assert!(PriorityLevel::Data30Sec.outranks(PriorityLevel::PollLow));
        assert!(!PriorityLevel::PollLow.outranks(PriorityLevel::PollLow));
    }

    #[test]
    fn raise_never_lowers() {
        assert_eq!(
            PriorityLevel::PollLow.raise_to(PriorityLevel::Command),
            PriorityLevel::Command
        );
        assert_eq!(
            PriorityLevel::Command.raise_to(PriorityLevel::PollLow),
            PriorityLevel::Command
        );
    }

    #[test]
    fn labels_round_trip_through_strum_and_serde() {
        for level in PriorityLevel::iter() {
            let label = level.to_string();
            assert_eq!(PriorityLevel::from_str(&label).unwrap(), level);
            let json = serde_json::to_string(&level).unwrap();
            assert_eq!(json, format!("\"{label}\""));
        }
        assert_eq!(PriorityLevel::Data30Sec.as_str(), "data-30-sec");
    }
}

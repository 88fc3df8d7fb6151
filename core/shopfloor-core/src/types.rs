//! Telemetry snapshot types reported by machine controllers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Stopped,
    Active,
    FeedHold,
    Interrupted,
    SemiAutomatic,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineStatus::Stopped => "stopped",
            MachineStatus::Active => "active",
            MachineStatus::FeedHold => "feed_hold",
            MachineStatus::Interrupted => "interrupted",
            MachineStatus::SemiAutomatic => "semi_automatic",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "stopped" => Some(MachineStatus::Stopped),
            "active" => Some(MachineStatus::Active),
            "feed_hold" => Some(MachineStatus::FeedHold),
            "interrupted" => Some(MachineStatus::Interrupted),
            "semi_automatic" => Some(MachineStatus::SemiAutomatic),
            _ => None,
        }
    }

    /// Whether this status counts as the machine cutting or paused mid-cut.
    /// Finish detection fires on the transition from one of these to Stopped.
    pub fn is_in_cycle(&self) -> bool {
        matches!(self, MachineStatus::Active | MachineStatus::FeedHold)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineMode {
    Automatic,
    ManualDataInput,
    Manual,
}

impl MachineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineMode::Automatic => "automatic",
            MachineMode::ManualDataInput => "manual_data_input",
            MachineMode::Manual => "manual",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "automatic" => Some(MachineMode::Automatic),
            "manual_data_input" => Some(MachineMode::ManualDataInput),
            "manual" => Some(MachineMode::Manual),
            _ => None,
        }
    }
}

/// One periodic state sample for a machine.
///
/// Two of these exist per machine at any time, "current" and "previous";
/// previous is overwritten on every tick and exists only to support diffing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub status: MachineStatus,
    pub mode: MachineMode,
    pub active_program: String,
    pub current_tool: String,
    pub restart_counter_a: i64,
    pub restart_counter_b: i64,
    pub machine_clock: DateTime<Utc>,
    pub remaining_secs: i64,
    pub cycle_secs: i64,
    pub last_cycle_secs: i64,
}

impl TelemetrySnapshot {
    /// Baseline snapshot used before a machine has reported anything.
    pub fn initial(clock: DateTime<Utc>) -> Self {
        Self {
            status: MachineStatus::Stopped,
            mode: MachineMode::Manual,
            active_program: String::new(),
            current_tool: String::new(),
            restart_counter_a: 0,
            restart_counter_b: 0,
            machine_clock: clock,
            remaining_secs: 0,
            cycle_secs: 0,
            last_cycle_secs: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            MachineStatus::Stopped,
            MachineStatus::Active,
            MachineStatus::FeedHold,
            MachineStatus::Interrupted,
            MachineStatus::SemiAutomatic,
        ] {
            assert_eq!(MachineStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(MachineStatus::from_str("unknown"), None);
    }

    #[test]
    fn mode_round_trips_through_strings() {
        for mode in [
            MachineMode::Automatic,
            MachineMode::ManualDataInput,
            MachineMode::Manual,
        ] {
            assert_eq!(MachineMode::from_str(mode.as_str()), Some(mode));
        }
        assert_eq!(MachineMode::from_str(""), None);
    }

    #[test]
    fn in_cycle_covers_active_and_feed_hold() {
        assert!(MachineStatus::Active.is_in_cycle());
        assert!(MachineStatus::FeedHold.is_in_cycle());
        assert!(!MachineStatus::Stopped.is_in_cycle());
        assert!(!MachineStatus::Interrupted.is_in_cycle());
    }
}

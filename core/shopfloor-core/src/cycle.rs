//! Cycle state machine evaluated once per telemetry tick.
//!
//! `evaluate_tick` is a pure transition table: (state, previous snapshot,
//! current snapshot) -> actions. It never touches the store, so the
//! day-boundary and restart-counter edge cases are testable in isolation.
//! Conservative rules avoid opening or closing cycles on ambiguous ticks.

use chrono::{DateTime, Utc};

use crate::types::{MachineMode, MachineStatus, TelemetrySnapshot};

/// Cap applied to finished-cycle durations and changing times. Guards
/// against controller clock anomalies producing multi-hour "cycles".
pub const MAX_CYCLE_SECS: i64 = 3600;

/// Changing time substituted when the raw delta comes out negative.
pub const NEGATIVE_CHANGING_DEFAULT_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    ProgramChanged,
    StatusStopped,
    RestartCounter,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::ProgramChanged => "program_changed",
            FinishReason::StatusStopped => "status_stopped",
            FinishReason::RestartCounter => "restart_counter",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "program_changed" => Some(FinishReason::ProgramChanged),
            "status_stopped" => Some(FinishReason::StatusStopped),
            "restart_counter" => Some(FinishReason::RestartCounter),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickAction {
    /// Program changed: the active job must be finished after any cycle
    /// close, regardless of other conditions.
    FinishJob,
    FinishCycle {
        end: DateTime<Utc>,
        reason: FinishReason,
    },
    StartCycle,
    AppendTool {
        tool: String,
    },
}

/// Evaluate one tick. Actions are ordered by the priority they must be
/// applied in: program change first, then finish, then start; tool-change
/// tracking is independent of the first three and always comes last.
pub fn evaluate_tick(
    state: CycleState,
    prev: &TelemetrySnapshot,
    curr: &TelemetrySnapshot,
) -> Vec<TickAction> {
    let mut actions = Vec::new();

    if curr.active_program != prev.active_program {
        if state == CycleState::Running {
            actions.push(TickAction::FinishCycle {
                end: finish_end_time(prev, curr),
                reason: FinishReason::ProgramChanged,
            });
        }
        actions.push(TickAction::FinishJob);
    } else if state == CycleState::Running {
        if let Some(reason) = finish_reason(prev, curr) {
            actions.push(TickAction::FinishCycle {
                end: finish_end_time(prev, curr),
                reason,
            });
        }
    } else if starts_cycle(prev, curr) {
        actions.push(TickAction::StartCycle);
    }

    if curr.current_tool != prev.current_tool
        && curr.mode == MachineMode::Automatic
        && !curr.current_tool.trim().is_empty()
    {
        actions.push(TickAction::AppendTool {
            tool: curr.current_tool.clone(),
        });
    }

    actions
}

fn finish_reason(prev: &TelemetrySnapshot, curr: &TelemetrySnapshot) -> Option<FinishReason> {
    if prev.status.is_in_cycle() && curr.status == MachineStatus::Stopped {
        return Some(FinishReason::StatusStopped);
    }
    if curr.restart_counter_a > prev.restart_counter_a
        || curr.restart_counter_b > prev.restart_counter_b
    {
        return Some(FinishReason::RestartCounter);
    }
    None
}

fn starts_cycle(prev: &TelemetrySnapshot, curr: &TelemetrySnapshot) -> bool {
    if prev.status == MachineStatus::Stopped && curr.status == MachineStatus::Active {
        return true;
    }
    curr.status == MachineStatus::Active && curr.mode == MachineMode::Automatic
}

/// End time for a finishing cycle. When the previous tick was on an earlier
/// calendar day the machine clock has rolled past midnight and the cycle
/// really ended "yesterday": use the previous snapshot's clock instead of
/// the current one.
pub fn finish_end_time(prev: &TelemetrySnapshot, curr: &TelemetrySnapshot) -> DateTime<Utc> {
    if prev.machine_clock.date_naive() != curr.machine_clock.date_naive() {
        prev.machine_clock
    } else {
        curr.machine_clock
    }
}

/// Finished-cycle duration: end minus start, rounded to whole seconds and
/// capped at one hour. A negative span (clock regression) collapses to zero.
pub fn cycle_duration_secs(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    let millis = (end - start).num_milliseconds();
    if millis <= 0 {
        return 0;
    }
    let rounded = (millis + 500) / 1000;
    rounded.min(MAX_CYCLE_SECS)
}

/// Gap between the machine's last stop and a new cycle start, clamped to
/// [0, 1h]. A negative raw delta falls back to a one-minute default.
pub fn changing_time_secs(now: DateTime<Utc>, last_stop: Option<DateTime<Utc>>) -> i64 {
    let Some(last_stop) = last_stop else {
        return 0;
    };
    let delta = (now - last_stop).num_seconds();
    if delta < 0 {
        return NEGATIVE_CHANGING_DEFAULT_SECS;
    }
    delta.min(MAX_CYCLE_SECS)
}

/// Warm-up cycles are long, touch at most two tools, and run in
/// manual-data-input mode. They are excluded from both setup and
/// production accounting.
pub fn is_warm_up(
    duration_secs: i64,
    tool_count: usize,
    mode: MachineMode,
    threshold_secs: i64,
) -> bool {
    duration_secs > threshold_secs && tool_count <= 2 && mode == MachineMode::ManualDataInput
}

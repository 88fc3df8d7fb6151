//! Telemetry ingestion: one report in, machine state advanced by one tick.
//!
//! `apply_report` is the daemon's only write path for machine state. It
//! merges the incoming report over the last known snapshot (absent or
//! malformed fields keep their previous value), demotes current to previous,
//! evaluates the cycle state machine on the pair, and applies the resulting
//! actions against the store in priority order.

use chrono::{DateTime, Utc};
use shopfloor_core::cycle::{
    changing_time_secs, cycle_duration_secs, evaluate_tick, is_warm_up, CycleState, FinishReason,
    TickAction,
};
use shopfloor_core::toolseq;
use shopfloor_core::types::{MachineMode, MachineStatus, TelemetrySnapshot};
use shopfloor_core::WorkCalendar;
use shopfloor_protocol::{parse_hms, TelemetryReport};

use crate::accountant;
use crate::classify;
use crate::config::RuntimeConfig;
use crate::db::{CycleRow, Db, JobRow, MachineRow};

/// Per-tick day-activity delta cap. A machine-clock jump larger than this is
/// treated as a gap in reporting rather than elapsed activity.
const MAX_TICK_DELTA_SECS: i64 = 3600;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub started_cycle: bool,
    pub finished_cycle: bool,
    pub finished_job: bool,
}

pub fn apply_report(
    db: &Db,
    config: &RuntimeConfig,
    calendar: &WorkCalendar,
    report: &TelemetryReport,
) -> Result<IngestOutcome, String> {
    let recorded_at = crate::db::parse_rfc3339(&report.recorded_at)
        .ok_or_else(|| format!("Invalid recorded_at in report {}", report.report_id))?;

    let mut machine = match db.get_machine(&report.machine_id)? {
        Some(machine) => machine,
        None => {
            tracing::info!(machine_id = %report.machine_id, "Registering new machine");
            MachineRow::new(&report.machine_id, recorded_at)
        }
    };

    let prev = machine.current.clone();
    let merged = merge_report(&prev, report);

    record_day_activity(db, &machine.machine_id, &prev, &merged, &mut machine.inactive_secs)?;

    machine.previous = prev.clone();
    machine.current = merged.clone();
    machine.updated_at = recorded_at;

    let state = if machine.active_cycle_id.is_some() {
        CycleState::Running
    } else {
        CycleState::Idle
    };

    let mut outcome = IngestOutcome::default();
    for action in evaluate_tick(state, &prev, &merged) {
        match action {
            TickAction::FinishCycle { end, reason } => {
                finish_active_cycle(db, config, calendar, &mut machine, end, reason)?;
                outcome.finished_cycle = true;
            }
            TickAction::FinishJob => {
                if finish_active_job(db, &mut machine, merged.machine_clock) {
                    outcome.finished_job = true;
                }
            }
            TickAction::StartCycle => {
                start_cycle(db, config, &mut machine, &merged)?;
                outcome.started_cycle = true;
            }
            TickAction::AppendTool { tool } => {
                append_tool_to_active_cycle(db, &machine, &tool)?;
            }
        }
    }

    // A job whose archive step failed earlier stays attached; retry the
    // finish once its program no longer matches the machine's.
    if let Some(job_id) = machine.active_job_id {
        if let Some(job) = db.get_job(job_id)? {
            if job.project_id != merged.active_program
                && finish_active_job(db, &mut machine, merged.machine_clock)
            {
                outcome.finished_job = true;
            }
        } else {
            tracing::warn!(job_id, "Active job row missing; detaching");
            machine.active_job_id = None;
        }
    }

    db.upsert_machine(&machine)?;
    Ok(outcome)
}

/// Merge an incoming report over the last known snapshot. Absent fields keep
/// their previous value; present-but-malformed fields also keep the previous
/// value and log a warning, so one bad field never poisons the whole tick.
pub fn merge_report(prev: &TelemetrySnapshot, report: &TelemetryReport) -> TelemetrySnapshot {
    let mut merged = prev.clone();

    if let Some(raw) = &report.status {
        match MachineStatus::from_str(raw) {
            Some(status) => merged.status = status,
            None => {
                tracing::warn!(machine_id = %report.machine_id, value = %raw, "Unknown status value")
            }
        }
    }
    if let Some(raw) = &report.mode {
        match MachineMode::from_str(raw) {
            Some(mode) => merged.mode = mode,
            None => {
                tracing::warn!(machine_id = %report.machine_id, value = %raw, "Unknown mode value")
            }
        }
    }
    if let Some(program) = &report.active_program {
        merged.active_program = program.trim().to_string();
    }
    if let Some(tool) = &report.current_tool {
        merged.current_tool = tool.trim().to_string();
    }
    if let Some(counter) = report.restart_counter_a {
        merged.restart_counter_a = counter;
    }
    if let Some(counter) = report.restart_counter_b {
        merged.restart_counter_b = counter;
    }
    if let Some(raw) = &report.machine_clock {
        match crate::db::parse_rfc3339(raw) {
            Some(clock) => merged.machine_clock = clock,
            None => {
                tracing::warn!(machine_id = %report.machine_id, value = %raw, "Unparsable machine clock")
            }
        }
    }
    merge_hms_field(report, &report.remaining_time, &mut merged.remaining_secs, "remaining_time");
    merge_hms_field(report, &report.cycle_time, &mut merged.cycle_secs, "cycle_time");
    merge_hms_field(
        report,
        &report.last_cycle_time,
        &mut merged.last_cycle_secs,
        "last_cycle_time",
    );

    merged
}

fn merge_hms_field(
    report: &TelemetryReport,
    raw: &Option<String>,
    target: &mut i64,
    field: &str,
) {
    if let Some(raw) = raw {
        match parse_hms(raw) {
            Some(secs) => *target = secs,
            None => {
                tracing::warn!(machine_id = %report.machine_id, field, value = %raw, "Unparsable duration field")
            }
        }
    }
}

/// Accumulate the machine-clock delta between two ticks into the per-day
/// active/stopped buckets. Negative or oversized deltas are dropped.
fn record_day_activity(
    db: &Db,
    machine_id: &str,
    prev: &TelemetrySnapshot,
    curr: &TelemetrySnapshot,
    inactive_secs: &mut i64,
) -> Result<(), String> {
    let delta = (curr.machine_clock - prev.machine_clock).num_seconds();
    if delta <= 0 || delta > MAX_TICK_DELTA_SECS {
        return Ok(());
    }
    let day = curr.machine_clock.format("%Y-%m-%d").to_string();
    if curr.status == MachineStatus::Active {
        db.add_day_activity(machine_id, &day, delta, 0)
    } else {
        *inactive_secs += delta;
        db.add_day_activity(machine_id, &day, 0, delta)
    }
}

fn finish_active_cycle(
    db: &Db,
    config: &RuntimeConfig,
    calendar: &WorkCalendar,
    machine: &mut MachineRow,
    end: DateTime<Utc>,
    reason: FinishReason,
) -> Result<(), String> {
    let Some(cycle_id) = machine.active_cycle_id else {
        return Ok(());
    };
    let Some(mut cycle) = db.get_cycle(cycle_id)? else {
        tracing::warn!(cycle_id, "Active cycle row missing; detaching");
        machine.active_cycle_id = None;
        return Ok(());
    };

    cycle.ended_at = Some(end);
    cycle.duration_secs = cycle_duration_secs(cycle.started_at, end);
    cycle.is_running = false;
    cycle.finish_reason = Some(reason.as_str().to_string());

    let mode = MachineMode::from_str(&cycle.mode).unwrap_or(MachineMode::Manual);
    if is_warm_up(
        cycle.duration_secs,
        cycle.tool_sequence.len(),
        mode,
        config.ingest.warmup_threshold_secs,
    ) {
        cycle.is_warm_up = true;
        cycle.is_setup = false;
    }
    db.update_cycle(&cycle)?;

    machine.last_stop_at = Some(end);
    machine.active_cycle_id = None;

    if let Some(job_id) = cycle.job_id {
        classify::on_cycle_finished(db, config, calendar, job_id)?;
    }
    Ok(())
}

/// Finish the machine's active job, if any. Returns true on success; a
/// failure (for example the archive transaction) logs and leaves the job
/// attached so a later tick retries.
fn finish_active_job(db: &Db, machine: &mut MachineRow, ended_at: DateTime<Utc>) -> bool {
    let Some(job_id) = machine.active_job_id else {
        return false;
    };
    match accountant::finish_job(db, job_id, ended_at) {
        Ok(()) => {
            machine.active_job_id = None;
            true
        }
        Err(err) => {
            tracing::warn!(job_id, error = %err, "Job finish failed; will retry");
            false
        }
    }
}

fn start_cycle(
    db: &Db,
    config: &RuntimeConfig,
    machine: &mut MachineRow,
    merged: &TelemetrySnapshot,
) -> Result<(), String> {
    let changing_secs = changing_time_secs(merged.machine_clock, machine.last_stop_at);

    // Automatic production against a named program opens a job when none is
    // active; manual cycles stay job-less and get folded in at job finish.
    if machine.active_job_id.is_none()
        && merged.mode == MachineMode::Automatic
        && !merged.active_program.is_empty()
    {
        let job_id = db.insert_job(&JobRow {
            job_id: 0,
            machine_id: machine.machine_id.clone(),
            project_id: merged.active_program.clone(),
            required_qty: 0,
            produced_qty: 0,
            parts_per_cycle: config.ingest.default_parts_per_cycle,
            full_cycle_id: None,
            full_cycle_key: None,
            median_cycle_secs: 0,
            median_changing_secs: 0,
            setup_active_secs: 0,
            setup_idle_secs: 0,
            machining_secs: 0,
            unrelated_secs: 0,
            predicted_done_at: None,
            started_at: merged.machine_clock,
            ended_at: None,
            is_finished: false,
        })?;
        tracing::info!(
            machine_id = %machine.machine_id,
            job_id,
            project_id = %merged.active_program,
            "Opened job"
        );
        machine.active_job_id = Some(job_id);
    }

    // The sequence only accumulates in automatic mode; a cycle started in
    // manual or MDI begins empty even when a tool is loaded.
    let mut tool_sequence = Vec::new();
    if merged.mode == MachineMode::Automatic {
        toolseq::append_tool(&mut tool_sequence, &merged.current_tool);
    }

    let cycle_id = db.insert_cycle(&CycleRow {
        cycle_id: 0,
        machine_id: machine.machine_id.clone(),
        job_id: machine.active_job_id,
        started_at: merged.machine_clock,
        ended_at: None,
        duration_secs: 0,
        changing_secs,
        tool_sequence,
        mode: merged.mode.as_str().to_string(),
        is_setup: true,
        is_full_cycle: false,
        is_warm_up: false,
        is_running: true,
        finish_reason: None,
    })?;
    machine.active_cycle_id = Some(cycle_id);
    machine.last_start_at = Some(merged.machine_clock);
    Ok(())
}

fn append_tool_to_active_cycle(db: &Db, machine: &MachineRow, tool: &str) -> Result<(), String> {
    let Some(cycle_id) = machine.active_cycle_id else {
        return Ok(());
    };
    let Some(mut cycle) = db.get_cycle(cycle_id)? else {
        return Ok(());
    };
    if toolseq::append_tool(&mut cycle.tool_sequence, tool) {
        db.update_cycle(&cycle)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, Db) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("state.db")).expect("db init");
        (temp_dir, db)
    }

    fn report(machine_id: &str, at: &str, status: &str, mode: &str) -> TelemetryReport {
        TelemetryReport {
            report_id: format!("rpt-{at}"),
            machine_id: machine_id.to_string(),
            recorded_at: at.to_string(),
            status: Some(status.to_string()),
            mode: Some(mode.to_string()),
            active_program: Some("O1234".to_string()),
            current_tool: Some("1".to_string()),
            restart_counter_a: Some(0),
            restart_counter_b: Some(0),
            machine_clock: Some(at.to_string()),
            remaining_time: None,
            cycle_time: None,
            last_cycle_time: None,
        }
    }

    fn apply(db: &Db, r: &TelemetryReport) -> IngestOutcome {
        let config = RuntimeConfig::default();
        let calendar = WorkCalendar::default();
        apply_report(db, &config, &calendar, r).expect("apply report")
    }

    #[test]
    fn first_report_registers_machine() {
        let (_guard, db) = test_db();
        apply(&db, &report("mill-01", "2026-02-02T08:00:00Z", "stopped", "manual"));
        let machine = db.get_machine("mill-01").expect("query").expect("exists");
        assert_eq!(machine.current.status, MachineStatus::Stopped);
        assert!(machine.active_cycle_id.is_none());
    }

    #[test]
    fn stopped_to_active_opens_job_and_cycle() {
        let (_guard, db) = test_db();
        apply(&db, &report("mill-01", "2026-02-02T08:00:00Z", "stopped", "automatic"));
        let outcome = apply(
            &db,
            &report("mill-01", "2026-02-02T08:00:10Z", "active", "automatic"),
        );
        assert!(outcome.started_cycle);

        let machine = db.get_machine("mill-01").expect("query").expect("exists");
        let cycle_id = machine.active_cycle_id.expect("cycle open");
        let job_id = machine.active_job_id.expect("job open");
        let cycle = db.get_cycle(cycle_id).expect("query").expect("exists");
        assert_eq!(cycle.job_id, Some(job_id));
        assert!(cycle.is_running);
        assert_eq!(cycle.tool_sequence, vec!["1".to_string()]);
        let job = db.get_job(job_id).expect("query").expect("exists");
        assert_eq!(job.project_id, "O1234");
    }

    #[test]
    fn manual_start_does_not_open_job() {
        let (_guard, db) = test_db();
        apply(&db, &report("mill-01", "2026-02-02T08:00:00Z", "stopped", "manual"));
        apply(&db, &report("mill-01", "2026-02-02T08:00:10Z", "active", "manual"));
        let machine = db.get_machine("mill-01").expect("query").expect("exists");
        assert!(machine.active_cycle_id.is_some());
        assert!(machine.active_job_id.is_none());
    }

    #[test]
    fn manual_start_does_not_seed_tool_sequence() {
        let (_guard, db) = test_db();
        apply(
            &db,
            &report("mill-01", "2026-02-02T08:00:00Z", "stopped", "manual_data_input"),
        );
        apply(
            &db,
            &report("mill-01", "2026-02-02T08:00:10Z", "active", "manual_data_input"),
        );

        let machine = db.get_machine("mill-01").expect("query").expect("exists");
        let cycle_id = machine.active_cycle_id.expect("cycle open");
        let cycle = db.get_cycle(cycle_id).expect("query").expect("exists");
        assert!(cycle.tool_sequence.is_empty());
    }

    #[test]
    fn stop_finishes_cycle_with_duration() {
        let (_guard, db) = test_db();
        apply(&db, &report("mill-01", "2026-02-02T08:00:00Z", "stopped", "automatic"));
        apply(&db, &report("mill-01", "2026-02-02T08:00:10Z", "active", "automatic"));
        let machine = db.get_machine("mill-01").expect("query").expect("exists");
        let cycle_id = machine.active_cycle_id.expect("cycle open");

        let outcome = apply(
            &db,
            &report("mill-01", "2026-02-02T08:04:10Z", "stopped", "automatic"),
        );
        assert!(outcome.finished_cycle);

        let cycle = db.get_cycle(cycle_id).expect("query").expect("exists");
        assert!(!cycle.is_running);
        assert_eq!(cycle.duration_secs, 240);
        assert_eq!(cycle.finish_reason.as_deref(), Some("status_stopped"));
        let machine = db.get_machine("mill-01").expect("query").expect("exists");
        assert!(machine.active_cycle_id.is_none());
        assert_eq!(
            machine.last_stop_at.expect("stop recorded").to_rfc3339(),
            "2026-02-02T08:04:10+00:00"
        );
    }

    #[test]
    fn program_change_finishes_job() {
        let (_guard, db) = test_db();
        apply(&db, &report("mill-01", "2026-02-02T08:00:00Z", "stopped", "automatic"));
        apply(&db, &report("mill-01", "2026-02-02T08:00:10Z", "active", "automatic"));
        apply(&db, &report("mill-01", "2026-02-02T08:04:10Z", "stopped", "automatic"));

        let mut switch = report("mill-01", "2026-02-02T08:05:00Z", "stopped", "automatic");
        switch.active_program = Some("O9999".to_string());
        let outcome = apply(&db, &switch);
        assert!(outcome.finished_job);

        let machine = db.get_machine("mill-01").expect("query").expect("exists");
        assert!(machine.active_job_id.is_none());
        let jobs = db.list_jobs().expect("list");
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].is_finished);
    }

    #[test]
    fn malformed_fields_keep_previous_values() {
        let (_guard, db) = test_db();
        apply(&db, &report("mill-01", "2026-02-02T08:00:00Z", "active", "automatic"));

        let mut bad = report("mill-01", "2026-02-02T08:00:10Z", "active", "automatic");
        bad.status = Some("melting".to_string());
        bad.machine_clock = Some("yesterday-ish".to_string());
        bad.cycle_time = Some("99:99:99".to_string());
        let config = RuntimeConfig::default();
        let calendar = WorkCalendar::default();
        apply_report(&db, &config, &calendar, &bad).expect("apply");

        let machine = db.get_machine("mill-01").expect("query").expect("exists");
        assert_eq!(machine.current.status, MachineStatus::Active);
        assert_eq!(
            machine.current.machine_clock.to_rfc3339(),
            "2026-02-02T08:00:00+00:00"
        );
        assert_eq!(machine.current.cycle_secs, 0);
    }

    #[test]
    fn absent_fields_are_retained() {
        let (_guard, db) = test_db();
        apply(&db, &report("mill-01", "2026-02-02T08:00:00Z", "active", "automatic"));

        let sparse = TelemetryReport {
            report_id: "rpt-sparse".to_string(),
            machine_id: "mill-01".to_string(),
            recorded_at: "2026-02-02T08:00:10Z".to_string(),
            status: None,
            mode: None,
            active_program: None,
            current_tool: None,
            restart_counter_a: None,
            restart_counter_b: None,
            machine_clock: Some("2026-02-02T08:00:10Z".to_string()),
            remaining_time: Some("00:10:00".to_string()),
            cycle_time: None,
            last_cycle_time: None,
        };
        apply(&db, &sparse);

        let machine = db.get_machine("mill-01").expect("query").expect("exists");
        assert_eq!(machine.current.status, MachineStatus::Active);
        assert_eq!(machine.current.active_program, "O1234");
        assert_eq!(machine.current.remaining_secs, 600);
    }

    #[test]
    fn tool_changes_accumulate_on_active_cycle() {
        let (_guard, db) = test_db();
        apply(&db, &report("mill-01", "2026-02-02T08:00:00Z", "stopped", "automatic"));
        apply(&db, &report("mill-01", "2026-02-02T08:00:10Z", "active", "automatic"));
        for (at, tool) in [
            ("2026-02-02T08:00:20Z", "2"),
            ("2026-02-02T08:00:30Z", "2"),
            ("2026-02-02T08:00:40Z", "5"),
        ] {
            let mut r = report("mill-01", at, "active", "automatic");
            r.current_tool = Some(tool.to_string());
            apply(&db, &r);
        }

        let machine = db.get_machine("mill-01").expect("query").expect("exists");
        let cycle = db
            .get_cycle(machine.active_cycle_id.expect("cycle open"))
            .expect("query")
            .expect("exists");
        assert_eq!(
            cycle.tool_sequence,
            vec!["1".to_string(), "2".to_string(), "5".to_string()]
        );
    }

    #[test]
    fn day_activity_splits_by_status() {
        let (_guard, db) = test_db();
        apply(&db, &report("mill-01", "2026-02-02T08:00:00Z", "stopped", "manual"));
        apply(&db, &report("mill-01", "2026-02-02T08:00:30Z", "stopped", "manual"));
        apply(&db, &report("mill-01", "2026-02-02T08:01:00Z", "active", "automatic"));

        let rows = db.list_day_activity(Some("mill-01")).expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].stopped_secs, 30);
        assert_eq!(rows[0].active_secs, 30);

        let machine = db.get_machine("mill-01").expect("query").expect("exists");
        assert_eq!(machine.inactive_secs, 30);
    }

    #[test]
    fn warm_up_cycle_is_flagged_at_finish() {
        let (_guard, db) = test_db();
        apply(&db, &report("mill-01", "2026-02-02T08:00:00Z", "stopped", "manual_data_input"));
        let mut start = report("mill-01", "2026-02-02T08:00:10Z", "active", "manual_data_input");
        start.active_program = Some(String::new());
        apply(&db, &start);
        let machine = db.get_machine("mill-01").expect("query").expect("exists");
        let cycle_id = machine.active_cycle_id.expect("cycle open");

        // 20 minutes in MDI mode with no tool sequence recorded.
        let mut stop = report("mill-01", "2026-02-02T08:20:10Z", "stopped", "manual_data_input");
        stop.active_program = Some(String::new());
        apply(&db, &stop);

        let cycle = db.get_cycle(cycle_id).expect("query").expect("exists");
        assert!(cycle.is_warm_up);
        assert!(!cycle.is_setup);
    }
}

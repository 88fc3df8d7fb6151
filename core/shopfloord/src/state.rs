//! Shared daemon state handed to every connection thread.

use chrono::Utc;
use serde::Serialize;
use shopfloor_core::WorkCalendar;
use shopfloor_protocol::{BroadcastMessage, TelemetryReport};
use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::sync::Mutex;

use crate::config::RuntimeConfig;
use crate::db::{Db, DayActivityRow, JobRow};
use crate::ingest::{self, IngestOutcome};
use crate::status::{Broadcaster, CursorCache, CursorView, MachineStatusView, StatusCache};

pub struct SharedState {
    db: Db,
    config: RuntimeConfig,
    calendar: WorkCalendar,
    /// Serializes ingestion. Connection threads call `ingest_report`
    /// concurrently, but a report is a read-modify-write over the machine
    /// row; interleaving two reports for the same machine would let both
    /// observe "no active cycle" and each open one.
    ingest_lock: Mutex<()>,
    cursors: CursorCache,
    broadcaster: Broadcaster,
    status: StatusCache,
}

#[derive(Debug, Serialize)]
pub struct JobView {
    pub job_id: i64,
    pub machine_id: String,
    pub project_id: String,
    pub required_qty: i64,
    pub produced_qty: i64,
    pub parts_per_cycle: i64,
    pub full_cycle_key: Option<String>,
    pub median_cycle_secs: i64,
    pub median_changing_secs: i64,
    pub setup_active_secs: i64,
    pub setup_idle_secs: i64,
    pub machining_secs: i64,
    pub unrelated_secs: i64,
    pub predicted_done_at: Option<String>,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub is_finished: bool,
}

impl From<JobRow> for JobView {
    fn from(job: JobRow) -> Self {
        Self {
            job_id: job.job_id,
            machine_id: job.machine_id,
            project_id: job.project_id,
            required_qty: job.required_qty,
            produced_qty: job.produced_qty,
            parts_per_cycle: job.parts_per_cycle,
            full_cycle_key: job.full_cycle_key,
            median_cycle_secs: job.median_cycle_secs,
            median_changing_secs: job.median_changing_secs,
            setup_active_secs: job.setup_active_secs,
            setup_idle_secs: job.setup_idle_secs,
            machining_secs: job.machining_secs,
            unrelated_secs: job.unrelated_secs,
            predicted_done_at: job.predicted_done_at.map(|at| at.to_rfc3339()),
            started_at: job.started_at.to_rfc3339(),
            ended_at: job.ended_at.map(|at| at.to_rfc3339()),
            is_finished: job.is_finished,
        }
    }
}

impl SharedState {
    pub fn new(db: Db, config: RuntimeConfig, calendar: WorkCalendar) -> Self {
        let cursors = CursorCache::new(config.status.cursor_ttl_secs);
        Self {
            db,
            config,
            calendar,
            ingest_lock: Mutex::new(()),
            cursors,
            broadcaster: Broadcaster::new(),
            status: StatusCache::new(),
        }
    }

    pub fn refresh_interval_secs(&self) -> u64 {
        self.config.status.refresh_interval_secs
    }

    pub fn ingest_report(&self, report: &TelemetryReport) -> Result<IngestOutcome, String> {
        let _guard = match self.ingest_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ingest::apply_report(&self.db, &self.config, &self.calendar, report)
    }

    /// Rebuild the status cache from the store and swap it in. Called by the
    /// refresh thread; requests never hit the store for status reads.
    pub fn refresh_status_cache(&self) -> Result<usize, String> {
        let machines = self.db.list_machines()?;
        let mut fresh = HashMap::with_capacity(machines.len());
        for machine in machines {
            fresh.insert(
                machine.machine_id.clone(),
                MachineStatusView {
                    machine_id: machine.machine_id,
                    name: machine.name,
                    status: machine.current.status.as_str().to_string(),
                    mode: machine.current.mode.as_str().to_string(),
                    active_program: machine.current.active_program,
                    current_tool: machine.current.current_tool,
                    remaining_secs: machine.current.remaining_secs,
                    inactive_secs: machine.inactive_secs,
                    active_job_id: machine.active_job_id,
                    updated_at: machine.updated_at.to_rfc3339(),
                },
            );
        }
        let count = fresh.len();
        self.status.replace_all(fresh);
        Ok(count)
    }

    pub fn status_snapshot(&self) -> Vec<MachineStatusView> {
        self.status.snapshot()
    }

    /// Record cursor activity and broadcast the movement to subscribers.
    pub fn touch_cursor(&self, operation_id: &str, operation_name: Option<&str>) {
        let now = Utc::now();
        self.cursors.touch(operation_id, operation_name, now);
        self.broadcaster.publish(&BroadcastMessage {
            operation_id: operation_id.to_string(),
            operation_name: operation_name.unwrap_or("").to_string(),
            timestamp: now.to_rfc3339(),
        });
    }

    pub fn cursor_snapshot(&self) -> Vec<CursorView> {
        self.cursors.snapshot(Utc::now())
    }

    pub fn subscribe_broadcast(&self) -> Receiver<BroadcastMessage> {
        self.broadcaster.subscribe()
    }

    pub fn jobs_snapshot(&self) -> Result<Vec<JobView>, String> {
        Ok(self.db.list_jobs()?.into_iter().map(JobView::from).collect())
    }

    pub fn day_activity_snapshot(
        &self,
        machine_id: Option<&str>,
    ) -> Result<Vec<DayActivityRow>, String> {
        self.db.list_day_activity(machine_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> (tempfile::TempDir, SharedState) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("state.db")).expect("db init");
        let config = RuntimeConfig::default();
        let calendar = config.calendar.build().expect("calendar");
        (temp_dir, SharedState::new(db, config, calendar))
    }

    fn report(at: &str, status: &str) -> TelemetryReport {
        TelemetryReport {
            report_id: format!("rpt-{at}"),
            machine_id: "mill-01".to_string(),
            recorded_at: at.to_string(),
            status: Some(status.to_string()),
            mode: Some("automatic".to_string()),
            active_program: Some("O1234".to_string()),
            current_tool: Some("3".to_string()),
            restart_counter_a: Some(0),
            restart_counter_b: Some(0),
            machine_clock: Some(at.to_string()),
            remaining_time: Some("00:05:00".to_string()),
            cycle_time: None,
            last_cycle_time: None,
        }
    }

    #[test]
    fn status_reads_come_from_the_cache() {
        let (_guard, state) = test_state();
        state
            .ingest_report(&report("2026-02-02T08:00:00Z", "active"))
            .expect("ingest");

        // Nothing refreshed yet: the cache is empty even though the store
        // has the machine.
        assert!(state.status_snapshot().is_empty());

        assert_eq!(state.refresh_status_cache().expect("refresh"), 1);
        let snapshot = state.status_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].machine_id, "mill-01");
        assert_eq!(snapshot[0].status, "active");
        assert_eq!(snapshot[0].remaining_secs, 300);
    }

    #[test]
    fn cursor_touch_publishes_to_subscribers() {
        let (_guard, state) = test_state();
        let receiver = state.subscribe_broadcast();
        state.touch_cursor("op-7", Some("OP70 housing"));

        let message = receiver.recv().expect("broadcast");
        assert_eq!(message.operation_id, "op-7");
        assert_eq!(message.operation_name, "OP70 housing");

        let cursors = state.cursor_snapshot();
        assert_eq!(cursors.len(), 1);
        assert!(cursors[0].is_active);
    }

    #[test]
    fn concurrent_reports_open_a_single_cycle() {
        use std::sync::Arc;

        let (_guard, state) = test_state();
        state
            .ingest_report(&report("2026-02-02T08:00:00Z", "stopped"))
            .expect("ingest");

        // Two connection threads deliver an "active" report for the same
        // machine at the same instant. Only one may open a cycle; the other
        // must observe it as already running.
        let state = Arc::new(state);
        let mut handles = Vec::new();
        for n in 0..2 {
            let state = Arc::clone(&state);
            handles.push(std::thread::spawn(move || {
                let mut racing = report("2026-02-02T08:00:10Z", "active");
                racing.report_id = format!("rpt-race-{n}");
                state.ingest_report(&racing).expect("ingest")
            }));
        }
        for handle in handles {
            handle.join().expect("join");
        }

        let jobs = state.jobs_snapshot().expect("jobs");
        assert_eq!(jobs.len(), 1);
        let cycles = state.db.list_cycles_for_job(jobs[0].job_id).expect("cycles");
        assert_eq!(cycles.len(), 1);
        assert!(cycles[0].is_running);

        let machine = state
            .db
            .get_machine("mill-01")
            .expect("machine read")
            .expect("machine present");
        assert_eq!(machine.active_cycle_id, Some(cycles[0].cycle_id));
    }

    #[test]
    fn jobs_snapshot_reflects_ingested_work() {
        let (_guard, state) = test_state();
        state
            .ingest_report(&report("2026-02-02T08:00:00Z", "stopped"))
            .expect("ingest");
        state
            .ingest_report(&report("2026-02-02T08:00:10Z", "active"))
            .expect("ingest");

        let jobs = state.jobs_snapshot().expect("jobs");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].project_id, "O1234");
        assert!(!jobs[0].is_finished);
    }
}

//! SQLite persistence for shopfloord.
//!
//! This is the single-writer store backing the daemon. Entities reference
//! each other by id (arena-and-index): machines point at their active cycle
//! and job, cycles point back at their job, nothing owns anything across
//! tables. The archive-and-delete batch at job finish is the only
//! multi-record transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use shopfloor_core::types::TelemetrySnapshot;
use shopfloor_core::toolseq;
use std::path::PathBuf;

pub struct Db {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MachineRow {
    pub machine_id: String,
    pub name: String,
    pub current: TelemetrySnapshot,
    pub previous: TelemetrySnapshot,
    pub inactive_secs: i64,
    pub last_start_at: Option<DateTime<Utc>>,
    pub last_stop_at: Option<DateTime<Utc>>,
    pub active_cycle_id: Option<i64>,
    pub active_job_id: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

impl MachineRow {
    pub fn new(machine_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            name: machine_id.to_string(),
            current: TelemetrySnapshot::initial(now),
            previous: TelemetrySnapshot::initial(now),
            inactive_secs: 0,
            last_start_at: None,
            last_stop_at: None,
            active_cycle_id: None,
            active_job_id: None,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleRow {
    pub cycle_id: i64,
    pub machine_id: String,
    pub job_id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: i64,
    pub changing_secs: i64,
    pub tool_sequence: Vec<String>,
    pub mode: String,
    pub is_setup: bool,
    pub is_full_cycle: bool,
    pub is_warm_up: bool,
    pub is_running: bool,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRow {
    pub job_id: i64,
    pub machine_id: String,
    pub project_id: String,
    pub required_qty: i64,
    pub produced_qty: i64,
    pub parts_per_cycle: i64,
    pub full_cycle_id: Option<i64>,
    pub full_cycle_key: Option<String>,
    pub median_cycle_secs: i64,
    pub median_changing_secs: i64,
    pub setup_active_secs: i64,
    pub setup_idle_secs: i64,
    pub machining_secs: i64,
    pub unrelated_secs: i64,
    pub predicted_done_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub is_finished: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DayActivityRow {
    pub machine_id: String,
    pub day: String,
    pub active_secs: i64,
    pub stopped_secs: i64,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    // ─── Machines ───────────────────────────────────────────────────────

    pub fn get_machine(&self, machine_id: &str) -> Result<Option<MachineRow>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT machine_id, name, current_snapshot, previous_snapshot, inactive_secs, \
                        last_start_at, last_stop_at, active_cycle_id, active_job_id, updated_at \
                 FROM machines WHERE machine_id = ?1",
                params![machine_id],
                machine_from_row,
            )
            .optional()
            .map_err(|err| format!("Failed to query machine: {}", err))
        })
    }

    pub fn list_machines(&self) -> Result<Vec<MachineRow>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT machine_id, name, current_snapshot, previous_snapshot, inactive_secs, \
                            last_start_at, last_stop_at, active_cycle_id, active_job_id, updated_at \
                     FROM machines ORDER BY machine_id ASC",
                )
                .map_err(|err| format!("Failed to prepare machines query: {}", err))?;
            let rows = stmt
                .query_map([], |row| {
                    let machine_id: String = row.get(0)?;
                    Ok((machine_id, machine_from_row(row)))
                })
                .map_err(|err| format!("Failed to read machine rows: {}", err))?;

            // One corrupt row must not take the whole listing down with it;
            // the other machines still get served.
            let mut machines = Vec::new();
            for row in rows {
                let (machine_id, decoded) =
                    row.map_err(|err| format!("Failed to read machine row: {}", err))?;
                match decoded {
                    Ok(machine) => machines.push(machine),
                    Err(err) => {
                        tracing::warn!(
                            machine_id = %machine_id,
                            error = %err,
                            "Skipping undecodable machine row"
                        );
                    }
                }
            }
            Ok(machines)
        })
    }

    pub fn upsert_machine(&self, machine: &MachineRow) -> Result<(), String> {
        let current = snapshot_to_json(&machine.current)?;
        let previous = snapshot_to_json(&machine.previous)?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO machines \
                    (machine_id, name, current_snapshot, previous_snapshot, inactive_secs, \
                     last_start_at, last_stop_at, active_cycle_id, active_job_id, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                 ON CONFLICT(machine_id) DO UPDATE SET \
                    name = excluded.name, \
                    current_snapshot = excluded.current_snapshot, \
                    previous_snapshot = excluded.previous_snapshot, \
                    inactive_secs = excluded.inactive_secs, \
                    last_start_at = excluded.last_start_at, \
                    last_stop_at = excluded.last_stop_at, \
                    active_cycle_id = excluded.active_cycle_id, \
                    active_job_id = excluded.active_job_id, \
                    updated_at = excluded.updated_at",
                params![
                    machine.machine_id,
                    machine.name,
                    current,
                    previous,
                    machine.inactive_secs,
                    machine.last_start_at.map(|at| at.to_rfc3339()),
                    machine.last_stop_at.map(|at| at.to_rfc3339()),
                    machine.active_cycle_id,
                    machine.active_job_id,
                    machine.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|err| format!("Failed to upsert machine: {}", err))?;
            Ok(())
        })
    }

    // ─── Cycles ─────────────────────────────────────────────────────────

    pub fn insert_cycle(&self, cycle: &CycleRow) -> Result<i64, String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO cycles \
                    (machine_id, job_id, started_at, ended_at, duration_secs, changing_secs, \
                     tool_sequence, mode, is_setup, is_full_cycle, is_warm_up, is_running, \
                     finish_reason) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    cycle.machine_id,
                    cycle.job_id,
                    cycle.started_at.to_rfc3339(),
                    cycle.ended_at.map(|at| at.to_rfc3339()),
                    cycle.duration_secs,
                    cycle.changing_secs,
                    cycle.tool_sequence.join(","),
                    cycle.mode,
                    cycle.is_setup,
                    cycle.is_full_cycle,
                    cycle.is_warm_up,
                    cycle.is_running,
                    cycle.finish_reason,
                ],
            )
            .map_err(|err| format!("Failed to insert cycle: {}", err))?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn update_cycle(&self, cycle: &CycleRow) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE cycles SET \
                    machine_id = ?1, job_id = ?2, started_at = ?3, ended_at = ?4, \
                    duration_secs = ?5, changing_secs = ?6, tool_sequence = ?7, mode = ?8, \
                    is_setup = ?9, is_full_cycle = ?10, is_warm_up = ?11, is_running = ?12, \
                    finish_reason = ?13 \
                 WHERE cycle_id = ?14",
                params![
                    cycle.machine_id,
                    cycle.job_id,
                    cycle.started_at.to_rfc3339(),
                    cycle.ended_at.map(|at| at.to_rfc3339()),
                    cycle.duration_secs,
                    cycle.changing_secs,
                    cycle.tool_sequence.join(","),
                    cycle.mode,
                    cycle.is_setup,
                    cycle.is_full_cycle,
                    cycle.is_warm_up,
                    cycle.is_running,
                    cycle.finish_reason,
                    cycle.cycle_id,
                ],
            )
            .map_err(|err| format!("Failed to update cycle: {}", err))?;
            Ok(())
        })
    }

    pub fn get_cycle(&self, cycle_id: i64) -> Result<Option<CycleRow>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                &format!("{} WHERE cycle_id = ?1", SELECT_CYCLE),
                params![cycle_id],
                cycle_from_row,
            )
            .optional()
            .map_err(|err| format!("Failed to query cycle: {}", err))
        })
    }

    /// All cycles of one job, oldest first. Start-time order matters to the
    /// classifier's tie-breaking and broken-cycle merge.
    pub fn list_cycles_for_job(&self, job_id: i64) -> Result<Vec<CycleRow>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "{} WHERE job_id = ?1 ORDER BY started_at ASC, cycle_id ASC",
                    SELECT_CYCLE
                ))
                .map_err(|err| format!("Failed to prepare cycles query: {}", err))?;
            let rows = stmt
                .query_map(params![job_id], cycle_from_row)
                .map_err(|err| format!("Failed to read cycle rows: {}", err))?;

            let mut cycles = Vec::new();
            for row in rows {
                cycles.push(row.map_err(|err| format!("Failed to decode cycle row: {}", err))?);
            }
            Ok(cycles)
        })
    }

    /// Finished manual (job-less) cycles of one machine started inside a
    /// time window. Used to fold ad-hoc cycles into a finishing job's setup
    /// accounting.
    pub fn list_manual_cycles_in_window(
        &self,
        machine_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CycleRow>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "{} WHERE machine_id = ?1 AND job_id IS NULL AND is_running = 0 \
                     AND started_at >= ?2 AND started_at <= ?3 \
                     ORDER BY started_at ASC",
                    SELECT_CYCLE
                ))
                .map_err(|err| format!("Failed to prepare manual cycles query: {}", err))?;
            let rows = stmt
                .query_map(
                    params![machine_id, from.to_rfc3339(), to.to_rfc3339()],
                    cycle_from_row,
                )
                .map_err(|err| format!("Failed to read manual cycle rows: {}", err))?;

            let mut cycles = Vec::new();
            for row in rows {
                cycles
                    .push(row.map_err(|err| format!("Failed to decode manual cycle: {}", err))?);
            }
            Ok(cycles)
        })
    }

    pub fn delete_cycle(&self, cycle_id: i64) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM cycles WHERE cycle_id = ?1", params![cycle_id])
                .map_err(|err| format!("Failed to delete cycle: {}", err))?;
            Ok(())
        })
    }

    /// Copy the given full production cycles into the archive and delete the
    /// live rows, atomically: either all archived copies exist and all
    /// originals are gone, or nothing changed.
    pub fn archive_full_cycles(
        &self,
        cycles: &[CycleRow],
        archived_at: DateTime<Utc>,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to start archive transaction: {}", err))?;

            for cycle in cycles {
                tx.execute(
                    "INSERT INTO archived_cycles \
                        (job_id, machine_id, started_at, ended_at, duration_secs, \
                         changing_secs, tool_sequence, mode, archived_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        cycle.job_id,
                        cycle.machine_id,
                        cycle.started_at.to_rfc3339(),
                        cycle.ended_at.map(|at| at.to_rfc3339()),
                        cycle.duration_secs,
                        cycle.changing_secs,
                        cycle.tool_sequence.join(","),
                        cycle.mode,
                        archived_at.to_rfc3339(),
                    ],
                )
                .map_err(|err| format!("Failed to insert archived cycle: {}", err))?;
                tx.execute(
                    "DELETE FROM cycles WHERE cycle_id = ?1",
                    params![cycle.cycle_id],
                )
                .map_err(|err| format!("Failed to delete archived original: {}", err))?;
            }

            tx.commit()
                .map_err(|err| format!("Failed to commit archive transaction: {}", err))
        })
    }

    pub fn count_archived_cycles(&self, job_id: i64) -> Result<i64, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM archived_cycles WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .map_err(|err| format!("Failed to count archived cycles: {}", err))
        })
    }

    // ─── Jobs ───────────────────────────────────────────────────────────

    pub fn insert_job(&self, job: &JobRow) -> Result<i64, String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO jobs \
                    (machine_id, project_id, required_qty, produced_qty, parts_per_cycle, \
                     full_cycle_id, full_cycle_key, median_cycle_secs, median_changing_secs, \
                     setup_active_secs, setup_idle_secs, machining_secs, unrelated_secs, \
                     predicted_done_at, started_at, ended_at, is_finished) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                         ?16, ?17)",
                params![
                    job.machine_id,
                    job.project_id,
                    job.required_qty,
                    job.produced_qty,
                    job.parts_per_cycle,
                    job.full_cycle_id,
                    job.full_cycle_key,
                    job.median_cycle_secs,
                    job.median_changing_secs,
                    job.setup_active_secs,
                    job.setup_idle_secs,
                    job.machining_secs,
                    job.unrelated_secs,
                    job.predicted_done_at.map(|at| at.to_rfc3339()),
                    job.started_at.to_rfc3339(),
                    job.ended_at.map(|at| at.to_rfc3339()),
                    job.is_finished,
                ],
            )
            .map_err(|err| format!("Failed to insert job: {}", err))?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn update_job(&self, job: &JobRow) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE jobs SET \
                    machine_id = ?1, project_id = ?2, required_qty = ?3, produced_qty = ?4, \
                    parts_per_cycle = ?5, full_cycle_id = ?6, full_cycle_key = ?7, \
                    median_cycle_secs = ?8, median_changing_secs = ?9, setup_active_secs = ?10, \
                    setup_idle_secs = ?11, machining_secs = ?12, unrelated_secs = ?13, \
                    predicted_done_at = ?14, started_at = ?15, ended_at = ?16, is_finished = ?17 \
                 WHERE job_id = ?18",
                params![
                    job.machine_id,
                    job.project_id,
                    job.required_qty,
                    job.produced_qty,
                    job.parts_per_cycle,
                    job.full_cycle_id,
                    job.full_cycle_key,
                    job.median_cycle_secs,
                    job.median_changing_secs,
                    job.setup_active_secs,
                    job.setup_idle_secs,
                    job.machining_secs,
                    job.unrelated_secs,
                    job.predicted_done_at.map(|at| at.to_rfc3339()),
                    job.started_at.to_rfc3339(),
                    job.ended_at.map(|at| at.to_rfc3339()),
                    job.is_finished,
                    job.job_id,
                ],
            )
            .map_err(|err| format!("Failed to update job: {}", err))?;
            Ok(())
        })
    }

    pub fn get_job(&self, job_id: i64) -> Result<Option<JobRow>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                &format!("{} WHERE job_id = ?1", SELECT_JOB),
                params![job_id],
                job_from_row,
            )
            .optional()
            .map_err(|err| format!("Failed to query job: {}", err))
        })
    }

    pub fn list_jobs(&self) -> Result<Vec<JobRow>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "{} ORDER BY started_at DESC, job_id DESC",
                    SELECT_JOB
                ))
                .map_err(|err| format!("Failed to prepare jobs query: {}", err))?;
            let rows = stmt
                .query_map([], job_from_row)
                .map_err(|err| format!("Failed to read job rows: {}", err))?;

            let mut jobs = Vec::new();
            for row in rows {
                jobs.push(row.map_err(|err| format!("Failed to decode job row: {}", err))?);
            }
            Ok(jobs)
        })
    }

    // ─── Day activity ───────────────────────────────────────────────────

    pub fn add_day_activity(
        &self,
        machine_id: &str,
        day: &str,
        active_delta: i64,
        stopped_delta: i64,
    ) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO day_activity (machine_id, day, active_secs, stopped_secs) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(machine_id, day) DO UPDATE SET \
                    active_secs = active_secs + excluded.active_secs, \
                    stopped_secs = stopped_secs + excluded.stopped_secs",
                params![machine_id, day, active_delta, stopped_delta],
            )
            .map_err(|err| format!("Failed to upsert day activity: {}", err))?;
            Ok(())
        })
    }

    pub fn list_day_activity(&self, machine_id: Option<&str>) -> Result<Vec<DayActivityRow>, String> {
        self.with_connection(|conn| {
            let (sql, machine_filter) = match machine_id {
                Some(id) => (
                    "SELECT machine_id, day, active_secs, stopped_secs FROM day_activity \
                     WHERE machine_id = ?1 ORDER BY day DESC",
                    Some(id.to_string()),
                ),
                None => (
                    "SELECT machine_id, day, active_secs, stopped_secs FROM day_activity \
                     ORDER BY day DESC, machine_id ASC",
                    None,
                ),
            };
            let mut stmt = stmt_or_err(conn, sql)?;
            let map = |row: &Row<'_>| {
                Ok(DayActivityRow {
                    machine_id: row.get(0)?,
                    day: row.get(1)?,
                    active_secs: row.get(2)?,
                    stopped_secs: row.get(3)?,
                })
            };
            let rows = match machine_filter {
                Some(id) => stmt.query_map(params![id], map),
                None => stmt.query_map([], map),
            }
            .map_err(|err| format!("Failed to read day activity: {}", err))?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(|err| format!("Failed to decode day activity: {}", err))?);
            }
            Ok(entries)
        })
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS machines (
                    machine_id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    current_snapshot TEXT NOT NULL,
                    previous_snapshot TEXT NOT NULL,
                    inactive_secs INTEGER NOT NULL DEFAULT 0,
                    last_start_at TEXT,
                    last_stop_at TEXT,
                    active_cycle_id INTEGER,
                    active_job_id INTEGER,
                    updated_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS cycles (
                    cycle_id INTEGER PRIMARY KEY,
                    machine_id TEXT NOT NULL,
                    job_id INTEGER,
                    started_at TEXT NOT NULL,
                    ended_at TEXT,
                    duration_secs INTEGER NOT NULL DEFAULT 0,
                    changing_secs INTEGER NOT NULL DEFAULT 0,
                    tool_sequence TEXT NOT NULL DEFAULT '',
                    mode TEXT NOT NULL,
                    is_setup INTEGER NOT NULL DEFAULT 1,
                    is_full_cycle INTEGER NOT NULL DEFAULT 0,
                    is_warm_up INTEGER NOT NULL DEFAULT 0,
                    is_running INTEGER NOT NULL DEFAULT 0,
                    finish_reason TEXT
                 );
                 CREATE TABLE IF NOT EXISTS archived_cycles (
                    archive_id INTEGER PRIMARY KEY,
                    job_id INTEGER,
                    machine_id TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    ended_at TEXT,
                    duration_secs INTEGER NOT NULL,
                    changing_secs INTEGER NOT NULL,
                    tool_sequence TEXT NOT NULL,
                    mode TEXT NOT NULL,
                    archived_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS jobs (
                    job_id INTEGER PRIMARY KEY,
                    machine_id TEXT NOT NULL,
                    project_id TEXT NOT NULL,
                    required_qty INTEGER NOT NULL DEFAULT 0,
                    produced_qty INTEGER NOT NULL DEFAULT 0,
                    parts_per_cycle INTEGER NOT NULL DEFAULT 1,
                    full_cycle_id INTEGER,
                    full_cycle_key TEXT,
                    median_cycle_secs INTEGER NOT NULL DEFAULT 0,
                    median_changing_secs INTEGER NOT NULL DEFAULT 0,
                    setup_active_secs INTEGER NOT NULL DEFAULT 0,
                    setup_idle_secs INTEGER NOT NULL DEFAULT 0,
                    machining_secs INTEGER NOT NULL DEFAULT 0,
                    unrelated_secs INTEGER NOT NULL DEFAULT 0,
                    predicted_done_at TEXT,
                    started_at TEXT NOT NULL,
                    ended_at TEXT,
                    is_finished INTEGER NOT NULL DEFAULT 0
                 );
                 CREATE TABLE IF NOT EXISTS day_activity (
                    machine_id TEXT NOT NULL,
                    day TEXT NOT NULL,
                    active_secs INTEGER NOT NULL DEFAULT 0,
                    stopped_secs INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (machine_id, day)
                 );
                 CREATE INDEX IF NOT EXISTS idx_cycles_job ON cycles(job_id);
                 CREATE INDEX IF NOT EXISTS idx_cycles_machine ON cycles(machine_id, started_at);
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("Failed to create daemon data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to set WAL journal mode: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous mode: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy timeout: {}", err))?;

        Ok(conn)
    }
}

const SELECT_CYCLE: &str = "SELECT cycle_id, machine_id, job_id, started_at, ended_at, \
     duration_secs, changing_secs, tool_sequence, mode, is_setup, is_full_cycle, is_warm_up, \
     is_running, finish_reason FROM cycles";

const SELECT_JOB: &str = "SELECT job_id, machine_id, project_id, required_qty, produced_qty, \
     parts_per_cycle, full_cycle_id, full_cycle_key, median_cycle_secs, median_changing_secs, \
     setup_active_secs, setup_idle_secs, machining_secs, unrelated_secs, predicted_done_at, \
     started_at, ended_at, is_finished FROM jobs";

fn stmt_or_err<'conn>(
    conn: &'conn Connection,
    sql: &str,
) -> Result<rusqlite::Statement<'conn>, String> {
    conn.prepare(sql)
        .map_err(|err| format!("Failed to prepare query: {}", err))
}

fn machine_from_row(row: &Row<'_>) -> rusqlite::Result<MachineRow> {
    let current: String = row.get(2)?;
    let previous: String = row.get(3)?;
    Ok(MachineRow {
        machine_id: row.get(0)?,
        name: row.get(1)?,
        current: snapshot_from_json(&current)?,
        previous: snapshot_from_json(&previous)?,
        inactive_secs: row.get(4)?,
        last_start_at: parse_optional_time(row.get::<_, Option<String>>(5)?),
        last_stop_at: parse_optional_time(row.get::<_, Option<String>>(6)?),
        active_cycle_id: row.get(7)?,
        active_job_id: row.get(8)?,
        updated_at: parse_time_or_epoch(row.get::<_, String>(9)?),
    })
}

fn cycle_from_row(row: &Row<'_>) -> rusqlite::Result<CycleRow> {
    let sequence: String = row.get(7)?;
    Ok(CycleRow {
        cycle_id: row.get(0)?,
        machine_id: row.get(1)?,
        job_id: row.get(2)?,
        started_at: parse_time_or_epoch(row.get::<_, String>(3)?),
        ended_at: parse_optional_time(row.get::<_, Option<String>>(4)?),
        duration_secs: row.get(5)?,
        changing_secs: row.get(6)?,
        tool_sequence: toolseq::split_sequence(&sequence),
        mode: row.get(8)?,
        is_setup: row.get(9)?,
        is_full_cycle: row.get(10)?,
        is_warm_up: row.get(11)?,
        is_running: row.get(12)?,
        finish_reason: row.get(13)?,
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        job_id: row.get(0)?,
        machine_id: row.get(1)?,
        project_id: row.get(2)?,
        required_qty: row.get(3)?,
        produced_qty: row.get(4)?,
        parts_per_cycle: row.get(5)?,
        full_cycle_id: row.get(6)?,
        full_cycle_key: row.get(7)?,
        median_cycle_secs: row.get(8)?,
        median_changing_secs: row.get(9)?,
        setup_active_secs: row.get(10)?,
        setup_idle_secs: row.get(11)?,
        machining_secs: row.get(12)?,
        unrelated_secs: row.get(13)?,
        predicted_done_at: parse_optional_time(row.get::<_, Option<String>>(14)?),
        started_at: parse_time_or_epoch(row.get::<_, String>(15)?),
        ended_at: parse_optional_time(row.get::<_, Option<String>>(16)?),
        is_finished: row.get(17)?,
    })
}

fn snapshot_to_json(snapshot: &TelemetrySnapshot) -> Result<String, String> {
    serde_json::to_string(snapshot).map_err(|err| format!("Failed to serialize snapshot: {}", err))
}

fn snapshot_from_json(raw: &str) -> rusqlite::Result<TelemetrySnapshot> {
    serde_json::from_str(raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(err),
        )
    })
}

fn parse_optional_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value.as_deref().and_then(parse_rfc3339)
}

fn parse_time_or_epoch(value: String) -> DateTime<Utc> {
    parse_rfc3339(&value).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

//! Job finishing: time accounting, archiving, cleanup.
//!
//! When a job ends every second it consumed is attributed to exactly one
//! bucket, its full production cycles move to the archive, and the remaining
//! live cycle rows are deleted. The archive step is transactional; if it
//! fails the job stays unfinished so the caller can retry on a later tick.

use chrono::{DateTime, Utc};
use shopfloor_core::types::MachineMode;

use crate::db::{CycleRow, Db};

pub fn finish_job(db: &Db, job_id: i64, ended_at: DateTime<Utc>) -> Result<(), String> {
    let Some(mut job) = db.get_job(job_id)? else {
        tracing::warn!(job_id, "Finish requested for missing job");
        return Ok(());
    };
    if job.is_finished {
        return Ok(());
    }

    let cycles: Vec<CycleRow> = db
        .list_cycles_for_job(job_id)?
        .into_iter()
        .filter(|cycle| !cycle.is_running)
        .collect();

    for cycle in &cycles {
        let mode = MachineMode::from_str(&cycle.mode);
        if cycle.is_warm_up {
            job.unrelated_secs += cycle.duration_secs;
            job.setup_idle_secs += cycle.changing_secs;
        } else if cycle.is_full_cycle {
            job.machining_secs += cycle.duration_secs + cycle.changing_secs;
        } else if cycle.is_setup && mode == Some(MachineMode::Automatic) {
            job.setup_active_secs += cycle.duration_secs + cycle.changing_secs;
        } else {
            tracing::warn!(
                job_id,
                cycle_id = cycle.cycle_id,
                mode = %cycle.mode,
                "Unclassified cycle at job finish; counting as setup"
            );
            job.setup_active_secs += cycle.duration_secs + cycle.changing_secs;
        }
    }

    // Ad-hoc manual cycles run on this machine during the job window belong
    // to its setup effort.
    let manual = db.list_manual_cycles_in_window(&job.machine_id, job.started_at, ended_at)?;
    for cycle in &manual {
        job.setup_active_secs += cycle.duration_secs + cycle.changing_secs;
    }

    let full: Vec<CycleRow> = cycles
        .iter()
        .filter(|cycle| cycle.is_full_cycle)
        .cloned()
        .collect();
    db.archive_full_cycles(&full, ended_at)?;

    for cycle in cycles.iter().filter(|cycle| !cycle.is_full_cycle) {
        db.delete_cycle(cycle.cycle_id)?;
    }
    for cycle in &manual {
        db.delete_cycle(cycle.cycle_id)?;
    }

    job.ended_at = Some(ended_at);
    job.is_finished = true;
    job.predicted_done_at = None;
    db.update_job(&job)?;

    tracing::info!(
        job_id,
        machine_id = %job.machine_id,
        produced_qty = job.produced_qty,
        archived = full.len(),
        "Job finished"
    );
    Ok(())
}

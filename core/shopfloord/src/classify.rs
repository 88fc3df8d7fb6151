//! Full-cycle classification for an active job.
//!
//! A job has no declared "reference cycle"; the canonical tool sequence is
//! elected statistically from the cycles observed so far. Every cycle finish
//! re-runs this pass: election (with retroactive credit and stale-sequence
//! reversion when the winner changes), per-cycle credit, the two-cycle
//! broken-cycle merge, median updates, and the completion projection.

use std::collections::HashMap;

use shopfloor_core::toolseq;
use shopfloor_core::WorkCalendar;

use crate::config::RuntimeConfig;
use crate::db::{CycleRow, Db, JobRow};

/// Election needs more evidence than this many finished cycles before the
/// modal sequence is trusted.
const ELECTION_MIN_CYCLES: usize = 3;

pub fn on_cycle_finished(
    db: &Db,
    config: &RuntimeConfig,
    calendar: &WorkCalendar,
    job_id: i64,
) -> Result<(), String> {
    let Some(mut job) = db.get_job(job_id)? else {
        tracing::warn!(job_id, "Classification requested for missing job");
        return Ok(());
    };
    if job.is_finished {
        return Ok(());
    }

    let double_tool = config.ingest.double_tool_numbers;
    let mut cycles: Vec<CycleRow> = db
        .list_cycles_for_job(job_id)?
        .into_iter()
        .filter(|cycle| !cycle.is_running)
        .collect();

    if cycles.len() > ELECTION_MIN_CYCLES {
        elect_canonical_sequence(db, &mut job, &mut cycles, double_tool)?;
    }

    credit_matching_cycles(db, &mut job, &mut cycles, double_tool)?;
    merge_broken_cycles(db, &mut job, &mut cycles, double_tool)?;
    update_medians(&mut job, &cycles, double_tool);
    update_projection(calendar, &mut job, &cycles);

    db.update_job(&job)
}

/// Elect the modal non-empty normalized sequence. Ties break toward the
/// sequence whose first occurrence started earliest. When the winner differs
/// from the current canonical key, credits held by stale-key cycles are
/// reverted (floored at zero) before matching cycles are re-credited.
fn elect_canonical_sequence(
    db: &Db,
    job: &mut JobRow,
    cycles: &mut [CycleRow],
    double_tool: bool,
) -> Result<(), String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (index, cycle) in cycles.iter().enumerate() {
        if cycle.is_warm_up {
            continue;
        }
        let key = toolseq::sequence_key(&cycle.tool_sequence, double_tool);
        if key.is_empty() {
            continue;
        }
        let entry = counts.entry(key).or_insert((0, index));
        entry.0 += 1;
    }

    let winner = counts
        .into_iter()
        .max_by(|(_, (count_a, first_a)), (_, (count_b, first_b))| {
            count_a.cmp(count_b).then(first_b.cmp(first_a))
        })
        .map(|(key, _)| key);

    let Some(winner) = winner else {
        return Ok(());
    };
    if job.full_cycle_key.as_deref() == Some(winner.as_str()) {
        return Ok(());
    }

    if job.full_cycle_key.is_some() {
        tracing::info!(
            job_id = job.job_id,
            old_key = job.full_cycle_key.as_deref().unwrap_or(""),
            new_key = %winner,
            "Canonical sequence re-elected"
        );
        revert_stale_credits(db, job, cycles, &winner, double_tool)?;
    }

    job.full_cycle_key = Some(winner.clone());
    job.full_cycle_id = cycles
        .iter()
        .find(|cycle| {
            !cycle.is_warm_up && toolseq::sequence_key(&cycle.tool_sequence, double_tool) == winner
        })
        .map(|cycle| cycle.cycle_id);
    Ok(())
}

fn revert_stale_credits(
    db: &Db,
    job: &mut JobRow,
    cycles: &mut [CycleRow],
    new_key: &str,
    double_tool: bool,
) -> Result<(), String> {
    for cycle in cycles.iter_mut() {
        if !cycle.is_full_cycle {
            continue;
        }
        if toolseq::sequence_key(&cycle.tool_sequence, double_tool) == new_key {
            continue;
        }
        cycle.is_full_cycle = false;
        cycle.is_setup = true;
        db.update_cycle(cycle)?;
        job.produced_qty = (job.produced_qty - job.parts_per_cycle).max(0);
    }
    Ok(())
}

/// Credit every finished, non-warm-up cycle whose sequence matches the
/// canonical key. The full-cycle flag makes this idempotent across repeated
/// classification passes.
fn credit_matching_cycles(
    db: &Db,
    job: &mut JobRow,
    cycles: &mut [CycleRow],
    double_tool: bool,
) -> Result<(), String> {
    let Some(canonical) = job.full_cycle_key.clone() else {
        return Ok(());
    };
    for cycle in cycles.iter_mut() {
        if cycle.is_warm_up || cycle.is_full_cycle {
            continue;
        }
        if toolseq::sequence_key(&cycle.tool_sequence, double_tool) != canonical {
            continue;
        }
        cycle.is_full_cycle = true;
        cycle.is_setup = false;
        db.update_cycle(cycle)?;
        job.produced_qty += job.parts_per_cycle;
    }
    Ok(())
}

/// Interrupted-and-resumed production: a pair of adjacent cycles whose
/// concatenated sequence equals the canonical one earns a single credit.
/// Only the immediately preceding cycle is considered; the merge never
/// chains deeper than two.
fn merge_broken_cycles(
    db: &Db,
    job: &mut JobRow,
    cycles: &mut [CycleRow],
    double_tool: bool,
) -> Result<(), String> {
    let Some(canonical) = job.full_cycle_key.clone() else {
        return Ok(());
    };
    for index in 1..cycles.len() {
        let (head, tail) = cycles.split_at_mut(index);
        let curr = &mut tail[0];
        if curr.is_warm_up || curr.is_full_cycle {
            continue;
        }
        let Some(prev) = head
            .iter_mut()
            .rev()
            .find(|cycle| !cycle.is_warm_up)
        else {
            continue;
        };
        if prev.is_full_cycle {
            continue;
        }
        let mut combined = prev.tool_sequence.clone();
        combined.extend(curr.tool_sequence.iter().cloned());
        if toolseq::sequence_key(&combined, double_tool) != canonical {
            continue;
        }
        prev.is_full_cycle = true;
        prev.is_setup = false;
        curr.is_full_cycle = true;
        curr.is_setup = false;
        db.update_cycle(prev)?;
        db.update_cycle(curr)?;
        job.produced_qty += job.parts_per_cycle;
    }
    Ok(())
}

/// Medians over full cycles, with merged halves folded back together. Both
/// halves of a broken pair carry the full-cycle flag for time accounting, but
/// they represent one production cycle: their durations sum to a single
/// sample, and the pair's changing time is the first half's. A half is
/// recognized by its own sequence not matching the canonical key.
fn update_medians(job: &mut JobRow, cycles: &[CycleRow], double_tool: bool) {
    let canonical = job.full_cycle_key.as_deref();
    let mut durations = Vec::new();
    let mut changings = Vec::new();
    let mut pending_half: Option<(i64, i64)> = None;
    for cycle in cycles.iter().filter(|cycle| cycle.is_full_cycle) {
        let matches = canonical
            .map(|key| toolseq::sequence_key(&cycle.tool_sequence, double_tool) == key)
            .unwrap_or(false);
        if matches {
            durations.push(cycle.duration_secs);
            changings.push(cycle.changing_secs);
        } else if let Some((duration, changing)) = pending_half.take() {
            durations.push(duration + cycle.duration_secs);
            changings.push(changing);
        } else {
            pending_half = Some((cycle.duration_secs, cycle.changing_secs));
        }
    }
    job.median_cycle_secs = median(durations);
    job.median_changing_secs = median(changings);
}

fn median(mut values: Vec<i64>) -> i64 {
    if values.is_empty() {
        return 0;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        (values[mid - 1] + values[mid]) / 2
    }
}

/// Project when the remaining quantity will be done, anchored at the latest
/// finished cycle's end. Needs a positive requirement and a usable median.
fn update_projection(calendar: &WorkCalendar, job: &mut JobRow, cycles: &[CycleRow]) {
    let remaining = job.required_qty - job.produced_qty;
    if job.required_qty <= 0 || remaining <= 0 || job.median_cycle_secs <= 0 {
        job.predicted_done_at = None;
        return;
    }
    let Some(anchor) = cycles.iter().filter_map(|cycle| cycle.ended_at).max() else {
        return;
    };
    let per_cycle = job.parts_per_cycle.max(1);
    let cycles_needed = (remaining + per_cycle - 1) / per_cycle;
    let required_secs = cycles_needed * (job.median_cycle_secs + job.median_changing_secs);
    job.predicted_done_at = Some(calendar.project_completion(anchor, required_secs));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use shopfloor_core::types::MachineMode;

    fn test_db() -> (tempfile::TempDir, Db) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("state.db")).expect("db init");
        (temp_dir, db)
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 2, 8, 0, 0).unwrap()
    }

    fn insert_job(db: &Db, required: i64, ppc: i64) -> i64 {
        db.insert_job(&JobRow {
            job_id: 0,
            machine_id: "mill-01".to_string(),
            project_id: "O1234".to_string(),
            required_qty: required,
            produced_qty: 0,
            parts_per_cycle: ppc,
            full_cycle_id: None,
            full_cycle_key: None,
            median_cycle_secs: 0,
            median_changing_secs: 0,
            setup_active_secs: 0,
            setup_idle_secs: 0,
            machining_secs: 0,
            unrelated_secs: 0,
            predicted_done_at: None,
            started_at: base_time(),
            ended_at: None,
            is_finished: false,
        })
        .expect("insert job")
    }

    fn insert_finished_cycle(
        db: &Db,
        job_id: i64,
        offset_secs: i64,
        duration_secs: i64,
        tools: &[&str],
    ) -> i64 {
        let started = base_time() + Duration::seconds(offset_secs);
        db.insert_cycle(&CycleRow {
            cycle_id: 0,
            machine_id: "mill-01".to_string(),
            job_id: Some(job_id),
            started_at: started,
            ended_at: Some(started + Duration::seconds(duration_secs)),
            duration_secs,
            changing_secs: 60,
            tool_sequence: tools.iter().map(|tool| tool.to_string()).collect(),
            mode: MachineMode::Automatic.as_str().to_string(),
            is_setup: true,
            is_full_cycle: false,
            is_warm_up: false,
            is_running: false,
            finish_reason: Some("status_stopped".to_string()),
        })
        .expect("insert cycle")
    }

    fn classify(db: &Db, job_id: i64) -> JobRow {
        let config = RuntimeConfig::default();
        let calendar = WorkCalendar::default();
        on_cycle_finished(db, &config, &calendar, job_id).expect("classify");
        db.get_job(job_id).expect("query").expect("exists")
    }

    #[test]
    fn no_election_below_threshold() {
        let (_guard, db) = test_db();
        let job_id = insert_job(&db, 100, 1);
        for offset in [0, 400, 800] {
            insert_finished_cycle(&db, job_id, offset, 300, &["1", "2"]);
        }
        let job = classify(&db, job_id);
        assert!(job.full_cycle_key.is_none());
        assert_eq!(job.produced_qty, 0);
    }

    #[test]
    fn modal_sequence_wins_election_and_credits() {
        let (_guard, db) = test_db();
        let job_id = insert_job(&db, 100, 2);
        insert_finished_cycle(&db, job_id, 0, 200, &["1"]);
        insert_finished_cycle(&db, job_id, 400, 300, &["1", "2"]);
        insert_finished_cycle(&db, job_id, 800, 310, &["1", "2"]);
        insert_finished_cycle(&db, job_id, 1200, 290, &["1", "2"]);

        let job = classify(&db, job_id);
        assert_eq!(job.full_cycle_key.as_deref(), Some("1,2"));
        // Three matching cycles at two parts each.
        assert_eq!(job.produced_qty, 6);

        let cycles = db.list_cycles_for_job(job_id).expect("list");
        assert_eq!(cycles.iter().filter(|cycle| cycle.is_full_cycle).count(), 3);
        assert!(!cycles[0].is_full_cycle);
        assert!(cycles[0].is_setup);
    }

    #[test]
    fn outlier_sequence_earns_no_credit() {
        let (_guard, db) = test_db();
        let job_id = insert_job(&db, 100, 1);
        for offset in [0, 400, 800, 1200] {
            insert_finished_cycle(&db, job_id, offset, 300, &["1", "2"]);
        }
        insert_finished_cycle(&db, job_id, 1600, 900, &["9"]);

        let job = classify(&db, job_id);
        assert_eq!(job.full_cycle_key.as_deref(), Some("1,2"));
        assert_eq!(job.produced_qty, 4);
    }

    #[test]
    fn tie_breaks_toward_earliest_first_occurrence() {
        let (_guard, db) = test_db();
        let job_id = insert_job(&db, 100, 1);
        insert_finished_cycle(&db, job_id, 0, 300, &["1", "2"]);
        insert_finished_cycle(&db, job_id, 400, 300, &["3", "4"]);
        insert_finished_cycle(&db, job_id, 800, 300, &["1", "2"]);
        insert_finished_cycle(&db, job_id, 1200, 300, &["3", "4"]);

        let job = classify(&db, job_id);
        assert_eq!(job.full_cycle_key.as_deref(), Some("1,2"));
    }

    #[test]
    fn cosmetic_tool_formatting_matches_canonical() {
        let (_guard, db) = test_db();
        let job_id = insert_job(&db, 100, 1);
        insert_finished_cycle(&db, job_id, 0, 300, &["01", "02"]);
        insert_finished_cycle(&db, job_id, 400, 300, &["1", "2"]);
        insert_finished_cycle(&db, job_id, 800, 300, &["001", "2"]);
        insert_finished_cycle(&db, job_id, 1200, 300, &["1", "02"]);

        let job = classify(&db, job_id);
        assert_eq!(job.full_cycle_key.as_deref(), Some("1,2"));
        assert_eq!(job.produced_qty, 4);
    }

    #[test]
    fn re_election_reverts_stale_credits() {
        let (_guard, db) = test_db();
        let job_id = insert_job(&db, 100, 1);
        insert_finished_cycle(&db, job_id, 0, 300, &["1"]);
        insert_finished_cycle(&db, job_id, 400, 300, &["1"]);
        insert_finished_cycle(&db, job_id, 800, 300, &["1"]);
        insert_finished_cycle(&db, job_id, 1200, 300, &["1"]);
        let job = classify(&db, job_id);
        assert_eq!(job.full_cycle_key.as_deref(), Some("1"));
        assert_eq!(job.produced_qty, 4);

        // The real sequence emerges: longer runs of 1,2 overtake the early
        // short cycles.
        for offset in [1600, 2000, 2400, 2800, 3200] {
            insert_finished_cycle(&db, job_id, offset, 300, &["1", "2"]);
        }
        let job = classify(&db, job_id);
        assert_eq!(job.full_cycle_key.as_deref(), Some("1,2"));
        // Four credits reverted, five new ones granted.
        assert_eq!(job.produced_qty, 5);
        let cycles = db.list_cycles_for_job(job_id).expect("list");
        assert!(cycles[0].is_setup && !cycles[0].is_full_cycle);
    }

    #[test]
    fn reversion_never_goes_negative() {
        let (_guard, db) = test_db();
        let job_id = insert_job(&db, 100, 3);
        insert_finished_cycle(&db, job_id, 0, 300, &["1"]);
        insert_finished_cycle(&db, job_id, 400, 300, &["1"]);
        insert_finished_cycle(&db, job_id, 800, 300, &["1"]);
        insert_finished_cycle(&db, job_id, 1200, 300, &["1"]);
        classify(&db, job_id);

        // Manually drain the counter to simulate external consumption, then
        // force a re-election.
        let mut job = db.get_job(job_id).expect("query").expect("exists");
        job.produced_qty = 2;
        db.update_job(&job).expect("update");
        for offset in [1600, 2000, 2400, 2800, 3200] {
            insert_finished_cycle(&db, job_id, offset, 300, &["1", "2"]);
        }
        let job = classify(&db, job_id);
        // 2 - 4*3 floors at 0 before the five new credits land.
        assert_eq!(job.produced_qty, 15);
    }

    #[test]
    fn broken_cycle_pair_earns_single_credit() {
        let (_guard, db) = test_db();
        let job_id = insert_job(&db, 100, 1);
        for offset in [0, 400, 800, 1200] {
            insert_finished_cycle(&db, job_id, offset, 300, &["1", "2", "3"]);
        }
        // Interrupted halfway, then resumed.
        let first = insert_finished_cycle(&db, job_id, 1600, 150, &["1", "2"]);
        let second = insert_finished_cycle(&db, job_id, 2000, 150, &["3"]);

        let job = classify(&db, job_id);
        assert_eq!(job.full_cycle_key.as_deref(), Some("1,2,3"));
        assert_eq!(job.produced_qty, 5);
        let halves = [
            db.get_cycle(first).expect("query").expect("exists"),
            db.get_cycle(second).expect("query").expect("exists"),
        ];
        assert!(halves.iter().all(|cycle| cycle.is_full_cycle));
        assert!(halves.iter().all(|cycle| !cycle.is_setup));
    }

    #[test]
    fn merged_halves_count_once_in_medians() {
        let (_guard, db) = test_db();
        let job_id = insert_job(&db, 100, 1);
        for offset in [0, 400, 800, 1200] {
            insert_finished_cycle(&db, job_id, offset, 300, &["1", "2", "3"]);
        }
        // Two interruptions, each split into a 100s + 100s pair.
        insert_finished_cycle(&db, job_id, 1600, 100, &["1", "2"]);
        insert_finished_cycle(&db, job_id, 2000, 100, &["3"]);
        insert_finished_cycle(&db, job_id, 2400, 100, &["1", "2"]);
        insert_finished_cycle(&db, job_id, 2800, 100, &["3"]);

        let job = classify(&db, job_id);
        assert_eq!(job.produced_qty, 6);
        // Each pair is one 200s sample, not two 100s ones; four intact
        // cycles at 300s keep the median there.
        assert_eq!(job.median_cycle_secs, 300);
        assert_eq!(job.median_changing_secs, 60);
    }

    #[test]
    fn merge_never_chains_three_fragments() {
        let (_guard, db) = test_db();
        let job_id = insert_job(&db, 100, 1);
        for offset in [0, 400, 800, 1200] {
            insert_finished_cycle(&db, job_id, offset, 300, &["1", "2", "3"]);
        }
        insert_finished_cycle(&db, job_id, 1600, 100, &["1"]);
        insert_finished_cycle(&db, job_id, 2000, 100, &["2"]);
        insert_finished_cycle(&db, job_id, 2400, 100, &["3"]);

        let job = classify(&db, job_id);
        assert_eq!(job.produced_qty, 4);
    }

    #[test]
    fn medians_and_projection_follow_full_cycles() {
        let (_guard, db) = test_db();
        let job_id = insert_job(&db, 10, 1);
        insert_finished_cycle(&db, job_id, 0, 280, &["1", "2"]);
        insert_finished_cycle(&db, job_id, 400, 300, &["1", "2"]);
        insert_finished_cycle(&db, job_id, 800, 320, &["1", "2"]);
        insert_finished_cycle(&db, job_id, 1200, 900, &["9"]);

        let job = classify(&db, job_id);
        assert_eq!(job.median_cycle_secs, 300);
        assert_eq!(job.median_changing_secs, 60);
        assert_eq!(job.produced_qty, 3);

        let predicted = job.predicted_done_at.expect("projection");
        // 7 remaining cycles at 360s each, anchored after the last finish.
        let anchor = base_time() + Duration::seconds(1200 + 900);
        let calendar = WorkCalendar::default();
        assert_eq!(predicted, calendar.project_completion(anchor, 7 * 360));
    }

    #[test]
    fn projection_cleared_when_requirement_met() {
        let (_guard, db) = test_db();
        let job_id = insert_job(&db, 3, 1);
        insert_finished_cycle(&db, job_id, 0, 300, &["1", "2"]);
        insert_finished_cycle(&db, job_id, 400, 300, &["1", "2"]);
        insert_finished_cycle(&db, job_id, 800, 300, &["1", "2"]);
        insert_finished_cycle(&db, job_id, 1200, 300, &["1", "2"]);

        let job = classify(&db, job_id);
        assert!(job.produced_qty >= job.required_qty);
        assert!(job.predicted_done_at.is_none());
    }

    #[test]
    fn warm_up_cycles_are_ignored() {
        let (_guard, db) = test_db();
        let job_id = insert_job(&db, 100, 1);
        let warm = insert_finished_cycle(&db, job_id, 0, 1800, &["1", "2"]);
        let mut cycle = db.get_cycle(warm).expect("query").expect("exists");
        cycle.is_warm_up = true;
        cycle.is_setup = false;
        db.update_cycle(&cycle).expect("update");
        for offset in [400, 800, 1200, 1600] {
            insert_finished_cycle(&db, job_id, offset, 300, &["3", "4"]);
        }

        let job = classify(&db, job_id);
        assert_eq!(job.full_cycle_key.as_deref(), Some("3,4"));
        assert_eq!(job.produced_qty, 4);
        let warm_cycle = db.get_cycle(warm).expect("query").expect("exists");
        assert!(!warm_cycle.is_full_cycle);
    }
}

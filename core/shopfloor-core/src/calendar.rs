//! Work-calendar projection of completion times.
//!
//! Maps (start instant, required working duration) to a completion instant
//! under a fixed calendar: one 8-hour shift per weekday inside a
//! [start_hour, end_hour) window, two break insertions applied once each
//! when the remaining span crosses their threshold hour, weekends skipped.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};

use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkCalendar {
    start_hour: u32,
    end_hour: u32,
    morning_break_hour: u32,
    morning_break_secs: i64,
    midday_break_hour: u32,
    midday_break_secs: i64,
}

impl Default for WorkCalendar {
    fn default() -> Self {
        Self {
            start_hour: 7,
            end_hour: 16,
            morning_break_hour: 9,
            morning_break_secs: 15 * 60,
            midday_break_hour: 12,
            midday_break_secs: 45 * 60,
        }
    }
}

impl WorkCalendar {
    pub fn new(
        start_hour: u32,
        end_hour: u32,
        morning_break_hour: u32,
        morning_break_secs: i64,
        midday_break_hour: u32,
        midday_break_secs: i64,
    ) -> Result<Self, CoreError> {
        if start_hour >= end_hour || end_hour > 24 {
            return Err(CoreError::InvalidCalendar {
                details: format!("shift window [{start_hour}, {end_hour}) is not valid"),
            });
        }
        if morning_break_secs < 0 || midday_break_secs < 0 {
            return Err(CoreError::InvalidCalendar {
                details: "break durations must be non-negative".to_string(),
            });
        }
        for hour in [morning_break_hour, midday_break_hour] {
            if hour < start_hour || hour >= end_hour {
                return Err(CoreError::InvalidCalendar {
                    details: format!("break hour {hour} is outside the shift window"),
                });
            }
        }
        let window_secs = i64::from(end_hour - start_hour) * 3600;
        if morning_break_secs + midday_break_secs >= window_secs {
            return Err(CoreError::InvalidCalendar {
                details: "breaks consume the entire shift window".to_string(),
            });
        }
        Ok(Self {
            start_hour,
            end_hour,
            morning_break_hour,
            morning_break_secs,
            midday_break_hour,
            midday_break_secs,
        })
    }

    /// Net working seconds in one shift: the window minus both breaks.
    pub fn shift_secs(&self) -> i64 {
        i64::from(self.end_hour - self.start_hour) * 3600
            - self.morning_break_secs
            - self.midday_break_secs
    }

    /// Project the completion instant of `required_secs` of working time
    /// beginning at `start`.
    ///
    /// The duration is split into whole shifts plus a remainder; when the
    /// division is exact one shift is folded back into the remainder so the
    /// final shift lands inside a working day rather than on the next day's
    /// boundary. Whole shifts advance the date one weekday each; the
    /// remainder is added with any owed break adjustments and the candidate
    /// is rolled forward until it sits inside a weekday shift window.
    pub fn project_completion(&self, start: DateTime<Utc>, required_secs: i64) -> DateTime<Utc> {
        let mut cursor = self.roll_forward(start);
        if required_secs <= 0 {
            return cursor;
        }

        let shift = self.shift_secs();
        let mut whole_shifts = required_secs / shift;
        if whole_shifts > 0 && required_secs % shift == 0 {
            whole_shifts -= 1;
        }
        for _ in 0..whole_shifts {
            cursor = next_weekday(cursor);
        }

        let remainder = required_secs - whole_shifts * shift;
        let span = self.with_owed_breaks(cursor, remainder);
        self.roll_forward(cursor + Duration::seconds(span))
    }

    /// Add each break once if the span from `from` crosses its threshold
    /// hour. The morning break is applied before the midday check so a span
    /// crossing both owes both.
    fn with_owed_breaks(&self, from: DateTime<Utc>, span_secs: i64) -> i64 {
        let from_secs = i64::from(from.num_seconds_from_midnight());
        let mut total = span_secs;
        for (hour, break_secs) in [
            (self.morning_break_hour, self.morning_break_secs),
            (self.midday_break_hour, self.midday_break_secs),
        ] {
            let threshold = i64::from(hour) * 3600;
            if from_secs <= threshold && from_secs + total > threshold {
                total += break_secs;
            }
        }
        total
    }

    /// Roll a candidate instant forward to the nearest valid position:
    /// a weekday with the time of day inside [start_hour, end_hour).
    /// Overflow past the window end becomes owed working time at the next
    /// weekday's window start, with that day's break adjustments re-applied.
    fn roll_forward(&self, candidate: DateTime<Utc>) -> DateTime<Utc> {
        let mut candidate = candidate;
        loop {
            if is_weekend(candidate) {
                candidate = next_weekday(candidate);
                continue;
            }
            let day_secs = i64::from(candidate.num_seconds_from_midnight());
            let window_start = i64::from(self.start_hour) * 3600;
            let window_end = i64::from(self.end_hour) * 3600;
            if day_secs < window_start {
                candidate = at_hour(candidate, self.start_hour);
                continue;
            }
            if day_secs >= window_end {
                let overflow = day_secs - window_end;
                let next_start = at_hour(next_weekday(candidate), self.start_hour);
                let span = self.with_owed_breaks(next_start, overflow);
                candidate = next_start + Duration::seconds(span);
                continue;
            }
            return candidate;
        }
    }
}

fn is_weekend(instant: DateTime<Utc>) -> bool {
    matches!(instant.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Advance one calendar day, then keep advancing while the date lands on a
/// weekend. Time of day is preserved.
fn next_weekday(instant: DateTime<Utc>) -> DateTime<Utc> {
    let mut next = instant + Duration::days(1);
    while is_weekend(next) {
        next += Duration::days(1);
    }
    next
}

fn at_hour(instant: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    instant
        .date_naive()
        .and_hms_opt(hour, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(instant)
}

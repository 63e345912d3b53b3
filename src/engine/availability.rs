use chrono::{NaiveDate, NaiveTime, TimeDelta};

use crate::model::*;

// ── Free-slot algorithm ──────────────────────────────────────────

/// Bookable hours of a date when no operating window applies.
fn whole_day() -> TimeRange {
    TimeRange {
        start: NaiveTime::MIN,
        end: NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN),
    }
}

/// Free intervals of `date`: the applicable operating window minus active
/// bookings. Empty for a blacked-out date or a space that is not Available.
pub fn free_slots(calendar: &SpaceCalendar, date: NaiveDate, min_duration: Option<TimeDelta>) -> Vec<TimeRange> {
    if calendar.space.state != SpaceState::Available || calendar.blackout_on(date).is_some() {
        return Vec::new();
    }
    let open = calendar
        .window_for(date)
        .map(|w| TimeRange { start: w.open, end: w.close })
        .unwrap_or_else(whole_day);

    // Bookings are kept sorted by start already.
    let busy: Vec<TimeRange> = calendar
        .on_date(date)
        .iter()
        .filter(|r| r.state.is_active())
        .map(|r| r.range)
        .collect();
    let mut free = subtract_intervals(&[open], &merge_overlapping(&busy));

    if let Some(min) = min_duration {
        free.retain(|r| r.duration() >= min);
    }
    free
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[TimeRange]) -> Vec<TimeRange> {
    let mut merged: Vec<TimeRange> = Vec::new();
    for &range in sorted {
        if let Some(last) = merged.last_mut()
            && range.start <= last.end
        {
            last.end = last.end.max(range.end);
            continue;
        }
        merged.push(range);
    }
    merged
}

/// `base` minus `to_remove`, both sorted and disjoint.
pub fn subtract_intervals(base: &[TimeRange], to_remove: &[TimeRange]) -> Vec<TimeRange> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(TimeRange { start: current_start, end: r.start });
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(TimeRange { start: current_start, end: current_end });
        }
    }

    result
}

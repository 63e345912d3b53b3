//! Availability rules for a candidate booking. Pure: reads a calendar snapshot, never mutates.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use ulid::Ulid;

use crate::config::Policy;
use crate::model::*;

use super::EngineError;

/// A booking as requested, before it has passed any rule.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub requester_id: Ulid,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub attendee_count: u32,
    /// Reservation being edited; ignored by the overlap and quota rules.
    pub exclude: Option<Ulid>,
}

/// Inputs the rules read besides the calendar.
pub struct Context<'a> {
    pub policy: &'a Policy,
    pub now: NaiveDateTime,
    /// Requester's active bookings on `candidate.date`, across all spaces.
    pub requester_active: &'a [Ulid],
}

fn hhmm(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

/// Evaluate the rules in order, stopping at the first failure.
/// Returns the validated time range on success.
pub fn validate(
    calendar: &SpaceCalendar,
    candidate: &Candidate,
    ctx: &Context<'_>,
) -> Result<TimeRange, EngineError> {
    let range = check_time_sanity(candidate, ctx.policy)?;
    check_notice(candidate, ctx)?;
    check_quota(candidate, ctx)?;
    check_overlap(calendar, candidate, range)?;
    check_blackout(calendar, candidate.date)?;
    check_operating_window(calendar, candidate.date, range)?;
    check_capacity(calendar, candidate.attendee_count)?;
    check_space_state(calendar)?;
    Ok(range)
}

pub(crate) fn check_time_sanity(candidate: &Candidate, policy: &Policy) -> Result<TimeRange, EngineError> {
    if candidate.start >= candidate.end {
        return Err(EngineError::Validation(
            "end time must be after start time".into(),
        ));
    }
    let range = TimeRange::new(candidate.start, candidate.end);
    if range.duration() < policy.min_duration {
        return Err(EngineError::Validation(format!(
            "minimum duration {} minutes",
            policy.min_duration.num_minutes()
        )));
    }
    if range.duration() > policy.max_duration {
        return Err(EngineError::Validation(format!(
            "maximum duration {} hours",
            policy.max_duration.num_minutes() as f64 / 60.0
        )));
    }
    Ok(range)
}

fn check_notice(candidate: &Candidate, ctx: &Context<'_>) -> Result<(), EngineError> {
    let starts_at = candidate.date.and_time(candidate.start);
    if starts_at < ctx.now + ctx.policy.min_notice {
        return Err(EngineError::Validation(format!(
            "reservations require at least {} minutes of notice",
            ctx.policy.min_notice.num_minutes()
        )));
    }
    if starts_at > ctx.now + ctx.policy.max_notice {
        return Err(EngineError::Validation(format!(
            "reservations cannot be made more than {} days in advance",
            ctx.policy.max_notice.num_days()
        )));
    }
    Ok(())
}

fn check_quota(candidate: &Candidate, ctx: &Context<'_>) -> Result<(), EngineError> {
    let held = ctx
        .requester_active
        .iter()
        .filter(|id| Some(**id) != candidate.exclude)
        .count();
    if held >= ctx.policy.daily_quota as usize {
        return Err(EngineError::Conflict(format!(
            "limit of {} reservations per day reached",
            ctx.policy.daily_quota
        )));
    }
    Ok(())
}

fn check_overlap(calendar: &SpaceCalendar, candidate: &Candidate, range: TimeRange) -> Result<(), EngineError> {
    if let Some(existing) = calendar
        .overlapping(candidate.date, range)
        .find(|r| Some(r.id) != candidate.exclude)
    {
        return Err(EngineError::Conflict(format!(
            "conflicts with existing reservation {}",
            existing.range
        )));
    }
    Ok(())
}

fn check_blackout(calendar: &SpaceCalendar, date: NaiveDate) -> Result<(), EngineError> {
    if let Some(block) = calendar.blackout_on(date) {
        return Err(EngineError::Conflict(format!(
            "space is under maintenance from {} to {}",
            block.start_date, block.end_date
        )));
    }
    Ok(())
}

fn check_operating_window(calendar: &SpaceCalendar, date: NaiveDate, range: TimeRange) -> Result<(), EngineError> {
    let Some(window) = calendar.window_for(date) else {
        return Ok(());
    };
    if range.start < window.open {
        return Err(EngineError::Conflict(format!("space opens at {}", hhmm(window.open))));
    }
    if range.end > window.close {
        return Err(EngineError::Conflict(format!("space closes at {}", hhmm(window.close))));
    }
    Ok(())
}

fn check_capacity(calendar: &SpaceCalendar, attendees: u32) -> Result<(), EngineError> {
    if attendees > calendar.space.capacity {
        return Err(EngineError::Conflict(format!(
            "{attendees} attendees exceed capacity of {}",
            calendar.space.capacity
        )));
    }
    Ok(())
}

fn check_space_state(calendar: &SpaceCalendar) -> Result<(), EngineError> {
    if calendar.space.state != SpaceState::Available {
        return Err(EngineError::Conflict(format!(
            "space is {}",
            calendar.space.state
        )));
    }
    Ok(())
}

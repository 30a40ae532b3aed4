use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};

use super::EngineError;
use crate::calendar::UnitCalendar;
use crate::limits::*;
use crate::model::{Ms, Slot, Span};

/// How far ahead bookings and listings may reach, in days from today.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingPolicy {
    /// Bound for students booking for themselves.
    pub student_lookahead_days: u32,
    /// Bound for supervisors booking on behalf of a student.
    pub supervisor_lookahead_days: u32,
    /// Window used by the caller's own slot listing.
    pub my_slots_window_days: u32,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            student_lookahead_days: 7,
            supervisor_lookahead_days: 7,
            my_slots_window_days: 3,
        }
    }
}

/// Calendar date of `now` (UTC).
pub(crate) fn today(now: Ms) -> NaiveDate {
    DateTime::<Utc>::from_timestamp_millis(now)
        .unwrap_or_default()
        .date_naive()
}

pub(crate) fn days_between(from: NaiveDate, to: NaiveDate) -> i64 {
    (to - from).num_days()
}

pub(crate) fn validate_slot(slot: &Slot, calendar: &UnitCalendar) -> Result<(), EngineError> {
    let max = calendar.max_unit();
    if slot.start_unit < 1 {
        return Err(EngineError::validation("startunit", "can't be smaller than 1"));
    }
    if slot.start_unit > max {
        return Err(EngineError::validation("startunit", format!("can't be larger than {max}")));
    }
    if slot.duration < 1 {
        return Err(EngineError::validation("duration", "must be at least 1"));
    }
    if u64::from(slot.start_unit) + u64::from(slot.duration) > u64::from(max) {
        return Err(EngineError::validation(
            "duration",
            format!("slot goes past the max unit {max}"),
        ));
    }
    let room_len = slot.room.chars().count();
    if room_len < MIN_ROOM_LEN {
        return Err(EngineError::validation("room", "name is too short"));
    }
    if room_len > MAX_ROOM_LEN {
        return Err(EngineError::validation(
            "room",
            format!("name is too long ({room_len} > {MAX_ROOM_LEN})"),
        ));
    }
    Ok(())
}

pub(crate) fn validate_cohort(cohort: &str) -> Result<(), EngineError> {
    if cohort.is_empty() {
        return Err(EngineError::validation("vintage", "must not be empty"));
    }
    if cohort.chars().count() > MAX_COHORT_LEN {
        return Err(EngineError::validation(
            "vintage",
            format!("longer than {MAX_COHORT_LEN} characters"),
        ));
    }
    Ok(())
}

/// Time span of a slot occurrence on `date`.
pub(crate) fn occurrence_span(
    slot: &Slot,
    date: NaiveDate,
    calendar: &UnitCalendar,
) -> Result<Span, EngineError> {
    Ok(calendar.span_on(date, slot.start_unit, slot.duration)?)
}

/// The next occurrence that has not started yet: this week's if still
/// ahead of `now`, otherwise the one a week later.
pub(crate) fn next_occurrence(
    slot: &Slot,
    now: Ms,
    calendar: &UnitCalendar,
) -> Result<(NaiveDate, Span), EngineError> {
    let today = today(now);
    let offset = (i64::from(slot.weekday.number())
        - i64::from(today.weekday().number_from_monday()))
    .rem_euclid(7) as u64;
    let mut date = today + Days::new(offset);
    let mut span = occurrence_span(slot, date, calendar)?;
    if span.start < now {
        date = date + Days::new(7);
        span = occurrence_span(slot, date, calendar)?;
    }
    Ok((date, span))
}

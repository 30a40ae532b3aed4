use chrono::NaiveDate;
use ulid::Ulid;

use crate::calendar::CalendarError;
use crate::model::{UserId, Weekday};

/// Every way an engine operation can be refused. All variants are policy
/// decisions except `WalError`; none of them is worth retrying unchanged.
#[derive(Debug)]
pub enum EngineError {
    Validation {
        field: &'static str,
        reason: String,
    },
    Forbidden(&'static str),
    NotSupervisor {
        slot_id: Ulid,
        user_id: UserId,
    },
    NotFound(Ulid),
    UnknownUser(UserId),
    PastDate(NaiveDate),
    TooFarInFuture {
        max_days: u32,
    },
    NoAccess {
        slot_id: Ulid,
        user_id: UserId,
    },
    WeekdayMismatch {
        date: NaiveDate,
        expected: Weekday,
    },
    AlreadyBooked {
        slot_id: Ulid,
        date: NaiveDate,
    },
    SlotFull {
        slot_id: Ulid,
        date: NaiveDate,
        capacity: u32,
    },
    AlreadyStarted(Ulid),
    AlreadyEnded(Ulid),
    ForceRequired(Ulid),
    Calendar(CalendarError),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        EngineError::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code, used on the wire and as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation { .. } => "validation_error",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::NotSupervisor { .. } => "not_supervisor",
            EngineError::NotFound(_) => "not_found",
            EngineError::UnknownUser(_) => "unknown_user",
            EngineError::PastDate(_) => "past_date",
            EngineError::TooFarInFuture { .. } => "too_far_in_future",
            EngineError::NoAccess { .. } => "no_access",
            EngineError::WeekdayMismatch { .. } => "weekday_mismatch",
            EngineError::AlreadyBooked { .. } => "already_booked",
            EngineError::SlotFull { .. } => "slot_full",
            EngineError::AlreadyStarted(_) => "already_started",
            EngineError::AlreadyEnded(_) => "already_ended",
            EngineError::ForceRequired(_) => "already_started_or_force_required",
            EngineError::Calendar(_) => "calendar_error",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "storage_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation { field, reason } => write!(f, "invalid {field}: {reason}"),
            EngineError::Forbidden(msg) => write!(f, "insufficient permission: {msg}"),
            EngineError::NotSupervisor { slot_id, user_id } => {
                write!(f, "insufficient permission: user {user_id} is not supervisor of slot {slot_id}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::UnknownUser(id) => write!(f, "unknown user: {id}"),
            EngineError::PastDate(date) => write!(f, "can't reserve date in the past: {date}"),
            EngineError::TooFarInFuture { max_days } => {
                write!(f, "date is past allowed date ({max_days} days in the future)")
            }
            EngineError::NoAccess { slot_id, user_id } => {
                write!(f, "user {user_id} does not have access to slot {slot_id}")
            }
            EngineError::WeekdayMismatch { date, expected } => {
                write!(f, "{date} is not a {expected:?}")
            }
            EngineError::AlreadyBooked { slot_id, date } => {
                write!(f, "user is already in slot {slot_id} on {date}")
            }
            EngineError::SlotFull {
                slot_id,
                date,
                capacity,
            } => write!(f, "slot {slot_id} is already full on {date} (capacity {capacity})"),
            EngineError::AlreadyStarted(id) => {
                write!(f, "can't unbook reservation {id}: it has already started")
            }
            EngineError::AlreadyEnded(id) => {
                write!(f, "can't unbook reservation {id}: it has already ended")
            }
            EngineError::ForceRequired(id) => write!(
                f,
                "reservation {id} has already started; students can't unbook it, force to remove it regardless"
            ),
            EngineError::Calendar(e) => write!(f, "calendar error: {e}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<CalendarError> for EngineError {
    fn from(e: CalendarError) -> Self {
        EngineError::Calendar(e)
    }
}

use chrono::{NaiveDate, NaiveTime};

use crate::model::{Ms, Span};

/// Start times of the default school day, unit 1 first. Units from 17:00 on are
/// really 45 minutes long; the schedule treats them as regular periods anyway.
const DEFAULT_UNITS: [(u32, u32); 16] = [
    (8, 0),
    (8, 50),
    (9, 50),
    (10, 40),
    (11, 30),
    (12, 30),
    (13, 20),
    (14, 10),
    (15, 10),
    (16, 0),
    (17, 0),
    (17, 45),
    (18, 45),
    (19, 30),
    (20, 15),
    (21, 0),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarError {
    OutOfRange { unit: u32, max: u32 },
    BadTime(String),
    Empty,
    NotIncreasing(usize),
}

impl std::fmt::Display for CalendarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalendarError::OutOfRange { unit, max } => {
                write!(f, "school unit {unit} out of range [1, {max}]")
            }
            CalendarError::BadTime(s) => write!(f, "invalid unit start time: {s:?} (expected HH:MM)"),
            CalendarError::Empty => write!(f, "calendar has no units"),
            CalendarError::NotIncreasing(unit) => {
                write!(f, "unit {unit} does not start after the previous unit")
            }
        }
    }
}

impl std::error::Error for CalendarError {}

/// Maps school-unit indices (1-based) to wall-clock start times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitCalendar {
    starts: Vec<NaiveTime>,
}

impl Default for UnitCalendar {
    fn default() -> Self {
        Self {
            starts: DEFAULT_UNITS
                .iter()
                .filter_map(|&(h, m)| NaiveTime::from_hms_opt(h, m, 0))
                .collect(),
        }
    }
}

impl UnitCalendar {
    pub fn new(starts: Vec<NaiveTime>) -> Result<Self, CalendarError> {
        if starts.is_empty() {
            return Err(CalendarError::Empty);
        }
        for (i, pair) in starts.windows(2).enumerate() {
            if pair[1] <= pair[0] {
                return Err(CalendarError::NotIncreasing(i + 2));
            }
        }
        Ok(Self { starts })
    }

    /// Parse a comma-separated `HH:MM` list, e.g. `"08:00,08:50,09:50"`.
    pub fn parse(list: &str) -> Result<Self, CalendarError> {
        let starts = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| NaiveTime::parse_from_str(s, "%H:%M").map_err(|_| CalendarError::BadTime(s.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(starts)
    }

    pub fn max_unit(&self) -> u32 {
        self.starts.len() as u32
    }

    pub fn unit_start_time(&self, unit: u32) -> Result<NaiveTime, CalendarError> {
        if unit == 0 || unit > self.max_unit() {
            return Err(CalendarError::OutOfRange {
                unit,
                max: self.max_unit(),
            });
        }
        Ok(self.starts[(unit - 1) as usize])
    }

    /// Concrete UTC span of a slot occurrence on `date`: from the start of
    /// `start_unit` to the start of `start_unit + duration`.
    pub fn span_on(&self, date: NaiveDate, start_unit: u32, duration: u32) -> Result<Span, CalendarError> {
        let start = self.unit_start_time(start_unit)?;
        let end = self.unit_start_time(start_unit.saturating_add(duration))?;
        Ok(Span::new(to_ms(date, start), to_ms(date, end)))
    }
}

pub(crate) fn to_ms(date: NaiveDate, time: NaiveTime) -> Ms {
    date.and_time(time).and_utc().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_calendar_has_sixteen_units() {
        let cal = UnitCalendar::default();
        assert_eq!(cal.max_unit(), 16);
        assert_eq!(cal.unit_start_time(1).unwrap(), NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        assert_eq!(cal.unit_start_time(16).unwrap(), NaiveTime::from_hms_opt(21, 0, 0).unwrap());
    }

    #[test]
    fn unit_zero_and_past_end_are_out_of_range() {
        let cal = UnitCalendar::default();
        assert_eq!(
            cal.unit_start_time(0),
            Err(CalendarError::OutOfRange { unit: 0, max: 16 })
        );
        assert_eq!(
            cal.unit_start_time(17),
            Err(CalendarError::OutOfRange { unit: 17, max: 16 })
        );
    }

    #[test]
    fn span_ends_at_start_of_following_unit() {
        let cal = UnitCalendar::default();
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let span = cal.span_on(date, 1, 2).unwrap();
        let eight = to_ms(date, NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        let nine_fifty = to_ms(date, NaiveTime::from_hms_opt(9, 50, 0).unwrap());
        assert_eq!(span, Span::new(eight, nine_fifty));
    }

    #[test]
    fn span_past_last_unit_fails() {
        let cal = UnitCalendar::default();
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        assert!(cal.span_on(date, 15, 2).is_err());
        assert!(cal.span_on(date, 15, 1).is_ok());
    }

    #[test]
    fn parse_custom_calendar() {
        let cal = UnitCalendar::parse("07:30, 08:20,09:10").unwrap();
        assert_eq!(cal.max_unit(), 3);
        assert_eq!(cal.unit_start_time(2).unwrap(), NaiveTime::from_hms_opt(8, 20, 0).unwrap());
    }

    #[test]
    fn parse_rejects_garbage_and_disorder() {
        assert_eq!(UnitCalendar::parse(""), Err(CalendarError::Empty));
        assert!(matches!(UnitCalendar::parse("8am"), Err(CalendarError::BadTime(_))));
        assert_eq!(
            UnitCalendar::parse("09:00,08:00"),
            Err(CalendarError::NotIncreasing(2))
        );
    }
}

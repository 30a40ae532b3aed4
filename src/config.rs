use std::path::PathBuf;
use std::str::FromStr;

use crate::calendar::{CalendarError, UnitCalendar};
use crate::engine::BookingPolicy;
use crate::limits::MAX_LOOKAHEAD_DAYS;

/// Server settings, read once from `SLOTBOOK_*` environment variables.
/// Unparseable numbers fall back to their defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub token: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// JSON user directory; without one every caller is unknown.
    pub directory: Option<PathBuf>,
    pub calendar: UnitCalendar,
    pub policy: BookingPolicy,
}

#[derive(Debug)]
pub enum ConfigError {
    Calendar(CalendarError),
    Lookahead { var: &'static str, days: u32 },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Calendar(e) => write!(f, "SLOTBOOK_SCHOOL_UNITS: {e}"),
            ConfigError::Lookahead { var, days } => {
                write!(f, "{var}: {days} days exceeds the maximum of {MAX_LOOKAHEAD_DAYS}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5480,
            data_dir: PathBuf::from("./data"),
            token: "slotbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            directory: None,
            calendar: UnitCalendar::default(),
            policy: BookingPolicy::default(),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Option<T> {
    lookup(var).and_then(|s| s.trim().parse().ok())
}

fn lookahead(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u32,
) -> Result<u32, ConfigError> {
    let days = parsed(lookup, var).unwrap_or(default);
    if days > MAX_LOOKAHEAD_DAYS {
        return Err(ConfigError::Lookahead { var, days });
    }
    Ok(days)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let calendar = match lookup("SLOTBOOK_SCHOOL_UNITS") {
            Some(list) => UnitCalendar::parse(&list).map_err(ConfigError::Calendar)?,
            None => defaults.calendar,
        };
        let policy = BookingPolicy {
            student_lookahead_days: lookahead(
                &lookup,
                "SLOTBOOK_STUDENT_LOOKAHEAD_DAYS",
                defaults.policy.student_lookahead_days,
            )?,
            supervisor_lookahead_days: lookahead(
                &lookup,
                "SLOTBOOK_SUPERVISOR_LOOKAHEAD_DAYS",
                defaults.policy.supervisor_lookahead_days,
            )?,
            my_slots_window_days: lookahead(
                &lookup,
                "SLOTBOOK_MY_SLOTS_WINDOW_DAYS",
                defaults.policy.my_slots_window_days,
            )?,
        };

        Ok(Self {
            bind: lookup("SLOTBOOK_BIND").unwrap_or(defaults.bind),
            port: parsed(&lookup, "SLOTBOOK_PORT").unwrap_or(defaults.port),
            data_dir: lookup("SLOTBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            token: lookup("SLOTBOOK_TOKEN").unwrap_or(defaults.token),
            max_connections: parsed(&lookup, "SLOTBOOK_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "SLOTBOOK_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "SLOTBOOK_METRICS_PORT"),
            directory: lookup("SLOTBOOK_DIRECTORY").map(PathBuf::from),
            calendar,
            policy,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotbook.wal")
    }
}

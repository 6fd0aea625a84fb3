//! Next-fire-time calculation for recurring schedules.
//!
//! Everything here is pure: the caller supplies `now`, so results are
//! deterministic and can be evaluated in any [`TimeZone`]. Comparisons use
//! `<=` so a slot exactly equal to `now` counts as already past.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ScheduleConfig, ScheduleType};

const DAY_NAMES: [&str; 7] = [
    "Sunday",
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
];

/// Why a schedule type/config pair cannot produce fire times.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("unrecognized schedule type: {0}")]
    UnknownType(String),

    #[error("minute out of range: {0}")]
    MinuteOutOfRange(u32),

    #[error("day of week out of range: {0}")]
    DayOutOfRange(u32),

    #[error("malformed time (expected HH:MM): {0:?}")]
    MalformedTime(String),

    #[error("unreadable schedule config: {0}")]
    MalformedConfig(String),
}

/// A validated recurrence rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Every hour at `minute`.
    Hourly { minute: u32 },
    /// Every day at `hour:minute`.
    Daily { hour: u32, minute: u32 },
    /// Every week on `day_of_week` (0 = Sunday) at `hour:minute`.
    Weekly {
        day_of_week: u32,
        hour: u32,
        minute: u32,
    },
}

impl Schedule {
    /// Validate a stored type/config pair, applying the field defaults
    /// (minute 0, time "00:00", Sunday).
    pub fn parse(
        schedule_type: &ScheduleType,
        config: &ScheduleConfig,
    ) -> Result<Self, ScheduleError> {
        if let Some(raw) = &config.malformed {
            return Err(ScheduleError::MalformedConfig(raw.to_string()));
        }

        match schedule_type {
            ScheduleType::Hourly => {
                let minute = config.minute.unwrap_or(0);
                if minute > 59 {
                    return Err(ScheduleError::MinuteOutOfRange(minute));
                }
                Ok(Schedule::Hourly { minute })
            }
            ScheduleType::Daily => {
                let (hour, minute) = parse_time(config.time.as_deref())?;
                Ok(Schedule::Daily { hour, minute })
            }
            ScheduleType::Weekly => {
                let (hour, minute) = parse_time(config.time.as_deref())?;
                let day_of_week = config.day_of_week.unwrap_or(0);
                if day_of_week > 6 {
                    return Err(ScheduleError::DayOutOfRange(day_of_week));
                }
                Ok(Schedule::Weekly {
                    day_of_week,
                    hour,
                    minute,
                })
            }
            ScheduleType::Other(other) => Err(ScheduleError::UnknownType(other.clone())),
        }
    }

    /// Every current schedule kind repeats after firing.
    pub fn is_recurring(&self) -> bool {
        true
    }

    /// The first fire time strictly after `now`, in `now`'s time zone.
    pub fn next_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = now.timezone();
        let today = now.date_naive();

        match *self {
            Schedule::Hourly { minute } => {
                let slot = now
                    .naive_local()
                    .with_minute(minute)?
                    .with_second(0)?
                    .with_nanosecond(0)?;
                let target = resolve_local(&tz, slot)?;
                if target <= *now {
                    Some(target + Duration::hours(1))
                } else {
                    Some(target)
                }
            }
            Schedule::Daily { hour, minute } => {
                let target = at_time(&tz, today, hour, minute)?;
                if target <= *now {
                    at_time(&tz, today.succ_opt()?, hour, minute)
                } else {
                    Some(target)
                }
            }
            Schedule::Weekly {
                day_of_week,
                hour,
                minute,
            } => {
                let target = at_time(&tz, today, hour, minute)?;
                let mut days_until =
                    i64::from(day_of_week) - i64::from(now.weekday().num_days_from_sunday());
                if days_until < 0 || (days_until == 0 && target <= *now) {
                    days_until += 7;
                }
                let day = today.checked_add_signed(Duration::days(days_until))?;
                at_time(&tz, day, hour, minute)
            }
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Schedule::Hourly { minute } => write!(f, "Every hour at minute {minute}"),
            Schedule::Daily { hour, minute } => write!(f, "Daily at {hour:02}:{minute:02}"),
            Schedule::Weekly {
                day_of_week,
                hour,
                minute,
            } => write!(
                f,
                "Every {} at {hour:02}:{minute:02}",
                DAY_NAMES
                    .get(day_of_week as usize)
                    .copied()
                    .unwrap_or("unknown day")
            ),
        }
    }
}

/// Compute the next fire time for a stored schedule, or `None` when the
/// schedule type is unrecognized or its config is malformed.
pub fn next_fire_time<Tz: TimeZone>(
    schedule_type: &ScheduleType,
    config: &ScheduleConfig,
    now: &DateTime<Tz>,
) -> Option<DateTime<Tz>> {
    Schedule::parse(schedule_type, config)
        .ok()?
        .next_after(now)
}

/// Human-readable description of a stored schedule.
pub fn describe(schedule_type: &ScheduleType, config: &ScheduleConfig) -> String {
    match Schedule::parse(schedule_type, config) {
        Ok(schedule) => schedule.to_string(),
        Err(_) => "Unknown schedule".to_string(),
    }
}

/// Wall-clock zone that schedules are evaluated in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    /// The host's local time zone.
    #[default]
    Local,
    Utc,
}

impl Zone {
    /// Evaluate `schedule` against `now` in this zone.
    pub fn next_after(&self, schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Zone::Local => schedule
                .next_after(&now.with_timezone(&chrono::Local))
                .map(|t| t.with_timezone(&Utc)),
            Zone::Utc => schedule.next_after(&now),
        }
    }
}

impl std::str::FromStr for Zone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Zone::Local),
            "utc" => Ok(Zone::Utc),
            other => Err(format!("unknown zone '{other}', expected 'local' or 'utc'")),
        }
    }
}

fn parse_time(time: Option<&str>) -> Result<(u32, u32), ScheduleError> {
    let raw = time.unwrap_or("00:00");
    let malformed = || ScheduleError::MalformedTime(raw.to_string());

    let (hour, minute) = raw.split_once(':').ok_or_else(malformed)?;
    let hour: u32 = hour.trim().parse().map_err(|_| malformed())?;
    let minute: u32 = minute.trim().parse().map_err(|_| malformed())?;
    if hour > 23 || minute > 59 {
        return Err(malformed());
    }
    Ok((hour, minute))
}

fn at_time<Tz: TimeZone>(
    tz: &Tz,
    date: NaiveDate,
    hour: u32,
    minute: u32,
) -> Option<DateTime<Tz>> {
    resolve_local(tz, date.and_hms_opt(hour, minute, 0)?)
}

/// Map a wall-clock time to an instant. Ambiguous times take the earlier
/// instant; times inside a DST gap move forward one hour.
fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
}

//! Simplified cron schedule gate.
//!
//! The schedule accepts only the hour and day-of-week fields, for example
//! "9-18 1-5" covers the working week hours. Replacement actions run only
//! inside the interval; `ScheduleState::Off` inverts that, so actions run
//! only outside it.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use tracing::warn;

use autospot_common::ScheduleState;

use crate::error::{ReplacementError, Result};

/// Parsed "hour day-of-week" crontab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    hours: Vec<bool>,
    days_of_week: Vec<bool>,
}

impl CronSchedule {
    /// Parse a two-field crontab. Each field is `*`, a value, a range
    /// `a-b`, or a comma-separated list of values and ranges. Days of week
    /// run 0-6 with Sunday as 0.
    pub fn parse(crontab: &str) -> Result<Self> {
        let mut fields = crontab.split_whitespace();
        let (hour_field, dow_field) = match (fields.next(), fields.next(), fields.next()) {
            (Some(h), Some(d), None) => (h, d),
            _ => {
                return Err(ReplacementError::Config(format!(
                    "cron schedule must have exactly two fields (hour day-of-week): {crontab:?}"
                )))
            }
        };

        Ok(Self {
            hours: parse_field(hour_field, 24)?,
            days_of_week: parse_field(dow_field, 7)?,
        })
    }

    /// Whether the given instant falls inside the schedule, evaluated in
    /// the given timezone.
    pub fn contains(&self, at: DateTime<Utc>, timezone: Tz) -> bool {
        let local = timezone.from_utc_datetime(&at.naive_utc());
        let hour = local.hour() as usize;
        let dow = local.weekday().num_days_from_sunday() as usize;
        self.hours[hour] && self.days_of_week[dow]
    }
}

fn parse_field(field: &str, size: u32) -> Result<Vec<bool>> {
    let mut allowed = vec![false; size as usize];
    if field == "*" {
        allowed.fill(true);
        return Ok(allowed);
    }

    for part in field.split(',') {
        let (start, end) = match part.split_once('-') {
            Some((a, b)) => (parse_value(a, size)?, parse_value(b, size)?),
            None => {
                let v = parse_value(part, size)?;
                (v, v)
            }
        };
        if start > end {
            return Err(ReplacementError::Config(format!(
                "inverted cron range: {part:?}"
            )));
        }
        for v in start..=end {
            allowed[v as usize] = true;
        }
    }
    Ok(allowed)
}

fn parse_value(value: &str, size: u32) -> Result<u32> {
    let parsed: u32 = value
        .parse()
        .map_err(|_| ReplacementError::Config(format!("invalid cron value: {value:?}")))?;
    if parsed >= size {
        return Err(ReplacementError::Config(format!(
            "cron value out of range: {parsed} (max {})",
            size - 1
        )));
    }
    Ok(parsed)
}

/// Whether replacement actions may run right now under the given schedule
/// configuration. Malformed schedules log and allow the action, so a bad
/// tag cannot freeze a group forever.
pub fn replacement_window_open(
    crontab: &str,
    timezone: &str,
    state: ScheduleState,
    now: DateTime<Utc>,
) -> bool {
    let schedule = match CronSchedule::parse(crontab) {
        Ok(schedule) => schedule,
        Err(error) => {
            warn!(%crontab, %error, "Ignoring malformed cron schedule");
            return true;
        }
    };
    let tz: Tz = match timezone.parse() {
        Ok(tz) => tz,
        Err(_) => {
            warn!(%timezone, "Unknown cron timezone, falling back to UTC");
            chrono_tz::UTC
        }
    };

    let inside = schedule.contains(now, tz);
    match state {
        ScheduleState::On => inside,
        ScheduleState::Off => !inside,
    }
}

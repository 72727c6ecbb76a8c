//! Cron expression parsing and next fire time calculation.
//!
//! Supports standard 5-field cron (`minute hour day month weekday`), the
//! 6-field form with a leading seconds field, and the presets `yearly`,
//! `annually`, `monthly`, `weekly`, `daily`, `midnight`, `hourly` and
//! `minutely` (with or without a leading `@`).
//!
//! Day-of-week numbers follow the usual crontab convention: `0` and `7` are
//! Sunday, `1` is Monday. When both day-of-month and day-of-week are
//! restricted, a day matching either one fires, as in crontab. Evaluation
//! happens in an IANA timezone and results are returned in UTC.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when parsing or evaluating cron expressions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// The expression could not be parsed.
    #[error("invalid cron expression: {0}")]
    InvalidExpression(String),

    /// The timezone is not a known IANA name.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// The expression never fires again.
    #[error("no more occurrences")]
    NoMoreOccurrences,
}

const WEEKDAYS: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];
const WEEKDAY_NAMES: [&str; 7] = [
    "SUNDAY",
    "MONDAY",
    "TUESDAY",
    "WEDNESDAY",
    "THURSDAY",
    "FRIDAY",
    "SATURDAY",
];

/// A parsed cron expression bound to a timezone.
#[derive(Clone)]
pub struct CronExpr {
    expression: String,
    timezone: Tz,
    // Two entries when day-of-month and day-of-week are ORed.
    schedules: Vec<CronSchedule>,
}

impl CronExpr {
    /// Parse `expression`, evaluated in the IANA `timezone`.
    pub fn parse(expression: &str, timezone: &str) -> Result<Self, ScheduleError> {
        let tz = parse_timezone(timezone)?;
        let schedules = normalize(expression)?
            .iter()
            .map(|normalized| {
                CronSchedule::from_str(normalized).map_err(|e| {
                    ScheduleError::InvalidExpression(format!("{}: {}", expression, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            expression: expression.trim().to_string(),
            timezone: tz,
            schedules,
        })
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let local = after.with_timezone(&self.timezone);
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(&local).next())
            .map(|dt| dt.with_timezone(&Utc))
            .min()
            .ok_or(ScheduleError::NoMoreOccurrences)
    }

    /// Up to `n` fire times strictly after `after`, in order.
    pub fn next_n_after(&self, after: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
        let local = after.with_timezone(&self.timezone);
        let mut times: Vec<DateTime<Utc>> = self
            .schedules
            .iter()
            .flat_map(|schedule| schedule.after(&local).take(n))
            .map(|dt| dt.with_timezone(&Utc))
            .collect();
        times.sort_unstable();
        times.dedup();
        times.truncate(n);
        times
    }

    /// The expression as given.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The timezone name.
    pub fn timezone(&self) -> &str {
        self.timezone.name()
    }
}

impl fmt::Debug for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronExpr")
            .field("expression", &self.expression)
            .field("timezone", &self.timezone.name())
            .finish()
    }
}

/// Compute the first fire time of `expression` strictly after `after`.
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use tardy::core::schedule::next_fire_after;
///
/// let after = Utc.with_ymd_and_hms(2024, 1, 1, 23, 0, 0).unwrap();
/// let next = next_fire_after("0 0 * * *", "UTC", after).unwrap();
/// assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
/// ```
pub fn next_fire_after(
    expression: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    CronExpr::parse(expression, timezone)?.next_after(after)
}

fn parse_timezone(timezone: &str) -> Result<Tz, ScheduleError> {
    timezone
        .trim()
        .parse::<Tz>()
        .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))
}

/// Rewrite an expression into the 6-field form the `cron` crate parses.
///
/// The `cron` crate ANDs day-of-month with day-of-week, so an expression
/// restricting both is split into one schedule per field.
fn normalize(expression: &str) -> Result<Vec<String>, ScheduleError> {
    let trimmed = expression.trim();
    if let Some(preset) = preset(trimmed) {
        return normalize(preset);
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    let (seconds, rest) = match fields.len() {
        5 => ("0", &fields[..]),
        6 => (fields[0], &fields[1..]),
        n => {
            return Err(ScheduleError::InvalidExpression(format!(
                "expected 5 or 6 fields, got {}",
                n
            )));
        }
    };

    let weekday = translate_weekdays(rest[4])?;
    let render = |day_of_month: &str, day_of_week: &str| {
        format!(
            "{} {} {} {} {} {}",
            seconds, rest[0], rest[1], day_of_month, rest[3], day_of_week
        )
    };

    if is_restricted(rest[2]) && is_restricted(rest[4]) {
        Ok(vec![render(rest[2], "*"), render("*", &weekday)])
    } else {
        Ok(vec![render(rest[2], &weekday)])
    }
}

/// Crontab treats a day field starting with `*` as unrestricted.
fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field == "?")
}

fn preset(expression: &str) -> Option<&'static str> {
    let name = expression.strip_prefix('@').unwrap_or(expression);
    match name.to_ascii_lowercase().as_str() {
        "yearly" | "annually" => Some("0 0 1 1 *"),
        "monthly" => Some("0 0 1 * *"),
        "weekly" => Some("0 0 * * 0"),
        "daily" | "midnight" => Some("0 0 * * *"),
        "hourly" => Some("0 * * * *"),
        "minutely" => Some("* * * * *"),
        _ => None,
    }
}

/// Translate crontab day-of-week numbers (0-7, Sunday based) into names.
///
/// The `cron` crate numbers weekdays 1-7 starting at Sunday, so numeric
/// lists and ranges are expanded into explicit names. `*` and `*/n` pass
/// through since both conventions agree on them.
fn translate_weekdays(field: &str) -> Result<String, ScheduleError> {
    if field == "*" || field == "?" || field.starts_with("*/") {
        return Ok(field.to_string());
    }

    let mut days: Vec<usize> = Vec::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, parse_step(step, field)?),
            None => (part, 1),
        };

        let (start, end) = match range.split_once('-') {
            Some((a, b)) => (weekday_index(a, field)?, weekday_index(b, field)?),
            None => {
                let start = weekday_index(range, field)?;
                // "a/n" runs to the end of the week
                (start, if step > 1 { 6 } else { start })
            }
        };
        if start > end {
            return Err(ScheduleError::InvalidExpression(format!(
                "day-of-week range out of order: {}",
                field
            )));
        }

        for day in (start..=end).step_by(step) {
            let day = day % 7;
            if !days.contains(&day) {
                days.push(day);
            }
        }
    }

    days.sort_unstable();
    Ok(days
        .into_iter()
        .map(|d| WEEKDAYS[d])
        .collect::<Vec<_>>()
        .join(","))
}

fn weekday_index(token: &str, field: &str) -> Result<usize, ScheduleError> {
    let token = token.trim();
    if let Ok(n) = token.parse::<usize>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(ScheduleError::InvalidExpression(format!(
                "day-of-week out of range: {}",
                field
            )))
        };
    }

    let upper = token.to_ascii_uppercase();
    WEEKDAYS[..7]
        .iter()
        .zip(WEEKDAY_NAMES)
        .position(|(short, full)| *short == upper || full == upper)
        .ok_or_else(|| ScheduleError::InvalidExpression(format!("bad day-of-week: {}", field)))
}

fn parse_step(step: &str, field: &str) -> Result<usize, ScheduleError> {
    match step.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ScheduleError::InvalidExpression(format!(
            "bad day-of-week step: {}",
            field
        ))),
    }
}

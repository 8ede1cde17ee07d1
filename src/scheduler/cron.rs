//! Cron expression handling.
//!
//! Accepts standard 5-field expressions (`min hour dom month dow`) as well as
//! the 6/7-field form with leading seconds used by the `cron` crate.
//!
//! The two forms number weekdays differently. Standard cron counts 0-7 with
//! Sunday as both 0 and 7; the `cron` crate counts 1-7 with Sunday as 1. The
//! day-of-week field of a 5-field expression is rewritten as day names before
//! it reaches the crate. 6/7-field expressions are passed through untouched.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use ::cron::Schedule as CronSchedule;

use super::SchedulerError;

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Parse and validate a cron expression.
pub fn parse(expr: &str) -> Result<CronSchedule, SchedulerError> {
    let invalid = |reason: String| SchedulerError::InvalidCron {
        expr: expr.to_string(),
        reason,
    };

    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = match fields.len() {
        5 => {
            let days = day_of_week_field(fields[4]).map_err(invalid)?;
            format!("0 {} {}", fields[..4].join(" "), days)
        }
        6 | 7 => fields.join(" "),
        n => return Err(invalid(format!("expected 5 to 7 fields, found {}", n))),
    };

    CronSchedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Rewrite a standard day-of-week field as an explicit list of day names.
fn day_of_week_field(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = [false; 7];
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => match step.parse::<usize>() {
                Ok(step) if step > 0 => (base, Some(step)),
                _ => return Err(format!("invalid day-of-week step '{}'", item)),
            },
            None => (item, None),
        };

        let (start, end) = match base.split_once('-') {
            _ if base == "*" || base == "?" => (0, 6),
            Some((from, to)) => {
                let start = day_number(from)?;
                let end = day_number(to)?;
                // `Fri-Sun` wraps to Sunday as 7.
                (start, if end == 0 && start > 0 { 7 } else { end })
            }
            None => {
                let day = day_number(base)?;
                (day, if step.is_some() { day.max(6) } else { day })
            }
        };
        if start > end {
            return Err(format!("invalid day-of-week range '{}'", base));
        }

        for day in (start..=end).step_by(step.unwrap_or(1)) {
            days[day % 7] = true;
        }
    }

    let names: Vec<&str> = DAY_NAMES
        .iter()
        .zip(days)
        .filter_map(|(name, on)| on.then_some(*name))
        .collect();
    Ok(names.join(","))
}

/// A weekday number 0-7 or a three-letter name. Sunday is 0.
fn day_number(token: &str) -> Result<usize, String> {
    match token.parse::<usize>() {
        Ok(n) if n <= 7 => Ok(n),
        Ok(n) => Err(format!("day-of-week {} out of range", n)),
        Err(_) => DAY_NAMES
            .iter()
            .position(|name| name.eq_ignore_ascii_case(token))
            .ok_or_else(|| format!("unknown day-of-week '{}'", token)),
    }
}

/// The first tick strictly after `after`.
pub fn next_tick(schedule: &CronSchedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Every tick in `(from, until]`.
pub fn ticks_between(
    schedule: &CronSchedule,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    schedule.after(&from).take_while(|t| *t <= until).collect()
}

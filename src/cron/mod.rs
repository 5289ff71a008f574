//! Cron expression evaluation: validation, next-fire computation in a named
//! timezone, and human-readable descriptions.
//!
//! Expressions are standard 5-field cron (minute hour day-of-month month
//! day-of-week). The `cron` crate requires a seconds field, so expressions
//! are normalized by prepending `0` before parsing.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tracing::warn;

/// Normalize a 5-field expression to the 6-field form the `cron` crate
/// parses. Returns `None` when the field count is wrong.
fn normalize(expr: &str) -> Option<String> {
    if expr.split_whitespace().count() == 5 {
        Some(format!("0 {}", expr))
    } else {
        None
    }
}

/// True iff `expr` parses as a standard 5-field cron expression.
pub fn validate(expr: &str) -> bool {
    normalize(expr).is_some_and(|n| n.parse::<Schedule>().is_ok())
}

/// Resolve an IANA timezone name, silently falling back to UTC for unknown
/// names (logged once per call).
fn resolve_tz(tz_name: &str) -> Tz {
    match tz_name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!("Invalid timezone '{}', falling back to UTC", tz_name);
            Tz::UTC
        }
    }
}

/// Strictly-future next fire instant of `expr` in the named timezone,
/// evaluated from `from`. Returns `None` for unparsable expressions or
/// schedules with no future occurrence.
pub fn next_run(expr: &str, tz_name: &str, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let schedule = normalize(expr)?.parse::<Schedule>().ok()?;
    let local = from.with_timezone(&resolve_tz(tz_name));
    schedule
        .after(&local)
        .next()
        .map(|next| next.with_timezone(&Utc))
}

/// `next_run` over Unix epoch seconds, the representation jobs persist.
pub fn next_run_timestamp(expr: &str, tz_name: &str, from_ts: i64) -> Option<i64> {
    let from = DateTime::from_timestamp(from_ts, 0)?;
    next_run(expr, tz_name, from).map(|dt| dt.timestamp())
}

/// Human-readable description of common schedule patterns. Falls back to the
/// raw expression for anything it does not recognize.
pub fn describe(expr: &str) -> String {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    if parts.len() != 5 {
        return expr.to_string();
    }
    let (minute, hour, day, month, weekday) = (parts[0], parts[1], parts[2], parts[3], parts[4]);

    if expr == "* * * * *" {
        return "Every minute".to_string();
    }
    if minute != "*" && hour != "*" && day == "*" && month == "*" && weekday == "*" {
        return format!("Daily at {}:{:0>2}", hour, minute);
    }
    if minute != "*" && hour != "*" && weekday != "*" && day == "*" && month == "*" {
        let day_str = match weekday {
            "0" | "7" => "Sunday",
            "1" => "Monday",
            "2" => "Tuesday",
            "3" => "Wednesday",
            "4" => "Thursday",
            "5" => "Friday",
            "6" => "Saturday",
            "1-5" => "weekdays",
            "0,6" => "weekends",
            other => other,
        };
        return format!("Every {} at {}:{:0>2}", day_str, hour, minute);
    }
    expr.to_string()
}

#[cfg(test)]
mod tests;

use super::*;
use chrono::TimeZone;

#[test]
fn test_validate_accepts_standard_expressions() {
    assert!(validate("* * * * *"));
    assert!(validate("*/5 * * * *"));
    assert!(validate("0 9 * * 1-5"));
    assert!(validate("30 8,20 1 * *"));
}

#[test]
fn test_validate_rejects_wrong_field_count() {
    assert!(!validate("* * * *"));
    assert!(!validate("0 0 9 * * *"));
    assert!(!validate(""));
}

#[test]
fn test_validate_rejects_garbage() {
    assert!(!validate("not a cron at all x"));
    assert!(!validate("99 99 99 99 99"));
}

#[test]
fn test_next_run_five_minute_boundary() {
    let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 2, 0).unwrap();
    let next = next_run("*/5 * * * *", "UTC", from).unwrap();
    assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap());
}

#[test]
fn test_next_run_is_strictly_future() {
    // From exactly on a boundary, the next fire is the following boundary.
    let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap();
    let next = next_run("*/5 * * * *", "UTC", from).unwrap();
    assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 0).unwrap());
}

#[test]
fn test_next_run_monotonic_composition() {
    let t = Utc.with_ymd_and_hms(2024, 6, 15, 11, 7, 3).unwrap();
    let first = next_run("*/15 * * * *", "UTC", t).unwrap();
    let second = next_run("*/15 * * * *", "UTC", first).unwrap();
    assert!(first > t);
    assert!(second > first);
}

#[test]
fn test_next_run_respects_timezone() {
    // 09:00 in New York is 14:00 UTC in January (EST, UTC-5).
    let from = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
    let next = next_run("0 9 * * *", "America/New_York", from).unwrap();
    assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 10, 14, 0, 0).unwrap());
}

#[test]
fn test_next_run_unknown_timezone_falls_back_to_utc() {
    let from = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
    let next = next_run("0 9 * * *", "Not/AZone", from).unwrap();
    assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 10, 9, 0, 0).unwrap());
}

#[test]
fn test_next_run_invalid_expression_returns_none() {
    let from = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
    assert!(next_run("bogus", "UTC", from).is_none());
}

#[test]
fn test_next_run_timestamp_round_trips_seconds() {
    let from_ts = Utc
        .with_ymd_and_hms(2024, 1, 1, 0, 2, 0)
        .unwrap()
        .timestamp();
    let next_ts = next_run_timestamp("*/5 * * * *", "UTC", from_ts).unwrap();
    assert_eq!(next_ts - from_ts, 180);
}

#[test]
fn test_describe_common_patterns() {
    assert_eq!(describe("* * * * *"), "Every minute");
    assert_eq!(describe("0 9 * * *"), "Daily at 9:00");
    assert_eq!(describe("30 8 * * 1"), "Every Monday at 8:30");
    assert_eq!(describe("0 9 * * 1-5"), "Every weekdays at 9:00");
}

#[test]
fn test_describe_falls_back_to_raw_expression() {
    assert_eq!(describe("*/5 * * * *"), "*/5 * * * *");
    assert_eq!(describe("not five fields"), "not five fields");
}

use super::*;
use chrono::Timelike;

// 2026-01-15T12:00:00Z
const ANCHOR: i64 = 1_768_478_400_000;

#[test]
fn relative_hours() {
    assert_eq!(
        parse_relative("+2h", ANCHOR).unwrap(),
        ANCHOR + 2 * 3600 * 1000
    );
}

#[test]
fn relative_compound() {
    let ms = parse_relative("+1Y2M3D", ANCHOR).unwrap();
    let dt = Utc.timestamp_millis_opt(ms).single().unwrap();
    // 2026-01-15 + 1 year + 2 months + 3 days = 2027-03-18
    assert_eq!(dt.format("%Y-%m-%d").to_string(), "2027-03-18");
    assert_eq!(dt.hour(), 12);
}

#[test]
fn relative_negative() {
    assert_eq!(parse_relative("-30m", ANCHOR).unwrap(), ANCHOR - 30 * 60 * 1000);
}

#[test]
fn relative_units_are_case_sensitive() {
    // 'm' is minutes, 'M' is months
    let minutes = parse_relative("+2m", ANCHOR).unwrap();
    let months = parse_relative("+2M", ANCHOR).unwrap();
    assert_eq!(minutes, ANCHOR + 2 * 60 * 1000);
    assert!(months > ANCHOR + 50 * 24 * 3600 * 1000);
}

#[test]
fn relative_rejects_garbage() {
    for bad in ["2h", "+", "+h", "+2x", "", "+2h3", "later"] {
        assert!(parse_relative(bad, ANCHOR).is_err(), "accepted {:?}", bad);
    }
}

#[test]
fn relative_month_clamps_to_end_of_month() {
    // 2026-01-31T00:00:00Z + 1 month -> 2026-02-28 (chrono clamps)
    let jan31 = Utc.with_ymd_and_hms(2026, 1, 31, 0, 0, 0).unwrap();
    let ms = parse_relative("+1M", jan31.timestamp_millis()).unwrap();
    let dt = Utc.timestamp_millis_opt(ms).single().unwrap();
    assert_eq!(dt.format("%Y-%m-%d").to_string(), "2026-02-28");
}

#[test]
fn deliver_at_accepts_iso_with_offset() {
    let ms = parse_deliver_at("2026-03-01T09:00:00+09:00", ANCHOR).unwrap();
    let dt = Utc.timestamp_millis_opt(ms).single().unwrap();
    assert_eq!(dt.format("%Y-%m-%dT%H:%M").to_string(), "2026-03-01T00:00");
}

#[test]
fn deliver_at_accepts_relative() {
    assert_eq!(
        parse_deliver_at("+1h", ANCHOR).unwrap(),
        ANCHOR + 3600 * 1000
    );
}

#[test]
fn format_in_tz_renders_numeric_offset() {
    let tz: Tz = "Asia/Tokyo".parse().unwrap();
    let rendered = format_in_tz(ANCHOR, &tz);
    assert_eq!(rendered, "2026-01-15T21:00:00+09:00");
}

#[test]
fn parse_timezone_rejects_unknown() {
    assert!(parse_timezone("Mars/Olympus").is_err());
    assert!(parse_timezone("Asia/Tokyo").is_ok());
}

#[test]
fn clock_time_bounds() {
    assert_eq!(parse_clock_time("09:30").unwrap(), (9, 30));
    assert_eq!(parse_clock_time("00:00").unwrap(), (0, 0));
    assert!(parse_clock_time("24:00").is_err());
    assert!(parse_clock_time("12:60").is_err());
    assert!(parse_clock_time("noon").is_err());
}

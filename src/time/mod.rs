//! Wall-clock and timezone utilities.
//!
//! All persisted timestamps are Unix epoch milliseconds UTC. Anything shown
//! to a human is rendered in the configured boss timezone with a numeric
//! offset.

use crate::errors::{HibossError, HibossResult};
use chrono::{DateTime, Days, Months, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as epoch milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Detect the host's IANA timezone (e.g. "America/New_York").
pub fn detect_host_timezone() -> Option<String> {
    iana_time_zone::get_timezone().ok()
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> HibossResult<Tz> {
    name.parse::<Tz>()
        .map_err(|_| HibossError::validation(format!("Unknown timezone '{}'", name)))
}

/// Render epoch milliseconds as ISO-8601 in the given timezone, with a
/// numeric offset (e.g. `2026-03-01T09:00:00+09:00`).
pub fn format_in_tz(ms: i64, tz: &Tz) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(dt) => dt
            .with_timezone(tz)
            .to_rfc3339_opts(SecondsFormat::Secs, false),
        None => format!("{}ms", ms),
    }
}

/// Parse a `deliver-at` value: either a relative duration (`+2h`, `-30m`,
/// `+1Y2M3D`) anchored at `now`, or an absolute ISO-8601 timestamp carrying
/// an offset.
pub fn parse_deliver_at(input: &str, now: i64) -> HibossResult<i64> {
    let input = input.trim();
    if input.is_empty() {
        return Err(HibossError::validation("Empty deliver-at value"));
    }
    if input.starts_with('+') || (input.starts_with('-') && !looks_like_iso(input)) {
        return parse_relative(input, now);
    }
    DateTime::parse_from_rfc3339(input)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| HibossError::validation(format!("Invalid timestamp '{}': {}", input, e)))
}

// ISO-8601 timestamps always carry a date separator in the first segment.
fn looks_like_iso(input: &str) -> bool {
    input.len() > 4 && input.as_bytes()[1].is_ascii_digit() && input.contains('-') && input.contains(':')
}

/// Parse a signed relative duration per the grammar
/// `("+"/"-") 1*( 1*DIGIT Unit )` with case-sensitive units `Y M D h m s`.
///
/// `Y` and `M` are calendar-aware (month arithmetic on the anchor instant);
/// `D`, `h`, `m`, `s` are fixed-length.
pub fn parse_relative(input: &str, now: i64) -> HibossResult<i64> {
    let bad = || HibossError::validation(format!("Invalid relative time '{}'", input));

    let mut chars = input.chars().peekable();
    let negative = match chars.next() {
        Some('+') => false,
        Some('-') => true,
        _ => return Err(bad()),
    };

    let anchor = Utc
        .timestamp_millis_opt(now)
        .single()
        .ok_or_else(|| HibossError::validation("Anchor timestamp out of range"))?;

    let mut months: u32 = 0;
    let mut days: u64 = 0;
    let mut seconds: i64 = 0;
    let mut saw_component = false;

    while chars.peek().is_some() {
        let mut value: i64 = 0;
        let mut saw_digit = false;
        while let Some(c) = chars.peek().copied() {
            if let Some(d) = c.to_digit(10) {
                value = value
                    .checked_mul(10)
                    .and_then(|v| v.checked_add(i64::from(d)))
                    .ok_or_else(bad)?;
                saw_digit = true;
                chars.next();
            } else {
                break;
            }
        }
        if !saw_digit {
            return Err(bad());
        }
        match chars.next() {
            Some('Y') => months = months.checked_add(value as u32 * 12).ok_or_else(bad)?,
            Some('M') => months = months.checked_add(value as u32).ok_or_else(bad)?,
            Some('D') => days = days.checked_add(value as u64).ok_or_else(bad)?,
            Some('h') => seconds += value * 3600,
            Some('m') => seconds += value * 60,
            Some('s') => seconds += value,
            _ => return Err(bad()),
        }
        saw_component = true;
    }

    if !saw_component {
        return Err(bad());
    }

    let shifted = if negative {
        anchor
            .checked_sub_months(Months::new(months))
            .and_then(|dt| dt.checked_sub_days(Days::new(days)))
            .and_then(|dt| dt.checked_sub_signed(chrono::Duration::seconds(seconds)))
    } else {
        anchor
            .checked_add_months(Months::new(months))
            .and_then(|dt| dt.checked_add_days(Days::new(days)))
            .and_then(|dt| dt.checked_add_signed(chrono::Duration::seconds(seconds)))
    };

    shifted
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| HibossError::validation(format!("Relative time '{}' out of range", input)))
}

/// Parse an `HH:MM` wall-clock time. Returns (hour, minute).
pub fn parse_clock_time(input: &str) -> HibossResult<(u32, u32)> {
    let bad = || HibossError::validation(format!("Invalid clock time '{}' (expected HH:MM)", input));
    let (h, m) = input.split_once(':').ok_or_else(bad)?;
    let hour: u32 = h.parse().map_err(|_| bad())?;
    let minute: u32 = m.parse().map_err(|_| bad())?;
    if hour > 23 || minute > 59 {
        return Err(bad());
    }
    Ok((hour, minute))
}

#[cfg(test)]
mod tests;

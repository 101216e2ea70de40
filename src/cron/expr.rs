//! Cron expression normalization and occurrence derivation.

use crate::errors::{HibossError, HibossResult};
use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

/// Normalize an expression to the 6-field (with seconds) form and validate
/// it parses. Accepts standard 5-field, 6-field, and the `@daily` family.
pub fn normalize_cron_expr(expr: &str) -> HibossResult<String> {
    let trimmed = expr.trim();
    let expanded = match trimmed {
        "@yearly" | "@annually" => "0 0 0 1 1 *".to_string(),
        "@monthly" => "0 0 0 1 * *".to_string(),
        "@weekly" => "0 0 0 * * Sun".to_string(),
        "@daily" | "@midnight" => "0 0 0 * * *".to_string(),
        "@hourly" => "0 0 * * * *".to_string(),
        other => {
            if other.split_whitespace().count() == 5 {
                format!("0 {}", other)
            } else {
                other.to_string()
            }
        }
    };
    Schedule::from_str(&expanded).map_err(|e| {
        HibossError::validation(format!("Invalid cron expression '{}': {}", expr, e))
    })?;
    Ok(expanded)
}

/// The next occurrence strictly after `after_ms`, evaluated in `tz`.
/// `None` when the schedule has no future occurrence.
pub fn next_occurrence(normalized: &str, tz: &Tz, after_ms: i64) -> HibossResult<Option<i64>> {
    let schedule = Schedule::from_str(normalized).map_err(|e| {
        HibossError::validation(format!("Invalid cron expression '{}': {}", normalized, e))
    })?;
    let Some(after) = Utc.timestamp_millis_opt(after_ms).single() else {
        return Err(HibossError::validation("Timestamp out of range"));
    };
    let after = after.with_timezone(tz);
    Ok(schedule.after(&after).next().map(|dt| dt.timestamp_millis()))
}

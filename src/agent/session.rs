//! Session refresh policy evaluation.

use crate::agent::types::SessionPolicy;
use crate::time::parse_clock_time;
use chrono::{Local, TimeZone, Utc};

/// The facts about a live session the policy is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct SessionMeta {
    pub created_at: i64,
    pub last_run_completed_at: Option<i64>,
    pub last_context_length: Option<u64>,
}

/// The most recent instant the wall clock read `hour:minute` in `tz`, at or
/// before `now_ms`.
pub(crate) fn most_recent_occurrence_ms<Z: TimeZone>(
    hour: u32,
    minute: u32,
    now_ms: i64,
    tz: &Z,
) -> Option<i64> {
    let now = Utc.timestamp_millis_opt(now_ms).single()?.with_timezone(tz);
    let mut date = now.date_naive();
    loop {
        let naive = date.and_hms_opt(hour, minute, 0)?;
        // earliest() handles DST folds; a nonexistent local time (spring
        // forward) walks back a day
        if let Some(candidate) = tz.from_local_datetime(&naive).earliest() {
            let candidate_ms = candidate.timestamp_millis();
            if candidate_ms <= now_ms {
                return Some(candidate_ms);
            }
        }
        date = date.pred_opt()?;
    }
}

/// Decide whether the session must be refreshed before the next run.
/// Returns the reason, or `None` to keep the session.
pub fn evaluate_refresh(policy: &SessionPolicy, meta: &SessionMeta, now: i64) -> Option<String> {
    evaluate_refresh_in(policy, meta, now, &Local)
}

pub(crate) fn evaluate_refresh_in<Z: TimeZone>(
    policy: &SessionPolicy,
    meta: &SessionMeta,
    now: i64,
    tz: &Z,
) -> Option<String> {
    if let Some(at) = &policy.daily_reset_at {
        if let Ok((hour, minute)) = parse_clock_time(at) {
            if let Some(occurrence) = most_recent_occurrence_ms(hour, minute, now, tz) {
                if occurrence > meta.created_at && occurrence <= now {
                    return Some(format!("daily reset at {}", at));
                }
            }
        }
    }

    if let Some(idle) = &policy.idle_timeout {
        if let (Ok(timeout), Some(last)) = (
            humantime::parse_duration(idle),
            meta.last_run_completed_at,
        ) {
            if now - last > timeout.as_millis() as i64 {
                return Some(format!("idle longer than {}", idle));
            }
        }
    }

    if let Some(max) = policy.max_context_length {
        if meta.last_context_length.is_some_and(|len| len > max) {
            return Some(format!("context length above {}", max));
        }
    }

    None
}

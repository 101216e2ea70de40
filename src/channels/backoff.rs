//! Bounded exponential backoff for adapter startup.

use std::time::Duration;

const INITIAL_MS: u64 = 2_000;
const FACTOR: f64 = 1.8;
const CAP_MS: u64 = 30_000;
const JITTER: f64 = 0.25;

/// Exponential backoff: 2s initial, factor 1.8, capped at 30s, with ±25%
/// jitter applied to each returned delay.
#[derive(Debug)]
pub struct StartBackoff {
    next_ms: f64,
}

impl StartBackoff {
    pub fn new() -> Self {
        Self {
            next_ms: INITIAL_MS as f64,
        }
    }

    /// Next delay to sleep before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.next_ms;
        self.next_ms = (self.next_ms * FACTOR).min(CAP_MS as f64);
        let jitter = 1.0 + JITTER * (fastrand::f64() * 2.0 - 1.0);
        Duration::from_millis((base * jitter) as u64)
    }
}

impl Default for StartBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_to_cap_within_jitter_bounds() {
        let mut backoff = StartBackoff::new();
        let mut expected = INITIAL_MS as f64;
        for _ in 0..10 {
            let delay = backoff.next_delay().as_millis() as f64;
            let lo = expected * (1.0 - JITTER) - 1.0;
            let hi = expected * (1.0 + JITTER) + 1.0;
            assert!(
                delay >= lo && delay <= hi,
                "delay {} outside [{}, {}]",
                delay,
                lo,
                hi
            );
            expected = (expected * FACTOR).min(CAP_MS as f64);
        }
        // Settled at the cap
        let settled = backoff.next_delay().as_millis() as f64;
        assert!(settled <= CAP_MS as f64 * (1.0 + JITTER) + 1.0);
        assert!(settled >= CAP_MS as f64 * (1.0 - JITTER) - 1.0);
    }
}

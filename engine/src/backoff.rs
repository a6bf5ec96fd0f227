//! Retry backoff for unreachable pushes.
//!
//! Delays grow exponentially from `base_ms`, are capped at `cap_ms`, and are
//! spread by a jitter factor. The jitter sample is passed in by the caller
//! (uniform in `[-1.0, 1.0]`) so the policy itself stays deterministic.

use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// Exponential backoff with bounded jitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base_ms: u64,
    /// Upper bound for any delay
    pub cap_ms: u64,
    /// Relative jitter, e.g. `0.2` for ±20%
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 60_000,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy.
    pub fn new(base_ms: u64, cap_ms: u64, jitter: f64) -> Self {
        Self {
            base_ms,
            cap_ms,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay without jitter for the given attempt (1 = first retry).
    pub fn nominal_delay(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(63);
        self.base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.cap_ms)
    }

    /// Jittered delay for the given attempt. `sample` is clamped to `[-1, 1]`
    /// and scaled by the jitter factor; the result never exceeds the cap.
    pub fn delay(&self, attempt: u32, sample: f64) -> u64 {
        let nominal = self.nominal_delay(attempt) as f64;
        let factor = 1.0 + self.jitter * sample.clamp(-1.0, 1.0);
        let jittered = (nominal * factor).round().max(0.0) as u64;
        jittered.min(self.cap_ms)
    }

    /// Time of the next attempt after a failure at `now`.
    pub fn next_attempt(&self, now: Timestamp, attempt: u32, sample: f64) -> Timestamp {
        now.saturating_add(self.delay(attempt, sample))
    }
}

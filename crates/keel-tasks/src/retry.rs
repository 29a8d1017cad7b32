//! Retry backoff policy.

use rand::Rng;
use std::time::Duration;

/// Cap on any retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Exponential backoff with jitter for a retry attempt (1-based).
///
/// `base * 2^(attempt-1)` plus up to 250 ms of jitter, capped at 30 s.
#[must_use]
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(10);
    let delay = base.saturating_mul(1u32 << exponent).min(MAX_RETRY_DELAY);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    (delay + jitter).min(MAX_RETRY_DELAY)
}

//! Failure-recovery backoff computation.
//!
//! The delay formula matches the widely used node-retry shape: the delay
//! before 1-based attempt `k` is
//! `min(max_timeout, round(r * max(min_timeout, 1ms) * factor^(k - 1)))`,
//! where `r` is 1, or uniform in `[1, 2)` when randomization is enabled.

use rand::Rng;
use tokio::time::Duration;

use crate::types::RetryOptions;

/// Delay before the given 1-based retry attempt.
pub(crate) fn backoff_delay(opts: &RetryOptions, attempt: u32) -> Duration {
    let rand_factor = if opts.randomize {
        rand::rng().random_range(1.0..2.0)
    } else {
        1.0
    };
    let min_ms = (opts.min_timeout.as_millis() as f64).max(1.0);
    let exponent = attempt.saturating_sub(1);
    let mut ms = (rand_factor * min_ms * opts.factor.powi(exponent as i32)).round();
    if let Some(max) = opts.max_timeout {
        ms = ms.min(max.as_millis() as f64);
    }
    if !ms.is_finite() {
        return opts.max_timeout.unwrap_or(Duration::MAX);
    }
    Duration::from_millis(ms.max(0.0) as u64)
}

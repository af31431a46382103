//! Retry backoff computation.

use std::time::Duration;

use rand::Rng;

use crate::plan::{Backoff, RetrySpec};

/// Delay before retry number `attempt` (1-based: the delay after the
/// first failed attempt is `attempt = 1`).
///
/// Fixed backoff waits `base_ms`; exponential doubles per attempt. With
/// jitter enabled the delay is multiplied by uniform(0.5, 1.0).
pub fn backoff_delay(spec: &RetrySpec, attempt: u32) -> Duration {
    let base = match spec.backoff {
        Backoff::Fixed => spec.base_ms,
        Backoff::Exp => {
            let exponent = attempt.saturating_sub(1).min(20);
            spec.base_ms.saturating_mul(2u64.saturating_pow(exponent))
        }
    };

    if !spec.jitter {
        return Duration::from_millis(base);
    }

    let factor: f64 = rand::thread_rng().gen_range(0.5..1.0);
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    {
        Duration::from_millis(((base as f64) * factor) as u64)
    }
}

use super::policy::{BackoffStrategy, RetryPolicy};
use std::time::Duration;

/// Maximum additive jitter, as a fraction of the computed delay
pub const JITTER_RATIO: f64 = 0.1;

/// Delay before the retry that follows `attempt` (zero-based).
///
/// Additive jitter in `[0, 10%]` is applied before clamping to `max_delay`.
pub fn calculate_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let base = base_delay(attempt, policy);
    let jitter = base.mul_f64(fastrand::f64() * JITTER_RATIO);
    base.saturating_add(jitter).min(policy.max_delay)
}

/// Delay without jitter or clamping
pub fn base_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let base = policy.base_delay;
    match policy.backoff {
        BackoffStrategy::Fixed => base,
        BackoffStrategy::Linear => base.saturating_mul(attempt.saturating_add(1)),
        BackoffStrategy::Exponential => {
            let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
            base.saturating_mul(factor)
        }
    }
}

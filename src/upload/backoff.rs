//! Exponential backoff with full jitter for the upload queue's retry
//! policy: delay doubles with each attempt, capped at 5 minutes, and is
//! randomized within 50%-150% of the ideal value so retries from many
//! devices don't synchronize.

use std::time::Duration;

use rand::Rng;

pub const BASE_DELAY: Duration = Duration::from_secs(1);
pub const MAX_DELAY: Duration = Duration::from_secs(300);
pub const MAX_ATTEMPTS: u32 = 10;

/// The un-jittered delay for retry attempt `attempt` (0-indexed): `base *
/// 2^attempt`, capped at [`MAX_DELAY`].
pub fn ideal_delay(attempt: u32) -> Duration {
    let shift = attempt.min(20);
    let scaled = BASE_DELAY.saturating_mul(1u32 << shift);
    scaled.min(MAX_DELAY)
}

/// Jittered delay for retry attempt `attempt`, uniformly distributed in
/// `[ideal * 0.5, ideal * 1.5]`.
pub fn delay_for_attempt(attempt: u32) -> Duration {
    let ideal = ideal_delay(attempt).as_secs_f64();
    let factor = rand::thread_rng().gen_range(0.5..=1.5);
    Duration::from_secs_f64(ideal * factor)
}

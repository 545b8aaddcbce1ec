//! Exponential retry delays shared by the remote reads and the status reporter.

use std::time::Duration;

/// Delay before retry number `attempt` (0-based): `unit * 2^attempt`.
pub fn delay_for(attempt: u32, unit: Duration) -> Duration {
    unit.saturating_mul(2u32.saturating_pow(attempt))
}

/// Full list of delays for `max_retries` retries.
pub fn schedule(max_retries: u32, unit: Duration) -> Vec<Duration> {
    (0..max_retries).map(|attempt| delay_for(attempt, unit)).collect()
}

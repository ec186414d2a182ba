use std::cmp;
use std::time::Duration;

const INITIAL_RETRY_MS: u64 = 1_000;
const BACKOFF_STEP_SECS: u64 = 5;
const BACKOFF_MAX_SECS: u64 = 60;

/// Delay between attempts while the initial connect window is still open.
pub fn initial_retry_delay(remaining: Duration) -> Duration {
    cmp::min(Duration::from_millis(INITIAL_RETRY_MS), remaining)
}

/// Delay before reconnect attempt `attempt` (0-based) once the link has been
/// lost or the initial window has elapsed.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let factor = 1u64 << cmp::min(attempt, 16);
    let secs = BACKOFF_STEP_SECS.saturating_mul(factor);
    Duration::from_secs(cmp::min(secs, BACKOFF_MAX_SECS))
}

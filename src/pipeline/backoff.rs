use std::time::Duration;

const RETRY_BACKOFF_MS: &[u64] = &[100, 400, 1_600];

/// Delay before retry number `attempt` (1-based). Saturates at the last step.
pub fn retry_backoff(attempt: u32) -> Duration {
    let idx = (attempt.saturating_sub(1) as usize).min(RETRY_BACKOFF_MS.len() - 1);
    Duration::from_millis(RETRY_BACKOFF_MS[idx])
}

//! Backoff policy and cancellable waits for retried requests.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Number of attempts made per request when the API reports rate
/// limiting.
pub const TRANSPORT_ATTEMPTS: u32 = 3;

/// Number of attempts made when an update hits an optimistic-concurrency
/// conflict.
pub const CONFLICT_ATTEMPTS: u32 = 3;

/// Minimum wait between rate-limited attempts.
pub const TRANSPORT_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Exponential backoff with jitter. The wait grows by a fixed factor
/// per attempt and is capped at twice the minimum interval.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    factor: f64,
}

impl Backoff {
    /// Creates a backoff starting at `min` and capped at `2 * min`.
    pub fn new(min: Duration) -> Self {
        Self {
            min,
            max: min * 2,
            factor: 1.5,
        }
    }

    /// Calculates the wait before the given attempt, 1-based.
    pub fn duration(&self, attempt: u32) -> Duration {
        let base = self.min.as_millis() as f64 * self.factor.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max.as_millis() as f64);

        let jitter_range = capped * 0.1;
        let jitter = rand_jitter() * jitter_range * 2.0 - jitter_range;

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(TRANSPORT_MIN_INTERVAL)
    }
}

/// Simple random jitter (0.0 to 1.0).
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos as f64) / (u32::MAX as f64)
}

/// Sleeps for the given duration, waking early if the token is
/// cancelled. Returns `false` when the wait was cancelled.
pub async fn sleep_cancellable(cancel: Option<&CancellationToken>, wait: Duration) -> bool {
    match cancel {
        Some(token) => {
            tokio::select! {
                _ = token.cancelled() => false,
                _ = tokio::time::sleep(wait) => true,
            }
        }
        None => {
            tokio::time::sleep(wait).await;
            true
        }
    }
}

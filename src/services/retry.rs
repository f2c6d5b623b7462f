//! Bounded retry with exponential backoff.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Exponential schedule: attempt `n` (1-based) that fails waits
/// `base_delay * multiplier^n` before the next one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            multiplier: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(self.multiplier.saturating_pow(attempt))
    }
}

/// Run `op` until it succeeds or the policy runs out of attempts.
///
/// On exhaustion the last error is returned together with the number of
/// attempts made.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, (u32, E)>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= policy.max_attempts => return Err((attempt, err)),
            Err(err) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what, attempt, policy.max_attempts, err, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

/// Fixed-delay retry with a bounded number of attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_tries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_tries: u32, delay: Duration) -> Self {
        Self { max_tries, delay }
    }

    /// Attempt budget, never less than one.
    pub fn attempts(&self) -> u32 {
        self.max_tries.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Call `op` until it succeeds or the attempt budget runs out. The closure
/// receives the 1-based attempt number; the last error is returned.
pub async fn with_retry<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                debug!(attempt, max_tries = attempts, error = %e, "Attempt failed, retrying");
                sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

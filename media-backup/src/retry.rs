//! Bounded retry with linearly increasing delay.
//!
//! Used for uploads during restore and for mail delivery. Only errors the
//! caller classifies as transient are retried.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Attempt `n` (1-based) is followed by a pause of `n * step`
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            step: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, step: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            step,
        }
    }

    /// Pause after the given failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.step * attempt
    }
}

/// Run `op` until it succeeds, fails permanently, or the budget runs out.
///
/// `op` receives the 1-based attempt number. The last error is returned when
/// every attempt failed.
pub async fn retry<T, E, F, Fut, P>(policy: &RetryPolicy, label: &str, is_transient: P, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !is_transient(&e) => return Err(e),
            Err(e) if attempt >= policy.max_attempts => {
                warn!("{}: giving up after {} attempts: {}", label, attempt, e);
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    "{}: attempt {}/{} failed: {}. Retrying in {:?}",
                    label, attempt, policy.max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

//! Fixed-backoff retry used by the SSH readiness probe
//!
//! Nothing else in the engine retries on its own: retry policy for every
//! other remote operation belongs to the caller.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::K3sResult;

/// Fixed number of attempts separated by a fixed delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBackoff {
    /// Maximum number of attempts (including the initial attempt)
    pub max_attempts: u32,
    /// Delay slept between two attempts
    pub delay: Duration,
}

impl FixedBackoff {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

/// Run `operation` until it succeeds or the attempts are exhausted.
///
/// Returns the last error once every attempt has failed. No sleep follows
/// the final attempt.
pub async fn retry_fixed<T, F, Fut>(
    policy: FixedBackoff,
    operation_name: &str,
    mut operation: F,
) -> K3sResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = K3sResult<T>>,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", operation_name, attempt);
                }
                return Ok(value);
            }
            Err(e) if attempt >= policy.max_attempts => {
                warn!(
                    "{} failed after {} attempts: {}",
                    operation_name, policy.max_attempts, e
                );
                return Err(e);
            }
            Err(e) => {
                debug!(
                    "{} attempt {}/{} failed: {}",
                    operation_name, attempt, policy.max_attempts, e
                );
                sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}

// file: src/utils/retry.rs
// version: 1.0.0
// guid: 8e1d4c7a-2b3f-4a90-9c5e-6f7a8b9c0d12

//! Bounded retries for transient remote failures

use crate::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry ceiling and pause between attempts
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_secs(5),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempts run out
pub async fn retry_transient<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                warn!(
                    "{} failed (attempt {}/{}): {}, retrying",
                    what, attempt, policy.attempts, e
                );
                attempt += 1;
                tokio::time::sleep(policy.interval).await;
            }
            other => return other,
        }
    }
}

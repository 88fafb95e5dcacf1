use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::ClientError;

/// Bounded retry on `ERROR:BUSY`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Fixed wait between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Calls `attempt` (with a 1-based attempt number) until it returns
/// anything other than a retryable error, or the policy runs out.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    mut attempt: F,
) -> Result<T, ClientError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let attempts = policy.max_attempts();
    for n in 1..=attempts {
        match attempt(n).await {
            Err(e) if e.is_retryable() => {
                if n == attempts {
                    break;
                }
                warn!(
                    attempt = n,
                    backoff_ms = policy.backoff.as_millis() as u64,
                    "server busy, retrying"
                );
                tokio::time::sleep(policy.backoff).await;
            }
            other => return other,
        }
    }
    Err(ClientError::RetriesExhausted { attempts })
}

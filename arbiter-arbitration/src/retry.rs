//! Retry of transient storage failures with exponential backoff.

use arbiter_core::{ArbiterResult, RetryConfig};
use std::future::Future;
use tracing::warn;

/// Run `op` until it succeeds, fails with a non-transient error, or
/// `max_retries` retries are used up.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    operation: &'static str,
    mut op: F,
) -> ArbiterResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ArbiterResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                let delay = config.backoff(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

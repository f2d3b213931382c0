use std::fmt::Display;
use std::future::Future;

use dataagent_core::BackoffPolicy;
use tracing::warn;

/// Runs `operation` until it succeeds or the policy's attempt budget is spent.
///
/// Only use this for idempotent operations. The last error is returned as-is.
pub async fn with_backoff<T, E, F, Fut>(
    policy: BackoffPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempts_made = 0_u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                attempts_made += 1;
                if !policy.allows_retry(attempts_made) {
                    warn!(
                        event_name = "retry.exhausted",
                        operation = operation_name,
                        attempts = attempts_made,
                        error = %error,
                        "operation failed after all attempts"
                    );
                    return Err(error);
                }

                let delay = policy.delay_for(attempts_made - 1);
                warn!(
                    event_name = "retry.scheduled",
                    operation = operation_name,
                    attempt = attempts_made,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "operation failed, retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use dataagent_core::BackoffPolicy;

    use super::with_backoff;

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);

        let result: Result<&str, String> = with_backoff(BackoffPolicy::new(3, 0), "flaky", || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if call < 3 {
                    Err(format!("transient failure {call}"))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_after_max_attempts_with_last_error() {
        let calls = AtomicU32::new(0);

        let result: Result<(), String> = with_backoff(BackoffPolicy::new(2, 0), "broken", || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(format!("failure {call}")) }
        })
        .await;

        assert_eq!(result, Err("failure 2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

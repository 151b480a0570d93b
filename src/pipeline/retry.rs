//! Call-level retry with capped exponential backoff.
//!
//! Transient remote errors (rate limits, overload, timeouts) are frequent
//! under concurrent load. Each remote call gets `max_retries` extra attempts,
//! waiting `initial_backoff * 2^n` (capped) between them. Quota exhaustion
//! and rejections are returned immediately; the round-level retry in the
//! coordinators is the second line of defence.

use crate::cancel::CancelToken;
use crate::config::RetryPolicy;
use crate::error::RemoteError;
use crate::progress::Reporter;
use std::future::Future;

/// Run `op` until it succeeds, fails permanently, or retries run out.
///
/// Cancellation is checked before every attempt and interrupts backoff
/// sleeps, but an attempt already started is always awaited to completion.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    reporter: &Reporter,
    label: &str,
    mut op: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(RemoteError::Cancelled);
        }
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let wait = policy.backoff_for(attempt);
                reporter.warn(format!(
                    "{label}: {e}. Retry {}/{} in {:.1}s",
                    attempt + 1,
                    policy.max_retries,
                    wait.as_secs_f64()
                ));
                if !cancel.sleep(wait).await {
                    return Err(RemoteError::Cancelled);
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

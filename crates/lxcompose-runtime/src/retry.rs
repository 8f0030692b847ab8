//! Bounded retry with exponential backoff.
//!
//! Only errors classified as transient by [`LxError::is_transient`] are
//! retried. Validation, state and runtime exit-code errors are returned
//! on the first attempt.

use std::time::Instant;

use lxcompose_common::config::RetryPolicy;
use lxcompose_common::error::{LxError, Result};

use crate::cancel::CancelToken;

/// Runs `op` until it succeeds, fails permanently, or the policy gives up.
///
/// No attempt is started once the next backoff would push the total time
/// past `policy.max_elapsed`; the last error is then wrapped in
/// [`LxError::RetryExhausted`].
///
/// # Errors
///
/// Returns the first permanent error, [`LxError::RetryExhausted`], or
/// [`LxError::Cancelled`] if `cancel` fires.
pub fn retry<T>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    operation: &'static str,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let started = Instant::now();
    let mut attempts: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(LxError::Cancelled { operation });
        }
        attempts += 1;
        let err = match op() {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => err,
        };

        let delay = policy.delay_for(attempts - 1);
        if started.elapsed() + delay > policy.max_elapsed {
            tracing::warn!(operation, attempts, error = %err, "giving up after transient failures");
            return Err(LxError::RetryExhausted {
                attempts,
                source: Box::new(err),
            });
        }
        tracing::warn!(
            operation,
            attempt = attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "transient failure, retrying"
        );
        if !cancel.sleep(delay) {
            return Err(LxError::Cancelled { operation });
        }
    }
}

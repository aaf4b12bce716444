//! Bounded retry with per-attempt timeout.
//!
//! Every attempt is handed to the caller's observer the moment it
//! resolves and collected in the returned log, so retries are visible
//! after the fact even when a chain is cut short.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

use crate::domain::RetryPolicy;
use crate::error::TransportError;

/// What happened on one attempt of a retry chain.
#[derive(Debug, Clone)]
pub struct AttemptLog {
    /// 1-based attempt number
    pub attempt: u32,
    pub latency_ms: u64,
    /// `None` on the successful final attempt
    pub error: Option<TransportError>,
}

/// Run `call` until it succeeds, returns a non-retryable error, or the
/// policy's attempt budget is spent. Each attempt races `call_timeout`;
/// an elapsed timer counts as a retryable timeout failure.
///
/// `on_attempt` fires as each attempt resolves, before any backoff
/// sleep. Callers persisting per-attempt records through it keep the
/// records for attempts already made even if the whole chain is
/// aborted later.
pub async fn call_with_retry<T, F, Fut, O, OFut>(
    policy: &RetryPolicy,
    call_timeout: Duration,
    mut call: F,
    mut on_attempt: O,
) -> (std::result::Result<T, TransportError>, Vec<AttemptLog>)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, TransportError>>,
    O: FnMut(AttemptLog) -> OFut,
    OFut: Future<Output = ()>,
{
    let mut attempts = Vec::new();
    let mut attempt: u32 = 0;

    loop {
        let started = Instant::now();
        let result = match timeout(call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                elapsed_ms: call_timeout.as_millis() as u64,
            }),
        };
        let latency_ms = started.elapsed().as_millis() as u64;
        attempt += 1;

        match result {
            Ok(value) => {
                let entry = AttemptLog {
                    attempt,
                    latency_ms,
                    error: None,
                };
                on_attempt(entry.clone()).await;
                attempts.push(entry);
                return (Ok(value), attempts);
            }
            Err(err) => {
                let entry = AttemptLog {
                    attempt,
                    latency_ms,
                    error: Some(err.clone()),
                };
                on_attempt(entry.clone()).await;
                attempts.push(entry);
                if !err.is_retryable() || attempt >= policy.max_attempts {
                    return (Err(err), attempts);
                }
                sleep(jittered(policy.delay_for(attempt - 1), policy.jitter)).await;
            }
        }
    }
}

/// Add up to 25% random spread so synchronized failures do not retry in
/// lockstep against the same buyer.
fn jittered(delay: Duration, jitter: bool) -> Duration {
    if !jitter || delay.is_zero() {
        return delay;
    }
    let spread = delay.as_millis() as u64 / 4;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::stats::StreamStats;

/// Failure of a single ranged fetch against the remote store.
///
/// `Retryable` covers network/timeout/5xx-equivalent conditions that the
/// retry loop recovers from locally; `Permanent` covers missing objects,
/// unsatisfiable ranges and authorization failures, which surface unchanged.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("transient remote failure: {0}")]
    Retryable(String),

    #[error("permanent remote failure: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Retryable(_))
    }
}

/// Capability the engine needs from the remote store: read bytes
/// `[start, end)` of one immutable object.
///
/// Implementations must be safe to call concurrently; the engine bounds the
/// number of outstanding calls itself.
pub trait ObjectStore: Send + Sync + 'static {
    fn fetch_range(&self, start: u64, end: u64) -> BoxFuture<'_, Result<Bytes, FetchError>>;
}

/// Fetch `[start, end)` with bounded retries, exponential backoff and jitter.
///
/// Retryable errors consume the attempt budget; a permanent error or
/// cancellation ends the loop immediately. An exhausted budget is reported as
/// permanent, since no further recovery happens downstream.
pub(crate) async fn fetch_with_retries(
    store: &dyn ObjectStore,
    start: u64,
    end: u64,
    policy: &RetryPolicy,
    stats: &StreamStats,
    cancel: &CancellationToken,
) -> Result<Bytes, FetchError> {
    let mut backoff = policy.backoff_base;
    let mut last_err = None;

    for attempt in 0..policy.attempts {
        if attempt > 0 {
            StreamStats::incr(&stats.fetch_retries);
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Permanent("stream closed".into())),
            result = store.fetch_range(start, end) => result,
        };

        match result {
            Ok(bytes) => return Ok(bytes),
            Err(e) => {
                if !e.is_retryable() {
                    return Err(e);
                }
                last_err = Some(e);
                let is_last = attempt + 1 >= policy.attempts;
                if is_last || cancel.is_cancelled() {
                    break;
                }
                tokio::time::sleep(with_jitter(backoff)).await;
                backoff = backoff.saturating_mul(2).min(policy.max_backoff);
            }
        }
    }

    let detail = match last_err {
        Some(e) => format!("retry budget exhausted after {} attempts: {e}", policy.attempts),
        None => "retry budget exhausted".into(),
    };
    Err(FetchError::Permanent(detail))
}

/// Full jitter over `[backoff/2, backoff]`, so concurrent retries against a
/// struggling store don't fire in lockstep.
fn with_jitter(backoff: Duration) -> Duration {
    let millis = backoff.as_millis().min(u128::from(u64::MAX)) as u64;
    if millis < 2 {
        return backoff;
    }
    let jittered = rand::thread_rng().gen_range(millis / 2..=millis);
    Duration::from_millis(jittered)
}

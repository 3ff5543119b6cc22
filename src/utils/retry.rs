//! Retry utilities: backoff builders for broker operations.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::warn;

use crate::bus::BusError;

/// Backoff for publish retries.
///
/// - Min delay: 50ms
/// - Max delay: 2s
/// - Max attempts: `max_retries`
/// - Jitter enabled
pub fn publish_backoff(max_retries: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(max_retries)
        .with_jitter()
}

/// Run a publish, retrying transient broker errors on a fresh attempt.
///
/// `NotConnected`, serialization and connection errors are returned at once.
pub async fn publish_with_retry<F, Fut>(max_retries: usize, op: F) -> Result<(), BusError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), BusError>>,
{
    op.retry(publish_backoff(max_retries))
        .when(BusError::is_transient)
        .notify(|err: &BusError, delay: Duration| {
            warn!(error = %err, ?delay, "Publish failed, retrying");
        })
        .await
}

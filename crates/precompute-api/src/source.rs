//! Collaborator seams: the upstream metadata source and the metric computation.
//!
//! Both are blocking, untrusted calls. The kernel runs them on the blocking
//! pool under a deadline and retries transient failures with backoff.

use std::sync::Arc;
use std::time::Duration;

use precompute_core::{KernelError, MetricQuery, SourceSystem, TimeRange, Watermark};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::warn;

use crate::backoff::BackoffPolicy;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("metadata source unavailable: {0}")]
    Unavailable(String),
    #[error("metadata source timed out")]
    Timeout,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ComputeError {
    /// Worth retrying: the upstream hiccupped.
    #[error("transient failure: {0}")]
    Transient(String),
    /// The query itself cannot be computed.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

/// One raw engineering-activity record as reported upstream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityRecord {
    pub source: SourceSystem,
    /// Author handle or email exactly as the source reports it.
    pub author: String,
    pub subject_id: String,
    pub kind: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

/// Read-only upstream holding engineering activity.
pub trait MetadataSource: Send + Sync {
    /// # Errors
    /// Returns [`SourceError`] when the source cannot be read.
    fn current_watermark(&self) -> Result<Watermark, SourceError>;

    /// # Errors
    /// Returns [`SourceError`] when the source cannot be read.
    fn activity(&self, range: &TimeRange) -> Result<Vec<ActivityRecord>, SourceError>;
}

/// The metric computation the kernel caches.
pub trait MetricComputer: Send + Sync {
    /// Compute `query` against source data as of `watermark`.
    ///
    /// # Errors
    /// Returns [`ComputeError::Transient`] for retryable failures and
    /// [`ComputeError::Permanent`] otherwise.
    fn compute(&self, query: &MetricQuery, watermark: Watermark) -> Result<Value, ComputeError>;
}

#[derive(Debug)]
pub(crate) enum Deadline<T> {
    Finished(T),
    Panicked(String),
    Elapsed,
}

/// Run a blocking call on the blocking pool, giving up on it after `limit`.
///
/// A call that overruns keeps its thread until it returns; its result is dropped.
pub(crate) async fn blocking_with_deadline<T, F>(limit: Duration, call: F) -> Deadline<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(call)).await {
        Ok(Ok(value)) => Deadline::Finished(value),
        Ok(Err(join_err)) => Deadline::Panicked(join_err.to_string()),
        Err(_) => Deadline::Elapsed,
    }
}

/// Call the metadata source with a per-call deadline, retrying failures with backoff.
///
/// # Errors
/// Returns [`KernelError::TransientSource`] once `max_attempts` calls have failed.
pub(crate) async fn call_source<T, F>(
    source: &Arc<dyn MetadataSource>,
    limit: Duration,
    backoff: &BackoffPolicy,
    max_attempts: u32,
    what: &'static str,
    call: F,
) -> Result<T, KernelError>
where
    F: Fn(&dyn MetadataSource) -> Result<T, SourceError> + Clone + Send + 'static,
    T: Send + 'static,
{
    let mut last_error = String::new();
    for attempt in 1..=max_attempts.max(1) {
        let source = Arc::clone(source);
        let call = call.clone();
        match blocking_with_deadline(limit, move || call(source.as_ref())).await {
            Deadline::Finished(Ok(value)) => return Ok(value),
            Deadline::Finished(Err(err)) => last_error = err.to_string(),
            Deadline::Panicked(message) => last_error = format!("source call panicked: {message}"),
            Deadline::Elapsed => last_error = SourceError::Timeout.to_string(),
        }
        if attempt < max_attempts {
            let delay = backoff.delay(attempt);
            warn!(
                what,
                attempt,
                delay_ms = delay.as_millis(),
                error = %last_error,
                "retrying metadata source"
            );
            tokio::time::sleep(delay).await;
        }
    }
    Err(KernelError::TransientSource(format!(
        "{what}: {last_error} (after {} attempts)",
        max_attempts.max(1)
    )))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct FlakySource {
        failures_left: AtomicU32,
    }

    impl MetadataSource for FlakySource {
        fn current_watermark(&self) -> Result<Watermark, SourceError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(SourceError::Unavailable("replica lagging".to_string()));
            }
            Ok(Watermark(77))
        }

        fn activity(&self, _range: &TimeRange) -> Result<Vec<ActivityRecord>, SourceError> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(Vec::new())
        }
    }

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(2), 2.0, 0.0)
    }

    #[tokio::test]
    async fn transient_source_failures_are_retried() -> Result<(), KernelError> {
        let source: Arc<dyn MetadataSource> =
            Arc::new(FlakySource { failures_left: AtomicU32::new(2) });
        let watermark = call_source(
            &source,
            Duration::from_secs(1),
            &fast_backoff(),
            3,
            "watermark",
            |source| source.current_watermark(),
        )
        .await?;
        assert_eq!(watermark, Watermark(77));
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_transient_source() {
        let source: Arc<dyn MetadataSource> =
            Arc::new(FlakySource { failures_left: AtomicU32::new(5) });
        let result = call_source(
            &source,
            Duration::from_secs(1),
            &fast_backoff(),
            2,
            "watermark",
            |source| source.current_watermark(),
        )
        .await;
        assert!(matches!(
            result,
            Err(KernelError::TransientSource(message)) if message.contains("replica lagging")
        ));
    }

    #[tokio::test]
    async fn slow_calls_hit_the_deadline() {
        let source: Arc<dyn MetadataSource> =
            Arc::new(FlakySource { failures_left: AtomicU32::new(0) });
        let range = match TimeRange::new(OffsetDateTime::UNIX_EPOCH, OffsetDateTime::UNIX_EPOCH) {
            Ok(range) => range,
            Err(err) => panic!("range rejected: {err}"),
        };
        let result = call_source(
            &source,
            Duration::from_millis(20),
            &fast_backoff(),
            1,
            "activity",
            move |source| source.activity(&range),
        )
        .await;
        assert!(matches!(
            result,
            Err(KernelError::TransientSource(message)) if message.contains("timed out")
        ));
    }
}

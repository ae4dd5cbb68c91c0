//! Retry policies for transient broker failures.
//!
//! All broker-facing components retry through the same named `backon`
//! policies so backoff behavior stays consistent across the codebase.
//!
//! # Available Policies
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `broker_policy` | 100ms | 5s | 5 | Appends, heartbeats, claims |
//! | `fast_policy` | 5ms | 100ms | 3 | Hot-path reads |
//!
//! Every policy includes jitter to prevent thundering herd. Only errors
//! classified retriable by [`Error::is_retriable`] are retried; fencing
//! rejections pass straight through so the caller can re-fetch the
//! assignment instead of spinning.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::error::{Error, Result};

/// Policy for broker coordination and data-path writes.
///
/// Moderate initial delay, long max delay to ride out a broker restart,
/// bounded retries so a dead broker surfaces as a task failure rather than
/// hanging forever.
pub fn broker_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(5)
        .with_jitter()
}

/// Policy for hot-path retries where latency matters.
pub fn fast_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(100))
        .with_max_times(3)
        .with_jitter()
}

/// Execute a broker operation with [`broker_policy`], retrying transient
/// errors only.
///
/// The last error is returned once retries are exhausted; the caller
/// decides whether that is fatal to its task.
///
/// # Example
///
/// ```rust,ignore
/// let id = retry::with_broker_policy(|| client.append(partition, payload.clone())).await?;
/// ```
pub async fn with_broker_policy<F, Fut, T>(operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    operation
        .retry(broker_policy())
        .when(|e: &Error| e.is_retriable())
        .notify(|e: &Error, dur: Duration| {
            tracing::debug!(error = %e, backoff_ms = dur.as_millis() as u64, "Retrying broker operation");
        })
        .await
}

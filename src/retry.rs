//! Backoff policies shared by the client components.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `metadata_policy` | 50ms | 2s | 5 | Metadata refresh across brokers |
//! | `coordinator_policy` | 100ms | 5s | 10 | FindCoordinator, JoinGroup, SyncGroup |
//! | `reconnect_backoff` | configured | configured | unbounded | Broker reconnects |
//!
//! # Example
//!
//! ```rust,no_run
//! use kafkaesque_client::retry;
//! use backon::Retryable;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     (|| async { Ok::<_, std::io::Error>(()) })
//!         .retry(retry::metadata_policy())
//!         .when(|e| e.kind() == std::io::ErrorKind::TimedOut)
//!         .await?;
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder, Retryable};
use tracing::debug;

/// Policy for metadata refreshes.
pub fn metadata_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(5)
        .with_jitter()
}

/// Policy for group coordinator operations.
///
/// Longer than the metadata policy: a coordinator that is still loading
/// group state answers `GroupLoadInProgress` for a while.
pub fn coordinator_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(10)
        .with_jitter()
}

/// Unbounded reconnect schedule starting at `floor`.
///
/// Jitter only ever lengthens a delay, so no delay is shorter than `floor`.
pub fn reconnect_backoff(floor: Duration, ceiling: Duration) -> ExponentialBackoff {
    ExponentialBuilder::default()
        .with_min_delay(floor)
        .with_max_delay(ceiling.max(floor))
        .without_max_times()
        .with_jitter()
        .build()
}

/// Run `operation` with [`metadata_policy`], retrying while `condition` holds.
pub async fn with_metadata_policy<F, Fut, T, E, C>(operation: F, condition: C) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::error::Error,
    C: FnMut(&E) -> bool,
{
    operation
        .retry(metadata_policy())
        .when(condition)
        .notify(|err, delay| debug!(error = %err, ?delay, "Retrying metadata request"))
        .await
}

/// Run `operation` with [`coordinator_policy`], retrying while `condition` holds.
pub async fn with_coordinator_policy<F, Fut, T, E, C>(operation: F, condition: C) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::error::Error,
    C: FnMut(&E) -> bool,
{
    operation
        .retry(coordinator_policy())
        .when(condition)
        .notify(|err, delay| debug!(error = %err, ?delay, "Retrying coordinator request"))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_reconnect_backoff_respects_floor() {
        let floor = Duration::from_millis(50);
        let delays: Vec<Duration> = reconnect_backoff(floor, Duration::from_millis(400))
            .take(20)
            .collect();
        assert_eq!(delays.len(), 20, "reconnect schedule must be unbounded");
        assert!(delays.iter().all(|d| *d >= floor));
    }

    #[test]
    fn test_reconnect_backoff_ceiling_below_floor() {
        let floor = Duration::from_millis(200);
        let first = reconnect_backoff(floor, Duration::from_millis(10)).next();
        assert!(first.is_some_and(|d| d >= floor));
    }

    #[tokio::test]
    async fn test_with_metadata_policy_retries_then_succeeds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result = with_metadata_policy(
            || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"))
                    } else {
                        Ok(7)
                    }
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_condition_stops_retry() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let result: Result<(), std::io::Error> = with_coordinator_policy(
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(std::io::Error::other("fatal"))
                }
            },
            |_| false,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}

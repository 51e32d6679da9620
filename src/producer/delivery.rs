//! Per-record completion handles and caller-owned result aggregation.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt;
use tokio::sync::oneshot;

use super::record::RecordMetadata;
use crate::error::{Error, Result};
use crate::types::TopicPartition;

/// Resolves once the record it was returned for is acknowledged or fails.
///
/// Dropping the future does not cancel the send.
#[must_use = "a DeliveryFuture does nothing unless awaited or tracked"]
#[derive(Debug)]
pub struct DeliveryFuture {
    rx: oneshot::Receiver<Result<RecordMetadata>>,
}

impl DeliveryFuture {
    pub(crate) fn channel() -> (DeliverySender, DeliveryFuture) {
        let (tx, rx) = oneshot::channel();
        (DeliverySender { tx }, DeliveryFuture { rx })
    }
}

impl Future for DeliveryFuture {
    type Output = Result<RecordMetadata>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the producer went away without completing us.
        self.rx
            .poll_unpin(cx)
            .map(|result| result.unwrap_or(Err(Error::Closed)))
    }
}

/// The producer's half of a [`DeliveryFuture`]. Completing consumes it, so a
/// record completes at most once.
#[derive(Debug)]
pub(crate) struct DeliverySender {
    tx: oneshot::Sender<Result<RecordMetadata>>,
}

impl DeliverySender {
    pub(crate) fn complete(self, result: Result<RecordMetadata>) {
        // The caller may have dropped the future.
        let _ = self.tx.send(result);
    }
}

/// Aggregated outcome of a set of deliveries.
///
/// Owned by the caller and updated only by awaiting completion handles
/// through it.
///
/// ```rust,no_run
/// # async fn example(producer: kafkaesque_client::producer::Producer) -> kafkaesque_client::error::Result<()> {
/// use kafkaesque_client::producer::{DeliveryTracker, ProducerRecord};
///
/// let mut tracker = DeliveryTracker::new();
/// let mut pending = Vec::new();
/// for i in 0..10 {
///     pending.push(producer.send(ProducerRecord::new("events", format!("e{}", i))).await?);
/// }
/// tracker.track_all(pending).await;
/// assert_eq!(tracker.total(), 10);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    succeeded: u64,
    failed: u64,
    ranges: BTreeMap<TopicPartition, (i64, i64)>,
    last_error: Option<Error>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Await one delivery and record its outcome.
    pub async fn track(&mut self, delivery: DeliveryFuture) -> Result<RecordMetadata> {
        let result = delivery.await;
        self.record(&result);
        result
    }

    /// Await every delivery, recording outcomes in completion order.
    pub async fn track_all<I>(&mut self, deliveries: I)
    where
        I: IntoIterator<Item = DeliveryFuture>,
    {
        for result in futures::future::join_all(deliveries).await {
            self.record(&result);
        }
    }

    fn record(&mut self, result: &Result<RecordMetadata>) {
        match result {
            Ok(metadata) => {
                self.succeeded += 1;
                if metadata.offset >= 0 {
                    let range = self
                        .ranges
                        .entry(metadata.topic_partition())
                        .or_insert((metadata.offset, metadata.offset));
                    range.0 = range.0.min(metadata.offset);
                    range.1 = range.1.max(metadata.offset);
                }
            }
            Err(e) => {
                self.failed += 1;
                self.last_error = Some(e.clone());
            }
        }
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn total(&self) -> u64 {
        self.succeeded + self.failed
    }

    /// Lowest and highest acknowledged offsets for `tp`.
    pub fn offset_range(&self, tp: &TopicPartition) -> Option<(i64, i64)> {
        self.ranges.get(tp).copied()
    }

    /// Partitions with at least one acknowledged record.
    pub fn partitions(&self) -> impl Iterator<Item = &TopicPartition> {
        self.ranges.keys()
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(partition: i32, offset: i64) -> RecordMetadata {
        RecordMetadata {
            topic: "t".to_string(),
            partition,
            offset,
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn test_future_resolves_with_result() {
        let (tx, fut) = DeliveryFuture::channel();
        tx.complete(Ok(metadata(0, 5)));
        assert_eq!(fut.await.unwrap().offset, 5);
    }

    #[tokio::test]
    async fn test_dropped_sender_is_closed() {
        let (tx, fut) = DeliveryFuture::channel();
        drop(tx);
        assert_eq!(fut.await.unwrap_err(), Error::Closed);
    }

    #[tokio::test]
    async fn test_tracker_aggregates() {
        let mut tracker = DeliveryTracker::new();
        let mut futures = Vec::new();
        for (partition, offset) in [(0, 10), (0, 11), (1, 3)] {
            let (tx, fut) = DeliveryFuture::channel();
            tx.complete(Ok(metadata(partition, offset)));
            futures.push(fut);
        }
        let (tx, fut) = DeliveryFuture::channel();
        tx.complete(Err(Error::retriable("broker down")));
        futures.push(fut);

        tracker.track_all(futures).await;
        assert_eq!(tracker.succeeded(), 3);
        assert_eq!(tracker.failed(), 1);
        assert_eq!(tracker.total(), 4);
        assert_eq!(
            tracker.offset_range(&TopicPartition::new("t", 0)),
            Some((10, 11))
        );
        assert_eq!(tracker.partitions().count(), 2);
        assert!(tracker.last_error().is_some());
    }
}

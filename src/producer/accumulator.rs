//! Per-partition batching.
//!
//! Each partition has a queue of [`ProducerBatch`]es. Records are appended to
//! the newest batch until it reaches `batch_size`, at which point it is
//! sealed and a new batch is opened behind it. A batch is also sealed when it
//! leaves the queue for the network. A sealed batch never accepts another
//! record; retried batches return to the front of their queue still sealed.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use super::delivery::DeliverySender;
use crate::protocol::{OutgoingRecord, RecordBatch};
use crate::types::TopicPartition;

/// A record waiting in a batch, with the handle that completes it.
#[derive(Debug)]
pub(crate) struct BatchEntry {
    pub(crate) record: OutgoingRecord,
    pub(crate) size: usize,
    pub(crate) seq: u64,
    pub(crate) delivery: DeliverySender,
}

/// Ordered records for one topic-partition.
#[derive(Debug)]
pub(crate) struct ProducerBatch {
    pub(crate) tp: TopicPartition,
    entries: Vec<BatchEntry>,
    size_bytes: usize,
    max_bytes: usize,
    created_at: Instant,
    sealed: bool,
    /// Send attempts that failed so far.
    pub(crate) attempts: u32,
    /// Earliest time of the next attempt after a failure.
    pub(crate) retry_at: Option<Instant>,
    /// Metadata version that must be exceeded before the next attempt.
    pub(crate) stale_metadata: Option<u64>,
}

impl ProducerBatch {
    pub(crate) fn new(tp: TopicPartition, max_bytes: usize) -> Self {
        Self {
            tp,
            entries: Vec::new(),
            size_bytes: 0,
            max_bytes,
            created_at: Instant::now(),
            sealed: false,
            attempts: 0,
            retry_at: None,
            stale_metadata: None,
        }
    }

    /// Append `entry`, handing it back if the batch is sealed or full.
    ///
    /// An empty batch accepts any record, however large.
    pub(crate) fn try_append(&mut self, entry: BatchEntry) -> Result<(), BatchEntry> {
        if self.sealed {
            return Err(entry);
        }
        if !self.entries.is_empty() && self.size_bytes + entry.size > self.max_bytes {
            return Err(entry);
        }
        self.size_bytes += entry.size;
        self.entries.push(entry);
        Ok(())
    }

    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }

    pub(crate) fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub(crate) fn is_full(&self) -> bool {
        self.size_bytes >= self.max_bytes
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub(crate) fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub(crate) fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub(crate) fn into_entries(self) -> Vec<BatchEntry> {
        self.entries
    }

    /// Encode as a RecordBatch v2.
    pub(crate) fn encode(&self) -> Bytes {
        let records: Vec<OutgoingRecord> = self.entries.iter().map(|e| e.record.clone()).collect();
        RecordBatch::from_records(&records).encode()
    }
}

/// Batches of every partition that are not in flight.
#[derive(Debug)]
pub(crate) struct RecordAccumulator {
    batch_size: usize,
    linger: Duration,
    queues: HashMap<TopicPartition, VecDeque<ProducerBatch>>,
}

impl RecordAccumulator {
    pub(crate) fn new(batch_size: usize, linger: Duration) -> Self {
        Self {
            batch_size,
            linger,
            queues: HashMap::new(),
        }
    }

    /// Append to the open batch of `tp`, sealing it and opening a new one
    /// when it is full.
    pub(crate) fn append(&mut self, tp: TopicPartition, entry: BatchEntry) {
        let queue = self.queues.entry(tp.clone()).or_default();
        let entry = match queue.back_mut() {
            Some(batch) => match batch.try_append(entry) {
                Ok(()) => return,
                Err(entry) => {
                    batch.seal();
                    entry
                }
            },
            None => entry,
        };

        let mut batch = ProducerBatch::new(tp, self.batch_size);
        if let Err(entry) = batch.try_append(entry) {
            // Unreachable: a fresh batch accepts anything. Keep the record anyway.
            batch.entries.push(entry);
        }
        queue.push_back(batch);
    }

    /// Put a failed batch back at the front of its partition queue.
    pub(crate) fn requeue_front(&mut self, mut batch: ProducerBatch) {
        batch.seal();
        self.queues
            .entry(batch.tp.clone())
            .or_default()
            .push_front(batch);
    }

    /// Put batches drained together back at the front of their queues,
    /// keeping their relative order.
    pub(crate) fn requeue_front_all(&mut self, batches: Vec<ProducerBatch>) {
        for batch in batches.into_iter().rev() {
            self.requeue_front(batch);
        }
    }

    /// Take the batches that may be sent now.
    ///
    /// `in_flight` is the number of requests outstanding for a partition; at
    /// most `max_in_flight` are allowed, and batches leave each queue in order.
    pub(crate) fn drain_ready<F>(
        &mut self,
        now: Instant,
        flushing: bool,
        metadata_version: u64,
        max_in_flight: usize,
        in_flight: F,
    ) -> Vec<ProducerBatch>
    where
        F: Fn(&TopicPartition) -> usize,
    {
        let mut ready = Vec::new();
        let mut partitions: Vec<TopicPartition> = self.queues.keys().cloned().collect();
        partitions.sort();

        for tp in partitions {
            let mut slots = max_in_flight.saturating_sub(in_flight(&tp));
            let Some(queue) = self.queues.get_mut(&tp) else {
                continue;
            };
            while slots > 0 {
                let Some(front) = queue.front() else { break };
                let due = (flushing && front.retry_at.is_none())
                    || now >= due_at(front, metadata_version, self.linger);
                if !due {
                    break;
                }
                if let Some(mut batch) = queue.pop_front() {
                    batch.seal();
                    ready.push(batch);
                    slots -= 1;
                }
            }
            if queue.is_empty() {
                self.queues.remove(&tp);
            }
        }
        ready
    }

    /// Remove batches that have waited longer than `timeout`.
    pub(crate) fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<ProducerBatch> {
        let mut expired = Vec::new();
        for queue in self.queues.values_mut() {
            // Batches are ordered oldest first.
            while queue.front().is_some_and(|b| b.age(now) >= timeout) {
                if let Some(batch) = queue.pop_front() {
                    expired.push(batch);
                }
            }
        }
        self.queues.retain(|_, queue| !queue.is_empty());
        expired
    }

    /// Earliest instant at which some batch becomes sendable or expires.
    ///
    /// Partitions whose in-flight window is full only contribute their expiry;
    /// a completed request wakes the sender for those.
    pub(crate) fn next_wakeup<F>(
        &self,
        delivery_timeout: Duration,
        metadata_version: u64,
        max_in_flight: usize,
        in_flight: F,
    ) -> Option<Instant>
    where
        F: Fn(&TopicPartition) -> usize,
    {
        self.queues
            .iter()
            .filter_map(|(tp, queue)| queue.front().map(|batch| (tp, batch)))
            .map(|(tp, batch)| {
                let expiry = batch.created_at + delivery_timeout;
                if in_flight(tp) >= max_in_flight {
                    expiry
                } else {
                    due_at(batch, metadata_version, self.linger).min(expiry)
                }
            })
            .min()
    }

    /// Remove and return every batch.
    pub(crate) fn drain_all(&mut self) -> Vec<ProducerBatch> {
        self.queues
            .drain()
            .flat_map(|(_, queue)| queue.into_iter())
            .collect()
    }

    pub(crate) fn record_count(&self) -> usize {
        self.queues
            .values()
            .flat_map(|queue| queue.iter())
            .map(ProducerBatch::len)
            .sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

/// How long a retried batch waits for a metadata refresh past its backoff.
const STALE_METADATA_GRACE: Duration = Duration::from_secs(1);

/// When `batch` may be sent, ignoring the in-flight window.
fn due_at(batch: &ProducerBatch, metadata_version: u64, linger: Duration) -> Instant {
    match batch.retry_at {
        Some(at) if batch.stale_metadata.is_some_and(|v| metadata_version <= v) => {
            at + STALE_METADATA_GRACE
        }
        Some(at) => at,
        None if batch.is_sealed() || batch.is_full() => batch.created_at,
        None => batch.created_at + linger,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producer::delivery::DeliveryFuture;

    fn entry(seq: u64, size: usize) -> (BatchEntry, DeliveryFuture) {
        let (delivery, fut) = DeliveryFuture::channel();
        (
            BatchEntry {
                record: OutgoingRecord {
                    timestamp: 0,
                    key: None,
                    value: Some(Bytes::from(vec![0u8; size])),
                    headers: vec![],
                },
                size,
                seq,
                delivery,
            },
            fut,
        )
    }

    fn tp() -> TopicPartition {
        TopicPartition::new("t", 0)
    }

    #[test]
    fn test_sealed_batch_rejects_records() {
        let mut batch = ProducerBatch::new(tp(), 1024);
        let (e1, _f1) = entry(1, 10);
        batch.try_append(e1).unwrap();
        batch.seal();

        let (e2, _f2) = entry(2, 10);
        let rejected = batch.try_append(e2).unwrap_err();
        assert_eq!(rejected.seq, 2);
        assert_eq!(batch.len(), 1);
        assert!(batch.is_sealed());
    }

    #[test]
    fn test_full_batch_rolls_over() {
        let mut acc = RecordAccumulator::new(25, Duration::from_secs(60));
        let mut futures = Vec::new();
        for seq in 0..3 {
            let (e, f) = entry(seq, 10);
            futures.push(f);
            acc.append(tp(), e);
        }
        // Two records fit, the third opens a second batch and seals the first.
        let queue = &acc.queues[&tp()];
        assert_eq!(queue.len(), 2);
        assert!(queue[0].is_sealed());
        assert_eq!(queue[0].len(), 2);
        assert!(!queue[1].is_sealed());
        assert_eq!(acc.record_count(), 3);
    }

    #[test]
    fn test_oversized_record_gets_own_batch() {
        let mut batch = ProducerBatch::new(tp(), 16);
        let (e, _f) = entry(0, 100);
        assert!(batch.try_append(e).is_ok());
        assert!(batch.is_full());
    }

    #[tokio::test(start_paused = true)]
    async fn test_linger_and_in_flight_window() {
        let mut acc = RecordAccumulator::new(1024, Duration::from_millis(10));
        let (e, _f) = entry(0, 10);
        acc.append(tp(), e);

        let now = Instant::now();
        assert!(acc.drain_ready(now, false, 0, 1, |_| 0).is_empty());
        assert_eq!(
            acc.next_wakeup(Duration::from_secs(120), 0, 1, |_| 0),
            Some(now + Duration::from_millis(10))
        );

        tokio::time::advance(Duration::from_millis(10)).await;
        let now = Instant::now();
        // Window full: nothing leaves.
        assert!(acc.drain_ready(now, false, 0, 1, |_| 1).is_empty());
        let ready = acc.drain_ready(now, false, 0, 1, |_| 0);
        assert_eq!(ready.len(), 1);
        assert!(ready[0].is_sealed());
        assert!(acc.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_ignores_linger() {
        let mut acc = RecordAccumulator::new(1024, Duration::from_secs(60));
        let (e, _f) = entry(0, 10);
        acc.append(tp(), e);
        assert_eq!(acc.drain_ready(Instant::now(), true, 0, 1, |_| 0).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_goes_to_front() {
        let mut acc = RecordAccumulator::new(10, Duration::ZERO);
        let mut futures = Vec::new();
        for seq in 0..2 {
            let (e, f) = entry(seq, 10);
            futures.push(f);
            acc.append(tp(), e);
        }
        let mut first = acc.drain_ready(Instant::now(), false, 0, 1, |_| 0);
        assert_eq!(first[0].entries()[0].seq, 0);

        let mut batch = first.remove(0);
        batch.retry_at = Some(Instant::now());
        acc.requeue_front(batch);

        let next = acc.drain_ready(Instant::now(), false, 0, 1, |_| 0);
        assert_eq!(next[0].entries()[0].seq, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_all_keeps_partition_order() {
        let mut acc = RecordAccumulator::new(10, Duration::ZERO);
        let mut futures = Vec::new();
        for seq in 0..4 {
            let (e, f) = entry(seq, 10);
            futures.push(f);
            acc.append(tp(), e);
        }
        let other = TopicPartition::new("t", 1);
        let (e, f) = entry(4, 10);
        futures.push(f);
        acc.append(other.clone(), e);

        // A wide window drains several batches of one partition at once.
        let drained = acc.drain_ready(Instant::now(), false, 0, 5, |_| 0);
        assert_eq!(drained.len(), 5);
        acc.requeue_front_all(drained);

        // Twice, as repeated leaderless dispatch cycles would.
        let drained = acc.drain_ready(Instant::now(), false, 0, 5, |_| 0);
        acc.requeue_front_all(drained);

        let seqs: Vec<u64> = acc
            .drain_ready(Instant::now(), false, 0, 5, |_| 0)
            .iter()
            .filter(|b| b.tp == tp())
            .map(|b| b.entries()[0].seq)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_oldest() {
        let mut acc = RecordAccumulator::new(1024, Duration::from_secs(60));
        let (e, _f) = entry(0, 10);
        acc.append(tp(), e);
        tokio::time::advance(Duration::from_secs(5)).await;
        let expired = acc.expire(Instant::now(), Duration::from_secs(5));
        assert_eq!(expired.len(), 1);
        assert!(acc.is_empty());
    }
}

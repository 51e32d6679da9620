//! Producer and consumer stand-ins that never touch a broker.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::consumer::ConsumerRecord;
use crate::error::{Error, Result};
use crate::producer::{DefaultPartitioner, Partitioner, ProducerRecord, RecordMetadata};
use crate::types::TopicPartition;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct ProducerState {
    history: Vec<ProducerRecord>,
    next_offsets: HashMap<TopicPartition, i64>,
    failures: VecDeque<Error>,
}

/// Records every send and acknowledges it immediately.
///
/// Partitions are chosen with the default partitioner over a fixed
/// partition count, so keyed records land where the real producer would
/// put them.
///
/// ```
/// use kafkaesque_client::producer::ProducerRecord;
/// use kafkaesque_client::testing::MockProducer;
///
/// # #[tokio::main]
/// # async fn main() {
/// let producer = MockProducer::new(3);
/// let metadata = producer.send(ProducerRecord::new("t", "v").with_partition(1)).await.unwrap();
/// assert_eq!((metadata.partition, metadata.offset), (1, 0));
/// assert_eq!(producer.history().len(), 1);
/// # }
/// ```
pub struct MockProducer {
    partitions: usize,
    partitioner: DefaultPartitioner,
    state: Mutex<ProducerState>,
    closed: AtomicBool,
}

impl MockProducer {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
            partitioner: DefaultPartitioner::default(),
            state: Mutex::new(ProducerState::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn send(&self, record: ProducerRecord) -> Result<RecordMetadata> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let mut state = lock(&self.state);
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        let partition = record.partition().unwrap_or_else(|| {
            self.partitioner
                .partition(record.topic(), record.key().map(|k| &k[..]), self.partitions)
        });
        let tp = TopicPartition::new(record.topic(), partition);
        let next = state.next_offsets.entry(tp).or_insert(0);
        let offset = *next;
        *next += 1;
        let metadata = RecordMetadata {
            topic: record.topic().to_string(),
            partition,
            offset,
            timestamp: record.timestamp().unwrap_or_default(),
        };
        state.history.push(record);
        Ok(metadata)
    }

    /// Fail the next send with `error`. Queued failures apply in order.
    pub fn fail_next(&self, error: Error) {
        lock(&self.state).failures.push_back(error);
    }

    /// Every record accepted so far, in send order.
    pub fn history(&self) -> Vec<ProducerRecord> {
        lock(&self.state).history.clone()
    }

    pub fn clear(&self) {
        lock(&self.state).history.clear();
    }

    pub async fn flush(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct ConsumerState {
    logs: BTreeMap<TopicPartition, Vec<ConsumerRecord>>,
    subscription: BTreeSet<String>,
    positions: HashMap<TopicPartition, i64>,
    committed: HashMap<TopicPartition, i64>,
    closed: bool,
}

impl ConsumerState {
    fn readable(&self, tp: &TopicPartition) -> bool {
        self.subscription.contains(&tp.topic)
    }
}

/// Serves records queued with [`add_record`](MockConsumer::add_record).
///
/// Every partition of a subscribed topic counts as assigned. Positions
/// start at the committed offset, or 0.
#[derive(Default)]
pub struct MockConsumer {
    state: Mutex<ConsumerState>,
}

impl MockConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a record. Its offset is the next one in its partition.
    pub fn add_record(&self, topic: &str, partition: i32, key: Option<&[u8]>, value: &[u8]) -> i64 {
        let tp = TopicPartition::new(topic, partition);
        let mut state = lock(&self.state);
        let log = state.logs.entry(tp).or_default();
        let offset = log.len() as i64;
        log.push(ConsumerRecord {
            topic: topic.to_string(),
            partition,
            offset,
            timestamp: 0,
            key: key.map(bytes::Bytes::copy_from_slice),
            value: Some(bytes::Bytes::copy_from_slice(value)),
            headers: Vec::new(),
        });
        offset
    }

    pub fn subscribe(&self, topics: &[&str]) -> Result<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(Error::Closed);
        }
        state.subscription = topics.iter().map(|t| t.to_string()).collect();
        Ok(())
    }

    pub fn subscription(&self) -> Vec<String> {
        lock(&self.state).subscription.iter().cloned().collect()
    }

    pub async fn poll(&self) -> Result<Option<ConsumerRecord>> {
        Ok(self.take(1)?.into_iter().next())
    }

    pub async fn poll_batch(&self, max_records: usize) -> Result<Vec<ConsumerRecord>> {
        self.take(max_records)
    }

    /// Next records in partition order, advancing positions.
    fn take(&self, max_records: usize) -> Result<Vec<ConsumerRecord>> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(Error::Closed);
        }
        let state = &mut *state;
        let mut out = Vec::new();
        for (tp, log) in &state.logs {
            if out.len() >= max_records {
                break;
            }
            if !state.subscription.contains(&tp.topic) {
                continue;
            }
            let start = state
                .positions
                .get(tp)
                .or_else(|| state.committed.get(tp))
                .copied()
                .unwrap_or(0);
            let batch: Vec<ConsumerRecord> = log
                .iter()
                .skip(start.max(0) as usize)
                .take(max_records - out.len())
                .cloned()
                .collect();
            state.positions.insert(tp.clone(), start + batch.len() as i64);
            out.extend(batch);
        }
        Ok(out)
    }

    pub fn position(&self, tp: &TopicPartition) -> Option<i64> {
        lock(&self.state).positions.get(tp).copied()
    }

    pub fn seek(&self, tp: &TopicPartition, offset: i64) -> Result<()> {
        let mut state = lock(&self.state);
        if offset < 0 || !state.readable(tp) {
            return Err(Error::fatal(format!("cannot seek {} to {}", tp, offset)));
        }
        state.positions.insert(tp.clone(), offset);
        Ok(())
    }

    /// Commit the current position of every partition read so far.
    pub async fn commit_sync(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(Error::Closed);
        }
        let positions: Vec<_> = state.positions.iter().map(|(tp, o)| (tp.clone(), *o)).collect();
        state.committed.extend(positions);
        Ok(())
    }

    pub fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        lock(&self.state).committed.get(tp).copied()
    }

    pub async fn close(&self) -> Result<()> {
        lock(&self.state).closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_producer_keyed_records_share_partition() {
        let producer = MockProducer::new(4);
        let a = producer
            .send(ProducerRecord::new("t", "1").with_key("user-7"))
            .await
            .unwrap();
        let b = producer
            .send(ProducerRecord::new("t", "2").with_key("user-7"))
            .await
            .unwrap();
        assert_eq!(a.partition, b.partition);
        assert_eq!((a.offset, b.offset), (0, 1));
    }

    #[tokio::test]
    async fn test_mock_producer_failure_and_close() {
        let producer = MockProducer::new(1);
        producer.fail_next(Error::retriable("injected"));
        assert!(producer.send(ProducerRecord::new("t", "v")).await.unwrap_err().is_retriable());
        assert!(producer.send(ProducerRecord::new("t", "v")).await.is_ok());

        producer.close().await.unwrap();
        assert!(matches!(producer.send(ProducerRecord::new("t", "v")).await, Err(Error::Closed)));
        assert_eq!(producer.history().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_consumer_poll_and_commit() {
        let consumer = MockConsumer::new();
        for v in ["a", "b", "c"] {
            consumer.add_record("t", 0, None, v.as_bytes());
        }
        consumer.add_record("other", 0, None, b"x");
        consumer.subscribe(&["t"]).unwrap();

        let batch = consumer.poll_batch(2).await.unwrap();
        assert_eq!(batch.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![0, 1]);
        consumer.commit_sync().await.unwrap();

        let tp = TopicPartition::new("t", 0);
        assert_eq!(consumer.committed(&tp), Some(2));
        assert_eq!(consumer.poll().await.unwrap().unwrap().offset, 2);
        assert!(consumer.poll().await.unwrap().is_none());

        consumer.seek(&tp, 0).unwrap();
        assert_eq!(consumer.poll().await.unwrap().unwrap().value_str().unwrap(), "a");
        assert!(consumer.seek(&TopicPartition::new("other", 0), 0).is_err());
    }
}

//! The producer's background task.
//!
//! One task owns the accumulator, the in-flight requests and the flush
//! bookkeeping. Callers talk to it only through [`Command`]s, so a record is
//! in exactly one place at a time: the command channel (queued), a batch in
//! the accumulator (batched), or an in-flight request.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::accumulator::{BatchEntry, ProducerBatch, RecordAccumulator};
use super::delivery::DeliverySender;
use super::record::RecordMetadata;
use crate::client::ClientCore;
use crate::config::ProducerConfig;
use crate::error::{Error, ErrorContext, KafkaCode, Result};
use crate::metrics;
use crate::network::BrokerInfo;
use crate::protocol::{OutgoingRecord, ProduceRequest};
use crate::types::TopicPartition;

pub(crate) enum Command {
    Send {
        tp: TopicPartition,
        record: OutgoingRecord,
        size: usize,
        delivery: DeliverySender,
    },
    /// Reply once every record received before this command has completed.
    Flush { done: oneshot::Sender<()> },
    /// Fail everything outstanding with `Closed` and stop.
    Close { done: oneshot::Sender<()> },
}

type InFlight = BoxFuture<'static, (u64, Result<i64>)>;

pub(crate) struct Sender {
    config: Arc<ProducerConfig>,
    core: Arc<ClientCore>,
    accumulator: RecordAccumulator,
    in_flight: FuturesUnordered<InFlight>,
    in_flight_batches: HashMap<u64, ProducerBatch>,
    in_flight_count: HashMap<TopicPartition, usize>,
    next_batch_id: u64,
    next_seq: u64,
    /// Sequence numbers of records not yet acked or failed.
    outstanding: BTreeSet<u64>,
    /// Flush callers with the first sequence number they do not wait for.
    flush_waiters: Vec<(u64, oneshot::Sender<()>)>,
    refreshing: Arc<AtomicBool>,
    refreshed_tx: mpsc::UnboundedSender<()>,
    refreshed_rx: mpsc::UnboundedReceiver<()>,
}

impl Sender {
    pub(crate) fn new(config: Arc<ProducerConfig>, core: Arc<ClientCore>) -> Self {
        let (refreshed_tx, refreshed_rx) = mpsc::unbounded_channel();
        Self {
            accumulator: RecordAccumulator::new(config.batch_size, config.linger()),
            config,
            core,
            in_flight: FuturesUnordered::new(),
            in_flight_batches: HashMap::new(),
            in_flight_count: HashMap::new(),
            next_batch_id: 0,
            next_seq: 0,
            outstanding: BTreeSet::new(),
            flush_waiters: Vec::new(),
            refreshing: Arc::new(AtomicBool::new(false)),
            refreshed_tx,
            refreshed_rx,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            let now = Instant::now();
            self.expire(now);
            self.dispatch(now);
            self.notify_flushers();

            let wakeup = {
                let counts = &self.in_flight_count;
                self.accumulator.next_wakeup(
                    self.config.delivery_timeout(),
                    self.core.metadata().version(),
                    self.config.max_in_flight_per_partition,
                    |tp| counts.get(tp).copied().unwrap_or(0),
                )
            };
            let sleep = async move {
                match wakeup {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => futures::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Send { tp, record, size, delivery }) => {
                        self.enqueue(tp, record, size, delivery);
                    }
                    Some(Command::Flush { done }) => {
                        debug!(outstanding = self.outstanding.len(), "Flush requested");
                        self.flush_waiters.push((self.next_seq, done));
                    }
                    Some(Command::Close { done }) => {
                        self.abort_all(&mut commands);
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        self.abort_all(&mut commands);
                        return;
                    }
                },
                Some((id, result)) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.complete(id, result);
                }
                Some(()) = self.refreshed_rx.recv() => {}
                _ = sleep => {}
            }
        }
    }

    fn enqueue(&mut self, tp: TopicPartition, record: OutgoingRecord, size: usize, delivery: DeliverySender) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.outstanding.insert(seq);
        metrics::RECORDS_SENT.with_label_values(&[&tp.topic]).inc();
        trace!(topic = %tp.topic, partition = tp.partition, seq, "Record batched");
        self.accumulator.append(
            tp,
            BatchEntry {
                record,
                size,
                seq,
                delivery,
            },
        );
    }

    /// Move every sendable batch onto the network.
    fn dispatch(&mut self, now: Instant) {
        let flushing = !self.flush_waiters.is_empty();
        let version = self.core.metadata().version();
        let ready = {
            let counts = &self.in_flight_count;
            self.accumulator.drain_ready(
                now,
                flushing,
                version,
                self.config.max_in_flight_per_partition,
                |tp| counts.get(tp).copied().unwrap_or(0),
            )
        };

        let mut leaderless = Vec::new();
        for mut batch in ready {
            match self.core.metadata().leader_for(&batch.tp.topic, batch.tp.partition) {
                Some(leader) => self.send_batch(batch, leader),
                None => {
                    debug!(topic = %batch.tp.topic, partition = batch.tp.partition, "No leader, waiting for metadata");
                    batch.retry_at = Some(now + self.config.retry_backoff());
                    batch.stale_metadata = Some(version);
                    self.request_refresh(&batch.tp.topic);
                    leaderless.push(batch);
                }
            }
        }
        // Several batches of one partition may be waiting; they go back in
        // the order they were drained.
        self.accumulator.requeue_front_all(leaderless);
    }

    fn send_batch(&mut self, batch: ProducerBatch, leader: BrokerInfo) {
        let id = self.next_batch_id;
        self.next_batch_id += 1;

        let tp = batch.tp.clone();
        let records = batch.encode();
        metrics::BATCH_SIZE_BYTES
            .with_label_values(&[&tp.topic])
            .observe(records.len() as f64);
        debug!(
            topic = %tp.topic,
            partition = tp.partition,
            broker = %leader.id,
            records = batch.len(),
            bytes = batch.size_bytes(),
            attempt = batch.attempts + 1,
            "Sending batch"
        );

        let acks = self.config.acks.as_i16();
        let request = ProduceRequest::single(
            tp.topic.clone(),
            tp.partition,
            records,
            acks,
            self.config.client.request_timeout_ms.min(i32::MAX as u64) as i32,
        );
        let transport = self.core.transport().clone();

        let request_future = async move {
            let result = match transport.call(leader.id, request).await {
                Ok(response) => match response.partition(&tp.topic, tp.partition) {
                    Some(p) if p.error_code == KafkaCode::None => Ok(p.base_offset),
                    Some(p) => Err(Error::from_code(
                        p.error_code,
                        ErrorContext::new().topic(tp.topic.clone()).partition(tp.partition),
                    )),
                    None if acks == 0 => Ok(-1),
                    None => Err(Error::retriable(format!(
                        "produce response did not mention {}",
                        tp
                    ))),
                },
                Err(e) => Err(e),
            };
            (id, result)
        };

        *self.in_flight_count.entry(batch.tp.clone()).or_insert(0) += 1;
        self.in_flight_batches.insert(id, batch);
        self.in_flight.push(request_future.boxed());
    }

    fn complete(&mut self, id: u64, result: Result<i64>) {
        let Some(batch) = self.in_flight_batches.remove(&id) else {
            return;
        };
        if let Some(count) = self.in_flight_count.get_mut(&batch.tp) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.in_flight_count.remove(&batch.tp);
            }
        }

        match result {
            Ok(base_offset) => self.succeed(batch, base_offset),
            Err(e) => self.retry_or_fail(batch, e),
        }
    }

    fn succeed(&mut self, batch: ProducerBatch, base_offset: i64) {
        let TopicPartition { topic, partition } = batch.tp.clone();
        let count = batch.len();
        for (i, entry) in batch.into_entries().into_iter().enumerate() {
            self.outstanding.remove(&entry.seq);
            let offset = if base_offset >= 0 {
                base_offset + i as i64
            } else {
                -1
            };
            entry.delivery.complete(Ok(RecordMetadata {
                topic: topic.clone(),
                partition,
                offset,
                timestamp: entry.record.timestamp,
            }));
        }
        metrics::RECORDS_ACKED
            .with_label_values(&[&topic])
            .inc_by(count as u64);
        trace!(%topic, partition, base_offset, count, "Batch acknowledged");
    }

    fn retry_or_fail(&mut self, mut batch: ProducerBatch, error: Error) {
        let now = Instant::now();
        let expired = batch.age(now) >= self.config.delivery_timeout();

        if !error.is_retriable() || batch.attempts >= self.config.retries || expired {
            warn!(
                topic = %batch.tp.topic,
                partition = batch.tp.partition,
                attempts = batch.attempts + 1,
                error = %error,
                "Batch failed"
            );
            self.fail(batch, error);
            return;
        }

        batch.attempts += 1;
        batch.retry_at = Some(now + self.config.retry_backoff());
        let stale_leader = error
            .kafka_code()
            .is_none_or(|code| code.invalidates_metadata() || code == KafkaCode::NetworkException);
        if stale_leader {
            batch.stale_metadata = Some(self.core.metadata().version());
            self.request_refresh(&batch.tp.topic);
        }

        metrics::BATCH_RETRIES
            .with_label_values(&[&batch.tp.topic])
            .inc();
        warn!(
            topic = %batch.tp.topic,
            partition = batch.tp.partition,
            attempt = batch.attempts,
            error = %error,
            "Retrying batch"
        );
        self.accumulator.requeue_front(batch);
    }

    fn fail(&mut self, batch: ProducerBatch, error: Error) {
        let TopicPartition { topic, partition } = batch.tp.clone();
        let error = error.with_partition(&topic, partition);
        let count = batch.len();
        for entry in batch.into_entries() {
            self.outstanding.remove(&entry.seq);
            entry.delivery.complete(Err(error.clone()));
        }
        metrics::RECORDS_FAILED
            .with_label_values(&[&topic])
            .inc_by(count as u64);
    }

    fn expire(&mut self, now: Instant) {
        let timeout = self.config.delivery_timeout();
        for batch in self.accumulator.expire(now, timeout) {
            let error = Error::Retriable {
                reason: format!("delivery timed out after {:?}", timeout),
                context: ErrorContext::new()
                    .topic(batch.tp.topic.clone())
                    .partition(batch.tp.partition)
                    .code(KafkaCode::RequestTimedOut),
            };
            warn!(topic = %batch.tp.topic, partition = batch.tp.partition, records = batch.len(), "Batch expired");
            self.fail(batch, error);
        }
    }

    /// Refresh metadata in the background; at most one refresh at a time.
    fn request_refresh(&self, topic: &str) {
        if self.refreshing.swap(true, Ordering::SeqCst) {
            return;
        }
        let metadata = self.core.metadata().clone();
        let refreshing = self.refreshing.clone();
        let done = self.refreshed_tx.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            if let Err(e) = metadata.refresh(&[topic.as_str()]).await {
                warn!(%topic, error = %e, "Metadata refresh for producer failed");
            }
            refreshing.store(false, Ordering::SeqCst);
            let _ = done.send(());
        });
    }

    fn notify_flushers(&mut self) {
        if self.flush_waiters.is_empty() {
            return;
        }
        let oldest = self.outstanding.first().copied();
        let (done, waiting): (Vec<_>, Vec<_>) = self
            .flush_waiters
            .drain(..)
            .partition(|(upto, _)| oldest.is_none_or(|seq| seq >= *upto));
        self.flush_waiters = waiting;
        for (_, tx) in done {
            let _ = tx.send(());
        }
    }

    fn abort_all(&mut self, commands: &mut mpsc::Receiver<Command>) {
        commands.close();
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::Send { delivery, .. } => delivery.complete(Err(Error::Closed)),
                Command::Flush { done } | Command::Close { done } => {
                    let _ = done.send(());
                }
            }
        }

        let aborted = self.outstanding.len();
        for batch in self.accumulator.drain_all() {
            self.fail(batch, Error::Closed);
        }
        self.in_flight.clear();
        self.in_flight_count.clear();
        let batches: Vec<ProducerBatch> = self.in_flight_batches.drain().map(|(_, b)| b).collect();
        for batch in batches {
            self.fail(batch, Error::Closed);
        }
        for (_, done) in self.flush_waiters.drain(..) {
            let _ = done.send(());
        }
        debug!(aborted, "Producer sender stopped");
    }
}

//! Batching producer.
//!
//! [`Producer::send`] resolves the record's partition, hands the record to a
//! background sender task and returns a [`DeliveryFuture`] for it. The sender
//! groups records per partition into batches, sends each batch to the
//! partition leader and retries retriable failures against refreshed
//! metadata.
//!
//! # Ordering
//!
//! Within a partition, acknowledgments arrive in the order batches were
//! sealed as long as `max_in_flight_per_partition` is 1 (the default). With a
//! larger window and `retries > 0`, a retried batch can land after a batch
//! sealed later.
//!
//! # Example
//!
//! ```rust,no_run
//! use kafkaesque_client::config::ProducerConfig;
//! use kafkaesque_client::producer::{Producer, ProducerRecord};
//!
//! # async fn example() -> kafkaesque_client::error::Result<()> {
//! let producer = Producer::new(ProducerConfig::new("localhost:9092"))?;
//! let delivery = producer
//!     .send(ProducerRecord::new("orders", "created").with_key("order-17"))
//!     .await?;
//! let metadata = delivery.await?;
//! println!("written at {}-{}@{}", metadata.topic, metadata.partition, metadata.offset);
//! producer.close_with_flush().await?;
//! # Ok(())
//! # }
//! ```

mod accumulator;
mod delivery;
mod partitioner;
mod record;
mod sender;

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

pub use delivery::{DeliveryFuture, DeliveryTracker};
pub use partitioner::{DefaultPartitioner, Partitioner, murmur2_partition};
pub use record::{ProducerRecord, RecordMetadata};

use crate::client::ClientCore;
use crate::config::ProducerConfig;
use crate::error::{Error, ErrorContext, KafkaCode, Result};
use crate::metadata::MetadataCache;
use crate::network::Transport;
use crate::types::TopicPartition;
use sender::{Command, Sender};

/// Asynchronous, batching Kafka producer.
pub struct Producer {
    core: Arc<ClientCore>,
    config: Arc<ProducerConfig>,
    partitioner: Arc<dyn Partitioner>,
    commands: mpsc::Sender<Command>,
    closed: AtomicBool,
}

impl Producer {
    /// Connect to the cluster over TCP. Must be called within a Tokio runtime.
    pub fn new(config: ProducerConfig) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        let core = ClientCore::connect(config.client.clone())?;
        Ok(Self::start(config, core))
    }

    /// Produce over an existing transport, such as
    /// [`MockCluster`](crate::testing::MockCluster).
    pub fn with_transport(config: ProducerConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        let core = ClientCore::with_transport(config.client.clone(), transport);
        Ok(Self::start(config, core))
    }

    fn start(config: ProducerConfig, core: Arc<ClientCore>) -> Self {
        let config = Arc::new(config);
        let (commands, rx) = mpsc::channel(config.queue_depth.max(1));
        tokio::spawn(Sender::new(config.clone(), core.clone()).run(rx));
        info!(
            client_id = %config.client.client_id,
            acks = ?config.acks,
            max_in_flight = config.max_in_flight_per_partition,
            retries = config.retries,
            "Producer started"
        );

        Self {
            core,
            config,
            partitioner: Arc::new(DefaultPartitioner),
            commands,
            closed: AtomicBool::new(false),
        }
    }

    /// Replace the partitioner used for records without a partition.
    pub fn with_partitioner(mut self, partitioner: impl Partitioner + 'static) -> Self {
        self.partitioner = Arc::new(partitioner);
        self
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<MetadataCache> {
        self.core.metadata()
    }

    /// Queue `record` for delivery.
    ///
    /// Waits only for partition resolution (and queue space); the returned
    /// future resolves when the record is acknowledged or fails.
    pub async fn send(&self, record: ProducerRecord) -> Result<DeliveryFuture> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let size = record.estimated_size();
        if size > self.config.max_request_size {
            return Err(Error::Fatal {
                reason: format!(
                    "record of {} bytes exceeds max.request.size {}",
                    size, self.config.max_request_size
                ),
                context: ErrorContext::new()
                    .topic(record.topic())
                    .code(KafkaCode::MessageSizeTooLarge),
            });
        }

        let tp = self.resolve_partition(&record).await?;
        let (_, outgoing) = record.into_outgoing();
        let (delivery, future) = DeliveryFuture::channel();
        self.commands
            .send(Command::Send {
                tp,
                record: outgoing,
                size,
                delivery,
            })
            .await
            .map_err(|_| Error::Closed)?;
        Ok(future)
    }

    /// Send `value` serialized as JSON.
    pub async fn send_json<T>(&self, topic: &str, key: Option<&str>, value: &T) -> Result<DeliveryFuture>
    where
        T: Serialize + Debug,
    {
        let mut record = ProducerRecord::json(topic, value)?;
        if let Some(key) = key {
            record = record.with_key(key.to_string());
        }
        self.send(record).await
    }

    /// Send `value` as UTF-8 text.
    pub async fn send_string(&self, topic: &str, key: Option<&str>, value: &str) -> Result<DeliveryFuture> {
        let mut record = ProducerRecord::new(topic, value.to_string());
        if let Some(key) = key {
            record = record.with_key(key.to_string());
        }
        self.send(record).await
    }

    async fn resolve_partition(&self, record: &ProducerRecord) -> Result<TopicPartition> {
        let topic = record.topic();
        let count = self.core.metadata().ensure_topic(topic).await?;
        let partition = match record.partition() {
            Some(p) if p >= 0 && (p as usize) < count => p,
            Some(p) => {
                return Err(Error::Fatal {
                    reason: format!("topic {} has {} partitions", topic, count),
                    context: ErrorContext::new()
                        .topic(topic)
                        .partition(p)
                        .code(KafkaCode::UnknownTopicOrPartition),
                });
            }
            None => self
                .partitioner
                .partition(topic, record.key().map(|k| &k[..]), count),
        };
        Ok(TopicPartition::new(topic, partition))
    }

    /// Wait until every record sent before this call is acknowledged or failed.
    pub async fn flush(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let (done, rx) = oneshot::channel();
        self.commands
            .send(Command::Flush { done })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Abort every outstanding record with `Closed` and release connections.
    ///
    /// Every outstanding [`DeliveryFuture`] is completed before this returns.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Close { done }).await.is_ok() {
            let _ = rx.await;
        }
        self.core.close().await;
        debug!("Producer closed");
        Ok(())
    }

    /// [`flush`](Self::flush), then [`close`](Self::close).
    pub async fn close_with_flush(&self) -> Result<()> {
        self.flush().await?;
        self.close().await
    }
}

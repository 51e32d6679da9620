//! # Kafkaesque Client
//! A from-scratch Kafka client core: producer, consumer with group
//! membership, and topic administration, speaking the Kafka wire protocol
//! directly over Tokio.
//!
//! [Documentation](https://docs.rs/kafkaesque-client/latest/kafkaesque_client/)
//!
//! # Goals
//! - Easy to understand code
//! - Leverage best in class libraries such as [Tokio](https://tokio.rs/), [Nom](https://docs.rs/nom/latest/nom/)
//! - Classic, non-flexible protocol versions only, pinned per API
//! - Everything testable in-process through the [`Transport`](network::Transport) seam
//!
//! ## Getting started
//! ```toml
//! kafkaesque-client = "0.1"
//! ```
//!
//! ### Producing
//! ```rust,no_run
//! use kafkaesque_client::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let producer = Producer::new(ProducerConfig::new("localhost:9092"))?;
//!     let delivery = producer
//!         .send(ProducerRecord::new("orders", "created").with_key("order-17"))
//!         .await?;
//!     let metadata = delivery.await?;
//!     println!("written to {}@{}", metadata.topic_partition(), metadata.offset);
//!     producer.close().await
//! }
//! ```
//!
//! ### Consuming in a group
//! ```rust,no_run
//! use std::time::Duration;
//! use kafkaesque_client::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let mut consumer = Consumer::new(ConsumerConfig::new("localhost:9092", "billing"))?;
//!     consumer.subscribe(&["orders"])?;
//!     while let Some(record) = consumer.poll(Duration::from_secs(1)).await? {
//!         println!("{}@{}: {:?}", record.topic_partition(), record.offset, record.value_str());
//!     }
//!     consumer.close().await
//! }
//! ```
//!
//! ### Testing without a broker
//! [`testing::MockCluster`] implements the transport in memory, so the real
//! clients can be exercised in unit tests:
//!
//! ```rust
//! use kafkaesque_client::prelude::*;
//! use kafkaesque_client::testing::MockCluster;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let cluster = MockCluster::new(1).with_topic("orders", 1);
//! let producer = Producer::with_transport(ProducerConfig::new("mock:9092"), cluster.transport())?;
//! producer.send(ProducerRecord::new("orders", "v")).await?.await?;
//! assert_eq!(cluster.records(&TopicPartition::new("orders", 0)).len(), 1);
//! producer.close().await
//! # }
//! ```
//!
//! ## Resources
//! - [Kafka Protocol Spec](https://kafka.apache.org/protocol.html)
//! - [Confluence Docs](https://cwiki.apache.org/confluence/display/KAFKA/A+Guide+To+The+Kafka+Protocol)
#![forbid(unsafe_code)]

mod encode;
pub mod error;
mod parser;
pub mod protocol;
pub mod types;

pub mod client;
pub mod config;
pub mod constants;
pub mod metadata;
pub mod network;
pub mod retry;

pub mod admin;
pub mod consumer;
pub mod group;
pub mod producer;

pub mod metrics;
pub mod telemetry;
pub mod testing;

pub mod prelude {
    //! Everyday client types.
    //!
    //! ```rust,no_run
    //! use kafkaesque_client::prelude::*;
    //!
    //! # fn example() -> Result<()> {
    //! let producer = Producer::new(ProducerConfig::new("localhost:9092"))?;
    //! let consumer = Consumer::new(ConsumerConfig::new("localhost:9092", "group"))?;
    //! let admin = Admin::new(AdminConfig::new("localhost:9092"))?;
    //! # Ok(())
    //! # }
    //! ```
    pub use crate::admin::{Admin, AdminError, TopicConfig, TopicResult};
    pub use crate::config::{Acks, AdminConfig, ClientConfig, ConsumerConfig, ProducerConfig};
    pub use crate::consumer::{Consumer, ConsumerRecord, ConsumerState, RecordStream};
    pub use crate::error::{Error, KafkaCode, Result};
    pub use crate::producer::{DeliveryFuture, Partitioner, Producer, ProducerRecord, RecordMetadata};
    pub use crate::types::{BrokerId, GenerationId, Offset, TopicPartition};

    pub use bytes;
}

//! Outbound records and their acknowledgment metadata.

use std::fmt::Debug;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::protocol::{BatchRecord, OutgoingRecord, RecordHeader};
use crate::types::TopicPartition;

/// A record to send.
///
/// Built once and never modified afterwards: every builder method consumes
/// the record and returns a new one.
///
/// ```
/// use kafkaesque_client::producer::ProducerRecord;
///
/// let record = ProducerRecord::new("orders", "created")
///     .with_key("order-17")
///     .with_header("source", "web");
/// assert_eq!(record.topic(), "orders");
/// assert_eq!(record.partition(), None);
/// ```
#[derive(Debug, Clone)]
pub struct ProducerRecord {
    topic: String,
    partition: Option<i32>,
    key: Option<Bytes>,
    value: Option<Bytes>,
    headers: Vec<RecordHeader>,
    timestamp: Option<i64>,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: None,
            value: Some(value.into()),
            headers: Vec::new(),
            timestamp: None,
        }
    }

    /// A record with a null value, which compacted topics treat as a delete.
    pub fn tombstone(topic: impl Into<String>, key: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: Some(key.into()),
            value: None,
            headers: Vec::new(),
            timestamp: None,
        }
    }

    /// Serialize `value` as JSON.
    pub fn json<T: Serialize + Debug>(topic: impl Into<String>, value: &T) -> Result<Self> {
        let payload = serde_json::to_vec(value).map_err(|e| Error::serialization(value, e))?;
        Ok(Self::new(topic, payload))
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Pin the record to a partition, bypassing the partitioner.
    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push(RecordHeader::new(key, value));
        self
    }

    /// Milliseconds since the epoch. Defaults to the time of `send`.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> Option<i32> {
        self.partition
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn headers(&self) -> &[RecordHeader] {
        &self.headers
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    /// Encoded size inside a batch, used against `batch_size`.
    pub(crate) fn estimated_size(&self) -> usize {
        BatchRecord {
            offset_delta: 0,
            timestamp_delta: 0,
            key: self.key.clone(),
            value: self.value.clone(),
            headers: self.headers.clone(),
        }
        .encoded_size()
    }

    /// Resolve into the wire representation, stamping the time if unset.
    pub(crate) fn into_outgoing(self) -> (String, OutgoingRecord) {
        let timestamp = self.timestamp.unwrap_or_else(now_millis);
        (
            self.topic,
            OutgoingRecord {
                timestamp,
                key: self.key,
                value: self.value,
                headers: self.headers,
            },
        )
    }
}

/// Where an acknowledged record landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    /// -1 with `acks = 0`, where the broker reports nothing.
    pub offset: i64,
    pub timestamp: i64,
}

impl RecordMetadata {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize)]
    struct Order {
        id: u32,
        item: String,
    }

    #[test]
    fn test_builder_and_accessors() {
        let record = ProducerRecord::new("t", "v")
            .with_key("k")
            .with_partition(2)
            .with_header("h", "x")
            .with_timestamp(1_700_000_000_000);
        assert_eq!(record.partition(), Some(2));
        assert_eq!(record.key().unwrap().as_ref(), b"k");
        assert_eq!(record.headers()[0].key, "h");

        let (topic, outgoing) = record.into_outgoing();
        assert_eq!(topic, "t");
        assert_eq!(outgoing.timestamp, 1_700_000_000_000);
        assert_eq!(outgoing.value.unwrap().as_ref(), b"v");
    }

    #[test]
    fn test_json_record() {
        let record = ProducerRecord::json(
            "orders",
            &Order {
                id: 7,
                item: "book".into(),
            },
        )
        .unwrap();
        assert_eq!(
            record.value().unwrap().as_ref(),
            br#"{"id":7,"item":"book"}"#
        );
    }

    #[test]
    fn test_json_failure_carries_value() {
        let mut map = std::collections::HashMap::new();
        map.insert(vec![1u8], "non-string key");
        let err = ProducerRecord::json("t", &map).unwrap_err();
        match err {
            Error::Serialization { value, .. } => assert!(value.contains("non-string key")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_tombstone_has_no_value() {
        let record = ProducerRecord::tombstone("t", "k");
        assert!(record.value().is_none());
        assert!(record.estimated_size() > 0);
    }
}

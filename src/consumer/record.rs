//! Inbound records.

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::protocol::{RecordBatch, RecordHeader};
use crate::types::TopicPartition;

/// A record read from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    pub key: Option<Bytes>,
    /// `None` for tombstones.
    pub value: Option<Bytes>,
    pub headers: Vec<RecordHeader>,
}

impl ConsumerRecord {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Decode the value as JSON.
    ///
    /// ```
    /// use bytes::Bytes;
    /// use kafkaesque_client::consumer::ConsumerRecord;
    ///
    /// let record = ConsumerRecord {
    ///     topic: "t".into(),
    ///     partition: 0,
    ///     offset: 0,
    ///     timestamp: 0,
    ///     key: None,
    ///     value: Some(Bytes::from_static(br#"{"id":1}"#)),
    ///     headers: vec![],
    /// };
    /// let value: serde_json::Value = record.value_json().unwrap();
    /// assert_eq!(value["id"], 1);
    /// ```
    pub fn value_json<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self.require_value()?;
        serde_json::from_slice(value)
            .map_err(|e| Error::serialization(String::from_utf8_lossy(value), e))
    }

    /// The value as UTF-8 text.
    pub fn value_str(&self) -> Result<&str> {
        let value = self.require_value()?;
        std::str::from_utf8(value).map_err(|e| Error::serialization(value, e))
    }

    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| std::str::from_utf8(k).ok())
    }

    pub fn header(&self, key: &str) -> Option<&Bytes> {
        self.headers
            .iter()
            .find(|h| h.key == key)
            .and_then(|h| h.value.as_ref())
    }

    fn require_value(&self) -> Result<&[u8]> {
        self.value.as_deref().ok_or_else(|| {
            Error::serialization(
                format!("{}@{}", self.topic_partition(), self.offset),
                "record has a null value",
            )
        })
    }
}

/// Flatten a decoded batch into records at or above `from_offset`.
pub(crate) fn records_from_batch(
    topic: &str,
    partition: i32,
    batch: RecordBatch,
    from_offset: i64,
) -> impl Iterator<Item = ConsumerRecord> + '_ {
    let base_offset = batch.base_offset;
    let base_timestamp = batch.base_timestamp;
    let skip_all = batch.is_control();
    batch
        .records
        .into_iter()
        .filter(move |_| !skip_all)
        .map(move |r| ConsumerRecord {
            topic: topic.to_string(),
            partition,
            offset: base_offset + i64::from(r.offset_delta),
            timestamp: base_timestamp + r.timestamp_delta,
            key: r.key,
            value: r.value,
            headers: r.headers,
        })
        .filter(move |r| r.offset >= from_offset)
}

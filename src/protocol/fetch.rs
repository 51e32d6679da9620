//! Fetch v4.

use bytes::{BufMut, Bytes};
use nom::{
    IResult,
    number::complete::{be_i16, be_i32, be_i64},
};
use nombytes::NomBytes;

use crate::constants::CONSUMER_REPLICA_ID;
use crate::encode::{ToByte, encode_array};
use crate::error::{KafkaCode, Result};
use crate::parser::{parse_array, parse_nullable_bytes, parse_utf8};

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub replica_id: i32,
    pub max_wait_ms: i32,
    pub min_bytes: i32,
    pub max_bytes: i32,
    /// 0 = read uncommitted, 1 = read committed.
    pub isolation_level: i8,
    pub topics: Vec<FetchTopic>,
}

#[derive(Debug, Clone)]
pub struct FetchTopic {
    pub name: String,
    pub partitions: Vec<FetchPartition>,
}

#[derive(Debug, Clone)]
pub struct FetchPartition {
    pub partition_index: i32,
    pub fetch_offset: i64,
    pub partition_max_bytes: i32,
}

impl FetchRequest {
    pub fn new(max_wait_ms: i32, min_bytes: i32, max_bytes: i32) -> Self {
        Self {
            replica_id: CONSUMER_REPLICA_ID,
            max_wait_ms,
            min_bytes,
            max_bytes,
            isolation_level: 0,
            topics: Vec::new(),
        }
    }

    /// Add a partition, grouping it under its topic.
    pub fn add_partition(
        &mut self,
        topic: &str,
        partition_index: i32,
        fetch_offset: i64,
        partition_max_bytes: i32,
    ) {
        let partition = FetchPartition {
            partition_index,
            fetch_offset,
            partition_max_bytes,
        };
        match self.topics.iter_mut().find(|t| t.name == topic) {
            Some(entry) => entry.partitions.push(partition),
            None => self.topics.push(FetchTopic {
                name: topic.to_string(),
                partitions: vec![partition],
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

impl ToByte for FetchRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.replica_id.encode(buffer)?;
        self.max_wait_ms.encode(buffer)?;
        self.min_bytes.encode(buffer)?;
        self.max_bytes.encode(buffer)?;
        self.isolation_level.encode(buffer)?;
        encode_array(buffer, &self.topics)
    }
}

impl ToByte for FetchTopic {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.name.encode(buffer)?;
        encode_array(buffer, &self.partitions)
    }
}

impl ToByte for FetchPartition {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.partition_index.encode(buffer)?;
        self.fetch_offset.encode(buffer)?;
        self.partition_max_bytes.encode(buffer)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub throttle_time_ms: i32,
    pub responses: Vec<FetchTopicResponse>,
}

#[derive(Debug, Clone)]
pub struct FetchTopicResponse {
    pub name: String,
    pub partitions: Vec<FetchPartitionResponse>,
}

#[derive(Debug, Clone, Default)]
pub struct FetchPartitionResponse {
    pub partition_index: i32,
    pub error_code: KafkaCode,
    pub high_watermark: i64,
    pub last_stable_offset: i64,
    pub aborted_transactions: Vec<AbortedTransaction>,
    /// Raw RecordBatches; the last one may be truncated.
    pub records: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortedTransaction {
    pub producer_id: i64,
    pub first_offset: i64,
}

pub fn parse_fetch_response(s: NomBytes) -> IResult<NomBytes, FetchResponse> {
    let (s, throttle_time_ms) = be_i32(s)?;
    let (s, responses) = parse_array(parse_fetch_topic_response)(s)?;
    Ok((
        s,
        FetchResponse {
            throttle_time_ms,
            responses,
        },
    ))
}

fn parse_fetch_topic_response(s: NomBytes) -> IResult<NomBytes, FetchTopicResponse> {
    let (s, name) = parse_utf8(s)?;
    let (s, partitions) = parse_array(parse_fetch_partition_response)(s)?;
    Ok((s, FetchTopicResponse { name, partitions }))
}

fn parse_aborted_transaction(s: NomBytes) -> IResult<NomBytes, AbortedTransaction> {
    let (s, producer_id) = be_i64(s)?;
    let (s, first_offset) = be_i64(s)?;
    Ok((
        s,
        AbortedTransaction {
            producer_id,
            first_offset,
        },
    ))
}

fn parse_fetch_partition_response(s: NomBytes) -> IResult<NomBytes, FetchPartitionResponse> {
    let (s, partition_index) = be_i32(s)?;
    let (s, error_code) = be_i16(s)?;
    let (s, high_watermark) = be_i64(s)?;
    let (s, last_stable_offset) = be_i64(s)?;
    let (s, aborted_transactions) = parse_array(parse_aborted_transaction)(s)?;
    let (s, records) = parse_nullable_bytes(s)?;
    Ok((
        s,
        FetchPartitionResponse {
            partition_index,
            error_code: KafkaCode::from_wire(error_code),
            high_watermark,
            last_stable_offset,
            aborted_transactions,
            records: records.unwrap_or_default(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_partition_groups_by_topic() {
        let mut request = FetchRequest::new(500, 1, 1024);
        request.add_partition("a", 0, 10, 100);
        request.add_partition("b", 0, 0, 100);
        request.add_partition("a", 1, 20, 100);

        assert_eq!(request.topics.len(), 2);
        assert_eq!(request.topics[0].partitions.len(), 2);
        assert_eq!(request.replica_id, -1);
    }

    #[test]
    fn test_parse_fetch_response_null_records() {
        let mut buf = Vec::new();
        buf.put_i32(0); // throttle
        buf.put_i32(1);
        buf.put_i16(1);
        buf.put_slice(b"t");
        buf.put_i32(1);
        buf.put_i32(3);
        buf.put_i16(1); // OffsetOutOfRange
        buf.put_i64(50);
        buf.put_i64(50);
        buf.put_i32(-1); // null aborted transactions
        buf.put_i32(-1); // null records

        let (_, response) = parse_fetch_response(NomBytes::new(Bytes::from(buf))).unwrap();
        let partition = &response.responses[0].partitions[0];
        assert_eq!(partition.partition_index, 3);
        assert_eq!(partition.error_code, KafkaCode::OffsetOutOfRange);
        assert_eq!(partition.high_watermark, 50);
        assert!(partition.records.is_empty());
    }
}

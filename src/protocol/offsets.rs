//! ListOffsets v1, OffsetCommit v2 and OffsetFetch v1.

use bytes::BufMut;
use nom::{
    IResult,
    number::complete::{be_i16, be_i32, be_i64},
};
use nombytes::NomBytes;

use crate::constants::CONSUMER_REPLICA_ID;
use crate::encode::{ToByte, encode_array};
use crate::error::{KafkaCode, Result};
use crate::parser::{parse_array, parse_nullable_utf8, parse_utf8};

// ============================================================================
// ListOffsets
// ============================================================================

#[derive(Debug, Clone)]
pub struct ListOffsetsRequest {
    pub replica_id: i32,
    pub topics: Vec<ListOffsetsTopic>,
}

#[derive(Debug, Clone)]
pub struct ListOffsetsTopic {
    pub name: String,
    pub partitions: Vec<ListOffsetsPartition>,
}

#[derive(Debug, Clone)]
pub struct ListOffsetsPartition {
    pub partition_index: i32,
    /// -1 for the log end, -2 for the log start, otherwise a timestamp.
    pub timestamp: i64,
}

impl ListOffsetsRequest {
    pub fn new() -> Self {
        Self {
            replica_id: CONSUMER_REPLICA_ID,
            topics: Vec::new(),
        }
    }

    pub fn add_partition(&mut self, topic: &str, partition_index: i32, timestamp: i64) {
        let partition = ListOffsetsPartition {
            partition_index,
            timestamp,
        };
        match self.topics.iter_mut().find(|t| t.name == topic) {
            Some(entry) => entry.partitions.push(partition),
            None => self.topics.push(ListOffsetsTopic {
                name: topic.to_string(),
                partitions: vec![partition],
            }),
        }
    }
}

impl Default for ListOffsetsRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl ToByte for ListOffsetsRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.replica_id.encode(buffer)?;
        encode_array(buffer, &self.topics)
    }
}

impl ToByte for ListOffsetsTopic {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.name.encode(buffer)?;
        encode_array(buffer, &self.partitions)
    }
}

impl ToByte for ListOffsetsPartition {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.partition_index.encode(buffer)?;
        self.timestamp.encode(buffer)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListOffsetsResponse {
    pub topics: Vec<ListOffsetsTopicResponse>,
}

#[derive(Debug, Clone)]
pub struct ListOffsetsTopicResponse {
    pub name: String,
    pub partitions: Vec<ListOffsetsPartitionResponse>,
}

#[derive(Debug, Clone, Default)]
pub struct ListOffsetsPartitionResponse {
    pub partition_index: i32,
    pub error_code: KafkaCode,
    pub timestamp: i64,
    pub offset: i64,
}

pub fn parse_list_offsets_response(s: NomBytes) -> IResult<NomBytes, ListOffsetsResponse> {
    let (s, topics) = parse_array(parse_list_offsets_topic_response)(s)?;
    Ok((s, ListOffsetsResponse { topics }))
}

fn parse_list_offsets_topic_response(s: NomBytes) -> IResult<NomBytes, ListOffsetsTopicResponse> {
    let (s, name) = parse_utf8(s)?;
    let (s, partitions) = parse_array(parse_list_offsets_partition_response)(s)?;
    Ok((s, ListOffsetsTopicResponse { name, partitions }))
}

fn parse_list_offsets_partition_response(
    s: NomBytes,
) -> IResult<NomBytes, ListOffsetsPartitionResponse> {
    let (s, partition_index) = be_i32(s)?;
    let (s, error_code) = be_i16(s)?;
    let (s, timestamp) = be_i64(s)?;
    let (s, offset) = be_i64(s)?;
    Ok((
        s,
        ListOffsetsPartitionResponse {
            partition_index,
            error_code: KafkaCode::from_wire(error_code),
            timestamp,
            offset,
        },
    ))
}

// ============================================================================
// OffsetCommit
// ============================================================================

#[derive(Debug, Clone)]
pub struct OffsetCommitRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
    pub retention_time_ms: i64,
    pub topics: Vec<OffsetCommitTopic>,
}

#[derive(Debug, Clone)]
pub struct OffsetCommitTopic {
    pub name: String,
    pub partitions: Vec<OffsetCommitPartition>,
}

#[derive(Debug, Clone)]
pub struct OffsetCommitPartition {
    pub partition_index: i32,
    pub committed_offset: i64,
    pub committed_metadata: Option<String>,
}

impl OffsetCommitRequest {
    pub fn add_offset(&mut self, topic: &str, partition_index: i32, offset: i64) {
        let partition = OffsetCommitPartition {
            partition_index,
            committed_offset: offset,
            committed_metadata: None,
        };
        match self.topics.iter_mut().find(|t| t.name == topic) {
            Some(entry) => entry.partitions.push(partition),
            None => self.topics.push(OffsetCommitTopic {
                name: topic.to_string(),
                partitions: vec![partition],
            }),
        }
    }
}

impl ToByte for OffsetCommitRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.group_id.encode(buffer)?;
        self.generation_id.encode(buffer)?;
        self.member_id.encode(buffer)?;
        self.retention_time_ms.encode(buffer)?;
        encode_array(buffer, &self.topics)
    }
}

impl ToByte for OffsetCommitTopic {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.name.encode(buffer)?;
        encode_array(buffer, &self.partitions)
    }
}

impl ToByte for OffsetCommitPartition {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.partition_index.encode(buffer)?;
        self.committed_offset.encode(buffer)?;
        self.committed_metadata.encode(buffer)
    }
}

#[derive(Debug, Clone, Default)]
pub struct OffsetCommitResponse {
    pub topics: Vec<OffsetCommitTopicResponse>,
}

#[derive(Debug, Clone)]
pub struct OffsetCommitTopicResponse {
    pub name: String,
    pub partitions: Vec<OffsetCommitPartitionResponse>,
}

#[derive(Debug, Clone, Default)]
pub struct OffsetCommitPartitionResponse {
    pub partition_index: i32,
    pub error_code: KafkaCode,
}

impl OffsetCommitResponse {
    /// First partition-level error, if any.
    pub fn first_error(&self) -> Option<(&str, i32, KafkaCode)> {
        self.topics.iter().find_map(|t| {
            t.partitions
                .iter()
                .find(|p| p.error_code != KafkaCode::None)
                .map(|p| (t.name.as_str(), p.partition_index, p.error_code))
        })
    }
}

pub fn parse_offset_commit_response(s: NomBytes) -> IResult<NomBytes, OffsetCommitResponse> {
    let (s, topics) = parse_array(parse_offset_commit_topic_response)(s)?;
    Ok((s, OffsetCommitResponse { topics }))
}

fn parse_offset_commit_topic_response(
    s: NomBytes,
) -> IResult<NomBytes, OffsetCommitTopicResponse> {
    let (s, name) = parse_utf8(s)?;
    let (s, partitions) = parse_array(parse_offset_commit_partition_response)(s)?;
    Ok((s, OffsetCommitTopicResponse { name, partitions }))
}

fn parse_offset_commit_partition_response(
    s: NomBytes,
) -> IResult<NomBytes, OffsetCommitPartitionResponse> {
    let (s, partition_index) = be_i32(s)?;
    let (s, error_code) = be_i16(s)?;
    Ok((
        s,
        OffsetCommitPartitionResponse {
            partition_index,
            error_code: KafkaCode::from_wire(error_code),
        },
    ))
}

// ============================================================================
// OffsetFetch
// ============================================================================

#[derive(Debug, Clone)]
pub struct OffsetFetchRequest {
    pub group_id: String,
    pub topics: Vec<OffsetFetchTopic>,
}

#[derive(Debug, Clone)]
pub struct OffsetFetchTopic {
    pub name: String,
    pub partition_indexes: Vec<i32>,
}

impl OffsetFetchRequest {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            topics: Vec::new(),
        }
    }

    pub fn add_partition(&mut self, topic: &str, partition_index: i32) {
        match self.topics.iter_mut().find(|t| t.name == topic) {
            Some(entry) => entry.partition_indexes.push(partition_index),
            None => self.topics.push(OffsetFetchTopic {
                name: topic.to_string(),
                partition_indexes: vec![partition_index],
            }),
        }
    }
}

impl ToByte for OffsetFetchRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.group_id.encode(buffer)?;
        encode_array(buffer, &self.topics)
    }
}

impl ToByte for OffsetFetchTopic {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.name.encode(buffer)?;
        encode_array(buffer, &self.partition_indexes)
    }
}

#[derive(Debug, Clone, Default)]
pub struct OffsetFetchResponse {
    pub topics: Vec<OffsetFetchTopicResponse>,
}

#[derive(Debug, Clone)]
pub struct OffsetFetchTopicResponse {
    pub name: String,
    pub partitions: Vec<OffsetFetchPartitionResponse>,
}

#[derive(Debug, Clone, Default)]
pub struct OffsetFetchPartitionResponse {
    pub partition_index: i32,
    /// -1 when the group has no committed offset for this partition.
    pub committed_offset: i64,
    pub metadata: Option<String>,
    pub error_code: KafkaCode,
}

pub fn parse_offset_fetch_response(s: NomBytes) -> IResult<NomBytes, OffsetFetchResponse> {
    let (s, topics) = parse_array(parse_offset_fetch_topic_response)(s)?;
    Ok((s, OffsetFetchResponse { topics }))
}

fn parse_offset_fetch_topic_response(s: NomBytes) -> IResult<NomBytes, OffsetFetchTopicResponse> {
    let (s, name) = parse_utf8(s)?;
    let (s, partitions) = parse_array(parse_offset_fetch_partition_response)(s)?;
    Ok((s, OffsetFetchTopicResponse { name, partitions }))
}

fn parse_offset_fetch_partition_response(
    s: NomBytes,
) -> IResult<NomBytes, OffsetFetchPartitionResponse> {
    let (s, partition_index) = be_i32(s)?;
    let (s, committed_offset) = be_i64(s)?;
    let (s, metadata) = parse_nullable_utf8(s)?;
    let (s, error_code) = be_i16(s)?;
    Ok((
        s,
        OffsetFetchPartitionResponse {
            partition_index,
            committed_offset,
            metadata,
            error_code: KafkaCode::from_wire(error_code),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_offset_commit_request_encode() {
        let mut request = OffsetCommitRequest {
            group_id: "g".to_string(),
            generation_id: 4,
            member_id: "m".to_string(),
            retention_time_ms: -1,
            topics: vec![],
        };
        request.add_offset("t", 0, 42);

        let mut buf = Vec::new();
        request.encode(&mut buf).unwrap();

        // group(3) + generation(4) + member(3) + retention(8) + topics(4)
        // + topic name(3) + partitions(4) + partition(4) + offset(8) + null metadata(2)
        assert_eq!(buf.len(), 43);
        assert_eq!(&buf[3..7], &4i32.to_be_bytes());
    }

    #[test]
    fn test_offset_commit_first_error() {
        let response = OffsetCommitResponse {
            topics: vec![OffsetCommitTopicResponse {
                name: "t".to_string(),
                partitions: vec![
                    OffsetCommitPartitionResponse {
                        partition_index: 0,
                        error_code: KafkaCode::None,
                    },
                    OffsetCommitPartitionResponse {
                        partition_index: 1,
                        error_code: KafkaCode::IllegalGeneration,
                    },
                ],
            }],
        };
        assert_eq!(
            response.first_error(),
            Some(("t", 1, KafkaCode::IllegalGeneration))
        );
    }

    #[test]
    fn test_parse_offset_fetch_response() {
        let mut buf = Vec::new();
        buf.put_i32(1);
        buf.put_i16(1);
        buf.put_slice(b"t");
        buf.put_i32(1);
        buf.put_i32(0);
        buf.put_i64(-1);
        buf.put_i16(-1);
        buf.put_i16(0);

        let (_, response) = parse_offset_fetch_response(NomBytes::new(Bytes::from(buf))).unwrap();
        let partition = &response.topics[0].partitions[0];
        assert_eq!(partition.committed_offset, -1);
        assert_eq!(partition.metadata, None);
    }

    #[test]
    fn test_parse_list_offsets_response() {
        let mut buf = Vec::new();
        buf.put_i32(1);
        buf.put_i16(1);
        buf.put_slice(b"t");
        buf.put_i32(1);
        buf.put_i32(2);
        buf.put_i16(0);
        buf.put_i64(-1);
        buf.put_i64(77);

        let (_, response) = parse_list_offsets_response(NomBytes::new(Bytes::from(buf))).unwrap();
        assert_eq!(response.topics[0].partitions[0].offset, 77);
        assert_eq!(response.topics[0].partitions[0].partition_index, 2);
    }
}

//! Produce v3.

use bytes::{BufMut, Bytes};
use nom::{
    IResult,
    number::complete::{be_i16, be_i32, be_i64},
};
use nombytes::NomBytes;

use crate::encode::{ToByte, encode_array};
use crate::error::{KafkaCode, Result};
use crate::parser::{parse_array, parse_utf8};

/// A produce request carrying one RecordBatch per partition.
#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub transactional_id: Option<String>,
    /// 0 = no acknowledgment, 1 = leader only, -1 = all in-sync replicas.
    pub acks: i16,
    pub timeout_ms: i32,
    pub topics: Vec<ProduceTopicData>,
}

#[derive(Debug, Clone)]
pub struct ProduceTopicData {
    pub name: String,
    pub partitions: Vec<ProducePartitionData>,
}

#[derive(Debug, Clone)]
pub struct ProducePartitionData {
    pub partition_index: i32,
    pub records: Bytes,
}

impl ProduceRequest {
    /// Single-partition request, which is all the sender ever builds.
    pub fn single(
        topic: impl Into<String>,
        partition: i32,
        records: Bytes,
        acks: i16,
        timeout_ms: i32,
    ) -> Self {
        Self {
            transactional_id: None,
            acks,
            timeout_ms,
            topics: vec![ProduceTopicData {
                name: topic.into(),
                partitions: vec![ProducePartitionData {
                    partition_index: partition,
                    records,
                }],
            }],
        }
    }
}

impl ToByte for ProduceRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.transactional_id.encode(buffer)?;
        self.acks.encode(buffer)?;
        self.timeout_ms.encode(buffer)?;
        encode_array(buffer, &self.topics)
    }
}

impl ToByte for ProduceTopicData {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.name.encode(buffer)?;
        encode_array(buffer, &self.partitions)
    }
}

impl ToByte for ProducePartitionData {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.partition_index.encode(buffer)?;
        self.records.encode(buffer)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProduceResponse {
    pub responses: Vec<ProduceTopicResponse>,
    pub throttle_time_ms: i32,
}

#[derive(Debug, Clone)]
pub struct ProduceTopicResponse {
    pub name: String,
    pub partitions: Vec<ProducePartitionResponse>,
}

#[derive(Debug, Clone, Default)]
pub struct ProducePartitionResponse {
    pub partition_index: i32,
    pub error_code: KafkaCode,
    pub base_offset: i64,
    pub log_append_time: i64,
}

impl ProducePartitionResponse {
    pub fn error(partition_index: i32, error_code: KafkaCode) -> Self {
        Self {
            partition_index,
            error_code,
            base_offset: -1,
            log_append_time: -1,
        }
    }

    pub fn success(partition_index: i32, base_offset: i64) -> Self {
        Self {
            partition_index,
            error_code: KafkaCode::None,
            base_offset,
            log_append_time: -1,
        }
    }
}

impl ProduceResponse {
    /// Look up the outcome for one partition.
    pub fn partition(&self, topic: &str, partition: i32) -> Option<&ProducePartitionResponse> {
        self.responses
            .iter()
            .filter(|t| t.name == topic)
            .flat_map(|t| t.partitions.iter())
            .find(|p| p.partition_index == partition)
    }
}

pub fn parse_produce_response(s: NomBytes) -> IResult<NomBytes, ProduceResponse> {
    let (s, responses) = parse_array(parse_produce_topic_response)(s)?;
    let (s, throttle_time_ms) = be_i32(s)?;
    Ok((
        s,
        ProduceResponse {
            responses,
            throttle_time_ms,
        },
    ))
}

fn parse_produce_topic_response(s: NomBytes) -> IResult<NomBytes, ProduceTopicResponse> {
    let (s, name) = parse_utf8(s)?;
    let (s, partitions) = parse_array(parse_produce_partition_response)(s)?;
    Ok((s, ProduceTopicResponse { name, partitions }))
}

fn parse_produce_partition_response(s: NomBytes) -> IResult<NomBytes, ProducePartitionResponse> {
    let (s, partition_index) = be_i32(s)?;
    let (s, error_code) = be_i16(s)?;
    let (s, base_offset) = be_i64(s)?;
    let (s, log_append_time) = be_i64(s)?;
    Ok((
        s,
        ProducePartitionResponse {
            partition_index,
            error_code: KafkaCode::from_wire(error_code),
            base_offset,
            log_append_time,
        },
    ))
}

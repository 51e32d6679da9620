//! Metadata v1.

use bytes::BufMut;
use nom::{
    IResult,
    number::complete::{be_i8, be_i16, be_i32},
};
use nombytes::NomBytes;

use crate::encode::{ToByte, encode_array};
use crate::error::{KafkaCode, Result};
use crate::parser::{parse_array, parse_nullable_utf8, parse_utf8};

/// Request metadata for `topics`, or for every topic when `None`.
#[derive(Debug, Clone, Default)]
pub struct MetadataRequest {
    pub topics: Option<Vec<String>>,
}

impl MetadataRequest {
    pub fn all() -> Self {
        Self { topics: None }
    }

    pub fn topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: Some(topics.into_iter().map(Into::into).collect()),
        }
    }
}

impl ToByte for MetadataRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        match &self.topics {
            // Null array: all topics.
            None => (-1i32).encode(buffer),
            Some(topics) => encode_array(buffer, topics),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetadataResponse {
    pub brokers: Vec<BrokerMetadata>,
    pub controller_id: i32,
    pub topics: Vec<TopicMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMetadata {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
    pub rack: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TopicMetadata {
    pub error_code: KafkaCode,
    pub name: String,
    pub is_internal: bool,
    pub partitions: Vec<PartitionMetadata>,
}

#[derive(Debug, Clone)]
pub struct PartitionMetadata {
    pub error_code: KafkaCode,
    pub partition_index: i32,
    /// -1 when the partition has no leader.
    pub leader_id: i32,
    pub replica_nodes: Vec<i32>,
    pub isr_nodes: Vec<i32>,
}

pub fn parse_metadata_response(s: NomBytes) -> IResult<NomBytes, MetadataResponse> {
    let (s, brokers) = parse_array(parse_broker_metadata)(s)?;
    let (s, controller_id) = be_i32(s)?;
    let (s, topics) = parse_array(parse_topic_metadata)(s)?;
    Ok((
        s,
        MetadataResponse {
            brokers,
            controller_id,
            topics,
        },
    ))
}

fn parse_broker_metadata(s: NomBytes) -> IResult<NomBytes, BrokerMetadata> {
    let (s, node_id) = be_i32(s)?;
    let (s, host) = parse_utf8(s)?;
    let (s, port) = be_i32(s)?;
    let (s, rack) = parse_nullable_utf8(s)?;
    Ok((
        s,
        BrokerMetadata {
            node_id,
            host,
            port,
            rack,
        },
    ))
}

fn parse_topic_metadata(s: NomBytes) -> IResult<NomBytes, TopicMetadata> {
    let (s, error_code) = be_i16(s)?;
    let (s, name) = parse_utf8(s)?;
    let (s, is_internal) = be_i8(s)?;
    let (s, partitions) = parse_array(parse_partition_metadata)(s)?;
    Ok((
        s,
        TopicMetadata {
            error_code: KafkaCode::from_wire(error_code),
            name,
            is_internal: is_internal != 0,
            partitions,
        },
    ))
}

fn parse_partition_metadata(s: NomBytes) -> IResult<NomBytes, PartitionMetadata> {
    let (s, error_code) = be_i16(s)?;
    let (s, partition_index) = be_i32(s)?;
    let (s, leader_id) = be_i32(s)?;
    let (s, replica_nodes) = parse_array(be_i32)(s)?;
    let (s, isr_nodes) = parse_array(be_i32)(s)?;
    Ok((
        s,
        PartitionMetadata {
            error_code: KafkaCode::from_wire(error_code),
            partition_index,
            leader_id,
            replica_nodes,
            isr_nodes,
        },
    ))
}

//! CreateTopics v0 and DeleteTopics v0.

use bytes::BufMut;
use nom::{
    IResult,
    number::complete::{be_i16, be_i32},
};
use nombytes::NomBytes;

use crate::encode::{ToByte, encode_array};
use crate::error::{KafkaCode, Result};
use crate::parser::{parse_array, parse_utf8};

#[derive(Debug, Clone)]
pub struct CreateTopicsRequest {
    pub topics: Vec<CreatableTopic>,
    pub timeout_ms: i32,
}

#[derive(Debug, Clone)]
pub struct CreatableTopic {
    pub name: String,
    /// -1 when `assignments` is given.
    pub num_partitions: i32,
    /// -1 when `assignments` is given.
    pub replication_factor: i16,
    pub assignments: Vec<CreatableReplicaAssignment>,
    pub configs: Vec<CreatableTopicConfig>,
}

#[derive(Debug, Clone)]
pub struct CreatableReplicaAssignment {
    pub partition_index: i32,
    pub broker_ids: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct CreatableTopicConfig {
    pub name: String,
    pub value: Option<String>,
}

impl ToByte for CreateTopicsRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        encode_array(buffer, &self.topics)?;
        self.timeout_ms.encode(buffer)
    }
}

impl ToByte for CreatableTopic {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.name.encode(buffer)?;
        self.num_partitions.encode(buffer)?;
        self.replication_factor.encode(buffer)?;
        encode_array(buffer, &self.assignments)?;
        encode_array(buffer, &self.configs)
    }
}

impl ToByte for CreatableReplicaAssignment {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.partition_index.encode(buffer)?;
        encode_array(buffer, &self.broker_ids)
    }
}

impl ToByte for CreatableTopicConfig {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.name.encode(buffer)?;
        self.value.encode(buffer)
    }
}

/// Per-topic outcome shared by CreateTopics and DeleteTopics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicErrorCode {
    pub name: String,
    pub error_code: KafkaCode,
}

#[derive(Debug, Clone, Default)]
pub struct CreateTopicsResponse {
    pub topics: Vec<TopicErrorCode>,
}

fn parse_topic_error_code(s: NomBytes) -> IResult<NomBytes, TopicErrorCode> {
    let (s, name) = parse_utf8(s)?;
    let (s, error_code) = be_i16(s)?;
    Ok((
        s,
        TopicErrorCode {
            name,
            error_code: KafkaCode::from_wire(error_code),
        },
    ))
}

pub fn parse_create_topics_response(s: NomBytes) -> IResult<NomBytes, CreateTopicsResponse> {
    let (s, topics) = parse_array(parse_topic_error_code)(s)?;
    Ok((s, CreateTopicsResponse { topics }))
}

#[derive(Debug, Clone)]
pub struct DeleteTopicsRequest {
    pub topic_names: Vec<String>,
    pub timeout_ms: i32,
}

impl ToByte for DeleteTopicsRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        encode_array(buffer, &self.topic_names)?;
        self.timeout_ms.encode(buffer)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeleteTopicsResponse {
    pub responses: Vec<TopicErrorCode>,
}

pub fn parse_delete_topics_response(s: NomBytes) -> IResult<NomBytes, DeleteTopicsResponse> {
    let (s, responses) = parse_array(parse_topic_error_code)(s)?;
    Ok((s, DeleteTopicsResponse { responses }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_create_topics_request_encode() {
        let request = CreateTopicsRequest {
            topics: vec![CreatableTopic {
                name: "t".to_string(),
                num_partitions: 3,
                replication_factor: 1,
                assignments: vec![],
                configs: vec![CreatableTopicConfig {
                    name: "retention.ms".to_string(),
                    value: Some("1000".to_string()),
                }],
            }],
            timeout_ms: 5000,
        };
        let mut buf = Vec::new();
        request.encode(&mut buf).unwrap();

        // topics(4) + name(3) + partitions(4) + rf(2) + assignments(4)
        // + configs(4) + key(14) + value(6) + timeout(4)
        assert_eq!(buf.len(), 45);
    }

    #[test]
    fn test_parse_delete_topics_response() {
        let mut buf = Vec::new();
        buf.put_i32(2);
        buf.put_i16(1);
        buf.put_slice(b"a");
        buf.put_i16(0);
        buf.put_i16(1);
        buf.put_slice(b"b");
        buf.put_i16(3);

        let (_, response) = parse_delete_topics_response(NomBytes::new(Bytes::from(buf))).unwrap();
        assert_eq!(response.responses[0].error_code, KafkaCode::None);
        assert_eq!(
            response.responses[1].error_code,
            KafkaCode::UnknownTopicOrPartition
        );
    }
}

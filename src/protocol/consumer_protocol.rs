//! Consumer protocol payloads carried opaquely by the group APIs.
//!
//! ```text
//! Subscription (JoinGroup protocol metadata):
//!   version: i16
//!   topics: [STRING]
//!   user_data: NULLABLE_BYTES
//!
//! Assignment (SyncGroup assignment):
//!   version: i16
//!   partitions: [topic: STRING, partitions: [i32]]
//!   user_data: NULLABLE_BYTES
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    IResult,
    combinator::opt,
    number::complete::{be_i16, be_i32},
};
use nombytes::NomBytes;
use std::collections::BTreeMap;

use crate::constants::CONSUMER_PROTOCOL_VERSION;
use crate::encode::{ToByte, encode_array, encode_as_array};
use crate::error::{Error, Result};
use crate::parser::{parse_array, parse_nullable_bytes, parse_utf8};
use crate::types::TopicPartition;

/// Topics a member wants, advertised in JoinGroup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscription {
    pub version: i16,
    pub topics: Vec<String>,
    pub user_data: Option<Bytes>,
}

impl Subscription {
    pub fn new(topics: Vec<String>) -> Self {
        Self {
            version: CONSUMER_PROTOCOL_VERSION,
            topics,
            user_data: None,
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Empty metadata decodes as an empty subscription.
    pub fn from_bytes(data: &Bytes) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::default());
        }
        let (_, subscription) = parse_subscription(NomBytes::new(data.clone()))
            .map_err(|_| Error::ParsingError(data.clone()))?;
        Ok(subscription)
    }
}

impl ToByte for Subscription {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.version.encode(buffer)?;
        encode_array(buffer, &self.topics)?;
        self.user_data.encode(buffer)
    }
}

fn parse_subscription(s: NomBytes) -> IResult<NomBytes, Subscription> {
    let (s, version) = be_i16(s)?;
    let (s, topics) = parse_array(parse_utf8)(s)?;
    // Some clients omit user_data entirely.
    let (s, user_data) = opt(parse_nullable_bytes)(s)?;
    Ok((
        s,
        Subscription {
            version,
            topics,
            user_data: user_data.flatten(),
        },
    ))
}

/// Partitions handed to one member in SyncGroup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberAssignment {
    pub version: i16,
    /// Topic to partitions; ordered so encoding is deterministic.
    pub partitions: BTreeMap<String, Vec<i32>>,
    pub user_data: Option<Bytes>,
}

impl MemberAssignment {
    pub fn new() -> Self {
        Self {
            version: CONSUMER_PROTOCOL_VERSION,
            ..Default::default()
        }
    }

    pub fn add(&mut self, topic: &str, partition: i32) {
        let partitions = self.partitions.entry(topic.to_string()).or_default();
        if !partitions.contains(&partition) {
            partitions.push(partition);
            partitions.sort_unstable();
        }
    }

    pub fn topic_partitions(&self) -> Vec<TopicPartition> {
        self.partitions
            .iter()
            .flat_map(|(topic, partitions)| {
                partitions
                    .iter()
                    .map(move |&p| TopicPartition::new(topic.clone(), p))
            })
            .collect()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.partition_count() == 0
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// An empty SyncGroup assignment means "nothing assigned".
    pub fn from_bytes(data: &Bytes) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::new());
        }
        let (_, assignment) = parse_member_assignment(NomBytes::new(data.clone()))
            .map_err(|_| Error::ParsingError(data.clone()))?;
        Ok(assignment)
    }
}

impl FromIterator<TopicPartition> for MemberAssignment {
    fn from_iter<I: IntoIterator<Item = TopicPartition>>(iter: I) -> Self {
        let mut assignment = MemberAssignment::new();
        for tp in iter {
            assignment.add(&tp.topic, tp.partition);
        }
        assignment
    }
}

impl ToByte for MemberAssignment {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.version.encode(buffer)?;
        let entries: Vec<(&String, &Vec<i32>)> = self.partitions.iter().collect();
        encode_as_array(buffer, &entries, |buffer, (topic, partitions)| {
            topic.encode(buffer)?;
            encode_array(buffer, partitions.as_slice())
        })?;
        self.user_data.encode(buffer)
    }
}

fn parse_assigned_topic(s: NomBytes) -> IResult<NomBytes, (String, Vec<i32>)> {
    let (s, topic) = parse_utf8(s)?;
    let (s, partitions) = parse_array(be_i32)(s)?;
    Ok((s, (topic, partitions)))
}

fn parse_member_assignment(s: NomBytes) -> IResult<NomBytes, MemberAssignment> {
    let (s, version) = be_i16(s)?;
    let (s, topics) = parse_array(parse_assigned_topic)(s)?;
    let (s, user_data) = opt(parse_nullable_bytes)(s)?;

    let mut assignment = MemberAssignment {
        version,
        partitions: BTreeMap::new(),
        user_data: user_data.flatten(),
    };
    for (topic, partitions) in topics {
        for partition in partitions {
            assignment.add(&topic, partition);
        }
    }
    Ok((s, assignment))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_wire_format() {
        let subscription = Subscription::new(vec!["test-topic".to_string()]);
        let bytes = subscription.to_bytes().unwrap();

        let mut expected = Vec::new();
        expected.put_i16(0);
        expected.put_i32(1);
        expected.put_i16(10);
        expected.put_slice(b"test-topic");
        expected.put_i32(-1);
        assert_eq!(bytes.as_ref(), expected.as_slice());

        assert_eq!(Subscription::from_bytes(&bytes).unwrap(), subscription);
    }

    #[test]
    fn test_subscription_without_user_data() {
        let mut bytes = Vec::new();
        bytes.put_i16(0);
        bytes.put_i32(1);
        bytes.put_i16(1);
        bytes.put_slice(b"a");

        let subscription = Subscription::from_bytes(&Bytes::from(bytes)).unwrap();
        assert_eq!(subscription.topics, vec!["a"]);
        assert!(subscription.user_data.is_none());
    }

    #[test]
    fn test_assignment_dedups_and_sorts() {
        let mut assignment = MemberAssignment::new();
        assignment.add("t", 2);
        assignment.add("t", 0);
        assignment.add("t", 2);

        assert_eq!(assignment.partitions["t"], vec![0, 2]);
        assert_eq!(assignment.partition_count(), 2);
    }

    #[test]
    fn test_assignment_decode() {
        let assignment: MemberAssignment = vec![
            TopicPartition::new("b", 1),
            TopicPartition::new("a", 0),
            TopicPartition::new("a", 3),
        ]
        .into_iter()
        .collect();

        let decoded = MemberAssignment::from_bytes(&assignment.to_bytes().unwrap()).unwrap();
        assert_eq!(
            decoded.topic_partitions(),
            vec![
                TopicPartition::new("a", 0),
                TopicPartition::new("a", 3),
                TopicPartition::new("b", 1),
            ]
        );
    }

    #[test]
    fn test_empty_assignment_bytes() {
        let assignment = MemberAssignment::from_bytes(&Bytes::new()).unwrap();
        assert!(assignment.is_empty());
    }
}

//! Type-safe wrappers for Kafka protocol primitives.
//!
//! These newtypes keep offsets, broker ids and generations from being mixed
//! up even though they share integer representations on the wire.

use bytes::BufMut;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::encode::ToByte;
use crate::error::Result;

/// Shared conversions, `Display` and wire encoding for an integer newtype.
macro_rules! protocol_newtype {
    ($name:ident, $inner:ty) => {
        impl $name {
            #[inline]
            pub const fn new(value: $inner) -> Self {
                $name(value)
            }

            #[inline]
            pub const fn value(self) -> $inner {
                self.0
            }
        }

        impl From<$inner> for $name {
            fn from(value: $inner) -> Self {
                $name(value)
            }
        }

        impl From<$name> for $inner {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl ToByte for $name {
            fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
                self.0.encode(buffer)
            }
        }
    };
}

/// A message offset within a partition.
///
/// # Special Values
///
/// - `-1` (`LATEST`/`INVALID`): in ListOffsets means "end of log"; in
///   OffsetFetch responses means "nothing committed".
/// - `-2` (`EARLIEST`): beginning of the log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Offset(pub i64);

protocol_newtype!(Offset, i64);

impl Offset {
    pub const INVALID: Self = Offset(-1);
    pub const EARLIEST: Self = Offset(-2);
    pub const LATEST: Self = Offset(-1);

    /// Non-negative offsets point at a real log position.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    #[inline]
    pub const fn next(self) -> Self {
        Offset(self.0 + 1)
    }
}

/// A broker node id.
///
/// Bootstrap servers get synthetic negative ids (`-1`, `-2`, ...) until the
/// cluster metadata names the real nodes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct BrokerId(pub i32);

protocol_newtype!(BrokerId, i32);

impl BrokerId {
    /// Used in metadata for partitions without a leader.
    pub const INVALID: Self = BrokerId(-1);

    /// Synthetic id for the `index`th bootstrap server.
    #[inline]
    pub const fn bootstrap(index: usize) -> Self {
        BrokerId(-(index as i32) - 1)
    }

    #[inline]
    pub const fn is_bootstrap(self) -> bool {
        self.0 < 0
    }
}

/// Matches a response frame to the request that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CorrelationId(pub i32);

protocol_newtype!(CorrelationId, i32);

impl CorrelationId {
    /// The id following this one, wrapping back to zero.
    #[inline]
    pub fn next(self) -> Self {
        CorrelationId(self.0.checked_add(1).unwrap_or(0))
    }
}

/// A consumer group generation. Incremented by the coordinator on every rebalance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct GenerationId(pub i32);

protocol_newtype!(GenerationId, i32);

impl GenerationId {
    /// Generation of a member that is not part of the group.
    pub const INVALID: Self = GenerationId(-1);

    #[inline]
    pub fn next(self) -> Self {
        GenerationId(self.0.wrapping_add(1))
    }
}

/// A topic-partition identifier.
///
/// ```
/// use kafkaesque_client::types::TopicPartition;
///
/// let tp = TopicPartition::new("my-topic", 0);
/// assert_eq!(tp.to_string(), "my-topic-0");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    #[inline]
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    #[inline]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[inline]
    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl From<(String, i32)> for TopicPartition {
    fn from((topic, partition): (String, i32)) -> Self {
        Self { topic, partition }
    }
}

impl From<(&str, i32)> for TopicPartition {
    fn from((topic, partition): (&str, i32)) -> Self {
        Self::new(topic, partition)
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_special_values() {
        assert_eq!(Offset::LATEST, Offset::INVALID);
        assert!(!Offset::EARLIEST.is_valid());
        assert!(Offset::new(0).is_valid());
        assert_eq!(Offset::new(41).next(), Offset::new(42));
    }

    #[test]
    fn test_bootstrap_broker_ids() {
        assert_eq!(BrokerId::bootstrap(0), BrokerId(-1));
        assert_eq!(BrokerId::bootstrap(2), BrokerId(-3));
        assert!(BrokerId::bootstrap(0).is_bootstrap());
        assert!(!BrokerId::new(0).is_bootstrap());
    }

    #[test]
    fn test_correlation_id_wraps() {
        assert_eq!(CorrelationId(i32::MAX).next(), CorrelationId(0));
        assert_eq!(CorrelationId(7).next(), CorrelationId(8));
    }

    #[test]
    fn test_generation_next() {
        assert_eq!(GenerationId::new(4).next(), GenerationId::new(5));
        assert_eq!(GenerationId::INVALID.next(), GenerationId::new(0));
    }

    #[test]
    fn test_newtype_encoding() {
        let mut buf = Vec::new();
        BrokerId::new(3).encode(&mut buf).unwrap();
        Offset::new(1).encode(&mut buf).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 3, 0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_topic_partition_ordering() {
        let mut tps = vec![
            TopicPartition::new("b", 0),
            TopicPartition::new("a", 1),
            TopicPartition::new("a", 0),
        ];
        tps.sort();
        assert_eq!(tps[0], TopicPartition::new("a", 0));
        assert_eq!(tps[2].to_string(), "b-0");
    }
}

//! Partition selection for records without an explicit partition.

use murmur2::{KAFKA_SEED, murmur2};

/// Chooses the partition of a record that does not name one.
pub trait Partitioner: Send + Sync {
    /// `partition_count` is always positive.
    fn partition(&self, topic: &str, key: Option<&[u8]>, partition_count: usize) -> i32;
}

/// Kafka's default: murmur2 of the key, random for null keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPartitioner;

impl Partitioner for DefaultPartitioner {
    fn partition(&self, _topic: &str, key: Option<&[u8]>, partition_count: usize) -> i32 {
        match key {
            Some(key) => murmur2_partition(key, partition_count),
            None => fastrand::usize(..partition_count.max(1)) as i32,
        }
    }
}

/// The partition the Java client picks for `key`.
///
/// Matches `Utils.toPositive(Utils.murmur2(key)) % numPartitions`.
pub fn murmur2_partition(key: &[u8], partition_count: usize) -> i32 {
    let hash = murmur2(key, KAFKA_SEED) & 0x7fff_ffff;
    (hash as usize % partition_count.max(1)) as i32
}

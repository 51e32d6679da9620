//! Centralized protocol and client constants.
//!
//! # Categories
//!
//! - **Protocol Constants**: Kafka wire protocol sizes and limits
//! - **Network Constants**: connection and frame limits
//! - **Producer/Consumer Defaults**: values behind the config `Default` impls
//! - **Group Constants**: consumer group protocol values

// =============================================================================
// Protocol Constants (Kafka Wire Protocol)
// =============================================================================

/// Size of a RecordBatch v2 header, up to and including the record count.
pub const MIN_BATCH_HEADER_SIZE: usize = 61;

/// Magic byte of RecordBatch v2.
pub const RECORD_BATCH_MAGIC: i8 = 2;

/// Bytes preceding `batch_length`'s coverage (base_offset + batch_length).
pub const BATCH_LENGTH_PREFIX: usize = 12;

// -----------------------------------------------------------------------------
// RecordBatch Header Field Offsets
// -----------------------------------------------------------------------------

/// Offset of the base_offset field (8 bytes, i64).
pub const BATCH_BASE_OFFSET: usize = 0;

/// Offset of the batch_length field (4 bytes, i32).
pub const BATCH_LENGTH_OFFSET: usize = 8;

/// Offset of the magic byte.
pub const BATCH_MAGIC_OFFSET: usize = 16;

/// Offset of the CRC field (4 bytes, u32 big-endian).
pub const BATCH_CRC_OFFSET: usize = 17;

/// Start of the CRC-covered region (attributes field).
pub const BATCH_CRC_DATA_START: usize = 21;

/// Low three bits of the attributes field select the compression codec.
pub const BATCH_COMPRESSION_MASK: i16 = 0x07;

/// Attribute bit marking a transactional control batch.
pub const BATCH_CONTROL_FLAG: i16 = 0x20;

/// Maximum array length accepted from a broker.
pub const MAX_PROTOCOL_ARRAY_SIZE: i32 = 100_000;

/// Producer id written into batches from non-idempotent producers.
pub const NO_PRODUCER_ID: i64 = -1;

/// Producer epoch written into batches from non-idempotent producers.
pub const NO_PRODUCER_EPOCH: i16 = -1;

/// Base sequence written into batches from non-idempotent producers.
pub const NO_SEQUENCE: i32 = -1;

/// replica_id sent by ordinary consumers in Fetch and ListOffsets.
pub const CONSUMER_REPLICA_ID: i32 = -1;

// =============================================================================
// Network Constants
// =============================================================================

/// Largest response frame the client will buffer (100 MB).
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 100 * 1024 * 1024;

/// Depth of each broker connection's outbound request queue.
pub const CONNECTION_QUEUE_DEPTH: usize = 1024;

/// Capacity of the disconnect broadcast channel.
pub const DISCONNECT_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// Producer/Consumer Defaults
// =============================================================================

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 50;
pub const DEFAULT_RECONNECT_BACKOFF_MAX_MS: u64 = 1_000;
pub const DEFAULT_METADATA_MAX_AGE_MS: u64 = 300_000;

pub const DEFAULT_BATCH_SIZE: usize = 16 * 1024;
pub const DEFAULT_LINGER_MS: u64 = 5;
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 100;
pub const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 120_000;
pub const DEFAULT_MAX_IN_FLIGHT_PER_PARTITION: usize = 1;
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 1024 * 1024;
pub const DEFAULT_PRODUCER_QUEUE_DEPTH: usize = 100_000;

pub const DEFAULT_FETCH_MAX_WAIT_MS: u64 = 500;
pub const DEFAULT_FETCH_MIN_BYTES: i32 = 1;
pub const DEFAULT_FETCH_MAX_BYTES: i32 = 50 * 1024 * 1024;
pub const DEFAULT_MAX_PARTITION_FETCH_BYTES: i32 = 1024 * 1024;
pub const DEFAULT_MAX_POLL_RECORDS: usize = 500;
pub const DEFAULT_MAX_POLL_INTERVAL_MS: u64 = 300_000;
pub const DEFAULT_AUTO_COMMIT_INTERVAL_MS: u64 = 5_000;

// =============================================================================
// Group Constants
// =============================================================================

/// Protocol type advertised in JoinGroup by consumers.
pub const CONSUMER_PROTOCOL_TYPE: &str = "consumer";

/// Version of the consumer protocol subscription/assignment payloads.
pub const CONSUMER_PROTOCOL_VERSION: i16 = 0;

/// Consecutive failed heartbeats after which a member considers itself evicted.
pub const MAX_MISSED_HEARTBEATS: u32 = 3;

pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 3_000;
pub const DEFAULT_REBALANCE_TIMEOUT_MS: u64 = 60_000;

/// Retention time sent in OffsetCommit v2; -1 defers to the broker.
pub const DEFAULT_OFFSET_RETENTION_MS: i64 = -1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_header_layout() {
        assert_eq!(BATCH_CRC_DATA_START, BATCH_CRC_OFFSET + 4);
        assert_eq!(BATCH_MAGIC_OFFSET + 1, BATCH_CRC_OFFSET);
        assert_eq!(BATCH_LENGTH_PREFIX, BATCH_LENGTH_OFFSET + 4);
        assert!(MIN_BATCH_HEADER_SIZE > BATCH_CRC_DATA_START);
    }

    #[test]
    fn test_heartbeat_fits_session() {
        assert!(DEFAULT_HEARTBEAT_INTERVAL_MS * MAX_MISSED_HEARTBEATS as u64
            <= DEFAULT_SESSION_TIMEOUT_MS);
    }
}

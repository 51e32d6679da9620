//! Crate & protocol level errors.
//!
//! Every fallible operation in the client returns [`Error`]. The variants
//! follow the client's retry policy rather than where the failure happened:
//!
//! - [`Error::Retriable`]: transient broker or network trouble. The producer
//!   and consumer retry these internally up to their configured bounds.
//! - [`Error::Fatal`]: configuration, authorization or protocol mismatches.
//!   Surfaced immediately.
//! - [`Error::Serialization`]: a payload could not be encoded or decoded. The
//!   offending value is attached.
//! - [`Error::Commit`]: an offset commit was rejected (stale generation,
//!   coordinator unavailable). The local committed offset is left untouched.
//! - [`Error::Closed`]: the client was closed while the operation was pending.
//!
//! Broker error codes are modelled by [`KafkaCode`] and mapped onto the
//! taxonomy with [`Error::from_code`].

use bytes::Bytes;
use num_derive::FromPrimitive;
use std::{fmt, io, result};
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Where an error happened: enough for a caller to act on it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub topic: Option<String>,
    pub partition: Option<i32>,
    pub offset: Option<i64>,
    pub code: Option<KafkaCode>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn code(mut self, code: KafkaCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.topic.is_none()
            && self.partition.is_none()
            && self.offset.is_none()
            && self.code.is_none()
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        let mut parts = Vec::with_capacity(4);
        if let Some(topic) = &self.topic {
            parts.push(format!("topic={}", topic));
        }
        if let Some(partition) = self.partition {
            parts.push(format!("partition={}", partition));
        }
        if let Some(offset) = self.offset {
            parts.push(format!("offset={}", offset));
        }
        if let Some(code) = self.code {
            parts.push(format!("code={:?}", code));
        }
        write!(f, " ({})", parts.join(", "))
    }
}

/// Client errors.
#[derive(Clone, Debug, ThisError)]
pub enum Error {
    /// Transient broker or network failure.
    #[error("Retriable error: {reason}{context}")]
    Retriable {
        reason: String,
        context: ErrorContext,
    },

    /// Configuration, authorization or protocol failure. Never retried.
    #[error("Fatal error: {reason}{context}")]
    Fatal {
        reason: String,
        context: ErrorContext,
    },

    /// A payload could not be encoded or decoded.
    #[error("Serialization error: {reason} (value: {value})")]
    Serialization { value: String, reason: String },

    /// An offset commit was rejected by the group coordinator.
    #[error("Commit error: {reason}{context}")]
    Commit {
        reason: String,
        context: ErrorContext,
    },

    /// The client was closed while the operation was outstanding.
    #[error("Client closed")]
    Closed,

    /// A caller supplied deadline elapsed.
    #[error("Operation timed out")]
    Timeout,

    /// An error in the network.
    #[error("IO error: {0:?}")]
    IoError(io::ErrorKind),

    /// Could not parse the data.
    #[error("Parsing error: invalid data ({} bytes)", .0.len())]
    ParsingError(Bytes),

    /// Configuration did not validate.
    #[error("Configuration error: {}", .0.join("; "))]
    Config(Vec<String>),
}

impl Error {
    pub fn retriable(reason: impl Into<String>) -> Self {
        Error::Retriable {
            reason: reason.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Error::Fatal {
            reason: reason.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn commit(reason: impl Into<String>, context: ErrorContext) -> Self {
        Error::Commit {
            reason: reason.into(),
            context,
        }
    }

    pub fn serialization(value: impl fmt::Debug, reason: impl fmt::Display) -> Self {
        Error::Serialization {
            value: format!("{:?}", value),
            reason: reason.to_string(),
        }
    }

    /// Classify a broker error code.
    pub fn from_code(code: KafkaCode, context: ErrorContext) -> Self {
        let reason = format!("broker returned {:?}", code);
        let context = context.code(code);
        if code.is_retriable() {
            Error::Retriable { reason, context }
        } else {
            Error::Fatal { reason, context }
        }
    }

    /// Whether the operation may succeed if attempted again.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Retriable { .. } | Error::IoError(_))
    }

    /// The broker error code behind this error, if any.
    pub fn kafka_code(&self) -> Option<KafkaCode> {
        match self {
            Error::Retriable { context, .. }
            | Error::Fatal { context, .. }
            | Error::Commit { context, .. } => context.code,
            _ => None,
        }
    }

    /// Replace the human readable reason, keeping the classification.
    pub fn with_reason(self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        match self {
            Error::Retriable { context, .. } => Error::Retriable { reason, context },
            Error::Fatal { context, .. } => Error::Fatal { reason, context },
            Error::Commit { context, .. } => Error::Commit { reason, context },
            other => other,
        }
    }

    /// Attach topic/partition information to an error that lacks it.
    pub fn with_partition(self, topic: &str, partition: i32) -> Self {
        match self {
            Error::Retriable { reason, context } => Error::Retriable {
                reason,
                context: fill(context, topic, partition),
            },
            Error::Fatal { reason, context } => Error::Fatal {
                reason,
                context: fill(context, topic, partition),
            },
            Error::Commit { reason, context } => Error::Commit {
                reason,
                context: fill(context, topic, partition),
            },
            other => other,
        }
    }
}

fn fill(mut context: ErrorContext, topic: &str, partition: i32) -> ErrorContext {
    if context.topic.is_none() {
        context.topic = Some(topic.to_string());
    }
    if context.partition.is_none() {
        context.partition = Some(partition);
    }
    context
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Error::Retriable {
                    reason: a,
                    context: ca,
                },
                Error::Retriable {
                    reason: b,
                    context: cb,
                },
            ) => a == b && ca == cb,
            (
                Error::Fatal {
                    reason: a,
                    context: ca,
                },
                Error::Fatal {
                    reason: b,
                    context: cb,
                },
            ) => a == b && ca == cb,
            (
                Error::Commit {
                    reason: a,
                    context: ca,
                },
                Error::Commit {
                    reason: b,
                    context: cb,
                },
            ) => a == b && ca == cb,
            (
                Error::Serialization {
                    value: va,
                    reason: ra,
                },
                Error::Serialization {
                    value: vb,
                    reason: rb,
                },
            ) => va == vb && ra == rb,
            (Error::Closed, Error::Closed) => true,
            (Error::Timeout, Error::Timeout) => true,
            (Error::IoError(a), Error::IoError(b)) => a == b,
            (Error::ParsingError(a), Error::ParsingError(b)) => a == b,
            (Error::Config(a), Error::Config(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IoError(e.kind())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization {
            value: String::from("<json>"),
            reason: e.to_string(),
        }
    }
}

/// Various errors reported by a remote Kafka server.
/// See also [Kafka Errors](http://kafka.apache.org/protocol.html)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, Default)]
pub enum KafkaCode {
    /// An unexpected server error
    Unknown = -1,
    #[default]
    None = 0,
    /// The requested offset is outside the range of offsets
    /// maintained by the server for the given topic/partition
    OffsetOutOfRange = 1,
    /// This indicates that a message contents does not match its CRC
    CorruptMessage = 2,
    /// This request is for a topic or partition that does not exist
    /// on this broker.
    UnknownTopicOrPartition = 3,
    /// The message has a negative size
    InvalidMessageSize = 4,
    /// There is currently no leader for this partition and hence it is
    /// unavailable for writes.
    LeaderNotAvailable = 5,
    /// The client sent a request to a replica that is not the leader
    /// for the partition. Its metadata is out of date.
    NotLeaderForPartition = 6,
    /// The request exceeded the user-specified time limit.
    RequestTimedOut = 7,
    /// Used mostly by tools when a broker is not alive.
    BrokerNotAvailable = 8,
    /// A replica is expected on a broker, but is not.
    ReplicaNotAvailable = 9,
    /// The client attempted to produce a message larger than the broker
    /// maximum.
    MessageSizeTooLarge = 10,
    StaleControllerEpoch = 11,
    /// Offset metadata string larger than the configured maximum.
    OffsetMetadataTooLarge = 12,
    /// The server disconnected before a response was received.
    NetworkException = 13,
    /// The coordinator is still loading group metadata.
    GroupLoadInProgress = 14,
    /// The group coordinator is not active.
    GroupCoordinatorNotAvailable = 15,
    /// The broker is not the coordinator for this group.
    NotCoordinatorForGroup = 16,
    /// Invalid topic name, or a write to an internal topic.
    InvalidTopic = 17,
    /// A message batch exceeds the maximum configured segment size.
    RecordListTooLarge = 18,
    /// Fewer in-sync replicas than the configured minimum with acks=-1.
    NotEnoughReplicas = 19,
    /// Written to the log, but with fewer in-sync replicas than required.
    NotEnoughReplicasAfterAppend = 20,
    /// requiredAcks is anything other than -1, 1, or 0.
    InvalidRequiredAcks = 21,
    /// The generation id provided in the request is not the current
    /// generation.
    IllegalGeneration = 22,
    /// The protocol type or set of protocols is not compatible with the
    /// current group.
    InconsistentGroupProtocol = 23,
    /// The groupId is empty or null.
    InvalidGroupId = 24,
    /// The memberId is not in the current generation.
    UnknownMemberId = 25,
    /// The requested session timeout is outside the broker's allowed range.
    InvalidSessionTimeout = 26,
    /// The coordinator has begun rebalancing the group; rejoin.
    RebalanceInProgress = 27,
    /// Offset commit rejected because of oversize metadata.
    InvalidCommitOffsetSize = 28,
    /// Not authorized to access the requested topic.
    TopicAuthorizationFailed = 29,
    /// Not authorized to access the group.
    GroupAuthorizationFailed = 30,
    /// Not authorized to use an inter-broker or administrative API.
    ClusterAuthorizationFailed = 31,
    /// The timestamp of the message is out of acceptable range.
    InvalidTimestamp = 32,
    UnsupportedSaslMechanism = 33,
    IllegalSaslState = 34,
    /// The version of API is not supported.
    UnsupportedVersion = 35,
    /// Topic with this name already exists.
    TopicAlreadyExists = 36,
    /// Number of partitions is below 1.
    InvalidPartitions = 37,
    /// Replication factor is below 1 or larger than the number of brokers.
    InvalidReplicationFactor = 38,
    /// Replica assignment is invalid.
    InvalidReplicaAssignment = 39,
    /// Configuration is invalid.
    InvalidConfig = 40,
    /// This is not the correct controller for this cluster.
    NotController = 41,
    /// The request is malformed.
    InvalidRequest = 42,
    /// The message format version on the broker does not support the request.
    UnsupportedForMessageFormat = 43,
    OutOfOrderSequenceNumber = 45,
    DuplicateSequenceNumber = 46,
    SaslAuthenticationFailed = 58,
    /// The broker is shutting down or the leader epoch is stale.
    KafkaStorageError = 56,
}

impl KafkaCode {
    /// Whether a client should retry a request that failed with this code.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            KafkaCode::CorruptMessage
                | KafkaCode::UnknownTopicOrPartition
                | KafkaCode::LeaderNotAvailable
                | KafkaCode::NotLeaderForPartition
                | KafkaCode::RequestTimedOut
                | KafkaCode::NetworkException
                | KafkaCode::GroupLoadInProgress
                | KafkaCode::GroupCoordinatorNotAvailable
                | KafkaCode::NotCoordinatorForGroup
                | KafkaCode::NotEnoughReplicas
                | KafkaCode::NotEnoughReplicasAfterAppend
                | KafkaCode::NotController
                | KafkaCode::KafkaStorageError
        )
    }

    /// Codes that mean the client's view of partition leadership is stale.
    pub fn invalidates_metadata(self) -> bool {
        matches!(
            self,
            KafkaCode::UnknownTopicOrPartition
                | KafkaCode::LeaderNotAvailable
                | KafkaCode::NotLeaderForPartition
                | KafkaCode::KafkaStorageError
        )
    }

    /// Codes that mean the group coordinator moved or is unavailable.
    pub fn invalidates_coordinator(self) -> bool {
        matches!(
            self,
            KafkaCode::GroupCoordinatorNotAvailable
                | KafkaCode::NotCoordinatorForGroup
                | KafkaCode::NetworkException
        )
    }

    /// Decode a wire error code, mapping unknown values to [`KafkaCode::Unknown`].
    pub fn from_wire(code: i16) -> Self {
        num_traits::FromPrimitive::from_i16(code).unwrap_or(KafkaCode::Unknown)
    }
}

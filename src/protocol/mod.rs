//! Client side of the Kafka wire protocol.
//!
//! Every supported API has a request type implementing [`ToByte`] and a
//! response type parsed with `nom`. The [`Request`] and [`Response`] enums
//! are the typed currency of the [`Transport`](crate::network::Transport)
//! seam; the real connection frames and parses them, the in-memory test
//! cluster matches on them directly.
//!
//! All APIs are pinned to classic (non-flexible) versions:
//!
//! | API | Key | Version |
//! |-----|-----|---------|
//! | Produce | 0 | 3 |
//! | Fetch | 1 | 4 |
//! | ListOffsets | 2 | 1 |
//! | Metadata | 3 | 1 |
//! | OffsetCommit | 8 | 2 |
//! | OffsetFetch | 9 | 1 |
//! | FindCoordinator | 10 | 0 |
//! | JoinGroup | 11 | 1 |
//! | Heartbeat | 12 | 0 |
//! | LeaveGroup | 13 | 0 |
//! | SyncGroup | 14 | 0 |
//! | ApiVersions | 18 | 0 |
//! | CreateTopics | 19 | 0 |
//! | DeleteTopics | 20 | 0 |

mod admin;
mod consumer_protocol;
mod fetch;
mod groups;
mod metadata;
mod offsets;
mod produce;
mod record_batch;
mod versions;

use bytes::{BufMut, Bytes, BytesMut};
use nombytes::NomBytes;

use crate::encode::ToByte;
use crate::error::{Error, Result};
use crate::types::CorrelationId;

pub use admin::*;
pub use consumer_protocol::*;
pub use fetch::*;
pub use groups::*;
pub use metadata::*;
pub use offsets::*;
pub use produce::*;
pub use record_batch::*;
pub use versions::*;

/// API keys used by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum ApiKey {
    Produce = 0,
    Fetch = 1,
    ListOffsets = 2,
    Metadata = 3,
    OffsetCommit = 8,
    OffsetFetch = 9,
    FindCoordinator = 10,
    JoinGroup = 11,
    Heartbeat = 12,
    LeaveGroup = 13,
    SyncGroup = 14,
    ApiVersions = 18,
    CreateTopics = 19,
    DeleteTopics = 20,
}

impl From<ApiKey> for i16 {
    fn from(key: ApiKey) -> Self {
        key as i16
    }
}

impl TryFrom<i16> for ApiKey {
    type Error = Error;

    fn try_from(value: i16) -> Result<Self> {
        ApiKey::CLIENT_APIS
            .iter()
            .copied()
            .find(|key| i16::from(*key) == value)
            .ok_or_else(|| Error::fatal(format!("unsupported api key {}", value)))
    }
}

impl ApiKey {
    pub const CLIENT_APIS: [ApiKey; 14] = [
        ApiKey::Produce,
        ApiKey::Fetch,
        ApiKey::ListOffsets,
        ApiKey::Metadata,
        ApiKey::OffsetCommit,
        ApiKey::OffsetFetch,
        ApiKey::FindCoordinator,
        ApiKey::JoinGroup,
        ApiKey::Heartbeat,
        ApiKey::LeaveGroup,
        ApiKey::SyncGroup,
        ApiKey::ApiVersions,
        ApiKey::CreateTopics,
        ApiKey::DeleteTopics,
    ];

    /// Returns a static string name for this API key.
    ///
    /// Used as a metric label without allocating.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiKey::Produce => "Produce",
            ApiKey::Fetch => "Fetch",
            ApiKey::ListOffsets => "ListOffsets",
            ApiKey::Metadata => "Metadata",
            ApiKey::OffsetCommit => "OffsetCommit",
            ApiKey::OffsetFetch => "OffsetFetch",
            ApiKey::FindCoordinator => "FindCoordinator",
            ApiKey::JoinGroup => "JoinGroup",
            ApiKey::Heartbeat => "Heartbeat",
            ApiKey::LeaveGroup => "LeaveGroup",
            ApiKey::SyncGroup => "SyncGroup",
            ApiKey::ApiVersions => "ApiVersions",
            ApiKey::CreateTopics => "CreateTopics",
            ApiKey::DeleteTopics => "DeleteTopics",
        }
    }

    /// The version this client speaks for the API.
    pub fn client_version(&self) -> i16 {
        match self {
            ApiKey::Produce => 3,
            ApiKey::Fetch => 4,
            ApiKey::ListOffsets => 1,
            ApiKey::Metadata => 1,
            ApiKey::OffsetCommit => 2,
            ApiKey::OffsetFetch => 1,
            ApiKey::FindCoordinator => 0,
            ApiKey::JoinGroup => 1,
            ApiKey::Heartbeat => 0,
            ApiKey::LeaveGroup => 0,
            ApiKey::SyncGroup => 0,
            ApiKey::ApiVersions => 0,
            ApiKey::CreateTopics => 0,
            ApiKey::DeleteTopics => 0,
        }
    }
}

/// A typed request whose response type is known statically.
pub trait KafkaRequest: ToByte + Into<Request> + Send {
    const API_KEY: ApiKey;
    type Response: TryFrom<Response, Error = Error> + Send;
}

/// Header prepended to every request (request header v1).
#[derive(Debug, Clone)]
pub struct RequestHeader<'a> {
    pub api_key: ApiKey,
    pub api_version: i16,
    pub correlation_id: CorrelationId,
    pub client_id: Option<&'a str>,
}

impl ToByte for RequestHeader<'_> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        i16::from(self.api_key).encode(buffer)?;
        self.api_version.encode(buffer)?;
        self.correlation_id.encode(buffer)?;
        self.client_id.encode(buffer)
    }
}

/// Generates the request/response enums and the conversions between them
/// and the per-API types.
macro_rules! api_messages {
    ($($variant:ident => $request:ty, $response:ty, $parser:path;)+) => {
        /// Any request the client can send.
        #[derive(Debug, Clone)]
        pub enum Request {
            $($variant($request),)+
        }

        /// Any response the client can receive.
        #[derive(Debug, Clone)]
        pub enum Response {
            $($variant($response),)+
        }

        impl Request {
            pub fn api_key(&self) -> ApiKey {
                match self {
                    $(Request::$variant(_) => ApiKey::$variant,)+
                }
            }

            fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
                match self {
                    $(Request::$variant(body) => body.encode(buffer),)+
                }
            }
        }

        impl Response {
            pub fn api_key(&self) -> ApiKey {
                match self {
                    $(Response::$variant(_) => ApiKey::$variant,)+
                }
            }

            /// Parse a response body (the bytes after the correlation id).
            pub fn parse(api_key: ApiKey, body: Bytes) -> Result<Self> {
                let input = NomBytes::new(body.clone());
                match api_key {
                    $(ApiKey::$variant => {
                        let (_, parsed) = $parser(input).map_err(|_| Error::ParsingError(body))?;
                        Ok(Response::$variant(parsed))
                    })+
                }
            }
        }

        $(
            impl From<$request> for Request {
                fn from(request: $request) -> Self {
                    Request::$variant(request)
                }
            }

            impl From<$response> for Response {
                fn from(response: $response) -> Self {
                    Response::$variant(response)
                }
            }

            impl TryFrom<Response> for $response {
                type Error = Error;

                fn try_from(response: Response) -> Result<Self> {
                    match response {
                        Response::$variant(inner) => Ok(inner),
                        other => Err(Error::fatal(format!(
                            "expected {} response, got {}",
                            ApiKey::$variant.as_str(),
                            other.api_key().as_str()
                        ))),
                    }
                }
            }

            impl KafkaRequest for $request {
                const API_KEY: ApiKey = ApiKey::$variant;
                type Response = $response;
            }
        )+
    };
}

api_messages! {
    Produce => ProduceRequest, ProduceResponse, parse_produce_response;
    Fetch => FetchRequest, FetchResponse, parse_fetch_response;
    ListOffsets => ListOffsetsRequest, ListOffsetsResponse, parse_list_offsets_response;
    Metadata => MetadataRequest, MetadataResponse, parse_metadata_response;
    OffsetCommit => OffsetCommitRequest, OffsetCommitResponse, parse_offset_commit_response;
    OffsetFetch => OffsetFetchRequest, OffsetFetchResponse, parse_offset_fetch_response;
    FindCoordinator => FindCoordinatorRequest, FindCoordinatorResponse, parse_find_coordinator_response;
    JoinGroup => JoinGroupRequest, JoinGroupResponse, parse_join_group_response;
    Heartbeat => HeartbeatRequest, HeartbeatResponse, parse_heartbeat_response;
    LeaveGroup => LeaveGroupRequest, LeaveGroupResponse, parse_leave_group_response;
    SyncGroup => SyncGroupRequest, SyncGroupResponse, parse_sync_group_response;
    ApiVersions => ApiVersionsRequest, ApiVersionsResponse, parse_api_versions_response;
    CreateTopics => CreateTopicsRequest, CreateTopicsResponse, parse_create_topics_response;
    DeleteTopics => DeleteTopicsRequest, DeleteTopicsResponse, parse_delete_topics_response;
}

impl Request {
    pub fn api_version(&self) -> i16 {
        self.api_key().client_version()
    }

    /// `acks = 0` produce requests get no response from the broker.
    pub fn expects_response(&self) -> bool {
        !matches!(self, Request::Produce(p) if p.acks == 0)
    }

    /// Serialize as a size-prefixed frame ready for the socket.
    pub fn encode_frame(&self, correlation_id: CorrelationId, client_id: &str) -> Result<Bytes> {
        let header = RequestHeader {
            api_key: self.api_key(),
            api_version: self.api_version(),
            correlation_id,
            client_id: Some(client_id),
        };

        let mut buf = BytesMut::with_capacity(128);
        buf.put_i32(0); // size, patched below
        header.encode(&mut buf)?;
        self.encode_body(&mut buf)?;

        let size = (buf.len() - 4) as i32;
        buf[..4].copy_from_slice(&size.to_be_bytes());
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_round_trip_and_versions() {
        for key in ApiKey::CLIENT_APIS {
            assert_eq!(ApiKey::try_from(i16::from(key)).unwrap(), key);
        }
        assert!(ApiKey::try_from(42).is_err());
        assert_eq!(ApiKey::Produce.client_version(), 3);
        assert_eq!(ApiKey::Fetch.client_version(), 4);
        assert_eq!(ApiKey::JoinGroup.as_str(), "JoinGroup");
    }

    #[test]
    fn test_encode_frame_header() {
        let request = Request::from(HeartbeatRequest {
            group_id: "g".to_string(),
            generation_id: 1,
            member_id: "m".to_string(),
        });
        let frame = request.encode_frame(CorrelationId::new(7), "cli").unwrap();

        let size = i32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        assert_eq!(size as usize, frame.len() - 4);
        assert_eq!(&frame[4..6], &12i16.to_be_bytes()); // api key
        assert_eq!(&frame[6..8], &0i16.to_be_bytes()); // version
        assert_eq!(&frame[8..12], &7i32.to_be_bytes());
        assert_eq!(&frame[12..17], &[0, 3, b'c', b'l', b'i']);
    }

    #[test]
    fn test_acks_zero_expects_no_response() {
        let request = Request::from(ProduceRequest::single("t", 0, Bytes::new(), 0, 1000));
        assert!(!request.expects_response());
        let request = Request::from(ProduceRequest::single("t", 0, Bytes::new(), 1, 1000));
        assert!(request.expects_response());
    }

    #[test]
    fn test_response_conversion_mismatch() {
        let response = Response::from(HeartbeatResponse::default());
        assert!(HeartbeatResponse::try_from(response.clone()).is_ok());
        assert!(LeaveGroupResponse::try_from(response).is_err());
    }

    #[test]
    fn test_response_parse_truncated() {
        let err = Response::parse(ApiKey::FindCoordinator, Bytes::from_static(&[0, 0])).unwrap_err();
        assert!(matches!(err, Error::ParsingError(_)));
    }
}

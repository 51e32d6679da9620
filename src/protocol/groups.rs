//! Group membership APIs: FindCoordinator v0, JoinGroup v1, SyncGroup v0,
//! Heartbeat v0 and LeaveGroup v0.

use bytes::{BufMut, Bytes};
use nom::{
    IResult,
    number::complete::{be_i16, be_i32},
};
use nombytes::NomBytes;

use crate::encode::{ToByte, encode_array};
use crate::error::{KafkaCode, Result};
use crate::parser::{parse_array, parse_bytes, parse_utf8};

// ============================================================================
// FindCoordinator
// ============================================================================

#[derive(Debug, Clone)]
pub struct FindCoordinatorRequest {
    pub group_id: String,
}

impl ToByte for FindCoordinatorRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.group_id.encode(buffer)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FindCoordinatorResponse {
    pub error_code: KafkaCode,
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

pub fn parse_find_coordinator_response(s: NomBytes) -> IResult<NomBytes, FindCoordinatorResponse> {
    let (s, error_code) = be_i16(s)?;
    let (s, node_id) = be_i32(s)?;
    let (s, host) = parse_utf8(s)?;
    let (s, port) = be_i32(s)?;
    Ok((
        s,
        FindCoordinatorResponse {
            error_code: KafkaCode::from_wire(error_code),
            node_id,
            host,
            port,
        },
    ))
}

// ============================================================================
// JoinGroup
// ============================================================================

#[derive(Debug, Clone)]
pub struct JoinGroupRequest {
    pub group_id: String,
    pub session_timeout_ms: i32,
    pub rebalance_timeout_ms: i32,
    /// Empty on the first join; the coordinator assigns one.
    pub member_id: String,
    pub protocol_type: String,
    pub protocols: Vec<JoinGroupProtocol>,
}

#[derive(Debug, Clone)]
pub struct JoinGroupProtocol {
    pub name: String,
    pub metadata: Bytes,
}

impl ToByte for JoinGroupRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.group_id.encode(buffer)?;
        self.session_timeout_ms.encode(buffer)?;
        self.rebalance_timeout_ms.encode(buffer)?;
        self.member_id.encode(buffer)?;
        self.protocol_type.encode(buffer)?;
        encode_array(buffer, &self.protocols)
    }
}

impl ToByte for JoinGroupProtocol {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.name.encode(buffer)?;
        self.metadata.encode(buffer)
    }
}

#[derive(Debug, Clone, Default)]
pub struct JoinGroupResponse {
    pub error_code: KafkaCode,
    pub generation_id: i32,
    pub protocol_name: String,
    pub leader: String,
    pub member_id: String,
    /// Populated only for the leader.
    pub members: Vec<JoinGroupMember>,
}

#[derive(Debug, Clone)]
pub struct JoinGroupMember {
    pub member_id: String,
    pub metadata: Bytes,
}

impl JoinGroupResponse {
    pub fn is_leader(&self) -> bool {
        !self.member_id.is_empty() && self.leader == self.member_id
    }
}

pub fn parse_join_group_response(s: NomBytes) -> IResult<NomBytes, JoinGroupResponse> {
    let (s, error_code) = be_i16(s)?;
    let (s, generation_id) = be_i32(s)?;
    let (s, protocol_name) = parse_utf8(s)?;
    let (s, leader) = parse_utf8(s)?;
    let (s, member_id) = parse_utf8(s)?;
    let (s, members) = parse_array(parse_join_group_member)(s)?;
    Ok((
        s,
        JoinGroupResponse {
            error_code: KafkaCode::from_wire(error_code),
            generation_id,
            protocol_name,
            leader,
            member_id,
            members,
        },
    ))
}

fn parse_join_group_member(s: NomBytes) -> IResult<NomBytes, JoinGroupMember> {
    let (s, member_id) = parse_utf8(s)?;
    let (s, metadata) = parse_bytes(s)?;
    Ok((
        s,
        JoinGroupMember {
            member_id,
            metadata,
        },
    ))
}

// ============================================================================
// SyncGroup
// ============================================================================

#[derive(Debug, Clone)]
pub struct SyncGroupRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
    /// Empty for followers.
    pub assignments: Vec<SyncGroupAssignment>,
}

#[derive(Debug, Clone)]
pub struct SyncGroupAssignment {
    pub member_id: String,
    pub assignment: Bytes,
}

impl ToByte for SyncGroupRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.group_id.encode(buffer)?;
        self.generation_id.encode(buffer)?;
        self.member_id.encode(buffer)?;
        encode_array(buffer, &self.assignments)
    }
}

impl ToByte for SyncGroupAssignment {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.member_id.encode(buffer)?;
        self.assignment.encode(buffer)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncGroupResponse {
    pub error_code: KafkaCode,
    pub assignment: Bytes,
}

pub fn parse_sync_group_response(s: NomBytes) -> IResult<NomBytes, SyncGroupResponse> {
    let (s, error_code) = be_i16(s)?;
    let (s, assignment) = parse_bytes(s)?;
    Ok((
        s,
        SyncGroupResponse {
            error_code: KafkaCode::from_wire(error_code),
            assignment,
        },
    ))
}

// ============================================================================
// Heartbeat / LeaveGroup
// ============================================================================

#[derive(Debug, Clone)]
pub struct HeartbeatRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
}

impl ToByte for HeartbeatRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.group_id.encode(buffer)?;
        self.generation_id.encode(buffer)?;
        self.member_id.encode(buffer)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HeartbeatResponse {
    pub error_code: KafkaCode,
}

pub fn parse_heartbeat_response(s: NomBytes) -> IResult<NomBytes, HeartbeatResponse> {
    let (s, error_code) = be_i16(s)?;
    Ok((
        s,
        HeartbeatResponse {
            error_code: KafkaCode::from_wire(error_code),
        },
    ))
}

#[derive(Debug, Clone)]
pub struct LeaveGroupRequest {
    pub group_id: String,
    pub member_id: String,
}

impl ToByte for LeaveGroupRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.group_id.encode(buffer)?;
        self.member_id.encode(buffer)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LeaveGroupResponse {
    pub error_code: KafkaCode,
}

pub fn parse_leave_group_response(s: NomBytes) -> IResult<NomBytes, LeaveGroupResponse> {
    let (s, error_code) = be_i16(s)?;
    Ok((
        s,
        LeaveGroupResponse {
            error_code: KafkaCode::from_wire(error_code),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_group_request_encode() {
        let request = JoinGroupRequest {
            group_id: "g".to_string(),
            session_timeout_ms: 10_000,
            rebalance_timeout_ms: 60_000,
            member_id: String::new(),
            protocol_type: "consumer".to_string(),
            protocols: vec![JoinGroupProtocol {
                name: "range".to_string(),
                metadata: Bytes::from_static(&[1, 2]),
            }],
        };
        let mut buf = Vec::new();
        request.encode(&mut buf).unwrap();

        // group(3) + session(4) + rebalance(4) + member(2) + type(10)
        // + protocols(4) + name(7) + metadata(4 + 2)
        assert_eq!(buf.len(), 40);
    }

    #[test]
    fn test_parse_join_group_response_leader() {
        let mut buf = Vec::new();
        buf.put_i16(0);
        buf.put_i32(3);
        buf.put_i16(5);
        buf.put_slice(b"range");
        buf.put_i16(2);
        buf.put_slice(b"m1");
        buf.put_i16(2);
        buf.put_slice(b"m1");
        buf.put_i32(1);
        buf.put_i16(2);
        buf.put_slice(b"m1");
        buf.put_i32(0);

        let (_, response) = parse_join_group_response(NomBytes::new(Bytes::from(buf))).unwrap();
        assert!(response.is_leader());
        assert_eq!(response.generation_id, 3);
        assert_eq!(response.protocol_name, "range");
        assert_eq!(response.members.len(), 1);
    }

    #[test]
    fn test_parse_heartbeat_rebalancing() {
        let (_, response) =
            parse_heartbeat_response(NomBytes::new(Bytes::from(27i16.to_be_bytes().to_vec())))
                .unwrap();
        assert_eq!(response.error_code, KafkaCode::RebalanceInProgress);
    }

    #[test]
    fn test_parse_find_coordinator_response() {
        let mut buf = Vec::new();
        buf.put_i16(0);
        buf.put_i32(2);
        buf.put_i16(4);
        buf.put_slice(b"host");
        buf.put_i32(9093);

        let (_, response) =
            parse_find_coordinator_response(NomBytes::new(Bytes::from(buf))).unwrap();
        assert_eq!(response.node_id, 2);
        assert_eq!(response.host, "host");
        assert_eq!(response.port, 9093);
    }
}

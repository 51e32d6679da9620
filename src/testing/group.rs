//! Coordinator-side consumer group state for the mock cluster.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::constants::{CONSUMER_PROTOCOL_TYPE, DEFAULT_REBALANCE_TIMEOUT_MS};
use crate::error::KafkaCode;
use crate::group::select_common_protocol;
use crate::protocol::{JoinGroupMember, JoinGroupProtocol, JoinGroupRequest, JoinGroupResponse, SyncGroupAssignment};

/// Group state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GroupState {
    #[default]
    Empty,
    PreparingRebalance,
    CompletingRebalance,
    Stable,
}

#[derive(Debug, Clone)]
pub(super) struct MockMember {
    protocols: Vec<JoinGroupProtocol>,
    session_timeout: Duration,
    rebalance_timeout: Duration,
    last_seen: Instant,
    /// Rebalance round this member last joined.
    joined_round: u64,
    assignment: Option<Bytes>,
}

#[derive(Debug, Clone, Default)]
pub(super) struct MockGroup {
    pub(super) generation: i32,
    pub(super) state: GroupState,
    pub(super) protocol: Option<String>,
    pub(super) leader: Option<String>,
    pub(super) members: BTreeMap<String, MockMember>,
    round: u64,
    completed_round: u64,
    round_deadline: Option<Instant>,
}

fn millis(ms: i32) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

impl MockGroup {
    pub(super) fn round_deadline(&self) -> Option<Instant> {
        self.round_deadline
    }

    pub(super) fn session_timeout(&self, member_id: &str) -> Option<Duration> {
        self.members.get(member_id).map(|m| m.session_timeout)
    }

    fn begin_rebalance(&mut self, now: Instant, timeout: Duration) {
        self.round += 1;
        self.state = GroupState::PreparingRebalance;
        self.round_deadline = Some(now + timeout);
        for member in self.members.values_mut() {
            member.assignment = None;
        }
    }

    /// Drop members whose session lapsed. Members already rejoined for the
    /// pending round are waiting on the coordinator and are kept.
    pub(super) fn expire(&mut self, now: Instant) {
        let round = self.round;
        let preparing = self.state == GroupState::PreparingRebalance;
        let expired: Vec<String> = self
            .members
            .iter()
            .filter(|(_, m)| !(preparing && m.joined_round == round))
            .filter(|(_, m)| now.duration_since(m.last_seen) > m.session_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        for id in &expired {
            self.members.remove(id);
        }
        self.after_departure(now);
    }

    fn after_departure(&mut self, now: Instant) {
        if self.members.is_empty() {
            self.state = GroupState::Empty;
            self.leader = None;
            self.round_deadline = None;
        } else if self.state != GroupState::PreparingRebalance {
            let timeout = self
                .members
                .values()
                .map(|m| m.rebalance_timeout)
                .max()
                .unwrap_or(Duration::from_millis(DEFAULT_REBALANCE_TIMEOUT_MS));
            self.begin_rebalance(now, timeout);
        }
    }

    /// Register a JoinGroup. Returns the member id and the round it joined.
    pub(super) fn join(
        &mut self,
        request: &JoinGroupRequest,
        now: Instant,
        new_member_id: impl FnOnce() -> String,
    ) -> Result<(String, u64), KafkaCode> {
        if request.protocol_type != CONSUMER_PROTOCOL_TYPE || request.protocols.is_empty() {
            return Err(KafkaCode::InconsistentGroupProtocol);
        }
        let member_id = if request.member_id.is_empty() {
            new_member_id()
        } else if self.members.contains_key(&request.member_id) {
            request.member_id.clone()
        } else {
            return Err(KafkaCode::UnknownMemberId);
        };

        let mut protocols: Vec<Vec<&str>> = self
            .members
            .iter()
            .filter(|(id, _)| **id != member_id)
            .map(|(_, m)| m.protocols.iter().map(|p| p.name.as_str()).collect())
            .collect();
        protocols.push(request.protocols.iter().map(|p| p.name.as_str()).collect());
        if select_common_protocol(&protocols).is_none() {
            return Err(KafkaCode::InconsistentGroupProtocol);
        }

        if self.state != GroupState::PreparingRebalance {
            self.begin_rebalance(now, millis(request.rebalance_timeout_ms));
        }
        self.members.insert(
            member_id.clone(),
            MockMember {
                protocols: request.protocols.clone(),
                session_timeout: millis(request.session_timeout_ms),
                rebalance_timeout: millis(request.rebalance_timeout_ms),
                last_seen: now,
                joined_round: self.round,
                assignment: None,
            },
        );
        Ok((member_id, self.round))
    }

    /// Finish the pending round once every member rejoined or the deadline
    /// passed. Returns whether the round completed.
    pub(super) fn try_complete_join(&mut self, now: Instant) -> bool {
        if self.state != GroupState::PreparingRebalance {
            return false;
        }
        let round = self.round;
        let all_joined = self.members.values().all(|m| m.joined_round == round);
        let expired = self.round_deadline.is_some_and(|d| now >= d);
        if !all_joined && !expired {
            return false;
        }

        self.members.retain(|_, m| m.joined_round == round);
        self.generation += 1;
        self.completed_round = round;
        self.round_deadline = None;
        if self.members.is_empty() {
            self.state = GroupState::Empty;
            self.leader = None;
            self.protocol = None;
            return true;
        }

        let protocols: Vec<Vec<&str>> = self
            .members
            .values()
            .map(|m| m.protocols.iter().map(|p| p.name.as_str()).collect())
            .collect();
        self.protocol = select_common_protocol(&protocols);
        let keep_leader = self
            .leader
            .as_ref()
            .is_some_and(|leader| self.members.contains_key(leader));
        if !keep_leader {
            self.leader = self.members.keys().next().cloned();
        }
        self.state = GroupState::CompletingRebalance;
        true
    }

    /// The JoinGroup answer for `member_id`, or `None` while its round is
    /// still open.
    pub(super) fn join_response(&self, member_id: &str, round: u64) -> Option<JoinGroupResponse> {
        if self.completed_round < round {
            return None;
        }
        if !self.members.contains_key(member_id) {
            return Some(JoinGroupResponse {
                error_code: KafkaCode::UnknownMemberId,
                ..Default::default()
            });
        }

        let protocol = self.protocol.clone().unwrap_or_default();
        let leader = self.leader.clone().unwrap_or_default();
        let members = if leader == member_id {
            self.members
                .iter()
                .map(|(id, m)| JoinGroupMember {
                    member_id: id.clone(),
                    metadata: m
                        .protocols
                        .iter()
                        .find(|p| p.name == protocol)
                        .map(|p| p.metadata.clone())
                        .unwrap_or_default(),
                })
                .collect()
        } else {
            Vec::new()
        };
        Some(JoinGroupResponse {
            error_code: KafkaCode::None,
            generation_id: self.generation,
            protocol_name: protocol,
            leader,
            member_id: member_id.to_string(),
            members,
        })
    }

    fn check_member(&self, member_id: &str, generation: i32) -> Result<(), KafkaCode> {
        if !self.members.contains_key(member_id) {
            return Err(KafkaCode::UnknownMemberId);
        }
        if generation != self.generation {
            return Err(KafkaCode::IllegalGeneration);
        }
        if self.state == GroupState::PreparingRebalance {
            return Err(KafkaCode::RebalanceInProgress);
        }
        Ok(())
    }

    /// Register a SyncGroup. The leader's assignments complete the rebalance.
    pub(super) fn sync(
        &mut self,
        member_id: &str,
        generation: i32,
        assignments: &[SyncGroupAssignment],
        now: Instant,
    ) -> Result<(), KafkaCode> {
        self.check_member(member_id, generation)?;
        if let Some(member) = self.members.get_mut(member_id) {
            member.last_seen = now;
        }
        if self.leader.as_deref() == Some(member_id) && self.state == GroupState::CompletingRebalance {
            for assignment in assignments {
                if let Some(member) = self.members.get_mut(&assignment.member_id) {
                    member.assignment = Some(assignment.assignment.clone());
                }
            }
            self.state = GroupState::Stable;
        }
        Ok(())
    }

    /// The SyncGroup answer, or `None` while the leader has not synced.
    pub(super) fn sync_response(&self, member_id: &str, generation: i32) -> Option<Result<Bytes, KafkaCode>> {
        if let Err(code) = self.check_member(member_id, generation) {
            return Some(Err(code));
        }
        match self.state {
            GroupState::Stable => Some(Ok(self
                .members
                .get(member_id)
                .and_then(|m| m.assignment.clone())
                .unwrap_or_default())),
            _ => None,
        }
    }

    pub(super) fn heartbeat(&mut self, member_id: &str, generation: i32, now: Instant) -> KafkaCode {
        if let Some(member) = self.members.get_mut(member_id) {
            member.last_seen = now;
        }
        match self.check_member(member_id, generation) {
            Ok(()) => KafkaCode::None,
            Err(code) => code,
        }
    }

    pub(super) fn leave(&mut self, member_id: &str, now: Instant) -> KafkaCode {
        if self.members.remove(member_id).is_none() {
            return KafkaCode::UnknownMemberId;
        }
        self.after_departure(now);
        KafkaCode::None
    }

    /// Whether an OffsetCommit from `member_id` at `generation` is accepted.
    /// Generation -1 with an empty member id is a standalone commit, only
    /// allowed while no member is registered.
    pub(super) fn validate_commit(&self, member_id: &str, generation: i32) -> KafkaCode {
        if generation < 0 && member_id.is_empty() {
            return if self.members.is_empty() {
                KafkaCode::None
            } else {
                KafkaCode::IllegalGeneration
            };
        }
        match self.check_member(member_id, generation) {
            Ok(()) => KafkaCode::None,
            Err(code) => code,
        }
    }

    /// Bump the generation as if a rebalance happened behind the members'
    /// backs.
    pub(super) fn advance_generation(&mut self) -> i32 {
        self.generation += 1;
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join_request(member_id: &str) -> JoinGroupRequest {
        JoinGroupRequest {
            group_id: "g".to_string(),
            session_timeout_ms: 10_000,
            rebalance_timeout_ms: 60_000,
            member_id: member_id.to_string(),
            protocol_type: CONSUMER_PROTOCOL_TYPE.to_string(),
            protocols: vec![JoinGroupProtocol {
                name: "range".to_string(),
                metadata: Bytes::from_static(b"meta"),
            }],
        }
    }

    #[test]
    fn test_single_member_round_completes_immediately() {
        let now = Instant::now();
        let mut group = MockGroup::default();
        let (id, round) = group.join(&join_request(""), now, || "m-1".to_string()).unwrap();
        assert!(group.join_response(&id, round).is_none());

        assert!(group.try_complete_join(now));
        let response = group.join_response(&id, round).unwrap();
        assert_eq!(response.generation_id, 1);
        assert_eq!(response.leader, "m-1");
        assert_eq!(response.protocol_name, "range");
        assert_eq!(response.members.len(), 1);
        assert_eq!(group.state, GroupState::CompletingRebalance);
    }

    #[test]
    fn test_round_waits_for_existing_members() {
        let now = Instant::now();
        let mut group = MockGroup::default();
        let (first, round) = group.join(&join_request(""), now, || "m-1".to_string()).unwrap();
        group.try_complete_join(now);
        group.sync(&first, 1, &[], now).unwrap();
        assert_eq!(group.state, GroupState::Stable);

        let (second, round2) = group.join(&join_request(""), now, || "m-2".to_string()).unwrap();
        assert!(round2 > round);
        assert!(!group.try_complete_join(now));
        assert_eq!(group.heartbeat(&first, 1, now), KafkaCode::RebalanceInProgress);

        group.join(&join_request(&first), now, || unreachable!()).unwrap();
        assert!(group.try_complete_join(now));
        assert_eq!(group.generation, 2);
        assert_eq!(group.leader.as_deref(), Some("m-1"));
        assert!(group.join_response(&second, round2).unwrap().members.is_empty());
    }

    #[test]
    fn test_deadline_drops_members_that_did_not_rejoin() {
        let now = Instant::now();
        let mut group = MockGroup::default();
        let (first, _) = group.join(&join_request(""), now, || "m-1".to_string()).unwrap();
        group.try_complete_join(now);
        group.sync(&first, 1, &[], now).unwrap();

        group.join(&join_request(""), now, || "m-2".to_string()).unwrap();
        assert!(group.try_complete_join(now + Duration::from_secs(61)));
        assert!(!group.members.contains_key(&first));
        assert_eq!(group.leader.as_deref(), Some("m-2"));
    }

    #[test]
    fn test_commit_validation() {
        let now = Instant::now();
        let mut group = MockGroup::default();
        assert_eq!(group.validate_commit("", -1), KafkaCode::None);

        let (id, _) = group.join(&join_request(""), now, || "m-1".to_string()).unwrap();
        group.try_complete_join(now);
        group.sync(&id, 1, &[], now).unwrap();
        assert_eq!(group.validate_commit(&id, 1), KafkaCode::None);
        assert_eq!(group.validate_commit("", -1), KafkaCode::IllegalGeneration);

        group.advance_generation();
        assert_eq!(group.validate_commit(&id, 1), KafkaCode::IllegalGeneration);
        assert_eq!(group.validate_commit("ghost", 2), KafkaCode::UnknownMemberId);
    }
}

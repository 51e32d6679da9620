//! Member-side group state.

use std::fmt;

use crate::types::{GenerationId, TopicPartition};

/// Where a member stands in the join/sync/heartbeat cycle.
///
/// ```text
/// Unjoined -> JoinRequested -> AwaitingSync -> Stable -> Revoked -> Unjoined
///                   ^                                       |
///                   +---------------------------------------+
/// ```
///
/// A Revoked member rejoins directly; eviction (missed heartbeats, session
/// timeout, `max.poll.interval`) always lands in Unjoined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemberState {
    #[default]
    Unjoined,
    JoinRequested,
    AwaitingSync,
    /// Synced: the member owns its assignment for the current generation.
    Stable,
    /// The coordinator started a rebalance; the assignment is no longer valid.
    Revoked,
}

impl MemberState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberState::Unjoined => "unjoined",
            MemberState::JoinRequested => "join_requested",
            MemberState::AwaitingSync => "awaiting_sync",
            MemberState::Stable => "stable",
            MemberState::Revoked => "revoked",
        }
    }

    /// Whether the member must (re)join before it may fetch.
    pub fn needs_join(&self) -> bool {
        matches!(self, MemberState::Unjoined | MemberState::Revoked)
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a member's view of its group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub member_id: String,
    pub generation: GenerationId,
    pub state: MemberState,
    pub is_leader: bool,
    /// Assignor chosen by the coordinator for the current generation.
    pub protocol: Option<String>,
    pub assignment: Vec<TopicPartition>,
}

impl Default for Membership {
    fn default() -> Self {
        Self {
            member_id: String::new(),
            generation: GenerationId::INVALID,
            state: MemberState::Unjoined,
            is_leader: false,
            protocol: None,
            assignment: Vec::new(),
        }
    }
}

impl Membership {
    /// Forget the generation and assignment. The member id survives unless
    /// `forget_member` is set.
    pub(crate) fn reset(&mut self, forget_member: bool) {
        if forget_member {
            self.member_id.clear();
        }
        self.generation = GenerationId::INVALID;
        self.state = MemberState::Unjoined;
        self.is_leader = false;
        self.protocol = None;
        self.assignment.clear();
    }
}

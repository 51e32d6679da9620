//! The member side of the consumer group protocol.
//!
//! [`GroupCoordinator`] locates the group's coordinator broker and drives the
//! member through JoinGroup, SyncGroup, Heartbeat and LeaveGroup. When this
//! member is elected leader it runs the assignor for the whole group.
//! Offsets are committed and fetched through the same coordinator.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::assignor::{AssignmentInput, PartitionAssignor, create_assignor};
use super::state::{MemberState, Membership};
use crate::client::ClientCore;
use crate::config::ConsumerConfig;
use crate::constants::{CONSUMER_PROTOCOL_TYPE, DEFAULT_OFFSET_RETENTION_MS, MAX_MISSED_HEARTBEATS};
use crate::error::{Error, ErrorContext, KafkaCode, Result};
use crate::metrics;
use crate::network::BrokerInfo;
use crate::protocol::{
    FindCoordinatorRequest, HeartbeatRequest, JoinGroupProtocol, JoinGroupRequest,
    JoinGroupResponse, LeaveGroupRequest, MemberAssignment, OffsetCommitRequest,
    OffsetFetchRequest, Subscription, SyncGroupAssignment, SyncGroupRequest,
};
use crate::retry;
use crate::types::{BrokerId, GenerationId, TopicPartition};

/// A consumer's handle on its group.
pub struct GroupCoordinator {
    group_id: String,
    config: Arc<ConsumerConfig>,
    core: Arc<ClientCore>,
    assignors: Vec<Box<dyn PartitionAssignor>>,
    coordinator: Mutex<Option<BrokerId>>,
    membership: Mutex<Membership>,
    /// Assignments from the last sync this member led.
    previous: Mutex<HashMap<String, MemberAssignment>>,
    missed_heartbeats: AtomicU32,
    last_heartbeat: Mutex<Instant>,
    join_lock: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl GroupCoordinator {
    pub fn new(group_id: impl Into<String>, config: Arc<ConsumerConfig>, core: Arc<ClientCore>) -> Self {
        let assignors = config
            .assignment_strategies
            .iter()
            .filter_map(|name| create_assignor(name))
            .collect();
        Self {
            group_id: group_id.into(),
            config,
            core,
            assignors,
            coordinator: Mutex::new(None),
            membership: Mutex::new(Membership::default()),
            previous: Mutex::new(HashMap::new()),
            missed_heartbeats: AtomicU32::new(0),
            last_heartbeat: Mutex::new(Instant::now()),
            join_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn membership(&self) -> Membership {
        lock(&self.membership).clone()
    }

    pub fn state(&self) -> MemberState {
        lock(&self.membership).state
    }

    pub fn generation(&self) -> GenerationId {
        lock(&self.membership).generation
    }

    pub fn missed_heartbeats(&self) -> u32 {
        self.missed_heartbeats.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: MemberState) {
        let mut membership = lock(&self.membership);
        if membership.state != state {
            debug!(group = %self.group_id, from = %membership.state, to = %state, "Member state change");
            membership.state = state;
        }
    }

    // ------------------------------------------------------------------
    // Coordinator discovery
    // ------------------------------------------------------------------

    /// The coordinator broker, looked up with FindCoordinator if unknown.
    pub async fn coordinator(&self) -> Result<BrokerId> {
        if let Some(id) = *lock(&self.coordinator) {
            return Ok(id);
        }
        let broker = retry::with_coordinator_policy(|| self.find_coordinator(), |e: &Error| {
            e.is_retriable()
        })
        .await?;
        *lock(&self.coordinator) = Some(broker);
        Ok(broker)
    }

    async fn find_coordinator(&self) -> Result<BrokerId> {
        let mut last_error = Error::retriable("no brokers available to find the coordinator");
        for broker in self.core.metadata().candidates() {
            let request = FindCoordinatorRequest {
                group_id: self.group_id.clone(),
            };
            let response = match self.core.transport().call(broker, request).await {
                Ok(response) => response,
                Err(e) => {
                    debug!(%broker, error = %e, "FindCoordinator failed");
                    last_error = e;
                    continue;
                }
            };
            if response.error_code != KafkaCode::None {
                return Err(Error::from_code(response.error_code, ErrorContext::new()));
            }

            let info = BrokerInfo::new(BrokerId(response.node_id), response.host, response.port);
            self.core.transport().update_brokers(std::slice::from_ref(&info));
            info!(group = %self.group_id, coordinator = %info, "Found group coordinator");
            return Ok(info.id);
        }
        Err(last_error)
    }

    fn forget_coordinator(&self) {
        if let Some(id) = lock(&self.coordinator).take() {
            debug!(group = %self.group_id, coordinator = %id, "Forgetting group coordinator");
        }
    }

    /// Classify a coordinator error code, dropping the cached coordinator
    /// when the code says it moved.
    fn coordinator_error(&self, code: KafkaCode) -> Error {
        if code.invalidates_coordinator() {
            self.forget_coordinator();
        }
        Error::from_code(code, ErrorContext::new().code(code))
    }

    // ------------------------------------------------------------------
    // Join and sync
    // ------------------------------------------------------------------

    /// Join the group subscribed to `topics` and wait for this member's
    /// assignment. Retriable failures are retried with the coordinator
    /// policy; on final failure the member is Unjoined.
    pub async fn join(&self, topics: &[String]) -> Result<Vec<TopicPartition>> {
        let _guard = self.join_lock.lock().await;
        let result = retry::with_coordinator_policy(
            || self.join_once(topics),
            |e: &Error| e.is_retriable(),
        )
        .await;

        match result {
            Ok(assignment) => Ok(assignment),
            Err(e) => {
                warn!(group = %self.group_id, error = %e, "Failed to join group");
                lock(&self.membership).reset(false);
                Err(e)
            }
        }
    }

    async fn join_once(&self, topics: &[String]) -> Result<Vec<TopicPartition>> {
        self.set_state(MemberState::JoinRequested);
        let coordinator = self.coordinator().await?;

        let metadata = Subscription::new(topics.to_vec()).to_bytes()?;
        let (member_id, known_generation) = {
            let m = lock(&self.membership);
            (m.member_id.clone(), m.generation)
        };
        let request = JoinGroupRequest {
            group_id: self.group_id.clone(),
            session_timeout_ms: clamp_ms(self.config.session_timeout_ms),
            rebalance_timeout_ms: clamp_ms(self.config.rebalance_timeout_ms),
            member_id,
            protocol_type: CONSUMER_PROTOCOL_TYPE.to_string(),
            protocols: self
                .assignors
                .iter()
                .map(|a| JoinGroupProtocol {
                    name: a.name().to_string(),
                    metadata: metadata.clone(),
                })
                .collect(),
        };

        let response = self.core.transport().call(coordinator, request).await?;
        match response.error_code {
            KafkaCode::None => {}
            KafkaCode::UnknownMemberId => {
                lock(&self.membership).reset(true);
                return Err(rejoin_error("coordinator does not know this member id", KafkaCode::UnknownMemberId));
            }
            KafkaCode::RebalanceInProgress => {
                return Err(rejoin_error("rebalance in progress", KafkaCode::RebalanceInProgress));
            }
            code => return Err(self.coordinator_error(code)),
        }

        let generation = GenerationId(response.generation_id);
        if known_generation != GenerationId::INVALID && generation < known_generation {
            warn!(
                group = %self.group_id,
                generation = %generation,
                known = %known_generation,
                "Rejecting JoinGroup response from an older generation"
            );
            return Err(rejoin_error(
                format!("JoinGroup generation {} is older than {}", generation, known_generation),
                KafkaCode::IllegalGeneration,
            ));
        }

        {
            let mut m = lock(&self.membership);
            m.member_id = response.member_id.clone();
            m.generation = generation;
            m.is_leader = response.is_leader();
            m.protocol = Some(response.protocol_name.clone());
            m.state = MemberState::AwaitingSync;
        }
        info!(
            group = %self.group_id,
            generation = %generation,
            member_id = %response.member_id,
            leader = response.is_leader(),
            protocol = %response.protocol_name,
            "Joined group"
        );

        let assignments = if response.is_leader() {
            self.lead_assignment(&response).await?
        } else {
            Vec::new()
        };

        let request = SyncGroupRequest {
            group_id: self.group_id.clone(),
            generation_id: generation.0,
            member_id: response.member_id.clone(),
            assignments,
        };
        let sync = self.core.transport().call(coordinator, request).await?;
        match sync.error_code {
            KafkaCode::None => {}
            KafkaCode::UnknownMemberId => {
                lock(&self.membership).reset(true);
                return Err(rejoin_error("member evicted during sync", KafkaCode::UnknownMemberId));
            }
            code @ (KafkaCode::RebalanceInProgress | KafkaCode::IllegalGeneration) => {
                return Err(rejoin_error("rebalance restarted during sync", code));
            }
            code => return Err(self.coordinator_error(code)),
        }

        let assignment = MemberAssignment::from_bytes(&sync.assignment)?;
        let partitions = assignment.topic_partitions();
        {
            let mut m = lock(&self.membership);
            if m.generation != generation {
                return Err(Error::retriable("generation changed during sync"));
            }
            m.assignment = partitions.clone();
            m.state = MemberState::Stable;
        }
        self.missed_heartbeats.store(0, Ordering::SeqCst);
        *lock(&self.last_heartbeat) = Instant::now();
        metrics::REBALANCES.with_label_values(&[&self.group_id]).inc();
        info!(
            group = %self.group_id,
            generation = %generation,
            partitions = partitions.len(),
            "Group assignment received"
        );
        Ok(partitions)
    }

    /// Run the group-selected assignor over every member's subscription.
    async fn lead_assignment(&self, response: &JoinGroupResponse) -> Result<Vec<SyncGroupAssignment>> {
        let assignor = self
            .assignors
            .iter()
            .find(|a| a.name() == response.protocol_name)
            .ok_or_else(|| {
                Error::fatal(format!(
                    "coordinator selected unknown assignor '{}'",
                    response.protocol_name
                ))
            })?;

        let mut subscriptions = HashMap::new();
        for member in &response.members {
            let subscription = Subscription::from_bytes(&member.metadata).unwrap_or_else(|e| {
                warn!(member_id = %member.member_id, error = %e, "Undecodable subscription");
                Subscription::new(Vec::new())
            });
            subscriptions.insert(member.member_id.clone(), subscription);
        }

        let input = AssignmentInput::new(subscriptions, HashMap::new());
        let topics = input.subscribed_topics();
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        let snapshot = self.core.metadata().refresh(&topic_refs).await?;
        let topic_partitions = topics
            .iter()
            .filter_map(|t| snapshot.partition_count(t).map(|n| (t.clone(), n as i32)))
            .collect();
        let previous = lock(&self.previous).clone();
        let input = AssignmentInput {
            topic_partitions,
            previous,
            ..input
        };

        let output = assignor.assign(&input);
        debug!(
            group = %self.group_id,
            assignor = assignor.name(),
            members = output.len(),
            "Computed group assignment"
        );

        let mut assignments = Vec::with_capacity(output.len());
        for (member_id, assignment) in &output {
            assignments.push(SyncGroupAssignment {
                member_id: member_id.clone(),
                assignment: assignment.to_bytes()?,
            });
        }
        *lock(&self.previous) = output;
        Ok(assignments)
    }

    // ------------------------------------------------------------------
    // Heartbeat and leave
    // ------------------------------------------------------------------

    /// Send one heartbeat and apply its outcome. Returns the resulting state.
    ///
    /// `RebalanceInProgress` revokes the assignment. `IllegalGeneration` and
    /// `UnknownMemberId` drop the member to Unjoined. Any other failure counts
    /// as a missed heartbeat; the third consecutive miss, or a session timeout
    /// without a successful heartbeat, evicts the member.
    pub async fn heartbeat(&self) -> MemberState {
        let (member_id, generation, state) = {
            let m = lock(&self.membership);
            (m.member_id.clone(), m.generation, m.state)
        };
        if state != MemberState::Stable {
            return state;
        }

        let outcome = match self.coordinator().await {
            Ok(coordinator) => {
                let request = HeartbeatRequest {
                    group_id: self.group_id.clone(),
                    generation_id: generation.0,
                    member_id,
                };
                self.core
                    .transport()
                    .call(coordinator, request)
                    .await
                    .map(|r| r.error_code)
            }
            Err(e) => Err(e),
        };

        // Something else (a rejoin or a leave) moved the member meanwhile.
        if self.generation() != generation {
            return self.state();
        }

        match outcome {
            Ok(KafkaCode::None) => {
                self.missed_heartbeats.store(0, Ordering::SeqCst);
                *lock(&self.last_heartbeat) = Instant::now();
                MemberState::Stable
            }
            Ok(KafkaCode::RebalanceInProgress) => {
                info!(group = %self.group_id, generation = %generation, "Rebalance in progress, assignment revoked");
                self.missed_heartbeats.store(0, Ordering::SeqCst);
                self.set_state(MemberState::Revoked);
                MemberState::Revoked
            }
            Ok(code @ (KafkaCode::IllegalGeneration | KafkaCode::UnknownMemberId)) => {
                warn!(group = %self.group_id, generation = %generation, ?code, "Heartbeat rejected, member must rejoin");
                lock(&self.membership).reset(code == KafkaCode::UnknownMemberId);
                MemberState::Unjoined
            }
            Ok(code) => {
                let error = self.coordinator_error(code);
                self.missed(error)
            }
            Err(error) => {
                if error.kafka_code().is_none_or(|c| c.invalidates_coordinator()) {
                    self.forget_coordinator();
                }
                self.missed(error)
            }
        }
    }

    fn missed(&self, error: Error) -> MemberState {
        let missed = self.missed_heartbeats.fetch_add(1, Ordering::SeqCst) + 1;
        let silent_for = lock(&self.last_heartbeat).elapsed();
        warn!(group = %self.group_id, missed, error = %error, "Heartbeat failed");

        if missed >= MAX_MISSED_HEARTBEATS || silent_for >= self.config.session_timeout() {
            warn!(
                group = %self.group_id,
                missed,
                silent_ms = silent_for.as_millis() as u64,
                "Heartbeats lost, member evicted"
            );
            self.evict();
            return MemberState::Unjoined;
        }
        MemberState::Stable
    }

    /// Rejoin on the next poll, for instance after the subscription changed.
    pub(crate) fn request_rejoin(&self) {
        let mut membership = lock(&self.membership);
        if membership.state == MemberState::Stable {
            membership.state = MemberState::Revoked;
        }
    }

    /// Drop to Unjoined without telling the coordinator.
    pub(crate) fn evict(&self) {
        lock(&self.membership).reset(true);
        self.missed_heartbeats.store(0, Ordering::SeqCst);
    }

    /// Leave the group (best effort) and drop to Unjoined.
    pub async fn leave(&self) {
        let member_id = lock(&self.membership).member_id.clone();
        if !member_id.is_empty() {
            let coordinator = *lock(&self.coordinator);
            if let Some(coordinator) = coordinator {
                let request = LeaveGroupRequest {
                    group_id: self.group_id.clone(),
                    member_id: member_id.clone(),
                };
                match self.core.transport().call(coordinator, request).await {
                    Ok(response) if response.error_code == KafkaCode::None => {
                        info!(group = %self.group_id, %member_id, "Left group");
                    }
                    Ok(response) => {
                        debug!(group = %self.group_id, code = ?response.error_code, "LeaveGroup rejected");
                    }
                    Err(e) => debug!(group = %self.group_id, error = %e, "LeaveGroup failed"),
                }
            }
        }
        self.evict();
    }

    /// Heartbeat every `heartbeat.interval.ms` while the member is Stable.
    ///
    /// The member also leaves the group once `last_poll` is older than
    /// `max.poll.interval.ms`; the consumer rejoins on its next poll.
    pub(crate) async fn run_heartbeats(self: Arc<Self>, last_poll: Arc<Mutex<Instant>>) {
        let interval = self.config.heartbeat_interval();
        let max_poll_interval = self.config.max_poll_interval();
        loop {
            let jitter = fastrand::u64(0..=interval.as_millis() as u64 / 10);
            tokio::time::sleep(interval.saturating_sub(Duration::from_millis(jitter))).await;

            // Joins and syncs run inside a poll; only a Stable member is
            // held to the poll interval.
            if self.state() != MemberState::Stable {
                continue;
            }

            let since_poll = lock(&last_poll).elapsed();
            if since_poll > max_poll_interval {
                warn!(
                    group = %self.group_id,
                    since_poll_ms = since_poll.as_millis() as u64,
                    max_poll_interval_ms = max_poll_interval.as_millis() as u64,
                    "max.poll.interval exceeded, leaving group"
                );
                self.leave().await;
                continue;
            }

            self.heartbeat().await;
        }
    }

    // ------------------------------------------------------------------
    // Offsets
    // ------------------------------------------------------------------

    /// Commit `offsets` under `generation`.
    ///
    /// A stale generation, an unknown member or a rebalance in progress fail
    /// with [`Error::Commit`], as does a coordinator that stays unavailable.
    pub async fn commit(
        &self,
        generation: GenerationId,
        member_id: &str,
        offsets: &BTreeMap<TopicPartition, i64>,
    ) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }

        let result = retry::with_coordinator_policy(
            || self.commit_once(generation, member_id, offsets),
            |e: &Error| e.is_retriable(),
        )
        .await;

        metrics::record_commit(&self.group_id, result.is_ok());
        result.map_err(|e| match e {
            Error::Commit { .. } | Error::Closed => e,
            Error::Retriable { reason, context } => Error::Commit {
                reason: format!("coordinator unavailable: {}", reason),
                context,
            },
            Error::Fatal { reason, context } => Error::Commit { reason, context },
            other => Error::commit(other.to_string(), ErrorContext::new()),
        })
    }

    async fn commit_once(
        &self,
        generation: GenerationId,
        member_id: &str,
        offsets: &BTreeMap<TopicPartition, i64>,
    ) -> Result<()> {
        let coordinator = self.coordinator().await?;
        let mut request = OffsetCommitRequest {
            group_id: self.group_id.clone(),
            generation_id: generation.0,
            member_id: member_id.to_string(),
            retention_time_ms: DEFAULT_OFFSET_RETENTION_MS,
            topics: Vec::new(),
        };
        for (tp, offset) in offsets {
            request.add_offset(&tp.topic, tp.partition, *offset);
        }

        let response = self.core.transport().call(coordinator, request).await?;
        let Some((topic, partition, code)) = response.first_error() else {
            debug!(group = %self.group_id, generation = %generation, partitions = offsets.len(), "Offsets committed");
            return Ok(());
        };

        let context = ErrorContext::new().topic(topic).partition(partition).code(code);
        match code {
            KafkaCode::IllegalGeneration | KafkaCode::UnknownMemberId | KafkaCode::RebalanceInProgress => {
                if generation == self.generation() {
                    self.set_state(if code == KafkaCode::RebalanceInProgress {
                        MemberState::Revoked
                    } else {
                        MemberState::Unjoined
                    });
                }
                Err(Error::commit(
                    format!("generation {} is no longer current", generation),
                    context,
                ))
            }
            code if code.invalidates_coordinator() => {
                self.forget_coordinator();
                Err(Error::from_code(code, context))
            }
            code => Err(Error::from_code(code, context)),
        }
    }

    /// Committed offsets of `partitions`; `None` where the group has none.
    pub async fn fetch_committed(
        &self,
        partitions: &[TopicPartition],
    ) -> Result<HashMap<TopicPartition, Option<i64>>> {
        if partitions.is_empty() {
            return Ok(HashMap::new());
        }
        retry::with_coordinator_policy(
            || self.fetch_committed_once(partitions),
            |e: &Error| e.is_retriable(),
        )
        .await
    }

    async fn fetch_committed_once(
        &self,
        partitions: &[TopicPartition],
    ) -> Result<HashMap<TopicPartition, Option<i64>>> {
        let coordinator = self.coordinator().await?;
        let mut request = OffsetFetchRequest::new(self.group_id.clone());
        for tp in partitions {
            request.add_partition(&tp.topic, tp.partition);
        }

        let response = self.core.transport().call(coordinator, request).await?;
        let mut committed = HashMap::with_capacity(partitions.len());
        for topic in response.topics {
            for p in topic.partitions {
                let tp = TopicPartition::new(topic.name.clone(), p.partition_index);
                match p.error_code {
                    KafkaCode::None => {}
                    KafkaCode::UnknownTopicOrPartition => {
                        committed.insert(tp, None);
                        continue;
                    }
                    code => {
                        return Err(self.coordinator_error(code).with_partition(&tp.topic, tp.partition));
                    }
                }
                let offset = (p.committed_offset >= 0).then_some(p.committed_offset);
                committed.insert(tp, offset);
            }
        }
        for tp in partitions {
            committed.entry(tp.clone()).or_insert(None);
        }
        Ok(committed)
    }
}

/// A failure that is resolved by joining again.
fn rejoin_error(reason: impl Into<String>, code: KafkaCode) -> Error {
    Error::Retriable {
        reason: reason.into(),
        context: ErrorContext::new().code(code),
    }
}

fn clamp_ms(ms: u64) -> i32 {
    ms.min(i32::MAX as u64) as i32
}

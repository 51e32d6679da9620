//! In-memory cluster speaking the typed request/response model.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::group::{GroupState, MockGroup};
use crate::consumer::{ConsumerRecord, records_from_batch};
use crate::constants::DISCONNECT_CHANNEL_CAPACITY;
use crate::error::{Error, ErrorContext, KafkaCode, Result};
use crate::network::{BrokerInfo, Transport};
use crate::protocol::{
    ApiKey, ApiVersion, ApiVersionsResponse, BrokerMetadata, CreateTopicsRequest,
    CreateTopicsResponse, DeleteTopicsRequest, DeleteTopicsResponse, FetchPartitionResponse,
    FetchRequest, FetchResponse, FetchTopicResponse, FindCoordinatorResponse, HeartbeatResponse,
    JoinGroupRequest, JoinGroupResponse, LeaveGroupResponse, ListOffsetsPartitionResponse,
    ListOffsetsRequest, ListOffsetsResponse, ListOffsetsTopicResponse, MetadataRequest,
    MetadataResponse, OffsetCommitPartitionResponse, OffsetCommitRequest, OffsetCommitResponse,
    OffsetCommitTopicResponse, OffsetFetchPartitionResponse, OffsetFetchRequest,
    OffsetFetchResponse, OffsetFetchTopicResponse, OutgoingRecord, PartitionMetadata,
    ProducePartitionResponse, ProduceRequest, ProduceResponse, ProduceTopicResponse, RecordBatch,
    Request, Response, SyncGroupRequest, SyncGroupResponse, TopicErrorCode, TopicMetadata,
    patch_base_offset,
};
use crate::types::{BrokerId, Offset, TopicPartition};

const MOCK_PORT: i32 = 9092;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
struct StoredBatch {
    base_offset: i64,
    last_offset: i64,
    max_timestamp: i64,
    raw: Bytes,
}

#[derive(Debug, Clone, Default)]
struct PartitionLog {
    leader: Option<BrokerId>,
    batches: Vec<StoredBatch>,
    high_watermark: i64,
}

impl PartitionLog {
    /// Append one RecordBatch, assigning offsets from the high watermark.
    fn append(&mut self, raw: &Bytes) -> std::result::Result<i64, KafkaCode> {
        let batch = RecordBatch::decode(raw.clone()).map_err(|_| KafkaCode::CorruptMessage)?;
        if batch.records.is_empty() {
            return Err(KafkaCode::CorruptMessage);
        }
        let base_offset = self.high_watermark;
        let mut stored = raw.to_vec();
        patch_base_offset(&mut stored, base_offset);
        let last_offset = base_offset + i64::from(batch.last_offset_delta());
        self.batches.push(StoredBatch {
            base_offset,
            last_offset,
            max_timestamp: batch.max_timestamp,
            raw: Bytes::from(stored),
        });
        self.high_watermark = last_offset + 1;
        Ok(base_offset)
    }

    /// Whole batches covering `offset` onwards, at least one even when it
    /// exceeds `max_bytes`.
    fn read(&self, offset: i64, max_bytes: i32) -> Bytes {
        let max_bytes = max_bytes.max(0) as usize;
        let mut buf = BytesMut::new();
        for batch in self.batches.iter().filter(|b| b.last_offset >= offset) {
            if !buf.is_empty() && buf.len() + batch.raw.len() > max_bytes {
                break;
            }
            buf.extend_from_slice(&batch.raw);
        }
        buf.freeze()
    }

    fn offset_for_timestamp(&self, timestamp: i64) -> i64 {
        match timestamp {
            t if t == Offset::EARLIEST.value() => 0,
            t if t == Offset::LATEST.value() => self.high_watermark,
            t => self
                .batches
                .iter()
                .find(|b| b.max_timestamp >= t)
                .map_or(self.high_watermark, |b| b.base_offset),
        }
    }
}

#[derive(Debug, Clone)]
struct MockBroker {
    info: BrokerInfo,
    up: bool,
}

#[derive(Debug, Default)]
struct ClusterState {
    brokers: BTreeMap<BrokerId, MockBroker>,
    topics: BTreeMap<String, Vec<PartitionLog>>,
    groups: HashMap<String, MockGroup>,
    offsets: HashMap<(String, TopicPartition), i64>,
    produce_faults: HashMap<TopicPartition, VecDeque<KafkaCode>>,
    heartbeat_faults: HashMap<String, u32>,
    next_leader: usize,
    next_member: u64,
}

impl ClusterState {
    /// Lowest live broker; acts as controller and group coordinator.
    fn controller(&self) -> Option<BrokerId> {
        self.brokers.values().find(|b| b.up).map(|b| b.info.id)
    }

    fn is_up(&self, broker: BrokerId) -> bool {
        self.brokers.get(&broker).is_some_and(|b| b.up)
    }

    fn partition(&self, topic: &str, partition: i32) -> Option<&PartitionLog> {
        let index = usize::try_from(partition).ok()?;
        self.topics.get(topic)?.get(index)
    }

    fn partition_mut(&mut self, topic: &str, partition: i32) -> Option<&mut PartitionLog> {
        let index = usize::try_from(partition).ok()?;
        self.topics.get_mut(topic)?.get_mut(index)
    }

    fn create_topic(&mut self, name: &str, partitions: i32) -> KafkaCode {
        if self.topics.contains_key(name) {
            return KafkaCode::TopicAlreadyExists;
        }
        if name.is_empty() {
            return KafkaCode::InvalidTopic;
        }
        if partitions <= 0 {
            return KafkaCode::InvalidPartitions;
        }
        let live: Vec<BrokerId> = self
            .brokers
            .values()
            .filter(|b| b.up)
            .map(|b| b.info.id)
            .collect();
        if live.is_empty() {
            return KafkaCode::BrokerNotAvailable;
        }
        let logs = (0..partitions)
            .map(|_| {
                let leader = live[self.next_leader % live.len()];
                self.next_leader += 1;
                PartitionLog {
                    leader: Some(leader),
                    ..Default::default()
                }
            })
            .collect();
        self.topics.insert(name.to_string(), logs);
        KafkaCode::None
    }

    /// Leader check shared by produce, fetch and list offsets.
    fn serving(&self, broker: BrokerId, topic: &str, partition: i32) -> std::result::Result<&PartitionLog, KafkaCode> {
        let log = self
            .partition(topic, partition)
            .ok_or(KafkaCode::UnknownTopicOrPartition)?;
        if log.leader != Some(broker) {
            return Err(KafkaCode::NotLeaderForPartition);
        }
        Ok(log)
    }

    fn new_member_id(&mut self) -> String {
        self.next_member += 1;
        format!("member-{}-{}", self.next_member, uuid::Uuid::new_v4().simple())
    }
}

struct ClusterInner {
    state: Mutex<ClusterState>,
    /// Signalled on every group membership change.
    group_events: Notify,
    /// Signalled on every append.
    appended: Notify,
    disconnects: broadcast::Sender<BrokerId>,
    requests: DashMap<ApiKey, u64>,
}

/// An in-memory Kafka cluster.
///
/// Brokers are numbered from 1 and named `mock-<id>`. The lowest live broker
/// is both controller and coordinator of every group. Each client gets its
/// own [`transport`](MockCluster::transport); closing one client leaves the
/// cluster running for the others.
///
/// ```
/// use kafkaesque_client::testing::MockCluster;
///
/// let cluster = MockCluster::new(3).with_topic("orders", 4);
/// assert_eq!(cluster.partition_count("orders"), Some(4));
/// ```
#[derive(Clone)]
pub struct MockCluster {
    inner: Arc<ClusterInner>,
}

impl MockCluster {
    pub fn new(brokers: usize) -> Self {
        let mut state = ClusterState::default();
        for id in 1..=brokers.max(1) as i32 {
            let id = BrokerId::new(id);
            state.brokers.insert(
                id,
                MockBroker {
                    info: BrokerInfo::new(id, format!("mock-{}", id), MOCK_PORT),
                    up: true,
                },
            );
        }
        let (disconnects, _) = broadcast::channel(DISCONNECT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ClusterInner {
                state: Mutex::new(state),
                group_events: Notify::new(),
                appended: Notify::new(),
                disconnects,
                requests: DashMap::new(),
            }),
        }
    }

    pub fn with_topic(self, name: &str, partitions: i32) -> Self {
        self.create_topic(name, partitions);
        self
    }

    /// Create `name` with leaders spread round-robin over the live brokers.
    pub fn create_topic(&self, name: &str, partitions: i32) -> KafkaCode {
        lock(&self.inner.state).create_topic(name, partitions)
    }

    /// A fresh client-side handle onto the cluster.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(MockTransport {
            cluster: self.inner.clone(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn broker_ids(&self) -> Vec<BrokerId> {
        lock(&self.inner.state).brokers.keys().copied().collect()
    }

    pub fn partition_count(&self, topic: &str) -> Option<usize> {
        lock(&self.inner.state).topics.get(topic).map(Vec::len)
    }

    pub fn leader(&self, tp: &TopicPartition) -> Option<BrokerId> {
        lock(&self.inner.state)
            .partition(&tp.topic, tp.partition)
            .and_then(|log| log.leader)
    }

    /// Hand leadership of `tp` to `broker`. Requests still addressed to the
    /// old leader fail with `NotLeaderForPartition`.
    pub fn move_leader(&self, tp: &TopicPartition, broker: BrokerId) {
        if let Some(log) = lock(&self.inner.state).partition_mut(&tp.topic, tp.partition) {
            debug!(%tp, %broker, "Mock leader moved");
            log.leader = Some(broker);
        }
    }

    /// Answer the next produce to `tp` with `code` instead of appending.
    pub fn fail_next_produce(&self, tp: &TopicPartition, code: KafkaCode) {
        lock(&self.inner.state)
            .produce_faults
            .entry(tp.clone())
            .or_default()
            .push_back(code);
    }

    /// Take `broker` down: its requests fail with a retriable network error
    /// and connection loss is announced to every client.
    pub fn fail_broker(&self, broker: BrokerId) {
        if let Some(b) = lock(&self.inner.state).brokers.get_mut(&broker) {
            b.up = false;
        }
        let _ = self.inner.disconnects.send(broker);
    }

    pub fn restore_broker(&self, broker: BrokerId) {
        if let Some(b) = lock(&self.inner.state).brokers.get_mut(&broker) {
            b.up = true;
        }
    }

    /// Fail the next `count` heartbeats of `group` at the network level.
    pub fn fail_heartbeats(&self, group: &str, count: u32) {
        *lock(&self.inner.state)
            .heartbeat_faults
            .entry(group.to_string())
            .or_default() += count;
    }

    /// Bump `group`'s generation without a rebalance, leaving every member
    /// with a stale generation. Returns the new generation.
    pub fn advance_generation(&self, group: &str) -> Option<i32> {
        let generation = lock(&self.inner.state)
            .groups
            .get_mut(group)
            .map(MockGroup::advance_generation);
        self.inner.group_events.notify_waiters();
        generation
    }

    pub fn group_generation(&self, group: &str) -> Option<i32> {
        lock(&self.inner.state).groups.get(group).map(|g| g.generation)
    }

    pub fn group_state(&self, group: &str) -> Option<GroupState> {
        lock(&self.inner.state).groups.get(group).map(|g| g.state)
    }

    pub fn group_members(&self, group: &str) -> Vec<String> {
        lock(&self.inner.state)
            .groups
            .get(group)
            .map(|g| g.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn committed(&self, group: &str, tp: &TopicPartition) -> Option<i64> {
        lock(&self.inner.state)
            .offsets
            .get(&(group.to_string(), tp.clone()))
            .copied()
    }

    /// Requests received for `key` across all clients.
    pub fn request_count(&self, key: ApiKey) -> u64 {
        self.inner.requests.get(&key).map_or(0, |count| *count)
    }

    pub fn high_watermark(&self, tp: &TopicPartition) -> Option<i64> {
        lock(&self.inner.state)
            .partition(&tp.topic, tp.partition)
            .map(|log| log.high_watermark)
    }

    /// Append one record directly to the log, bypassing any producer.
    pub fn append(&self, tp: &TopicPartition, key: Option<&[u8]>, value: &[u8]) -> Result<i64> {
        let record = OutgoingRecord {
            timestamp: 0,
            key: key.map(Bytes::copy_from_slice),
            value: Some(Bytes::copy_from_slice(value)),
            headers: Vec::new(),
        };
        let raw = RecordBatch::from_records(&[record]).encode();
        let offset = {
            let mut state = lock(&self.inner.state);
            let log = state.partition_mut(&tp.topic, tp.partition).ok_or_else(|| {
                Error::from_code(
                    KafkaCode::UnknownTopicOrPartition,
                    ErrorContext::new().topic(tp.topic.clone()).partition(tp.partition),
                )
            })?;
            log.append(&raw)
                .map_err(|code| Error::from_code(code, ErrorContext::new().topic(tp.topic.clone())))?
        };
        self.inner.appended.notify_waiters();
        Ok(offset)
    }

    /// Every record in `tp`, in offset order.
    pub fn records(&self, tp: &TopicPartition) -> Vec<ConsumerRecord> {
        let batches: Vec<Bytes> = lock(&self.inner.state)
            .partition(&tp.topic, tp.partition)
            .map(|log| log.batches.iter().map(|b| b.raw.clone()).collect())
            .unwrap_or_default();
        batches
            .into_iter()
            .filter_map(|raw| RecordBatch::decode(raw).ok())
            .flat_map(|batch| records_from_batch(&tp.topic, tp.partition, batch, 0).collect::<Vec<_>>())
            .collect()
    }
}

impl ClusterInner {
    fn unreachable(broker: BrokerId) -> Error {
        Error::Retriable {
            reason: format!("broker {} is unreachable", broker),
            context: ErrorContext::new().code(KafkaCode::NetworkException),
        }
    }

    /// Map a bootstrap id to a live broker and reject brokers that are down.
    fn resolve(&self, broker: BrokerId) -> Result<BrokerId> {
        let state = lock(&self.state);
        if broker.is_bootstrap() {
            return state.controller().ok_or_else(|| Self::unreachable(broker));
        }
        if state.is_up(broker) {
            Ok(broker)
        } else {
            Err(Self::unreachable(broker))
        }
    }

    async fn handle(&self, broker: BrokerId, request: Request) -> Result<Response> {
        *self.requests.entry(request.api_key()).or_insert(0) += 1;
        let broker = self.resolve(broker)?;
        trace!(%broker, api = request.api_key().as_str(), "Mock request");

        let response: Response = match request {
            Request::Produce(r) => self.produce(broker, r).into(),
            Request::Fetch(r) => self.fetch(broker, r).await.into(),
            Request::ListOffsets(r) => self.list_offsets(broker, r).into(),
            Request::Metadata(r) => self.metadata(r).into(),
            Request::OffsetCommit(r) => self.offset_commit(broker, r).into(),
            Request::OffsetFetch(r) => self.offset_fetch(broker, r).into(),
            Request::FindCoordinator(_) => self.find_coordinator().into(),
            Request::JoinGroup(r) => self.join_group(broker, r).await.into(),
            Request::SyncGroup(r) => self.sync_group(broker, r).await.into(),
            Request::Heartbeat(r) => {
                let failed = {
                    let mut state = lock(&self.state);
                    match state.heartbeat_faults.get_mut(&r.group_id) {
                        Some(n) if *n > 0 => {
                            *n -= 1;
                            true
                        }
                        _ => false,
                    }
                };
                if failed {
                    return Err(Self::unreachable(broker));
                }
                self.heartbeat(broker, &r.group_id, &r.member_id, r.generation_id).into()
            }
            Request::LeaveGroup(r) => self.leave_group(broker, &r.group_id, &r.member_id).into(),
            Request::ApiVersions(_) => api_versions().into(),
            Request::CreateTopics(r) => self.create_topics(broker, r).into(),
            Request::DeleteTopics(r) => self.delete_topics(broker, r).into(),
        };
        Ok(response)
    }

    fn produce(&self, broker: BrokerId, request: ProduceRequest) -> ProduceResponse {
        let acks = request.acks;
        let mut responses = Vec::with_capacity(request.topics.len());
        {
            let mut state = lock(&self.state);
            for topic in request.topics {
                let partitions = topic
                    .partitions
                    .iter()
                    .map(|p| {
                        let index = p.partition_index;
                        let tp = TopicPartition::new(topic.name.clone(), index);
                        if let Some(code) = state.produce_faults.get_mut(&tp).and_then(VecDeque::pop_front) {
                            return ProducePartitionResponse::error(index, code);
                        }
                        if let Err(code) = state.serving(broker, &topic.name, index) {
                            return ProducePartitionResponse::error(index, code);
                        }
                        match state.partition_mut(&topic.name, index).map(|log| log.append(&p.records)) {
                            Some(Ok(base)) => ProducePartitionResponse::success(index, base),
                            Some(Err(code)) => ProducePartitionResponse::error(index, code),
                            None => ProducePartitionResponse::error(index, KafkaCode::UnknownTopicOrPartition),
                        }
                    })
                    .collect();
                responses.push(ProduceTopicResponse {
                    name: topic.name,
                    partitions,
                });
            }
        }
        self.appended.notify_waiters();

        if acks == 0 {
            return ProduceResponse::default();
        }
        ProduceResponse {
            responses,
            throttle_time_ms: 0,
        }
    }

    /// Answer immediately when data is available, otherwise wait up to
    /// `max_wait_ms` for an append.
    async fn fetch(&self, broker: BrokerId, request: FetchRequest) -> FetchResponse {
        let appended = self.appended.notified();
        let response = self.read(broker, &request);
        let has_data = response
            .responses
            .iter()
            .flat_map(|t| &t.partitions)
            .any(|p| !p.records.is_empty() || p.error_code != KafkaCode::None);
        if has_data || request.max_wait_ms <= 0 {
            return response;
        }
        let max_wait = Duration::from_millis(request.max_wait_ms as u64);
        let _ = tokio::time::timeout(max_wait, appended).await;
        self.read(broker, &request)
    }

    fn read(&self, broker: BrokerId, request: &FetchRequest) -> FetchResponse {
        let state = lock(&self.state);
        let responses = request
            .topics
            .iter()
            .map(|topic| FetchTopicResponse {
                name: topic.name.clone(),
                partitions: topic
                    .partitions
                    .iter()
                    .map(|p| {
                        let mut response = FetchPartitionResponse {
                            partition_index: p.partition_index,
                            high_watermark: -1,
                            last_stable_offset: -1,
                            ..Default::default()
                        };
                        match state.serving(broker, &topic.name, p.partition_index) {
                            Err(code) => response.error_code = code,
                            Ok(log) => {
                                response.high_watermark = log.high_watermark;
                                response.last_stable_offset = log.high_watermark;
                                if p.fetch_offset < 0 || p.fetch_offset > log.high_watermark {
                                    response.error_code = KafkaCode::OffsetOutOfRange;
                                } else {
                                    response.records = log.read(p.fetch_offset, p.partition_max_bytes);
                                }
                            }
                        }
                        response
                    })
                    .collect(),
            })
            .collect();
        FetchResponse {
            throttle_time_ms: 0,
            responses,
        }
    }

    fn list_offsets(&self, broker: BrokerId, request: ListOffsetsRequest) -> ListOffsetsResponse {
        let state = lock(&self.state);
        ListOffsetsResponse {
            topics: request
                .topics
                .into_iter()
                .map(|topic| ListOffsetsTopicResponse {
                    partitions: topic
                        .partitions
                        .iter()
                        .map(|p| {
                            let mut response = ListOffsetsPartitionResponse {
                                partition_index: p.partition_index,
                                timestamp: -1,
                                offset: -1,
                                ..Default::default()
                            };
                            match state.serving(broker, &topic.name, p.partition_index) {
                                Ok(log) => response.offset = log.offset_for_timestamp(p.timestamp),
                                Err(code) => response.error_code = code,
                            }
                            response
                        })
                        .collect(),
                    name: topic.name,
                })
                .collect(),
        }
    }

    fn metadata(&self, request: MetadataRequest) -> MetadataResponse {
        let state = lock(&self.state);
        let brokers = state
            .brokers
            .values()
            .filter(|b| b.up)
            .map(|b| BrokerMetadata {
                node_id: b.info.id.value(),
                host: b.info.host.clone(),
                port: b.info.port,
                rack: None,
            })
            .collect();
        let names = request
            .topics
            .unwrap_or_else(|| state.topics.keys().cloned().collect());
        let topics = names
            .into_iter()
            .map(|name| match state.topics.get(&name) {
                None => TopicMetadata {
                    error_code: KafkaCode::UnknownTopicOrPartition,
                    name,
                    is_internal: false,
                    partitions: Vec::new(),
                },
                Some(logs) => TopicMetadata {
                    error_code: KafkaCode::None,
                    is_internal: false,
                    partitions: logs
                        .iter()
                        .enumerate()
                        .map(|(index, log)| {
                            let leader = log.leader.filter(|id| state.is_up(*id));
                            let replicas: Vec<i32> = leader.map(|id| id.value()).into_iter().collect();
                            PartitionMetadata {
                                error_code: if leader.is_some() {
                                    KafkaCode::None
                                } else {
                                    KafkaCode::LeaderNotAvailable
                                },
                                partition_index: index as i32,
                                leader_id: leader.map_or(-1, |id| id.value()),
                                replica_nodes: replicas.clone(),
                                isr_nodes: replicas,
                            }
                        })
                        .collect(),
                    name,
                },
            })
            .collect();
        MetadataResponse {
            brokers,
            controller_id: state.controller().map_or(-1, |id| id.value()),
            topics,
        }
    }

    fn find_coordinator(&self) -> FindCoordinatorResponse {
        let state = lock(&self.state);
        match state.controller().and_then(|id| state.brokers.get(&id)) {
            Some(broker) => FindCoordinatorResponse {
                error_code: KafkaCode::None,
                node_id: broker.info.id.value(),
                host: broker.info.host.clone(),
                port: broker.info.port,
            },
            None => FindCoordinatorResponse {
                error_code: KafkaCode::GroupCoordinatorNotAvailable,
                node_id: -1,
                ..Default::default()
            },
        }
    }

    fn is_coordinator(state: &ClusterState, broker: BrokerId) -> bool {
        state.controller() == Some(broker)
    }

    async fn join_group(&self, broker: BrokerId, request: JoinGroupRequest) -> JoinGroupResponse {
        let group_id = request.group_id.clone();
        let joined = {
            let mut state = lock(&self.state);
            if !Self::is_coordinator(&state, broker) {
                return join_error(KafkaCode::NotCoordinatorForGroup);
            }
            let member_id = (request.member_id.is_empty()).then(|| state.new_member_id());
            let now = Instant::now();
            let group = state.groups.entry(group_id.clone()).or_default();
            group.expire(now);
            group.join(&request, now, || member_id.unwrap_or_default())
        };
        let (member_id, round) = match joined {
            Ok(joined) => joined,
            Err(code) => return join_error(code),
        };
        debug!(group = %group_id, %member_id, round, "Mock member joining");
        self.group_events.notify_waiters();

        loop {
            let changed = self.group_events.notified();
            let (completed, response, deadline) = {
                let mut state = lock(&self.state);
                let Some(group) = state.groups.get_mut(&group_id) else {
                    return join_error(KafkaCode::UnknownMemberId);
                };
                let completed = group.try_complete_join(Instant::now());
                (completed, group.join_response(&member_id, round), group.round_deadline())
            };
            if completed {
                self.group_events.notify_waiters();
            }
            if let Some(response) = response {
                return response;
            }
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = changed => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => changed.await,
            }
        }
    }

    async fn sync_group(&self, broker: BrokerId, request: SyncGroupRequest) -> SyncGroupResponse {
        let session_timeout = {
            let mut state = lock(&self.state);
            if !Self::is_coordinator(&state, broker) {
                return sync_error(KafkaCode::NotCoordinatorForGroup);
            }
            let Some(group) = state.groups.get_mut(&request.group_id) else {
                return sync_error(KafkaCode::UnknownMemberId);
            };
            if let Err(code) = group.sync(
                &request.member_id,
                request.generation_id,
                &request.assignments,
                Instant::now(),
            ) {
                return sync_error(code);
            }
            group.session_timeout(&request.member_id).unwrap_or_default()
        };
        self.group_events.notify_waiters();

        let deadline = Instant::now() + session_timeout;
        loop {
            let changed = self.group_events.notified();
            let response = lock(&self.state)
                .groups
                .get(&request.group_id)
                .and_then(|g| g.sync_response(&request.member_id, request.generation_id));
            match response {
                Some(Ok(assignment)) => {
                    return SyncGroupResponse {
                        error_code: KafkaCode::None,
                        assignment,
                    };
                }
                Some(Err(code)) => return sync_error(code),
                None => {}
            }
            tokio::select! {
                _ = changed => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return sync_error(KafkaCode::RebalanceInProgress);
                }
            }
        }
    }

    fn heartbeat(&self, broker: BrokerId, group_id: &str, member_id: &str, generation: i32) -> HeartbeatResponse {
        let mut state = lock(&self.state);
        if !Self::is_coordinator(&state, broker) {
            return HeartbeatResponse {
                error_code: KafkaCode::NotCoordinatorForGroup,
            };
        }
        let now = Instant::now();
        let error_code = match state.groups.get_mut(group_id) {
            Some(group) => {
                group.expire(now);
                group.heartbeat(member_id, generation, now)
            }
            None => KafkaCode::UnknownMemberId,
        };
        HeartbeatResponse { error_code }
    }

    fn leave_group(&self, broker: BrokerId, group_id: &str, member_id: &str) -> LeaveGroupResponse {
        let error_code = {
            let mut state = lock(&self.state);
            if !Self::is_coordinator(&state, broker) {
                KafkaCode::NotCoordinatorForGroup
            } else {
                match state.groups.get_mut(group_id) {
                    Some(group) => group.leave(member_id, Instant::now()),
                    None => KafkaCode::UnknownMemberId,
                }
            }
        };
        self.group_events.notify_waiters();
        LeaveGroupResponse { error_code }
    }

    fn offset_commit(&self, broker: BrokerId, request: OffsetCommitRequest) -> OffsetCommitResponse {
        let mut state = lock(&self.state);
        let group_code = if !Self::is_coordinator(&state, broker) {
            KafkaCode::NotCoordinatorForGroup
        } else {
            state
                .groups
                .get(&request.group_id)
                .map_or(KafkaCode::None, |g| g.validate_commit(&request.member_id, request.generation_id))
        };
        let topics = request
            .topics
            .into_iter()
            .map(|topic| OffsetCommitTopicResponse {
                partitions: topic
                    .partitions
                    .iter()
                    .map(|p| {
                        let error_code = if group_code != KafkaCode::None {
                            group_code
                        } else if state.partition(&topic.name, p.partition_index).is_none() {
                            KafkaCode::UnknownTopicOrPartition
                        } else {
                            let tp = TopicPartition::new(topic.name.clone(), p.partition_index);
                            state.offsets.insert((request.group_id.clone(), tp), p.committed_offset);
                            KafkaCode::None
                        };
                        OffsetCommitPartitionResponse {
                            partition_index: p.partition_index,
                            error_code,
                        }
                    })
                    .collect(),
                name: topic.name,
            })
            .collect();
        OffsetCommitResponse { topics }
    }

    fn offset_fetch(&self, broker: BrokerId, request: OffsetFetchRequest) -> OffsetFetchResponse {
        let state = lock(&self.state);
        let coordinator = Self::is_coordinator(&state, broker);
        OffsetFetchResponse {
            topics: request
                .topics
                .into_iter()
                .map(|topic| OffsetFetchTopicResponse {
                    partitions: topic
                        .partition_indexes
                        .iter()
                        .map(|&partition_index| {
                            let tp = TopicPartition::new(topic.name.clone(), partition_index);
                            let committed = state.offsets.get(&(request.group_id.clone(), tp)).copied();
                            OffsetFetchPartitionResponse {
                                partition_index,
                                committed_offset: committed.unwrap_or(-1),
                                metadata: None,
                                error_code: if coordinator {
                                    KafkaCode::None
                                } else {
                                    KafkaCode::NotCoordinatorForGroup
                                },
                            }
                        })
                        .collect(),
                    name: topic.name,
                })
                .collect(),
        }
    }

    fn create_topics(&self, broker: BrokerId, request: CreateTopicsRequest) -> CreateTopicsResponse {
        let mut state = lock(&self.state);
        let controller = state.controller() == Some(broker);
        let live = state.brokers.values().filter(|b| b.up).count() as i16;
        let topics = request
            .topics
            .into_iter()
            .map(|topic| {
                let error_code = if !controller {
                    KafkaCode::NotController
                } else if topic.replication_factor == 0 || topic.replication_factor > live {
                    KafkaCode::InvalidReplicationFactor
                } else {
                    let partitions = if topic.num_partitions == -1 { 1 } else { topic.num_partitions };
                    state.create_topic(&topic.name, partitions)
                };
                TopicErrorCode {
                    name: topic.name,
                    error_code,
                }
            })
            .collect();
        CreateTopicsResponse { topics }
    }

    fn delete_topics(&self, broker: BrokerId, request: DeleteTopicsRequest) -> DeleteTopicsResponse {
        let mut state = lock(&self.state);
        let controller = state.controller() == Some(broker);
        let responses = request
            .topic_names
            .into_iter()
            .map(|name| {
                let error_code = if !controller {
                    KafkaCode::NotController
                } else if state.topics.remove(&name).is_some() {
                    KafkaCode::None
                } else {
                    KafkaCode::UnknownTopicOrPartition
                };
                TopicErrorCode { name, error_code }
            })
            .collect();
        DeleteTopicsResponse { responses }
    }
}

fn join_error(error_code: KafkaCode) -> JoinGroupResponse {
    JoinGroupResponse {
        error_code,
        generation_id: -1,
        ..Default::default()
    }
}

fn sync_error(error_code: KafkaCode) -> SyncGroupResponse {
    SyncGroupResponse {
        error_code,
        assignment: Bytes::new(),
    }
}

fn api_versions() -> ApiVersionsResponse {
    ApiVersionsResponse {
        error_code: KafkaCode::None,
        api_keys: ApiKey::CLIENT_APIS
            .iter()
            .map(|key| ApiVersion {
                api_key: i16::from(*key),
                min_version: 0,
                max_version: key.client_version(),
            })
            .collect(),
    }
}

/// One client's connection to a [`MockCluster`].
struct MockTransport {
    cluster: Arc<ClusterInner>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, broker: BrokerId, request: Request) -> Result<Response> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.cluster.handle(broker, request).await
    }

    async fn connect(&self, broker: BrokerId) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.cluster.resolve(broker).map(|_| ())
    }

    async fn close(&self, _broker: BrokerId) {}

    async fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn bootstrap_brokers(&self) -> Vec<BrokerId> {
        vec![BrokerId::bootstrap(0)]
    }

    fn update_brokers(&self, _brokers: &[BrokerInfo]) {}

    fn subscribe_disconnects(&self) -> broadcast::Receiver<BrokerId> {
        self.cluster.disconnects.subscribe()
    }
}

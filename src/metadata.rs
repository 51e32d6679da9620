//! Cluster metadata cache.
//!
//! The cache holds an immutable [`MetadataSnapshot`] behind an `ArcSwap`.
//! Readers load the current snapshot without locking and keep a consistent
//! view for as long as they hold it. A refresh builds a whole new snapshot
//! and swaps it in, bumping [`MetadataSnapshot::version`].
//!
//! The cache never decides on its own that it is stale. Callers that see a
//! leadership error (`NotLeaderForPartition`, `LeaderNotAvailable`, ...) ask
//! for a [`refresh`](MetadataCache::refresh).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use dashmap::DashSet;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, ErrorContext, KafkaCode, Result};
use crate::network::{BrokerInfo, Transport};
use crate::protocol::{MetadataRequest, MetadataResponse};
use crate::retry;
use crate::types::{BrokerId, TopicPartition};

/// Leadership and replicas of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub partition: i32,
    /// `None` while the partition has no leader.
    pub leader: Option<BrokerId>,
    pub replicas: Vec<BrokerId>,
    pub isr: Vec<BrokerId>,
    pub error: KafkaCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub name: String,
    pub error: KafkaCode,
    pub is_internal: bool,
    /// Sorted by partition id.
    pub partitions: Vec<PartitionInfo>,
}

/// One immutable view of the cluster.
#[derive(Debug, Clone)]
pub struct MetadataSnapshot {
    version: u64,
    brokers: HashMap<BrokerId, BrokerInfo>,
    topics: HashMap<String, TopicInfo>,
    controller: Option<BrokerId>,
    fetched_at: Instant,
}

impl MetadataSnapshot {
    /// The empty snapshot a cache starts with (version 0).
    pub fn empty() -> Self {
        Self {
            version: 0,
            brokers: HashMap::new(),
            topics: HashMap::new(),
            controller: None,
            fetched_at: Instant::now(),
        }
    }

    /// Build a snapshot from a Metadata response.
    pub fn from_response(version: u64, response: &MetadataResponse) -> Self {
        let brokers = response
            .brokers
            .iter()
            .map(|b| {
                let id = BrokerId::new(b.node_id);
                (id, BrokerInfo::new(id, b.host.clone(), b.port))
            })
            .collect();

        let topics = response
            .topics
            .iter()
            .map(|t| {
                let mut partitions: Vec<PartitionInfo> = t
                    .partitions
                    .iter()
                    .map(|p| PartitionInfo {
                        partition: p.partition_index,
                        leader: (p.leader_id >= 0).then(|| BrokerId::new(p.leader_id)),
                        replicas: p.replica_nodes.iter().copied().map(BrokerId::new).collect(),
                        isr: p.isr_nodes.iter().copied().map(BrokerId::new).collect(),
                        error: p.error_code,
                    })
                    .collect();
                partitions.sort_by_key(|p| p.partition);
                (
                    t.name.clone(),
                    TopicInfo {
                        name: t.name.clone(),
                        error: t.error_code,
                        is_internal: t.is_internal,
                        partitions,
                    },
                )
            })
            .collect();

        Self {
            version,
            brokers,
            topics,
            controller: (response.controller_id >= 0)
                .then(|| BrokerId::new(response.controller_id)),
            fetched_at: Instant::now(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    pub fn controller(&self) -> Option<BrokerId> {
        self.controller
    }

    pub fn broker(&self, id: BrokerId) -> Option<&BrokerInfo> {
        self.brokers.get(&id)
    }

    pub fn brokers(&self) -> impl Iterator<Item = &BrokerInfo> {
        self.brokers.values()
    }

    pub fn topic(&self, topic: &str) -> Option<&TopicInfo> {
        self.topics.get(topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &TopicInfo> {
        self.topics.values()
    }

    /// Whether the snapshot has a usable entry for `topic`.
    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|t| t.error == KafkaCode::None)
    }

    pub fn leader_for(&self, topic: &str, partition: i32) -> Option<&BrokerInfo> {
        let leader = self
            .topics
            .get(topic)?
            .partitions
            .iter()
            .find(|p| p.partition == partition)?
            .leader?;
        self.brokers.get(&leader)
    }

    pub fn partition_count(&self, topic: &str) -> Option<usize> {
        self.topics
            .get(topic)
            .filter(|t| t.error == KafkaCode::None && !t.partitions.is_empty())
            .map(|t| t.partitions.len())
    }

    pub fn partitions_for(&self, topic: &str) -> Vec<i32> {
        self.topics
            .get(topic)
            .map(|t| t.partitions.iter().map(|p| p.partition).collect())
            .unwrap_or_default()
    }
}

/// Cache of cluster metadata shared by the client cores.
pub struct MetadataCache {
    transport: Arc<dyn Transport>,
    snapshot: ArcSwap<MetadataSnapshot>,
    tracked: DashSet<String>,
    refresh_lock: Mutex<()>,
    max_age: Duration,
}

impl MetadataCache {
    pub fn new(transport: Arc<dyn Transport>, max_age: Duration) -> Self {
        Self {
            transport,
            snapshot: ArcSwap::from_pointee(MetadataSnapshot::empty()),
            tracked: DashSet::new(),
            refresh_lock: Mutex::new(()),
            max_age,
        }
    }

    /// The current snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<MetadataSnapshot> {
        self.snapshot.load_full()
    }

    pub fn version(&self) -> u64 {
        self.snapshot.load().version
    }

    /// Whether the snapshot is older than `metadata_max_age`.
    pub fn is_stale(&self) -> bool {
        let snapshot = self.snapshot.load();
        snapshot.version == 0 || snapshot.age() >= self.max_age
    }

    pub fn leader_for(&self, topic: &str, partition: i32) -> Option<BrokerInfo> {
        self.snapshot.load().leader_for(topic, partition).cloned()
    }

    pub fn broker(&self, id: BrokerId) -> Option<BrokerInfo> {
        self.snapshot.load().broker(id).cloned()
    }

    pub fn partition_count(&self, topic: &str) -> Option<usize> {
        self.snapshot.load().partition_count(topic)
    }

    pub fn partitions_for(&self, topic: &str) -> Vec<i32> {
        self.snapshot.load().partitions_for(topic)
    }

    /// Topics included in every refresh.
    pub fn tracked_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.tracked.iter().map(|t| t.key().clone()).collect();
        topics.sort();
        topics
    }

    /// Stop including `topic` in refreshes.
    pub fn untrack(&self, topic: &str) {
        self.tracked.remove(topic);
    }

    /// Fetch metadata for the tracked topics plus `topics` and swap in a new
    /// snapshot.
    ///
    /// Concurrent refreshes are serialized. A caller that waited behind a
    /// refresh which already covered its topics gets that snapshot without a
    /// second round trip.
    pub async fn refresh(&self, topics: &[&str]) -> Result<Arc<MetadataSnapshot>> {
        for topic in topics {
            if !self.tracked.contains(*topic) {
                self.tracked.insert((*topic).to_string());
            }
        }

        let observed = self.version();
        let _guard = self.refresh_lock.lock().await;

        let current = self.snapshot();
        if current.version > observed && topics.iter().all(|t| current.topic(t).is_some()) {
            debug!(version = current.version, "Metadata refresh coalesced");
            return Ok(current);
        }

        let request_topics = self.tracked_topics();
        let response = retry::with_metadata_policy(
            || self.fetch(&request_topics),
            |e: &Error| e.is_retriable(),
        )
        .await?;

        let next = Arc::new(MetadataSnapshot::from_response(
            current.version + 1,
            &response,
        ));
        let brokers: Vec<BrokerInfo> = next.brokers().cloned().collect();
        self.transport.update_brokers(&brokers);
        self.snapshot.store(next.clone());

        info!(
            version = next.version,
            brokers = brokers.len(),
            topics = request_topics.len(),
            "Metadata refreshed"
        );
        Ok(next)
    }

    /// Partition count of `topic`, refreshing once if the topic is unknown.
    pub async fn ensure_topic(&self, topic: &str) -> Result<usize> {
        if let Some(count) = self.partition_count(topic) {
            return Ok(count);
        }

        let snapshot = self.refresh(&[topic]).await?;
        match snapshot.topic(topic) {
            Some(info) if info.error != KafkaCode::None => Err(Error::from_code(
                info.error,
                ErrorContext::new().topic(topic),
            )),
            Some(info) if !info.partitions.is_empty() => Ok(info.partitions.len()),
            _ => Err(Error::Retriable {
                reason: format!("no metadata for topic {}", topic),
                context: ErrorContext::new()
                    .topic(topic)
                    .code(KafkaCode::UnknownTopicOrPartition),
            }),
        }
    }

    /// Leader of `tp`, or a retriable error if it has none right now.
    pub fn require_leader(&self, tp: &TopicPartition) -> Result<BrokerInfo> {
        self.leader_for(&tp.topic, tp.partition)
            .ok_or_else(|| Error::Retriable {
                reason: format!("no leader for {}", tp),
                context: ErrorContext::new()
                    .topic(tp.topic.clone())
                    .partition(tp.partition)
                    .code(KafkaCode::LeaderNotAvailable),
            })
    }

    /// Brokers to ask for metadata: known nodes first, then bootstrap servers.
    pub(crate) fn candidates(&self) -> Vec<BrokerId> {
        let snapshot = self.snapshot.load();
        let mut brokers: Vec<BrokerId> = snapshot.brokers().map(|b| b.id).collect();
        brokers.sort();
        brokers.extend(self.transport.bootstrap_brokers());
        brokers
    }

    async fn fetch(&self, topics: &[String]) -> Result<MetadataResponse> {
        let mut last_error = Error::retriable("no brokers available for metadata");
        for broker in self.candidates() {
            let request = MetadataRequest::topics(topics.iter().cloned());
            match self.transport.call(broker, request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(%broker, error = %e, "Metadata request failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BrokerMetadata, PartitionMetadata, TopicMetadata};

    fn response(leader: i32) -> MetadataResponse {
        MetadataResponse {
            brokers: vec![
                BrokerMetadata {
                    node_id: 0,
                    host: "b0".to_string(),
                    port: 9092,
                    rack: None,
                },
                BrokerMetadata {
                    node_id: 1,
                    host: "b1".to_string(),
                    port: 9092,
                    rack: None,
                },
            ],
            controller_id: 0,
            topics: vec![TopicMetadata {
                error_code: KafkaCode::None,
                name: "orders".to_string(),
                is_internal: false,
                partitions: vec![
                    PartitionMetadata {
                        error_code: KafkaCode::None,
                        partition_index: 1,
                        leader_id: -1,
                        replica_nodes: vec![0, 1],
                        isr_nodes: vec![0],
                    },
                    PartitionMetadata {
                        error_code: KafkaCode::None,
                        partition_index: 0,
                        leader_id: leader,
                        replica_nodes: vec![0, 1],
                        isr_nodes: vec![0, 1],
                    },
                ],
            }],
        }
    }

    #[test]
    fn test_snapshot_from_response() {
        let snapshot = MetadataSnapshot::from_response(3, &response(1));
        assert_eq!(snapshot.version(), 3);
        assert_eq!(snapshot.controller(), Some(BrokerId::new(0)));
        assert_eq!(snapshot.partition_count("orders"), Some(2));
        assert_eq!(snapshot.partitions_for("orders"), vec![0, 1]);
        assert_eq!(snapshot.leader_for("orders", 0).unwrap().host, "b1");
        // Negative leader id means no leader.
        assert!(snapshot.leader_for("orders", 1).is_none());
        assert!(snapshot.leader_for("missing", 0).is_none());
    }

    #[test]
    fn test_topic_error_hides_partition_count() {
        let mut resp = response(0);
        resp.topics[0].error_code = KafkaCode::UnknownTopicOrPartition;
        let snapshot = MetadataSnapshot::from_response(1, &resp);
        assert_eq!(snapshot.partition_count("orders"), None);
        assert!(!snapshot.has_topic("orders"));
    }
}

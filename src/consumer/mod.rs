//! Group-managed and manually assigned consumer.
//!
//! [`Consumer`] pulls records with [`poll`](Consumer::poll) and
//! [`poll_batch`](Consumer::poll_batch). With [`subscribe`](Consumer::subscribe)
//! partitions come from the consumer group; with [`assign`](Consumer::assign)
//! the caller picks them and no group membership is kept.
//!
//! ```text
//! Unjoined -> Joining -> Fetching <-> Rebalancing
//!                                        |
//!                                      Closed
//! ```
//!
//! Each poll:
//! 1. leaves the group if the previous poll is older than
//!    `max.poll.interval.ms`
//! 2. (re)joins when the member is not Stable
//! 3. initializes positions from committed offsets or `auto.offset.reset`
//! 4. auto-commits consumed positions when due
//! 5. returns buffered records, fetching from partition leaders as needed
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use kafkaesque_client::config::ConsumerConfig;
//! use kafkaesque_client::consumer::Consumer;
//!
//! # async fn example() -> kafkaesque_client::error::Result<()> {
//! let mut consumer = Consumer::new(ConsumerConfig::new("localhost:9092", "billing"))?;
//! consumer.subscribe(&["orders"])?;
//! loop {
//!     for record in consumer.poll_batch(Duration::from_secs(1)).await? {
//!         println!("{} {:?}", record.offset, record.value_str());
//!     }
//!     consumer.commit().await?;
//! }
//! # }
//! ```

mod fetcher;
mod offsets;
mod record;
mod stream;

pub use offsets::OffsetState;
pub use record::ConsumerRecord;
pub use stream::RecordStream;
pub(crate) use record::records_from_batch;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::ClientCore;
use crate::config::ConsumerConfig;
use crate::error::{Error, ErrorContext, Result};
use crate::group::{GroupCoordinator, MemberState, Membership};
use crate::network::Transport;
use crate::types::{GenerationId, TopicPartition};
use fetcher::{Fetcher, PartitionFetch};
use offsets::OffsetStore;

/// Consumer lifecycle as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerState {
    /// No subscription yet, or evicted from the group.
    Unjoined,
    Joining,
    Fetching,
    /// The group is rebalancing; the old assignment is revoked.
    Rebalancing,
    Closed,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Unjoined => "unjoined",
            ConsumerState::Joining => "joining",
            ConsumerState::Fetching => "fetching",
            ConsumerState::Rebalancing => "rebalancing",
            ConsumerState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Idle,
    Subscribed(Vec<String>),
    Assigned,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Kafka consumer.
pub struct Consumer {
    core: Arc<ClientCore>,
    config: Arc<ConsumerConfig>,
    group: Option<Arc<GroupCoordinator>>,
    fetcher: Fetcher,
    mode: Mode,
    offsets: Arc<Mutex<OffsetStore>>,
    buffer: VecDeque<ConsumerRecord>,
    last_poll: Arc<Mutex<Instant>>,
    last_auto_commit: Instant,
    heartbeat: Option<JoinHandle<()>>,
    rebalancing: bool,
    closed: bool,
}

impl Consumer {
    /// Validate `config` and connect to the bootstrap brokers over TCP.
    pub fn new(config: ConsumerConfig) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        let core = ClientCore::connect(config.client.clone())?;
        Ok(Self::start(config, core))
    }

    /// Build a consumer over any [`Transport`].
    pub fn with_transport(config: ConsumerConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        let core = ClientCore::with_transport(config.client.clone(), transport);
        Ok(Self::start(config, core))
    }

    fn start(config: ConsumerConfig, core: Arc<ClientCore>) -> Self {
        let config = Arc::new(config);
        let group = config
            .group_id
            .clone()
            .map(|group_id| Arc::new(GroupCoordinator::new(group_id, config.clone(), core.clone())));
        info!(
            client_id = %config.client.client_id,
            group = config.group_id.as_deref().unwrap_or(""),
            "Consumer started"
        );
        Self {
            fetcher: Fetcher::new(core.clone(), config.clone()),
            core,
            config,
            group,
            mode: Mode::Idle,
            offsets: Arc::new(Mutex::new(OffsetStore::default())),
            buffer: VecDeque::new(),
            last_poll: Arc::new(Mutex::new(Instant::now())),
            last_auto_commit: Instant::now(),
            heartbeat: None,
            rebalancing: false,
            closed: false,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Group handle, when `group.id` is configured.
    pub fn group(&self) -> Option<&Arc<GroupCoordinator>> {
        self.group.as_ref()
    }

    // ------------------------------------------------------------------
    // Subscription
    // ------------------------------------------------------------------

    /// Join the group for `topics`. The join happens on the next poll.
    pub fn subscribe(&mut self, topics: &[&str]) -> Result<()> {
        self.ensure_open()?;
        let Some(group) = &self.group else {
            return Err(Error::Config(vec!["group.id is required to subscribe".to_string()]));
        };
        let topics: Vec<String> = topics
            .iter()
            .map(|t| t.to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if topics.is_empty() || topics.iter().any(|t| t.is_empty()) {
            return Err(Error::fatal("subscription must name at least one non-empty topic"));
        }

        match &self.mode {
            Mode::Subscribed(current) if *current == topics => return Ok(()),
            Mode::Subscribed(_) => group.request_rejoin(),
            Mode::Assigned => lock(&self.offsets).clear(),
            Mode::Idle => {}
        }
        info!(group = %group.group_id(), ?topics, "Subscribed");
        self.buffer.clear();
        self.mode = Mode::Subscribed(topics);
        Ok(())
    }

    /// Consume exactly `partitions`, without group management.
    ///
    /// Commits still go to the group coordinator when `group.id` is set.
    pub async fn assign(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        self.ensure_open()?;
        if matches!(self.mode, Mode::Subscribed(_)) {
            self.leave_group().await;
        }
        lock(&self.offsets).assign(partitions.iter().cloned());
        self.buffer.retain(|r| partitions.contains(&r.topic_partition()));
        self.mode = Mode::Assigned;
        debug!(partitions = partitions.len(), "Partitions assigned manually");
        Ok(())
    }

    /// Drop the subscription or manual assignment, leaving the group.
    pub async fn unsubscribe(&mut self) {
        if matches!(self.mode, Mode::Subscribed(_)) {
            self.leave_group().await;
        }
        lock(&self.offsets).clear();
        self.buffer.clear();
        self.mode = Mode::Idle;
    }

    // ------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------

    /// At most one record, or `None` once `timeout` elapses.
    pub async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumerRecord>> {
        Ok(self.poll_records(timeout, 1).await?.into_iter().next())
    }

    /// Up to `max.poll.records` records, or an empty batch once `timeout`
    /// elapses.
    pub async fn poll_batch(&mut self, timeout: Duration) -> Result<Vec<ConsumerRecord>> {
        let max = self.config.max_poll_records;
        self.poll_records(timeout, max).await
    }

    async fn poll_records(&mut self, timeout: Duration, max: usize) -> Result<Vec<ConsumerRecord>> {
        self.ensure_open()?;
        if self.mode == Mode::Idle {
            return Err(Error::fatal("consumer is neither subscribed nor assigned"));
        }
        let deadline = Instant::now() + timeout;

        self.check_poll_interval().await;

        loop {
            // The interval bounds the time between polls, not the time spent
            // inside one, so a long poll keeps the member alive.
            *lock(&self.last_poll) = Instant::now();
            self.ensure_membership().await?;
            self.initialize_positions().await?;
            self.maybe_auto_commit();

            if !self.buffer.is_empty() {
                return Ok(self.drain_buffer(max));
            }

            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            let positions = lock(&self.offsets).fetchable();
            if positions.is_empty() {
                // Nothing assigned to this member in the current generation.
                tokio::time::sleep(remaining.min(self.config.fetch_max_wait())).await;
                if Instant::now() >= deadline {
                    return Ok(Vec::new());
                }
                continue;
            }

            let outcomes = self
                .fetcher
                .fetch(&positions, remaining.min(self.config.fetch_max_wait()))
                .await;
            let failed = self.apply_fetch(outcomes).await?;

            if !self.buffer.is_empty() {
                return Ok(self.drain_buffer(max));
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            if failed {
                let backoff = Duration::from_millis(self.config.client.reconnect_backoff_ms)
                    .max(Duration::from_millis(crate::constants::DEFAULT_RETRY_BACKOFF_MS));
                tokio::time::sleep(backoff.min(deadline.saturating_duration_since(Instant::now())))
                    .await;
            }
        }
    }

    /// Buffer fetched records. Returns whether any partition failed with a
    /// retriable error.
    async fn apply_fetch(&mut self, outcomes: Vec<(TopicPartition, PartitionFetch)>) -> Result<bool> {
        let mut failed = false;
        let mut refresh = false;
        for (tp, outcome) in outcomes {
            match outcome {
                PartitionFetch::Records(records) => {
                    let position = lock(&self.offsets).get(&tp).and_then(|s| s.position);
                    // Drop responses for partitions that were seeked or revoked
                    // while the fetch was outstanding.
                    if let Some(position) = position {
                        self.buffer
                            .extend(records.into_iter().filter(|r| r.offset >= position));
                    }
                }
                PartitionFetch::OutOfRange => {
                    warn!(topic = %tp.topic, partition = tp.partition, policy = ?self.config.auto_offset_reset, "Fetch offset out of range, resetting");
                    let reset = self
                        .fetcher
                        .reset_offsets(std::slice::from_ref(&tp), self.config.auto_offset_reset)
                        .await?;
                    let mut offsets = lock(&self.offsets);
                    match reset.get(&tp) {
                        Some(offset) => {
                            offsets.set_position(&tp, *offset);
                        }
                        None => offsets.reset_position(&tp),
                    }
                }
                PartitionFetch::Failed(e) if e.is_retriable() => {
                    debug!(topic = %tp.topic, partition = tp.partition, error = %e, "Fetch failed");
                    refresh |= e.kafka_code().is_none_or(|code| code.invalidates_metadata());
                    failed = true;
                }
                PartitionFetch::Failed(e) => return Err(e),
            }
        }

        if refresh {
            let topics = self.assigned_topics();
            let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
            if let Err(e) = self.core.metadata().refresh(&topics).await {
                debug!(error = %e, "Metadata refresh after fetch failure failed");
            }
        }
        Ok(failed)
    }

    /// Hand out up to `max` buffered records, advancing positions past them.
    fn drain_buffer(&mut self, max: usize) -> Vec<ConsumerRecord> {
        let take = max.min(self.buffer.len());
        let records: Vec<ConsumerRecord> = self.buffer.drain(..take).collect();
        let mut offsets = lock(&self.offsets);
        for record in &records {
            offsets.set_position(&record.topic_partition(), record.offset + 1);
        }
        records
    }

    async fn check_poll_interval(&mut self) {
        let Some(group) = &self.group else {
            return;
        };
        if !matches!(self.mode, Mode::Subscribed(_)) || group.state() != MemberState::Stable {
            return;
        }
        let since_poll = lock(&self.last_poll).elapsed();
        if since_poll > self.config.max_poll_interval() {
            warn!(
                group = %group.group_id(),
                since_poll_ms = since_poll.as_millis() as u64,
                "max.poll.interval exceeded, rejoining"
            );
            self.leave_group().await;
        }
    }

    /// Join or rejoin the group when the member is not Stable.
    async fn ensure_membership(&mut self) -> Result<()> {
        let (Some(group), Mode::Subscribed(topics)) = (self.group.clone(), self.mode.clone()) else {
            return Ok(());
        };
        let state = group.state();
        if state == MemberState::Stable {
            return Ok(());
        }

        if state == MemberState::Revoked {
            self.rebalancing = true;
            if self.config.enable_auto_commit {
                // Best effort: the generation may already be gone.
                if let Err(e) = self.commit_consumed().await {
                    debug!(error = %e, "Commit before rebalance failed");
                }
            }
        }

        // The previous generation's assignment is gone. Positions restart
        // from the committed offsets of whatever the new one hands out.
        self.buffer.clear();
        lock(&self.offsets).clear();
        let joined = group.join(&topics).await;
        self.rebalancing = false;
        let assignment = joined?;
        info!(
            group = %group.group_id(),
            generation = %group.generation(),
            partitions = assignment.len(),
            "Assignment received"
        );
        lock(&self.offsets).assign(assignment);

        if self.heartbeat.as_ref().is_none_or(|h| h.is_finished()) {
            self.heartbeat = Some(tokio::spawn(group.clone().run_heartbeats(self.last_poll.clone())));
        }
        Ok(())
    }

    /// Give every new partition a starting position.
    async fn initialize_positions(&mut self) -> Result<()> {
        let pending = lock(&self.offsets).uninitialized();
        if pending.is_empty() {
            return Ok(());
        }

        let topics: BTreeSet<&str> = pending.iter().map(|tp| tp.topic.as_str()).collect();
        for topic in topics {
            self.core.metadata().ensure_topic(topic).await?;
        }

        let mut missing = Vec::new();
        if let Some(group) = &self.group {
            let committed = group.fetch_committed(&pending).await?;
            let mut offsets = lock(&self.offsets);
            for tp in pending {
                match committed.get(&tp).copied().flatten() {
                    Some(offset) => {
                        offsets.set_committed(&tp, Some(offset));
                        offsets.set_position(&tp, offset);
                    }
                    None => missing.push(tp),
                }
            }
        } else {
            missing = pending;
        }

        if !missing.is_empty() {
            let reset = self
                .fetcher
                .reset_offsets(&missing, self.config.auto_offset_reset)
                .await?;
            let mut offsets = lock(&self.offsets);
            for (tp, offset) in reset {
                offsets.set_position(&tp, offset);
            }
        }
        Ok(())
    }

    fn maybe_auto_commit(&mut self) {
        if !self.config.enable_auto_commit || self.group.is_none() {
            return;
        }
        if self.last_auto_commit.elapsed() < self.config.auto_commit_interval() {
            return;
        }
        self.last_auto_commit = Instant::now();
        let pending = lock(&self.offsets).uncommitted();
        if pending.is_empty() {
            return;
        }
        self.commit_async_with(pending, |result| {
            if let Err(e) = result {
                warn!(error = %e, "Auto-commit failed");
            }
        });
    }

    // ------------------------------------------------------------------
    // Commits
    // ------------------------------------------------------------------

    /// Generation and member id a commit is issued under.
    fn commit_target(&self) -> Result<(Arc<GroupCoordinator>, GenerationId, String)> {
        if self.closed {
            return Err(Error::Closed);
        }
        let Some(group) = &self.group else {
            return Err(Error::Config(vec!["group.id is required to commit".to_string()]));
        };
        match self.mode {
            Mode::Subscribed(_) => {
                let membership = group.membership();
                if membership.state != MemberState::Stable {
                    return Err(Error::commit(
                        format!("membership is {}, assignment was revoked", membership.state),
                        ErrorContext::new(),
                    ));
                }
                Ok((group.clone(), membership.generation, membership.member_id))
            }
            Mode::Assigned | Mode::Idle => Ok((group.clone(), GenerationId::INVALID, String::new())),
        }
    }

    /// Commit `offsets` and wait for the coordinator's acknowledgment.
    ///
    /// The offset is the next record to consume, i.e. last processed + 1.
    pub async fn commit_sync(&self, offsets: &BTreeMap<TopicPartition, i64>) -> Result<()> {
        let (group, generation, member_id) = self.commit_target()?;
        group.commit(generation, &member_id, offsets).await?;
        lock(&self.offsets).mark_committed(offsets);
        Ok(())
    }

    /// Commit in the background, ignoring the outcome beyond logging it.
    pub fn commit_async(&self, offsets: BTreeMap<TopicPartition, i64>) {
        self.commit_async_with(offsets, |result| {
            if let Err(e) = result {
                debug!(error = %e, "Async commit failed");
            }
        });
    }

    /// Commit in the background and run `callback` with the outcome.
    pub fn commit_async_with<F>(&self, offsets: BTreeMap<TopicPartition, i64>, callback: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let target = self.commit_target();
        let store = self.offsets.clone();
        tokio::spawn(async move {
            let result = match target {
                Ok((group, generation, member_id)) => {
                    group.commit(generation, &member_id, &offsets).await
                }
                Err(e) => Err(e),
            };
            if result.is_ok() {
                lock(&store).mark_committed(&offsets);
            }
            callback(result);
        });
    }

    /// Commit the positions returned by poll so far.
    pub async fn commit(&self) -> Result<()> {
        self.commit_consumed().await
    }

    async fn commit_consumed(&self) -> Result<()> {
        let pending = lock(&self.offsets).uncommitted();
        if pending.is_empty() {
            return Ok(());
        }
        self.commit_sync(&pending).await
    }

    // ------------------------------------------------------------------
    // Positions
    // ------------------------------------------------------------------

    /// Consume `tp` from `offset` on the next poll.
    pub fn seek(&mut self, tp: &TopicPartition, offset: i64) -> Result<()> {
        self.ensure_open()?;
        if offset < 0 {
            return Err(Error::fatal(format!("cannot seek to negative offset {}", offset)));
        }
        if !lock(&self.offsets).set_position(tp, offset) {
            return Err(not_assigned(tp));
        }
        self.buffer.retain(|r| r.topic != tp.topic || r.partition != tp.partition);
        debug!(topic = %tp.topic, partition = tp.partition, offset, "Seek");
        Ok(())
    }

    /// Move `partitions` to their log start.
    pub async fn seek_to_beginning(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        self.seek_to(partitions, crate::config::OffsetReset::Earliest).await
    }

    /// Move `partitions` to their log end.
    pub async fn seek_to_end(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        self.seek_to(partitions, crate::config::OffsetReset::Latest).await
    }

    async fn seek_to(&mut self, partitions: &[TopicPartition], reset: crate::config::OffsetReset) -> Result<()> {
        self.ensure_open()?;
        for tp in partitions {
            if !lock(&self.offsets).is_assigned(tp) {
                return Err(not_assigned(tp));
            }
            self.core.metadata().ensure_topic(&tp.topic).await?;
        }
        for (tp, offset) in self.fetcher.reset_offsets(partitions, reset).await? {
            self.seek(&tp, offset)?;
        }
        Ok(())
    }

    /// Next offset poll will return for `tp`.
    pub fn position(&self, tp: &TopicPartition) -> Option<i64> {
        self.offset_state(tp).and_then(|s| s.position)
    }

    /// Last offset the coordinator acknowledged for `tp`.
    pub fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.offset_state(tp).and_then(|s| s.committed)
    }

    pub fn offset_state(&self, tp: &TopicPartition) -> Option<OffsetState> {
        if !self.owns_assignment() {
            return None;
        }
        lock(&self.offsets).get(tp)
    }

    /// Partitions this consumer currently owns. Empty while a group member
    /// is evicted or rebalancing.
    pub fn assignment(&self) -> Vec<TopicPartition> {
        if !self.owns_assignment() {
            return Vec::new();
        }
        lock(&self.offsets).assignment()
    }

    fn owns_assignment(&self) -> bool {
        match (&self.mode, &self.group) {
            (Mode::Subscribed(_), Some(group)) => group.state() == MemberState::Stable,
            _ => true,
        }
    }

    pub fn membership(&self) -> Option<Membership> {
        self.group.as_ref().map(|g| g.membership())
    }

    pub fn state(&self) -> ConsumerState {
        if self.closed {
            return ConsumerState::Closed;
        }
        match (&self.mode, &self.group) {
            (Mode::Idle, _) => ConsumerState::Unjoined,
            (Mode::Assigned, _) => ConsumerState::Fetching,
            (Mode::Subscribed(_), None) => ConsumerState::Unjoined,
            (Mode::Subscribed(_), Some(group)) => match group.state() {
                MemberState::Stable => ConsumerState::Fetching,
                MemberState::Revoked => ConsumerState::Rebalancing,
                MemberState::JoinRequested | MemberState::AwaitingSync if self.rebalancing => {
                    ConsumerState::Rebalancing
                }
                MemberState::JoinRequested | MemberState::AwaitingSync => ConsumerState::Joining,
                MemberState::Unjoined => ConsumerState::Unjoined,
            },
        }
    }

    /// Turn the consumer into a bounded stream of records.
    pub fn into_stream(self, capacity: usize) -> RecordStream {
        RecordStream::spawn(self, capacity)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Commit consumed positions (with auto-commit), leave the group and
    /// release connections. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let mut result = Ok(());
        if self.config.enable_auto_commit
            && self.group.as_ref().is_some_and(|g| g.state() == MemberState::Stable)
        {
            result = self.commit_consumed().await;
            if let Err(e) = &result {
                warn!(error = %e, "Final commit failed");
            }
        }
        if matches!(self.mode, Mode::Subscribed(_)) {
            self.leave_group().await;
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        self.closed = true;
        self.buffer.clear();
        self.core.close().await;
        info!("Consumer closed");
        result
    }

    async fn leave_group(&mut self) {
        if let Some(group) = &self.group {
            group.leave().await;
        }
        lock(&self.offsets).clear();
        self.buffer.clear();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed { Err(Error::Closed) } else { Ok(()) }
    }

    fn assigned_topics(&self) -> Vec<String> {
        let offsets = lock(&self.offsets);
        offsets
            .assignment()
            .into_iter()
            .map(|tp| tp.topic)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

fn not_assigned(tp: &TopicPartition) -> Error {
    Error::Fatal {
        reason: "partition is not assigned to this consumer".to_string(),
        context: ErrorContext::new().topic(tp.topic.clone()).partition(tp.partition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_state_names() {
        assert_eq!(ConsumerState::Rebalancing.to_string(), "rebalancing");
        assert_eq!(ConsumerState::Fetching.as_str(), "fetching");
    }
}

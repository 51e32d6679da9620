//! Topic administration.
//!
//! [`Admin`] creates, deletes, lists and describes topics. Create and delete
//! go to the controller broker; outcomes are reported per topic as a
//! [`TopicResult`] so one rejected topic does not hide the others.
//!
//! ```rust,no_run
//! use kafkaesque_client::admin::{Admin, TopicConfig};
//! use kafkaesque_client::config::AdminConfig;
//!
//! # async fn example() -> kafkaesque_client::error::Result<()> {
//! let admin = Admin::new(AdminConfig::new("localhost:9092"))?;
//! let results = admin
//!     .create_topics(&[TopicConfig::new("orders", 6, 3).with_config("retention.ms", "86400000")])
//!     .await?;
//! for result in results {
//!     if let Err(e) = result.outcome {
//!         eprintln!("{}: {}", result.topic, e);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error as ThisError;
use tracing::{info, warn};

use crate::client::ClientCore;
use crate::config::AdminConfig;
use crate::error::{Error, KafkaCode, Result};
use crate::metadata::TopicInfo;
use crate::network::Transport;
use crate::protocol::{
    ApiKey, ApiVersionsRequest, CreatableTopic, CreatableTopicConfig, CreateTopicsRequest,
    CreateTopicsResponse, DeleteTopicsRequest, DeleteTopicsResponse, KafkaRequest, MetadataRequest,
    MetadataResponse, TopicErrorCode,
};
use crate::retry;
use crate::types::BrokerId;

/// A topic to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    pub name: String,
    pub num_partitions: i32,
    pub replication_factor: i16,
    /// Topic-level overrides such as `cleanup.policy` or `retention.ms`.
    pub configs: BTreeMap<String, String>,
}

impl TopicConfig {
    pub fn new(name: impl Into<String>, num_partitions: i32, replication_factor: i16) -> Self {
        Self {
            name: name.into(),
            num_partitions,
            replication_factor,
            configs: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.configs.insert(key.into(), value.into());
        self
    }

    fn to_creatable(&self) -> CreatableTopic {
        CreatableTopic {
            name: self.name.clone(),
            num_partitions: self.num_partitions,
            replication_factor: self.replication_factor,
            assignments: Vec::new(),
            configs: self
                .configs
                .iter()
                .map(|(name, value)| CreatableTopicConfig {
                    name: name.clone(),
                    value: Some(value.clone()),
                })
                .collect(),
        }
    }
}

/// Why a topic operation was rejected.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum AdminError {
    #[error("topic already exists")]
    TopicAlreadyExists,

    #[error("unknown topic")]
    UnknownTopic,

    /// Partition count, replication factor, name or config rejected.
    #[error("invalid topic settings ({0:?})")]
    InvalidTopic(KafkaCode),

    #[error("not authorized")]
    NotAuthorized,

    /// The request timed out on the broker; the operation may still complete.
    #[error("timed out on the broker")]
    Timeout,

    #[error("broker returned {0:?}")]
    Broker(KafkaCode),
}

impl AdminError {
    fn from_code(code: KafkaCode) -> Option<Self> {
        match code {
            KafkaCode::None => None,
            KafkaCode::TopicAlreadyExists => Some(AdminError::TopicAlreadyExists),
            KafkaCode::UnknownTopicOrPartition => Some(AdminError::UnknownTopic),
            KafkaCode::InvalidTopic
            | KafkaCode::InvalidPartitions
            | KafkaCode::InvalidReplicationFactor
            | KafkaCode::InvalidReplicaAssignment
            | KafkaCode::InvalidConfig => Some(AdminError::InvalidTopic(code)),
            KafkaCode::TopicAuthorizationFailed | KafkaCode::ClusterAuthorizationFailed => {
                Some(AdminError::NotAuthorized)
            }
            KafkaCode::RequestTimedOut => Some(AdminError::Timeout),
            code => Some(AdminError::Broker(code)),
        }
    }
}

/// Outcome of one topic in a create or delete call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicResult {
    pub topic: String,
    pub outcome: std::result::Result<(), AdminError>,
}

impl TopicResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Topic administration client.
pub struct Admin {
    core: Arc<ClientCore>,
    config: AdminConfig,
}

impl Admin {
    pub fn new(config: AdminConfig) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        let core = ClientCore::connect(config.client.clone())?;
        Ok(Self { core, config })
    }

    pub fn with_transport(config: AdminConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        let core = ClientCore::with_transport(config.client.clone(), transport);
        Ok(Self { core, config })
    }

    pub fn config(&self) -> &AdminConfig {
        &self.config
    }

    fn operation_timeout_ms(&self) -> i32 {
        self.config.operation_timeout_ms.min(i32::MAX as u64) as i32
    }

    /// Controller if known, otherwise any broker that answers.
    async fn controller(&self) -> Result<BrokerId> {
        if self.core.metadata().snapshot().controller().is_none() {
            self.core.metadata().refresh(&[]).await?;
        }
        let snapshot = self.core.metadata().snapshot();
        snapshot
            .controller()
            .or_else(|| self.core.metadata().candidates().into_iter().next())
            .ok_or_else(|| Error::retriable("no broker available"))
    }

    pub async fn create_topics(&self, topics: &[TopicConfig]) -> Result<Vec<TopicResult>> {
        let request = CreateTopicsRequest {
            topics: topics.iter().map(TopicConfig::to_creatable).collect(),
            timeout_ms: self.operation_timeout_ms(),
        };
        let request = &request;
        let response = retry::with_metadata_policy(
            || self.create_once(request),
            |e: &Error| e.is_retriable(),
        )
        .await?;

        let results = topic_results(response.topics);
        let created: Vec<&str> = results
            .iter()
            .filter(|r| r.is_ok())
            .map(|r| r.topic.as_str())
            .collect();
        if !created.is_empty() {
            info!(topics = ?created, "Topics created");
        }
        Ok(results)
    }

    pub async fn create_topic(&self, topic: TopicConfig) -> Result<TopicResult> {
        let name = topic.name.clone();
        self.create_topics(&[topic])
            .await?
            .into_iter()
            .find(|r| r.topic == name)
            .ok_or_else(|| Error::fatal(format!("no result for topic {}", name)))
    }

    pub async fn delete_topics(&self, topics: &[&str]) -> Result<Vec<TopicResult>> {
        let request = DeleteTopicsRequest {
            topic_names: topics.iter().map(|t| t.to_string()).collect(),
            timeout_ms: self.operation_timeout_ms(),
        };
        let request = &request;
        let response = retry::with_metadata_policy(
            || self.delete_once(request),
            |e: &Error| e.is_retriable(),
        )
        .await?;

        let results = topic_results(response.responses);
        for result in results.iter().filter(|r| r.is_ok()) {
            self.core.metadata().untrack(&result.topic);
        }
        info!(
            deleted = results.iter().filter(|r| r.is_ok()).count(),
            requested = topics.len(),
            "Topics deleted"
        );
        Ok(results)
    }

    /// Names of every non-internal topic, sorted.
    pub async fn list_topics(&self) -> Result<Vec<String>> {
        let response = self.fetch_metadata(MetadataRequest::all()).await?;
        let mut names: Vec<String> = response
            .topics
            .into_iter()
            .filter(|t| !t.is_internal && t.error_code == KafkaCode::None)
            .map(|t| t.name)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Partition layout of `topics`. Unknown topics are reported with
    /// `error = UnknownTopicOrPartition`.
    pub async fn describe_topics(&self, topics: &[&str]) -> Result<Vec<TopicInfo>> {
        let response = self.fetch_metadata(MetadataRequest::topics(topics.iter().copied())).await?;
        let snapshot = crate::metadata::MetadataSnapshot::from_response(0, &response);
        Ok(topics
            .iter()
            .filter_map(|t| snapshot.topic(t).cloned())
            .collect())
    }

    /// Pinned API versions the broker does not support. Empty when the
    /// client and broker are compatible.
    pub async fn unsupported_apis(&self) -> Result<Vec<ApiKey>> {
        let broker = self.controller().await?;
        let response = self.core.transport().call(broker, ApiVersionsRequest).await?;
        if response.error_code != KafkaCode::None {
            return Err(Error::from_code(response.error_code, Default::default()));
        }
        Ok(response.unsupported())
    }

    pub async fn close(&self) {
        self.core.close().await;
    }

    async fn create_once(&self, request: &CreateTopicsRequest) -> Result<CreateTopicsResponse> {
        let response = self.call_controller(request.clone()).await?;
        self.check_controller(&response.topics)?;
        Ok(response)
    }

    async fn delete_once(&self, request: &DeleteTopicsRequest) -> Result<DeleteTopicsResponse> {
        let response = self.call_controller(request.clone()).await?;
        self.check_controller(&response.responses)?;
        Ok(response)
    }

    /// A controller that cannot be reached is looked up again before the
    /// next attempt.
    async fn call_controller<R: KafkaRequest>(&self, request: R) -> Result<R::Response> {
        let controller = self.controller().await?;
        let result = self.core.transport().call(controller, request).await;
        if let Err(e) = &result {
            if e.is_retriable() {
                warn!(%controller, error = %e, "Controller unreachable, refreshing metadata");
                if let Err(e) = self.core.metadata().refresh(&[]).await {
                    warn!(error = %e, "Metadata refresh after controller failure failed");
                }
            }
        }
        result
    }

    async fn fetch_metadata(&self, request: MetadataRequest) -> Result<MetadataResponse> {
        let request = &request;
        retry::with_metadata_policy(
            || self.fetch_metadata_once(request),
            |e: &Error| e.is_retriable(),
        )
        .await
    }

    /// Ask each known broker in turn until one answers.
    async fn fetch_metadata_once(&self, request: &MetadataRequest) -> Result<MetadataResponse> {
        let mut last = Error::retriable("no broker available");
        for broker in self.core.metadata().candidates() {
            match self.core.transport().call(broker, request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retriable() => last = e,
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// A `NotController` answer means the cached controller moved.
    fn check_controller(&self, topics: &[TopicErrorCode]) -> Result<()> {
        if topics.iter().any(|t| t.error_code == KafkaCode::NotController) {
            let core = self.core.clone();
            tokio::spawn(async move {
                if let Err(e) = core.metadata().refresh(&[]).await {
                    warn!(error = %e, "Metadata refresh after NotController failed");
                }
            });
            return Err(Error::from_code(KafkaCode::NotController, Default::default()));
        }
        Ok(())
    }
}

fn topic_results(topics: Vec<TopicErrorCode>) -> Vec<TopicResult> {
    topics
        .into_iter()
        .map(|t| TopicResult {
            outcome: AdminError::from_code(t.error_code).map_or(Ok(()), Err),
            topic: t.name,
        })
        .collect()
}

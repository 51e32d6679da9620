//! Typed client configuration.
//!
//! Each config struct enumerates the options it understands, with defaults
//! documented per field. Three ways to build one:
//!
//! - struct literal / `Default` plus field assignment
//! - [`ProducerConfig::from_properties`] (and friends) with Kafka-style dotted
//!   keys such as `bootstrap.servers` or `linger.ms`
//! - `from_env()`, which reads `KAFKA_*` variables (`KAFKA_LINGER_MS` maps to
//!   `linger.ms`)
//!
//! Keys a config does not recognize are kept verbatim in
//! [`ClientConfig::extra`] rather than rejected.
//!
//! `validate()` reports every problem found, not only the first.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Prefix of environment variables read by `from_env()`.
pub const ENV_PREFIX: &str = "KAFKA_";

/// Options shared by every client type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `host:port` of the brokers used to discover the cluster.
    /// Key: `bootstrap.servers` (comma separated). Required.
    pub bootstrap_servers: Vec<String>,

    /// Sent in every request header. Key: `client.id`.
    /// Default: `kafkaesque-<uuid>`.
    pub client_id: String,

    /// Upper bound on waiting for any single response. Key: `request.timeout.ms`.
    /// Default: 30000.
    pub request_timeout_ms: u64,

    /// TCP connect timeout. Key: `socket.connection.setup.timeout.ms`.
    /// Default: 5000.
    pub connect_timeout_ms: u64,

    /// Floor of the reconnect backoff. No reconnect to a broker happens sooner
    /// than this after a failure. Key: `reconnect.backoff.ms`. Default: 50.
    pub reconnect_backoff_ms: u64,

    /// Ceiling of the exponential reconnect backoff.
    /// Key: `reconnect.backoff.max.ms`. Default: 1000.
    pub reconnect_backoff_max_ms: u64,

    /// Metadata older than this is refreshed before use.
    /// Key: `metadata.max.age.ms`. Default: 300000.
    pub metadata_max_age_ms: u64,

    /// Largest response frame accepted. Key: `receive.message.max.bytes`.
    /// Default: 100 MiB.
    pub max_response_size: usize,

    /// Unrecognized keys, passed through untouched.
    pub extra: BTreeMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: Vec::new(),
            client_id: format!("kafkaesque-{}", uuid::Uuid::new_v4()),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            reconnect_backoff_ms: DEFAULT_RECONNECT_BACKOFF_MS,
            reconnect_backoff_max_ms: DEFAULT_RECONNECT_BACKOFF_MAX_MS,
            metadata_max_age_ms: DEFAULT_METADATA_MAX_AGE_MS,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            extra: BTreeMap::new(),
        }
    }
}

impl ClientConfig {
    pub fn new(bootstrap_servers: &str) -> Self {
        Self {
            bootstrap_servers: split_list(bootstrap_servers),
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn reconnect_backoff_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_max_ms)
    }

    pub fn metadata_max_age(&self) -> Duration {
        Duration::from_millis(self.metadata_max_age_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        self.collect_errors(&mut errors);
        finish(errors)
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        if self.bootstrap_servers.is_empty() {
            errors.push("bootstrap.servers must name at least one broker".to_string());
        }
        for server in &self.bootstrap_servers {
            let valid = server
                .rsplit_once(':')
                .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
                .unwrap_or(false);
            if !valid {
                errors.push(format!(
                    "bootstrap server '{}' must have the form host:port",
                    server
                ));
            }
        }
        if self.client_id.is_empty() {
            errors.push("client.id must not be empty".to_string());
        }
        if self.request_timeout_ms == 0 {
            errors.push("request.timeout.ms must be positive".to_string());
        }
        if self.connect_timeout_ms == 0 {
            errors.push("socket.connection.setup.timeout.ms must be positive".to_string());
        }
        if self.metadata_max_age_ms == 0 {
            errors.push("metadata.max.age.ms must be positive".to_string());
        }
        if self.reconnect_backoff_max_ms < self.reconnect_backoff_ms {
            errors.push(format!(
                "reconnect.backoff.max.ms ({}) must be at least reconnect.backoff.ms ({})",
                self.reconnect_backoff_max_ms, self.reconnect_backoff_ms
            ));
        }
        if self.max_response_size < 1024 {
            errors.push(format!(
                "receive.message.max.bytes ({}) should be at least 1KB",
                self.max_response_size
            ));
        }
    }

    fn apply(&mut self, key: &str, value: &str, errors: &mut Vec<String>) -> bool {
        match key {
            "bootstrap.servers" => self.bootstrap_servers = split_list(value),
            "client.id" => self.client_id = value.to_string(),
            "request.timeout.ms" => set(&mut self.request_timeout_ms, key, value, errors),
            "socket.connection.setup.timeout.ms" => {
                set(&mut self.connect_timeout_ms, key, value, errors)
            }
            "reconnect.backoff.ms" => set(&mut self.reconnect_backoff_ms, key, value, errors),
            "reconnect.backoff.max.ms" => {
                set(&mut self.reconnect_backoff_max_ms, key, value, errors)
            }
            "metadata.max.age.ms" => set(&mut self.metadata_max_age_ms, key, value, errors),
            "receive.message.max.bytes" => set(&mut self.max_response_size, key, value, errors),
            _ => return false,
        }
        true
    }
}

/// `acks` setting for produce requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acks {
    /// Fire and forget; records complete once written to the socket.
    None,
    /// The partition leader has written the batch.
    Leader,
    /// Every in-sync replica has the batch.
    All,
}

impl Acks {
    pub fn as_i16(self) -> i16 {
        match self {
            Acks::None => 0,
            Acks::Leader => 1,
            Acks::All => -1,
        }
    }
}

impl FromStr for Acks {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "0" | "none" => Ok(Acks::None),
            "1" | "leader" => Ok(Acks::Leader),
            "-1" | "all" => Ok(Acks::All),
            other => Err(format!("unknown acks value '{}'", other)),
        }
    }
}

/// Producer options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    #[serde(flatten)]
    pub client: ClientConfig,

    /// Key: `acks`. Default: `all`.
    pub acks: Acks,

    /// A partition's open batch is sealed once it reaches this many bytes.
    /// Key: `batch.size`. Default: 16384.
    pub batch_size: usize,

    /// How long an open batch may wait for more records before being sealed.
    /// Key: `linger.ms`. Default: 5.
    pub linger_ms: u64,

    /// Resends of a batch after a retriable failure. Key: `retries`. Default: 3.
    pub retries: u32,

    /// Pause before a failed batch is resent. Key: `retry.backoff.ms`. Default: 100.
    pub retry_backoff_ms: u64,

    /// Upper bound on the time between `send` and the record's outcome,
    /// retries included. Key: `delivery.timeout.ms`. Default: 120000.
    pub delivery_timeout_ms: u64,

    /// Produce requests outstanding per partition.
    ///
    /// With the default of 1, acknowledgments within a partition are observed
    /// in send order even when retries happen. Raising it above 1 while
    /// `retries > 0` gives up that ordering: a retried batch can land after a
    /// batch sealed later. Key: `max.in.flight.requests.per.connection`.
    pub max_in_flight_per_partition: usize,

    /// Largest record (key + value + headers) accepted by `send`.
    /// Key: `max.request.size`. Default: 1 MiB.
    pub max_request_size: usize,

    /// Records that may wait in the send queue before `send` suspends.
    /// Key: `queue.buffering.max.messages`. Default: 100000.
    pub queue_depth: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            acks: Acks::All,
            batch_size: DEFAULT_BATCH_SIZE,
            linger_ms: DEFAULT_LINGER_MS,
            retries: DEFAULT_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            delivery_timeout_ms: DEFAULT_DELIVERY_TIMEOUT_MS,
            max_in_flight_per_partition: DEFAULT_MAX_IN_FLIGHT_PER_PARTITION,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            queue_depth: DEFAULT_PRODUCER_QUEUE_DEPTH,
        }
    }
}

impl ProducerConfig {
    pub fn new(bootstrap_servers: &str) -> Self {
        Self {
            client: ClientConfig::new(bootstrap_servers),
            ..Self::default()
        }
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    /// Whether acknowledgments are guaranteed to arrive in send order per partition.
    pub fn preserves_ordering(&self) -> bool {
        self.max_in_flight_per_partition <= 1 || self.retries == 0
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        self.client.collect_errors(&mut errors);
        if self.batch_size == 0 {
            errors.push("batch.size must be positive".to_string());
        }
        if self.max_in_flight_per_partition == 0 {
            errors.push("max.in.flight.requests.per.connection must be at least 1".to_string());
        }
        if self.queue_depth == 0 {
            errors.push("queue.buffering.max.messages must be at least 1".to_string());
        }
        if self.max_request_size < 1024 {
            errors.push(format!(
                "max.request.size ({}) should be at least 1KB",
                self.max_request_size
            ));
        }
        if self.delivery_timeout_ms < self.linger_ms + self.client.request_timeout_ms {
            errors.push(format!(
                "delivery.timeout.ms ({}) must be at least linger.ms + request.timeout.ms ({})",
                self.delivery_timeout_ms,
                self.linger_ms + self.client.request_timeout_ms
            ));
        }
        finish(errors)
    }

    pub fn from_properties<I, K, V>(properties: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        load_properties(properties)
    }

    pub fn from_env() -> Result<Self> {
        load_properties(env_properties())
    }
}

/// Where a consumer starts when its group has no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    Earliest,
    Latest,
    /// Fail the poll instead of guessing.
    None,
}

impl FromStr for OffsetReset {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "earliest" | "smallest" | "beginning" => Ok(OffsetReset::Earliest),
            "latest" | "largest" | "end" => Ok(OffsetReset::Latest),
            "none" | "error" => Ok(OffsetReset::None),
            other => Err(format!("unknown auto.offset.reset value '{}'", other)),
        }
    }
}

impl fmt::Display for OffsetReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
            OffsetReset::None => "none",
        };
        f.write_str(name)
    }
}

/// Consumer options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    #[serde(flatten)]
    pub client: ClientConfig,

    /// Consumer group. Required for `subscribe` and for commits.
    /// Key: `group.id`.
    pub group_id: Option<String>,

    /// Key: `auto.offset.reset`. Default: `latest`.
    pub auto_offset_reset: OffsetReset,

    /// Commit consumed positions from `poll` every `auto_commit_interval_ms`.
    /// Key: `enable.auto.commit`. Default: true.
    pub enable_auto_commit: bool,

    /// Key: `auto.commit.interval.ms`. Default: 5000.
    pub auto_commit_interval_ms: u64,

    /// Coordinator evicts the member after this long without a heartbeat.
    /// Key: `session.timeout.ms`. Default: 10000.
    pub session_timeout_ms: u64,

    /// Key: `heartbeat.interval.ms`. Default: 3000.
    pub heartbeat_interval_ms: u64,

    /// How long the coordinator waits for members to rejoin.
    /// Key: `rebalance.timeout.ms`. Default: 60000.
    pub rebalance_timeout_ms: u64,

    /// A consumer that does not call `poll` within this interval leaves the
    /// group and must rejoin. Key: `max.poll.interval.ms`. Default: 300000.
    pub max_poll_interval_ms: u64,

    /// Cap on records returned by one `poll_batch`. Key: `max.poll.records`.
    /// Default: 500.
    pub max_poll_records: usize,

    /// Key: `fetch.min.bytes`. Default: 1.
    pub fetch_min_bytes: i32,

    /// Key: `fetch.max.bytes`. Default: 50 MiB.
    pub fetch_max_bytes: i32,

    /// Key: `fetch.max.wait.ms`. Default: 500.
    pub fetch_max_wait_ms: u64,

    /// Key: `max.partition.fetch.bytes`. Default: 1 MiB.
    pub max_partition_fetch_bytes: i32,

    /// Assignors advertised in JoinGroup, in preference order.
    /// Key: `partition.assignment.strategy` (comma separated; `range`,
    /// `roundrobin`, `sticky`). Default: `range,sticky`.
    pub assignment_strategies: Vec<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            group_id: None,
            auto_offset_reset: OffsetReset::Latest,
            enable_auto_commit: true,
            auto_commit_interval_ms: DEFAULT_AUTO_COMMIT_INTERVAL_MS,
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            rebalance_timeout_ms: DEFAULT_REBALANCE_TIMEOUT_MS,
            max_poll_interval_ms: DEFAULT_MAX_POLL_INTERVAL_MS,
            max_poll_records: DEFAULT_MAX_POLL_RECORDS,
            fetch_min_bytes: DEFAULT_FETCH_MIN_BYTES,
            fetch_max_bytes: DEFAULT_FETCH_MAX_BYTES,
            fetch_max_wait_ms: DEFAULT_FETCH_MAX_WAIT_MS,
            max_partition_fetch_bytes: DEFAULT_MAX_PARTITION_FETCH_BYTES,
            assignment_strategies: vec!["range".to_string(), "sticky".to_string()],
        }
    }
}

impl ConsumerConfig {
    pub fn new(bootstrap_servers: &str, group_id: impl Into<String>) -> Self {
        Self {
            client: ClientConfig::new(bootstrap_servers),
            group_id: Some(group_id.into()),
            ..Self::default()
        }
    }

    pub fn auto_commit_interval(&self) -> Duration {
        Duration::from_millis(self.auto_commit_interval_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    pub fn fetch_max_wait(&self) -> Duration {
        Duration::from_millis(self.fetch_max_wait_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        self.client.collect_errors(&mut errors);
        if matches!(&self.group_id, Some(g) if g.is_empty()) {
            errors.push("group.id must not be empty when set".to_string());
        }
        if self.heartbeat_interval_ms == 0 {
            errors.push("heartbeat.interval.ms must be positive".to_string());
        }
        if self.heartbeat_interval_ms >= self.session_timeout_ms {
            errors.push(format!(
                "heartbeat.interval.ms ({}) must be less than session.timeout.ms ({})",
                self.heartbeat_interval_ms, self.session_timeout_ms
            ));
        }
        if self.max_poll_records == 0 {
            errors.push("max.poll.records must be at least 1".to_string());
        }
        if self.max_poll_interval_ms == 0 {
            errors.push("max.poll.interval.ms must be positive".to_string());
        }
        if self.fetch_min_bytes < 0 {
            errors.push("fetch.min.bytes must not be negative".to_string());
        }
        if self.fetch_max_bytes <= 0 || self.max_partition_fetch_bytes <= 0 {
            errors.push("fetch.max.bytes and max.partition.fetch.bytes must be positive".to_string());
        }
        if self.assignment_strategies.is_empty() {
            errors.push("partition.assignment.strategy must name at least one assignor".to_string());
        }
        for name in &self.assignment_strategies {
            if crate::group::create_assignor(name).is_none() {
                errors.push(format!("unknown partition.assignment.strategy '{}'", name));
            }
        }
        finish(errors)
    }

    pub fn from_properties<I, K, V>(properties: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        load_properties(properties)
    }

    pub fn from_env() -> Result<Self> {
        load_properties(env_properties())
    }
}

/// Admin client options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    #[serde(flatten)]
    pub client: ClientConfig,

    /// Timeout the broker is given for topic operations.
    /// Key: `default.api.timeout.ms`. Default: 30000.
    pub operation_timeout_ms: u64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            operation_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl AdminConfig {
    pub fn new(bootstrap_servers: &str) -> Self {
        Self {
            client: ClientConfig::new(bootstrap_servers),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        self.client.collect_errors(&mut errors);
        if self.operation_timeout_ms == 0 {
            errors.push("default.api.timeout.ms must be positive".to_string());
        }
        finish(errors)
    }

    pub fn from_properties<I, K, V>(properties: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        load_properties(properties)
    }

    pub fn from_env() -> Result<Self> {
        load_properties(env_properties())
    }
}

/// Key/value loading shared by the config types.
trait Properties: Default {
    /// Returns false for keys this config does not know.
    fn apply(&mut self, key: &str, value: &str, errors: &mut Vec<String>) -> bool;
    fn client_mut(&mut self) -> &mut ClientConfig;
    fn check(&self) -> std::result::Result<(), Vec<String>>;
}

impl Properties for ProducerConfig {
    fn apply(&mut self, key: &str, value: &str, errors: &mut Vec<String>) -> bool {
        match key {
            "acks" => set(&mut self.acks, key, value, errors),
            "batch.size" => set(&mut self.batch_size, key, value, errors),
            "linger.ms" => set(&mut self.linger_ms, key, value, errors),
            "retries" => set(&mut self.retries, key, value, errors),
            "retry.backoff.ms" => set(&mut self.retry_backoff_ms, key, value, errors),
            "delivery.timeout.ms" => set(&mut self.delivery_timeout_ms, key, value, errors),
            "max.in.flight.requests.per.connection" | "max.in.flight" => {
                set(&mut self.max_in_flight_per_partition, key, value, errors)
            }
            "max.request.size" => set(&mut self.max_request_size, key, value, errors),
            "queue.buffering.max.messages" => set(&mut self.queue_depth, key, value, errors),
            _ => return self.client.apply(key, value, errors),
        }
        true
    }

    fn client_mut(&mut self) -> &mut ClientConfig {
        &mut self.client
    }

    fn check(&self) -> std::result::Result<(), Vec<String>> {
        self.validate()
    }
}

impl Properties for ConsumerConfig {
    fn apply(&mut self, key: &str, value: &str, errors: &mut Vec<String>) -> bool {
        match key {
            "group.id" => self.group_id = Some(value.to_string()),
            "auto.offset.reset" => set(&mut self.auto_offset_reset, key, value, errors),
            "enable.auto.commit" => match parse_bool(value) {
                Some(enabled) => self.enable_auto_commit = enabled,
                None => errors.push(format!("{}: expected true or false, got '{}'", key, value)),
            },
            "auto.commit.interval.ms" => set(&mut self.auto_commit_interval_ms, key, value, errors),
            "session.timeout.ms" => set(&mut self.session_timeout_ms, key, value, errors),
            "heartbeat.interval.ms" => set(&mut self.heartbeat_interval_ms, key, value, errors),
            "rebalance.timeout.ms" => set(&mut self.rebalance_timeout_ms, key, value, errors),
            "max.poll.interval.ms" => set(&mut self.max_poll_interval_ms, key, value, errors),
            "max.poll.records" => set(&mut self.max_poll_records, key, value, errors),
            "fetch.min.bytes" => set(&mut self.fetch_min_bytes, key, value, errors),
            "fetch.max.bytes" => set(&mut self.fetch_max_bytes, key, value, errors),
            "fetch.max.wait.ms" => set(&mut self.fetch_max_wait_ms, key, value, errors),
            "max.partition.fetch.bytes" => {
                set(&mut self.max_partition_fetch_bytes, key, value, errors)
            }
            "partition.assignment.strategy" => self.assignment_strategies = split_list(value),
            _ => return self.client.apply(key, value, errors),
        }
        true
    }

    fn client_mut(&mut self) -> &mut ClientConfig {
        &mut self.client
    }

    fn check(&self) -> std::result::Result<(), Vec<String>> {
        self.validate()
    }
}

impl Properties for AdminConfig {
    fn apply(&mut self, key: &str, value: &str, errors: &mut Vec<String>) -> bool {
        match key {
            "default.api.timeout.ms" => set(&mut self.operation_timeout_ms, key, value, errors),
            _ => return self.client.apply(key, value, errors),
        }
        true
    }

    fn client_mut(&mut self) -> &mut ClientConfig {
        &mut self.client
    }

    fn check(&self) -> std::result::Result<(), Vec<String>> {
        self.validate()
    }
}

fn load_properties<C, I, K, V>(properties: I) -> Result<C>
where
    C: Properties,
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut config = C::default();
    let mut errors = Vec::new();
    for (key, value) in properties {
        let (key, value) = (key.as_ref().trim(), value.as_ref().trim());
        if !config.apply(key, value, &mut errors) {
            config
                .client_mut()
                .extra
                .insert(key.to_string(), value.to_string());
        }
    }
    if !errors.is_empty() {
        return Err(Error::Config(errors));
    }
    config.check().map_err(Error::Config)?;
    Ok(config)
}

/// `KAFKA_LINGER_MS=10` becomes `("linger.ms", "10")`.
fn env_properties() -> Vec<(String, String)> {
    std::env::vars()
        .filter_map(|(name, value)| {
            let key = name.strip_prefix(ENV_PREFIX)?;
            Some((key.to_lowercase().replace('_', "."), value))
        })
        .collect()
}

fn set<T>(field: &mut T, key: &str, value: &str, errors: &mut Vec<String>)
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match value.parse() {
        Ok(parsed) => *field = parsed,
        Err(e) => errors.push(format!("{}: invalid value '{}' ({})", key, value, e)),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn finish(errors: Vec<String>) -> std::result::Result<(), Vec<String>> {
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

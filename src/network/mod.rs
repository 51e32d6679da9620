//! Broker connections.
//!
//! The [`Transport`] trait is the seam between the client cores and the
//! network. [`ConnectionManager`] is the TCP implementation; the in-memory
//! [`MockCluster`](crate::testing::MockCluster) implements the same trait
//! for tests.
//!
//! # Trait Hierarchy
//!
//! - [`Transport`]: request/response exchange, broker registry, lifecycle
//! - `impl dyn Transport`: the typed [`call`](Transport::call) helper

mod connection;
mod manager;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::protocol::{KafkaRequest, Request, Response};
use crate::types::BrokerId;

pub use manager::ConnectionManager;

/// Address of a broker node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerInfo {
    pub id: BrokerId,
    pub host: String,
    pub port: i32,
}

impl BrokerInfo {
    pub fn new(id: BrokerId, host: impl Into<String>, port: i32) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }

    /// `host:port`, as accepted by `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for BrokerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

/// Request/response exchange with the brokers of one cluster.
///
/// Implementations must fail every outstanding request to a broker with a
/// retriable error when the connection to it is lost, and announce the loss
/// on [`subscribe_disconnects`](Transport::subscribe_disconnects).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` to `broker` and wait for its response.
    ///
    /// Produce requests with `acks = 0` resolve once written, with an empty
    /// produce response.
    async fn send(&self, broker: BrokerId, request: Request) -> Result<Response>;

    /// Establish the connection to `broker` ahead of the first request.
    async fn connect(&self, broker: BrokerId) -> Result<()>;

    /// Drop the connection to `broker`, failing its outstanding requests.
    async fn close(&self, broker: BrokerId);

    /// Drop every connection. Outstanding and later requests fail with `Closed`.
    async fn close_all(&self);

    /// Synthetic ids of the configured bootstrap servers.
    fn bootstrap_brokers(&self) -> Vec<BrokerId>;

    /// Register broker addresses learned from metadata.
    fn update_brokers(&self, brokers: &[BrokerInfo]);

    /// Ids of brokers whose connection was lost.
    fn subscribe_disconnects(&self) -> broadcast::Receiver<BrokerId>;
}

impl dyn Transport {
    /// Send a typed request and unwrap the matching typed response.
    pub async fn call<R: KafkaRequest>(&self, broker: BrokerId, request: R) -> Result<R::Response> {
        let response = self.send(broker, request.into()).await?;
        R::Response::try_from(response)
    }
}

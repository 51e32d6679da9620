//! TCP [`Transport`] with lazy connects and per-broker reconnect backoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backon::ExponentialBackoff;
use dashmap::DashMap;
use tokio::sync::{Mutex, broadcast};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::connection::BrokerConnection;
use super::{BrokerInfo, Transport};
use crate::config::ClientConfig;
use crate::constants::DISCONNECT_CHANNEL_CAPACITY;
use crate::error::{Error, Result};
use crate::metrics;
use crate::protocol::{Request, Response};
use crate::retry::reconnect_backoff;
use crate::types::BrokerId;

/// Reconnect schedule for a broker that failed or dropped.
struct Backoff {
    schedule: ExponentialBackoff,
    not_before: Instant,
}

/// Owns the TCP connections to every broker of a cluster.
///
/// Connections are opened on first use. After a failed attempt or a lost
/// connection, the next attempt to that broker waits out a jittered
/// exponential delay that never drops below `reconnect_backoff_ms`.
pub struct ConnectionManager {
    client_id: String,
    request_timeout: Duration,
    connect_timeout: Duration,
    reconnect_floor: Duration,
    reconnect_ceiling: Duration,
    max_response_size: usize,
    bootstrap: Vec<BrokerId>,
    addresses: DashMap<BrokerId, String>,
    connections: DashMap<BrokerId, Arc<BrokerConnection>>,
    connecting: DashMap<BrokerId, Arc<Mutex<()>>>,
    backoff: DashMap<BrokerId, Backoff>,
    disconnects: broadcast::Sender<BrokerId>,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(config: &ClientConfig) -> Self {
        let addresses = DashMap::new();
        let bootstrap: Vec<BrokerId> = config
            .bootstrap_servers
            .iter()
            .enumerate()
            .map(|(index, server)| {
                let id = BrokerId::bootstrap(index);
                addresses.insert(id, server.clone());
                id
            })
            .collect();
        let (disconnects, _) = broadcast::channel(DISCONNECT_CHANNEL_CAPACITY);

        Self {
            client_id: config.client_id.clone(),
            request_timeout: config.request_timeout(),
            connect_timeout: config.connect_timeout(),
            reconnect_floor: config.reconnect_backoff(),
            reconnect_ceiling: config.reconnect_backoff_max(),
            max_response_size: config.max_response_size,
            bootstrap,
            addresses,
            connections: DashMap::new(),
            connecting: DashMap::new(),
            backoff: DashMap::new(),
            disconnects,
            closed: AtomicBool::new(false),
        }
    }

    /// Address registered for `broker`, if any.
    pub fn address(&self, broker: BrokerId) -> Option<String> {
        self.addresses.get(&broker).map(|a| a.clone())
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .count()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// The live connection to `broker`, opening one if needed.
    async fn connection(&self, broker: BrokerId) -> Result<Arc<BrokerConnection>> {
        self.ensure_open()?;
        if let Some(conn) = self.live(broker) {
            return Ok(conn);
        }

        let lock = self
            .connecting
            .entry(broker)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another caller may have connected while we waited.
        if let Some(conn) = self.live(broker) {
            return Ok(conn);
        }
        self.ensure_open()?;

        let address = self
            .address(broker)
            .ok_or_else(|| Error::fatal(format!("no address known for broker {}", broker)))?;

        self.wait_for_backoff(broker).await;
        self.ensure_open()?;

        match BrokerConnection::connect(
            broker,
            &address,
            self.client_id.clone(),
            self.connect_timeout,
            self.max_response_size,
            self.disconnects.clone(),
        )
        .await
        {
            Ok(conn) => {
                metrics::CONNECTION_ATTEMPTS
                    .with_label_values(&["success"])
                    .inc();
                self.backoff.remove(&broker);
                let conn = Arc::new(conn);
                self.connections.insert(broker, conn.clone());
                Ok(conn)
            }
            Err(e) => {
                metrics::CONNECTION_ATTEMPTS
                    .with_label_values(&["failure"])
                    .inc();
                let delay = self.schedule_reconnect(broker);
                warn!(%broker, address, error = %e, ?delay, "Broker connection attempt failed");
                Err(match e {
                    Error::IoError(kind) => Error::retriable(format!(
                        "cannot connect to broker {} at {}: {:?}",
                        broker, address, kind
                    )),
                    other => other,
                })
            }
        }
    }

    /// A connection that is still up. A dead one is evicted and its broker
    /// put on the reconnect schedule.
    fn live(&self, broker: BrokerId) -> Option<Arc<BrokerConnection>> {
        let conn = self.connections.get(&broker).map(|c| c.clone())?;
        if !conn.is_closed() {
            return Some(conn);
        }
        self.connections
            .remove_if(&broker, |_, existing| Arc::ptr_eq(existing, &conn));
        self.schedule_reconnect(broker);
        None
    }

    /// Push the earliest next attempt for `broker` forward by one backoff step.
    fn schedule_reconnect(&self, broker: BrokerId) -> Duration {
        let mut entry = self.backoff.entry(broker).or_insert_with(|| Backoff {
            schedule: reconnect_backoff(self.reconnect_floor, self.reconnect_ceiling),
            not_before: Instant::now(),
        });
        let delay = entry
            .schedule
            .next()
            .unwrap_or(self.reconnect_ceiling)
            .max(self.reconnect_floor);
        entry.not_before = Instant::now() + delay;
        delay
    }

    async fn wait_for_backoff(&self, broker: BrokerId) {
        let not_before = self.backoff.get(&broker).map(|b| b.not_before);
        if let Some(not_before) = not_before {
            if not_before > Instant::now() {
                debug!(%broker, wait = ?(not_before - Instant::now()), "Waiting for reconnect backoff");
                tokio::time::sleep_until(not_before).await;
            }
        }
    }
}

#[async_trait]
impl Transport for ConnectionManager {
    async fn send(&self, broker: BrokerId, request: Request) -> Result<Response> {
        let conn = self.connection(broker).await?;
        conn.send(request, self.request_timeout).await
    }

    async fn connect(&self, broker: BrokerId) -> Result<()> {
        self.connection(broker).await.map(|_| ())
    }

    async fn close(&self, broker: BrokerId) {
        if let Some((_, conn)) = self.connections.remove(&broker) {
            conn.shutdown(Error::Closed);
            debug!(%broker, "Closed broker connection");
        }
    }

    async fn close_all(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let brokers: Vec<BrokerId> = self.connections.iter().map(|e| *e.key()).collect();
        for broker in brokers {
            if let Some((_, conn)) = self.connections.remove(&broker) {
                conn.shutdown(Error::Closed);
            }
        }
        info!("Closed all broker connections");
    }

    fn bootstrap_brokers(&self) -> Vec<BrokerId> {
        self.bootstrap.clone()
    }

    fn update_brokers(&self, brokers: &[BrokerInfo]) {
        for broker in brokers {
            let address = broker.address();
            let previous = self.addresses.insert(broker.id, address.clone());
            if previous.as_deref().is_some_and(|p| p != address) {
                // The node moved: its old socket points at the wrong host.
                if let Some((_, conn)) = self.connections.remove(&broker.id) {
                    conn.shutdown(Error::retriable(format!(
                        "broker {} moved to {}",
                        broker.id, address
                    )));
                }
                info!(broker = %broker.id, address, "Broker address changed");
            }
        }
    }

    fn subscribe_disconnects(&self) -> broadcast::Receiver<BrokerId> {
        self.disconnects.subscribe()
    }
}

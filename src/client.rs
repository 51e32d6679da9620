//! State shared by the producer, consumer and admin clients.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::metadata::MetadataCache;
use crate::network::{ConnectionManager, Transport};

/// Transport plus metadata cache, and the task that keeps the cache fresh.
///
/// The background task refreshes metadata whenever a broker connection is
/// lost and whenever the snapshot outlives `metadata_max_age_ms`.
pub struct ClientCore {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    metadata: Arc<MetadataCache>,
    maintenance: JoinHandle<()>,
}

impl ClientCore {
    /// Connect over TCP. Must be called within a Tokio runtime.
    pub fn connect(config: ClientConfig) -> Result<Arc<Self>> {
        config.validate().map_err(Error::Config)?;
        let transport: Arc<dyn Transport> = Arc::new(ConnectionManager::new(&config));
        Ok(Self::with_transport(config, transport))
    }

    /// Run over any [`Transport`], such as the in-memory test cluster.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        let metadata = Arc::new(MetadataCache::new(
            transport.clone(),
            config.metadata_max_age(),
        ));
        let maintenance = tokio::spawn(maintain_metadata(
            transport.clone(),
            metadata.clone(),
            config.metadata_max_age(),
        ));

        Arc::new(Self {
            config,
            transport,
            metadata,
            maintenance,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn metadata(&self) -> &Arc<MetadataCache> {
        &self.metadata
    }

    /// Stop background work and drop every connection.
    pub async fn close(&self) {
        self.maintenance.abort();
        self.transport.close_all().await;
    }
}

impl Drop for ClientCore {
    fn drop(&mut self) {
        self.maintenance.abort();
    }
}

async fn maintain_metadata(
    transport: Arc<dyn Transport>,
    metadata: Arc<MetadataCache>,
    max_age: std::time::Duration,
) {
    let mut disconnects = transport.subscribe_disconnects();
    // interval() panics on a zero period.
    let mut ticker = tokio::time::interval(max_age.max(std::time::Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            event = disconnects.recv() => match event {
                Ok(broker) => {
                    debug!(%broker, "Refreshing metadata after disconnect");
                }
                Err(RecvError::Lagged(missed)) => {
                    debug!(missed, "Disconnect events lagged");
                }
                Err(RecvError::Closed) => return,
            },
            _ = ticker.tick() => {
                if !metadata.is_stale() {
                    continue;
                }
            }
        }

        if let Err(e) = metadata.refresh(&[]).await {
            warn!(error = %e, "Background metadata refresh failed");
        }
    }
}

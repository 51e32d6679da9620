//! TCP transport and metadata cache behavior.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

use kafkaesque_client::config::ClientConfig;
use kafkaesque_client::error::{Error, KafkaCode};
use kafkaesque_client::metadata::MetadataCache;
use kafkaesque_client::network::{ConnectionManager, Transport};
use kafkaesque_client::protocol::MetadataRequest;
use kafkaesque_client::testing::MockCluster;
use kafkaesque_client::types::{BrokerId, TopicPartition};

fn transport(address: &str, configure: impl FnOnce(&mut ClientConfig)) -> Arc<dyn Transport> {
    let mut config = ClientConfig::new(address);
    configure(&mut config);
    Arc::new(ConnectionManager::new(&config))
}

/// An address nothing listens on.
async fn closed_port() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);
    address
}

#[tokio::test]
async fn test_lost_connection_fails_pending_request() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    // Read one request frame, then hang up without answering.
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let len = socket.read_i32().await.unwrap();
        let mut frame = vec![0u8; len as usize];
        socket.read_exact(&mut frame).await.unwrap();
        frame
    });

    let transport = transport(&address, |_| {});
    let mut disconnects = transport.subscribe_disconnects();
    let broker = transport.bootstrap_brokers()[0];
    assert_eq!(broker, BrokerId::bootstrap(0));

    let error = transport
        .call(broker, MetadataRequest::all())
        .await
        .unwrap_err();
    assert!(error.is_retriable(), "unexpected error: {error}");
    assert_eq!(error.kafka_code(), Some(KafkaCode::NetworkException));

    let lost = tokio::time::timeout(Duration::from_secs(1), disconnects.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lost, broker);

    // The frame carried a Metadata request header.
    let frame = server.await.unwrap();
    assert_eq!(i16::from_be_bytes([frame[0], frame[1]]), 3);
}

#[tokio::test]
async fn test_reconnect_waits_for_backoff_floor() {
    let address = closed_port().await;
    let transport = transport(&address, |c| {
        c.reconnect_backoff_ms = 200;
        c.reconnect_backoff_max_ms = 1_000;
    });
    let broker = transport.bootstrap_brokers()[0];

    let first = transport.connect(broker).await.unwrap_err();
    assert!(first.is_retriable());

    let started = Instant::now();
    let second = transport.connect(broker).await.unwrap_err();
    assert!(second.is_retriable());
    assert!(
        started.elapsed() >= Duration::from_millis(150),
        "reconnected after {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_closed_transport_rejects_requests() {
    let address = closed_port().await;
    let transport = transport(&address, |_| {});
    transport.close_all().await;

    let result = transport
        .call(BrokerId::bootstrap(0), MetadataRequest::all())
        .await;
    assert!(matches!(result, Err(Error::Closed)));
}

#[tokio::test]
async fn test_metadata_refresh_swaps_snapshot() {
    let cluster = MockCluster::new(3).with_topic("a", 2);
    let cache = MetadataCache::new(cluster.transport(), Duration::from_secs(300));
    assert!(cache.is_stale());

    let before = cache.refresh(&["a"]).await.unwrap();
    assert_eq!(before.partition_count("a"), Some(2));
    assert_eq!(before.brokers().count(), 3);
    assert!(!cache.is_stale());

    cluster.create_topic("b", 4);
    let after = cache.refresh(&["b"]).await.unwrap();

    // Readers holding the old snapshot keep a consistent view.
    assert!(after.version() > before.version());
    assert!(!before.has_topic("b"));
    assert_eq!(after.partition_count("a"), Some(2));
    assert_eq!(after.partition_count("b"), Some(4));
    assert_eq!(cache.tracked_topics(), vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test]
async fn test_metadata_follows_leader_moves() {
    let cluster = MockCluster::new(2).with_topic("a", 1);
    let tp = TopicPartition::new("a", 0);
    let cache = MetadataCache::new(cluster.transport(), Duration::from_secs(300));
    cache.refresh(&["a"]).await.unwrap();

    let old = cluster.leader(&tp).unwrap();
    assert_eq!(cache.require_leader(&tp).unwrap().id, old);

    let new = cluster
        .broker_ids()
        .into_iter()
        .find(|b| *b != old)
        .unwrap();
    cluster.move_leader(&tp, new);
    cache.refresh(&[]).await.unwrap();
    assert_eq!(cache.require_leader(&tp).unwrap().id, new);
}

#[tokio::test]
async fn test_ensure_topic_reports_unknown_topic() {
    let cluster = MockCluster::new(1).with_topic("a", 3);
    let cache = MetadataCache::new(cluster.transport(), Duration::from_secs(300));

    assert_eq!(cache.ensure_topic("a").await.unwrap(), 3);
    let error = cache.ensure_topic("missing").await.unwrap_err();
    assert_eq!(error.kafka_code(), Some(KafkaCode::UnknownTopicOrPartition));
}

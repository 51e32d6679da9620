//! Producer behavior against the in-memory cluster.

use futures::FutureExt;
use kafkaesque_client::config::ProducerConfig;
use kafkaesque_client::error::{Error, KafkaCode};
use kafkaesque_client::producer::{Producer, ProducerRecord};
use kafkaesque_client::protocol::ApiKey;
use kafkaesque_client::telemetry::init_test_logging;
use kafkaesque_client::testing::MockCluster;
use kafkaesque_client::types::{BrokerId, TopicPartition};

fn producer(cluster: &MockCluster, configure: impl FnOnce(&mut ProducerConfig)) -> Producer {
    init_test_logging();
    let mut config = ProducerConfig::new("mock:9092");
    configure(&mut config);
    Producer::with_transport(config, cluster.transport()).unwrap()
}

#[tokio::test]
async fn test_thousand_records_acked_in_send_order() {
    let cluster = MockCluster::new(1).with_topic("events", 1);
    let producer = producer(&cluster, |c| c.retries = 0);

    let mut deliveries = Vec::with_capacity(1000);
    for i in 0..1000 {
        let record = ProducerRecord::new("events", format!("v{}", i)).with_partition(0);
        deliveries.push(producer.send(record).await.unwrap());
    }

    for (i, delivery) in deliveries.into_iter().enumerate() {
        let metadata = delivery.await.unwrap();
        assert_eq!(metadata.partition, 0);
        assert_eq!(metadata.offset, i as i64);
    }

    let stored = cluster.records(&TopicPartition::new("events", 0));
    assert_eq!(stored.len(), 1000);
    for (i, record) in stored.iter().enumerate() {
        assert_eq!(record.value_str().unwrap(), format!("v{}", i));
    }
    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_leader_change_is_retried_without_duplicates() {
    let cluster = MockCluster::new(2).with_topic("orders", 1);
    let tp = TopicPartition::new("orders", 0);
    let producer = producer(&cluster, |c| c.retry_backoff_ms = 10);

    // Warm the metadata cache with the original leader.
    producer
        .send(ProducerRecord::new("orders", "first").with_partition(0))
        .await
        .unwrap()
        .await
        .unwrap();

    let old_leader = cluster.leader(&tp).unwrap();
    let new_leader = if old_leader == BrokerId::new(1) {
        BrokerId::new(2)
    } else {
        BrokerId::new(1)
    };
    cluster.move_leader(&tp, new_leader);

    let mut deliveries = Vec::new();
    for i in 0..10 {
        let record = ProducerRecord::new("orders", format!("r{}", i)).with_partition(0);
        deliveries.push(producer.send(record).await.unwrap());
    }
    let mut offsets = Vec::new();
    for delivery in deliveries {
        offsets.push(delivery.await.unwrap().offset);
    }

    assert_eq!(offsets, (1..=10).collect::<Vec<i64>>());
    assert_eq!(cluster.records(&tp).len(), 11);
    assert!(cluster.request_count(ApiKey::Produce) >= 3);
    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_fatal_broker_error_fails_batch() {
    let cluster = MockCluster::new(1).with_topic("t", 1);
    let tp = TopicPartition::new("t", 0);
    cluster.fail_next_produce(&tp, KafkaCode::MessageSizeTooLarge);
    let producer = producer(&cluster, |_| {});

    let result = producer
        .send(ProducerRecord::new("t", "v").with_partition(0))
        .await
        .unwrap()
        .await;
    assert!(matches!(result, Err(ref e) if !e.is_retriable()));
    assert_eq!(cluster.high_watermark(&tp), Some(0));
    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_retriable_error_retried_until_acked() {
    let cluster = MockCluster::new(1).with_topic("t", 1);
    let tp = TopicPartition::new("t", 0);
    cluster.fail_next_produce(&tp, KafkaCode::NotEnoughReplicas);
    cluster.fail_next_produce(&tp, KafkaCode::NotEnoughReplicas);
    let producer = producer(&cluster, |c| c.retry_backoff_ms = 5);

    let metadata = producer
        .send(ProducerRecord::new("t", "v").with_partition(0))
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(metadata.offset, 0);
    assert_eq!(cluster.records(&tp).len(), 1);
    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_flush_settles_every_record() {
    let cluster = MockCluster::new(3).with_topic("t", 6);
    let producer = producer(&cluster, |c| c.linger_ms = 1_000);

    let mut deliveries = Vec::new();
    for i in 0..50 {
        let record = ProducerRecord::new("t", "v").with_key(format!("key-{}", i));
        deliveries.push(producer.send(record).await.unwrap());
    }
    producer.flush().await.unwrap();

    for delivery in deliveries {
        let outcome = delivery.now_or_never().expect("settled by flush");
        assert!(outcome.is_ok());
    }
    let total: usize = (0..6)
        .map(|p| cluster.records(&TopicPartition::new("t", p)).len())
        .sum();
    assert_eq!(total, 50);
    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_close_fails_outstanding_records_with_closed() {
    let cluster = MockCluster::new(1).with_topic("t", 1);
    let producer = producer(&cluster, |c| {
        c.linger_ms = 60_000;
        c.delivery_timeout_ms = 120_000;
    });

    let mut deliveries = Vec::new();
    for _ in 0..5 {
        deliveries.push(producer.send(ProducerRecord::new("t", "v").with_partition(0)).await.unwrap());
    }
    producer.close().await.unwrap();

    for delivery in deliveries {
        assert!(matches!(delivery.await, Err(Error::Closed)));
    }
    assert!(matches!(
        producer.send(ProducerRecord::new("t", "late")).await,
        Err(Error::Closed)
    ));
}

#[tokio::test]
async fn test_keyed_records_stay_on_one_partition() {
    let cluster = MockCluster::new(2).with_topic("users", 8);
    let producer = producer(&cluster, |_| {});

    let mut partitions = Vec::new();
    for i in 0..5 {
        let delivery = producer
            .send(ProducerRecord::new("users", format!("update-{}", i)).with_key("user-42"))
            .await
            .unwrap();
        partitions.push(delivery.await.unwrap().partition);
    }
    partitions.dedup();
    assert_eq!(partitions.len(), 1);
    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_topic_is_rejected() {
    let cluster = MockCluster::new(1);
    let producer = producer(&cluster, |_| {});

    let result = match producer.send(ProducerRecord::new("missing", "v")).await {
        Ok(delivery) => delivery.await.map(|_| ()),
        Err(e) => Err(e),
    };
    assert!(result.is_err());
    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_wide_window_keeps_order_while_leader_is_missing() {
    let cluster = MockCluster::new(2).with_topic("events", 2);
    let tp = TopicPartition::new("events", 1);
    let leader = cluster.leader(&tp).unwrap();
    cluster.fail_broker(leader);

    let producer = producer(&cluster, |c| {
        c.retries = 0;
        c.max_in_flight_per_partition = 5;
        c.batch_size = 1;
        c.retry_backoff_ms = 10;
    });
    assert!(producer.config().preserves_ordering());

    let mut deliveries = Vec::new();
    for i in 0..4 {
        let record = ProducerRecord::new("events", format!("v{}", i)).with_partition(1);
        deliveries.push(producer.send(record).await.unwrap());
    }

    // Several leaderless dispatch cycles pass before the leader returns.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    cluster.restore_broker(leader);

    let mut offsets = Vec::new();
    for delivery in deliveries {
        offsets.push(delivery.await.unwrap().offset);
    }
    assert_eq!(offsets, vec![0, 1, 2, 3]);

    let stored: Vec<String> = cluster
        .records(&tp)
        .iter()
        .map(|r| r.value_str().unwrap().to_string())
        .collect();
    assert_eq!(stored, vec!["v0", "v1", "v2", "v3"]);
    producer.close().await.unwrap();
}

//! Topic administration against the in-memory cluster.

use kafkaesque_client::admin::{Admin, AdminError, TopicConfig};
use kafkaesque_client::config::AdminConfig;
use kafkaesque_client::error::KafkaCode;
use kafkaesque_client::telemetry::init_test_logging;
use kafkaesque_client::testing::MockCluster;
use kafkaesque_client::types::BrokerId;

fn admin(cluster: &MockCluster) -> Admin {
    init_test_logging();
    Admin::with_transport(AdminConfig::new("mock:9092"), cluster.transport()).unwrap()
}

#[tokio::test]
async fn test_create_list_describe_delete() {
    let cluster = MockCluster::new(3);
    let admin = admin(&cluster);

    let results = admin
        .create_topics(&[
            TopicConfig::new("orders", 6, 3).with_config("retention.ms", "86400000"),
            TopicConfig::new("audit", 1, 1),
        ])
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.is_ok()), "{results:?}");
    assert_eq!(cluster.partition_count("orders"), Some(6));

    assert_eq!(admin.list_topics().await.unwrap(), vec!["audit", "orders"]);

    let described = admin.describe_topics(&["orders", "missing"]).await.unwrap();
    assert_eq!(described.len(), 2);
    assert_eq!(described[0].partitions.len(), 6);
    assert_eq!(described[1].error, KafkaCode::UnknownTopicOrPartition);

    let deleted = admin.delete_topics(&["audit"]).await.unwrap();
    assert!(deleted[0].is_ok());
    assert_eq!(admin.list_topics().await.unwrap(), vec!["orders"]);
    admin.close().await;
}

#[tokio::test]
async fn test_per_topic_failures_are_reported_individually() {
    let cluster = MockCluster::new(1).with_topic("orders", 2);
    let admin = admin(&cluster);

    let results = admin
        .create_topics(&[
            TopicConfig::new("orders", 2, 1),
            TopicConfig::new("wide", 4, 3),
            TopicConfig::new("fresh", 2, 1),
        ])
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].outcome, Err(AdminError::TopicAlreadyExists));
    assert_eq!(
        results[1].outcome,
        Err(AdminError::InvalidTopic(KafkaCode::InvalidReplicationFactor))
    );
    assert!(results[2].is_ok());

    let deleted = admin.delete_topics(&["missing"]).await.unwrap();
    assert_eq!(deleted[0].outcome, Err(AdminError::UnknownTopic));
}

#[tokio::test]
async fn test_create_follows_controller_failover() {
    let cluster = MockCluster::new(3);
    let admin = admin(&cluster);
    assert!(admin.create_topic(TopicConfig::new("a", 1, 1)).await.unwrap().is_ok());

    // The lowest live broker is the controller.
    cluster.fail_broker(BrokerId::new(1));
    let result = admin.create_topic(TopicConfig::new("b", 2, 2)).await.unwrap();
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(cluster.partition_count("b"), Some(2));
}

#[tokio::test]
async fn test_broker_supports_pinned_versions() {
    let cluster = MockCluster::new(1);
    let admin = admin(&cluster);
    assert!(admin.unsupported_apis().await.unwrap().is_empty());
}

//! Consumer and group membership against the in-memory cluster.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use futures::StreamExt;

use kafkaesque_client::config::{ConsumerConfig, OffsetReset};
use kafkaesque_client::consumer::{Consumer, ConsumerState};
use kafkaesque_client::error::Error;
use kafkaesque_client::group::MemberState;
use kafkaesque_client::telemetry::init_test_logging;
use kafkaesque_client::testing::{GroupState, MockCluster};
use kafkaesque_client::types::TopicPartition;

const GROUP: &str = "billing";

fn new_consumer(cluster: &MockCluster, configure: impl FnOnce(&mut ConsumerConfig)) -> Consumer {
    init_test_logging();
    let mut config = ConsumerConfig::new("mock:9092", GROUP);
    config.auto_offset_reset = OffsetReset::Earliest;
    config.enable_auto_commit = false;
    config.fetch_max_wait_ms = 50;
    // Keep the background heartbeat out of the way of tests that drive it.
    config.session_timeout_ms = 30_000;
    config.heartbeat_interval_ms = 10_000;
    configure(&mut config);
    Consumer::with_transport(config, cluster.transport()).unwrap()
}

fn seed(cluster: &MockCluster, topic: &str, partitions: i32, per_partition: usize) {
    for p in 0..partitions {
        let tp = TopicPartition::new(topic, p);
        for i in 0..per_partition {
            cluster.append(&tp, None, format!("{}-{}", p, i).as_bytes()).unwrap();
        }
    }
}

/// Poll until `count` records arrived or `rounds` polls came back empty.
async fn drain(consumer: &mut Consumer, count: usize, rounds: usize) -> Vec<(TopicPartition, i64)> {
    let mut seen = Vec::new();
    let mut empty = 0;
    while seen.len() < count && empty < rounds {
        let batch = consumer.poll_batch(Duration::from_millis(100)).await.unwrap();
        if batch.is_empty() {
            empty += 1;
        }
        seen.extend(batch.into_iter().map(|r| (r.topic_partition(), r.offset)));
    }
    seen
}

#[tokio::test]
async fn test_subscribe_joins_and_reads_from_earliest() {
    let cluster = MockCluster::new(1).with_topic("orders", 3);
    seed(&cluster, "orders", 3, 4);
    let mut consumer = new_consumer(&cluster, |_| {});
    consumer.subscribe(&["orders"]).unwrap();

    let seen = drain(&mut consumer, 12, 20).await;
    assert_eq!(seen.len(), 12);
    assert_eq!(consumer.state(), ConsumerState::Fetching);
    assert_eq!(consumer.assignment().len(), 3);
    assert_eq!(cluster.group_state(GROUP), Some(GroupState::Stable));

    // Offsets within each partition are handed out in order.
    for p in 0..3 {
        let offsets: Vec<i64> = seen
            .iter()
            .filter(|(tp, _)| tp.partition == p)
            .map(|(_, o)| *o)
            .collect();
        assert_eq!(offsets, vec![0, 1, 2, 3]);
    }
    consumer.close().await.unwrap();
    assert!(cluster.group_members(GROUP).is_empty());
}

#[tokio::test]
async fn test_two_members_split_partitions() {
    let cluster = MockCluster::new(2).with_topic("orders", 4);
    let mut first = new_consumer(&cluster, |c| c.rebalance_timeout_ms = 2_000);
    let mut second = new_consumer(&cluster, |c| c.rebalance_timeout_ms = 2_000);
    first.subscribe(&["orders"]).unwrap();
    second.subscribe(&["orders"]).unwrap();

    first.poll_batch(Duration::from_millis(50)).await.unwrap();
    assert_eq!(first.assignment().len(), 4);

    // The second join starts a rebalance; the first member learns of it
    // through its heartbeat and rejoins within the rebalance timeout.
    let group = first.group().unwrap().clone();
    let (second_result, first_result) = tokio::join!(second.poll_batch(Duration::from_millis(50)), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(group.heartbeat().await, MemberState::Revoked);
        first.poll_batch(Duration::from_millis(50)).await
    });
    second_result.unwrap();
    first_result.unwrap();

    let a: BTreeSet<_> = first.assignment().into_iter().collect();
    let b: BTreeSet<_> = second.assignment().into_iter().collect();
    assert_eq!(a.len() + b.len(), 4);
    assert!(a.is_disjoint(&b));
    assert_eq!(cluster.group_members(GROUP).len(), 2);

    first.close().await.unwrap();
    second.close().await.unwrap();
}

#[tokio::test]
async fn test_committed_offsets_resume_after_restart() {
    let cluster = MockCluster::new(1).with_topic("orders", 1);
    seed(&cluster, "orders", 1, 10);
    let tp = TopicPartition::new("orders", 0);

    let mut consumer = new_consumer(&cluster, |c| c.max_poll_records = 4);
    consumer.subscribe(&["orders"]).unwrap();
    let batch = consumer.poll_batch(Duration::from_secs(1)).await.unwrap();
    assert_eq!(batch.len(), 4);
    consumer.commit().await.unwrap();
    assert_eq!(cluster.committed(GROUP, &tp), Some(4));
    assert_eq!(consumer.committed(&tp), Some(4));
    consumer.close().await.unwrap();

    let mut restarted = new_consumer(&cluster, |_| {});
    restarted.subscribe(&["orders"]).unwrap();
    let record = restarted.poll(Duration::from_secs(1)).await.unwrap().unwrap();
    assert_eq!(record.offset, 4);
    restarted.close().await.unwrap();
}

#[tokio::test]
async fn test_three_missed_heartbeats_force_unjoined() {
    let cluster = MockCluster::new(1).with_topic("orders", 2);
    // The evicted member id lingers on the coordinator until the rejoin
    // round times out.
    let mut consumer = new_consumer(&cluster, |c| c.rebalance_timeout_ms = 300);
    consumer.subscribe(&["orders"]).unwrap();
    consumer.poll_batch(Duration::from_millis(50)).await.unwrap();

    let group = consumer.group().unwrap().clone();
    assert_eq!(group.state(), MemberState::Stable);

    cluster.fail_heartbeats(GROUP, 3);
    assert_eq!(group.heartbeat().await, MemberState::Stable);
    assert_eq!(group.heartbeat().await, MemberState::Stable);
    assert_eq!(group.missed_heartbeats(), 2);
    assert_eq!(group.heartbeat().await, MemberState::Unjoined);
    assert_eq!(consumer.state(), ConsumerState::Unjoined);

    // The next poll rejoins.
    consumer.poll_batch(Duration::from_millis(50)).await.unwrap();
    assert_eq!(group.state(), MemberState::Stable);
    consumer.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_max_poll_interval_evicts_and_rejoins() {
    let cluster = MockCluster::new(1).with_topic("orders", 1);
    let mut consumer = new_consumer(&cluster, |c| {
        c.max_poll_interval_ms = 1_000;
        c.heartbeat_interval_ms = 100;
    });
    consumer.subscribe(&["orders"]).unwrap();
    consumer.poll_batch(Duration::from_millis(50)).await.unwrap();
    let generation = cluster.group_generation(GROUP).unwrap();
    assert_eq!(cluster.group_members(GROUP).len(), 1);

    // No poll for longer than max.poll.interval: the heartbeat task leaves.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(consumer.state(), ConsumerState::Unjoined);
    assert!(cluster.group_members(GROUP).is_empty());

    consumer.poll_batch(Duration::from_millis(50)).await.unwrap();
    assert_eq!(consumer.state(), ConsumerState::Fetching);
    assert!(cluster.group_generation(GROUP).unwrap() > generation);
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_stale_generation_commit_fails_without_advancing() {
    let cluster = MockCluster::new(1).with_topic("orders", 1);
    seed(&cluster, "orders", 1, 5);
    let tp = TopicPartition::new("orders", 0);

    let mut consumer = new_consumer(&cluster, |_| {});
    consumer.subscribe(&["orders"]).unwrap();
    let seen = drain(&mut consumer, 5, 10).await;
    assert_eq!(seen.len(), 5);
    consumer.commit_sync(&BTreeMap::from([(tp.clone(), 2)])).await.unwrap();
    assert_eq!(consumer.committed(&tp), Some(2));

    cluster.advance_generation(GROUP).unwrap();
    let result = consumer.commit_sync(&BTreeMap::from([(tp.clone(), 5)])).await;
    assert!(matches!(result, Err(Error::Commit { .. })));
    assert_eq!(consumer.committed(&tp), Some(2));
    assert_eq!(cluster.committed(GROUP, &tp), Some(2));
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_manual_assignment_seek_and_standalone_commit() {
    let cluster = MockCluster::new(1).with_topic("orders", 2);
    seed(&cluster, "orders", 2, 3);
    let tp = TopicPartition::new("orders", 1);

    let mut consumer = new_consumer(&cluster, |_| {});
    consumer.assign(std::slice::from_ref(&tp)).await.unwrap();
    let first = consumer.poll(Duration::from_secs(1)).await.unwrap().unwrap();
    assert_eq!((first.partition, first.offset), (1, 0));

    consumer.seek(&tp, 2).unwrap();
    let record = consumer.poll(Duration::from_secs(1)).await.unwrap().unwrap();
    assert_eq!(record.offset, 2);
    assert!(consumer.seek(&TopicPartition::new("orders", 0), 0).is_err());
    assert!(consumer.seek(&tp, -5).is_err());

    consumer.commit().await.unwrap();
    assert_eq!(cluster.committed(GROUP, &tp), Some(3));
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_closed_consumer_rejects_calls() {
    let cluster = MockCluster::new(1).with_topic("orders", 1);
    let mut consumer = new_consumer(&cluster, |_| {});
    consumer.subscribe(&["orders"]).unwrap();
    consumer.close().await.unwrap();
    consumer.close().await.unwrap();

    assert_eq!(consumer.state(), ConsumerState::Closed);
    assert!(matches!(
        consumer.poll(Duration::from_millis(10)).await,
        Err(Error::Closed)
    ));
    assert!(matches!(consumer.subscribe(&["orders"]), Err(Error::Closed)));
}

#[tokio::test]
async fn test_subscribe_without_group_is_config_error() {
    let cluster = MockCluster::new(1).with_topic("orders", 1);
    let mut config = ConsumerConfig::default();
    config.client.bootstrap_servers = vec!["mock:9092".to_string()];
    let mut consumer = Consumer::with_transport(config, cluster.transport()).unwrap();
    assert!(matches!(consumer.subscribe(&["orders"]), Err(Error::Config(_))));
}

#[tokio::test]
async fn test_record_stream_delivers_in_order_and_leaves_on_close() {
    let cluster = MockCluster::new(1).with_topic("orders", 1);
    seed(&cluster, "orders", 1, 5);
    let mut consumer = new_consumer(&cluster, |_| {});
    consumer.subscribe(&["orders"]).unwrap();

    let mut stream = consumer.into_stream(2);
    let mut offsets = Vec::new();
    while offsets.len() < 5 {
        let record = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        offsets.push(record.offset);
    }
    assert_eq!(offsets, vec![0, 1, 2, 3, 4]);

    stream.close().await;
    assert!(cluster.group_members(GROUP).is_empty());
}

#[tokio::test]
async fn test_async_commit_reports_outcome() {
    let cluster = MockCluster::new(1).with_topic("orders", 1);
    seed(&cluster, "orders", 1, 3);
    let tp = TopicPartition::new("orders", 0);

    let mut consumer = new_consumer(&cluster, |_| {});
    consumer.subscribe(&["orders"]).unwrap();
    assert_eq!(drain(&mut consumer, 3, 10).await.len(), 3);

    let (tx, rx) = tokio::sync::oneshot::channel();
    consumer.commit_async_with(BTreeMap::from([(tp.clone(), 3)]), move |result| {
        let _ = tx.send(result.is_ok());
    });
    assert!(rx.await.unwrap());
    assert_eq!(cluster.committed(GROUP, &tp), Some(3));
    assert_eq!(consumer.committed(&tp), Some(3));
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_seek_to_end_skips_existing_records() {
    let cluster = MockCluster::new(1).with_topic("orders", 1);
    seed(&cluster, "orders", 1, 4);
    let tp = TopicPartition::new("orders", 0);

    let mut consumer = new_consumer(&cluster, |_| {});
    consumer.assign(std::slice::from_ref(&tp)).await.unwrap();
    consumer.poll(Duration::from_millis(200)).await.unwrap();
    consumer.seek_to_end(std::slice::from_ref(&tp)).await.unwrap();
    assert_eq!(consumer.position(&tp), Some(4));

    cluster.append(&tp, None, b"late").unwrap();
    let record = consumer.poll(Duration::from_secs(1)).await.unwrap().unwrap();
    assert_eq!((record.offset, record.value_str().unwrap()), (4, "late"));
    consumer.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_long_poll_does_not_exceed_max_poll_interval() {
    let cluster = MockCluster::new(1).with_topic("orders", 1);
    let mut consumer = new_consumer(&cluster, |c| {
        c.max_poll_interval_ms = 1_000;
        c.heartbeat_interval_ms = 100;
    });
    consumer.subscribe(&["orders"]).unwrap();
    consumer.poll_batch(Duration::from_millis(50)).await.unwrap();
    let generation = cluster.group_generation(GROUP).unwrap();

    // One poll on an idle topic outlasting the interval is still polling.
    let batch = consumer.poll_batch(Duration::from_millis(3_000)).await.unwrap();
    assert!(batch.is_empty());
    assert_eq!(cluster.group_generation(GROUP), Some(generation));
    assert_eq!(cluster.group_members(GROUP).len(), 1);
    assert_eq!(consumer.state(), ConsumerState::Fetching);
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_eviction_drops_assignment_and_resumes_from_committed() {
    let cluster = MockCluster::new(1).with_topic("orders", 1);
    seed(&cluster, "orders", 1, 5);
    let tp = TopicPartition::new("orders", 0);

    let mut consumer = new_consumer(&cluster, |c| c.rebalance_timeout_ms = 300);
    consumer.subscribe(&["orders"]).unwrap();
    assert_eq!(drain(&mut consumer, 5, 10).await.len(), 5);
    consumer.commit_sync(&BTreeMap::from([(tp.clone(), 2)])).await.unwrap();
    assert_eq!(consumer.position(&tp), Some(5));

    let group = consumer.group().unwrap().clone();
    cluster.fail_heartbeats(GROUP, 3);
    for _ in 0..3 {
        group.heartbeat().await;
    }
    assert_eq!(group.state(), MemberState::Unjoined);
    assert!(consumer.assignment().is_empty());
    assert_eq!(consumer.position(&tp), None);

    // The rejoined member starts over from the group's committed offset.
    let record = consumer.poll(Duration::from_secs(2)).await.unwrap().unwrap();
    assert_eq!(record.offset, 2);
    assert_eq!(consumer.assignment(), vec![tp.clone()]);
    assert_eq!(consumer.committed(&tp), Some(2));
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_async_commit_with_stale_generation_fails() {
    let cluster = MockCluster::new(1).with_topic("orders", 1);
    seed(&cluster, "orders", 1, 3);
    let tp = TopicPartition::new("orders", 0);

    let mut consumer = new_consumer(&cluster, |_| {});
    consumer.subscribe(&["orders"]).unwrap();
    assert_eq!(drain(&mut consumer, 3, 10).await.len(), 3);

    cluster.advance_generation(GROUP).unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel();
    consumer.commit_async_with(BTreeMap::from([(tp.clone(), 3)]), move |result| {
        let _ = tx.send(result);
    });
    assert!(matches!(rx.await.unwrap(), Err(Error::Commit { .. })));
    assert_eq!(cluster.committed(GROUP, &tp), None);
    consumer.close().await.unwrap();
}

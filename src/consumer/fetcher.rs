//! Fetch and ListOffsets requests, grouped per partition leader.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, trace};

use super::record::{ConsumerRecord, records_from_batch};
use crate::client::ClientCore;
use crate::config::{ConsumerConfig, OffsetReset};
use crate::error::{Error, ErrorContext, KafkaCode, Result};
use crate::metrics;
use crate::protocol::{FetchPartitionResponse, FetchRequest, ListOffsetsRequest, decode_record_batches};
use crate::types::{BrokerId, Offset, TopicPartition};

/// What one partition's fetch produced.
#[derive(Debug)]
pub(crate) enum PartitionFetch {
    /// Records at or above the requested offset, possibly none.
    Records(Vec<ConsumerRecord>),
    /// The requested offset is outside the log; the reset policy applies.
    OutOfRange,
    Failed(Error),
}

pub(crate) struct Fetcher {
    core: Arc<ClientCore>,
    config: Arc<ConsumerConfig>,
}

impl Fetcher {
    pub(crate) fn new(core: Arc<ClientCore>, config: Arc<ConsumerConfig>) -> Self {
        Self { core, config }
    }

    /// Fetch from every position, one request per leader, all in parallel.
    pub(crate) async fn fetch(
        &self,
        positions: &[(TopicPartition, i64)],
        max_wait: Duration,
    ) -> Vec<(TopicPartition, PartitionFetch)> {
        let mut outcomes = Vec::with_capacity(positions.len());
        let mut by_leader: HashMap<BrokerId, Vec<(TopicPartition, i64)>> = HashMap::new();
        for (tp, position) in positions {
            match self.core.metadata().require_leader(tp) {
                Ok(leader) => by_leader
                    .entry(leader.id)
                    .or_default()
                    .push((tp.clone(), *position)),
                Err(e) => outcomes.push((tp.clone(), PartitionFetch::Failed(e))),
            }
        }

        let max_wait_ms = max_wait.as_millis().min(i32::MAX as u128) as i32;
        let requests = by_leader
            .into_iter()
            .map(|(leader, partitions)| self.fetch_from(leader, partitions, max_wait_ms));
        for mut leader_outcomes in join_all(requests).await {
            outcomes.append(&mut leader_outcomes);
        }
        outcomes
    }

    async fn fetch_from(
        &self,
        leader: BrokerId,
        partitions: Vec<(TopicPartition, i64)>,
        max_wait_ms: i32,
    ) -> Vec<(TopicPartition, PartitionFetch)> {
        let mut request = FetchRequest::new(
            max_wait_ms,
            self.config.fetch_min_bytes,
            self.config.fetch_max_bytes,
        );
        for (tp, position) in &partitions {
            request.add_partition(&tp.topic, tp.partition, *position, self.config.max_partition_fetch_bytes);
        }
        trace!(broker = %leader, partitions = partitions.len(), "Sending fetch");

        let response = match self.core.transport().call(leader, request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(broker = %leader, error = %e, "Fetch failed");
                return partitions
                    .into_iter()
                    .map(|(tp, _)| {
                        let error = e.clone().with_partition(&tp.topic, tp.partition);
                        (tp, PartitionFetch::Failed(error))
                    })
                    .collect();
            }
        };

        let requested: HashMap<TopicPartition, i64> = partitions.into_iter().collect();
        let mut outcomes = Vec::with_capacity(requested.len());
        for topic in response.responses {
            for partition in topic.partitions {
                let tp = TopicPartition::new(topic.name.clone(), partition.partition_index);
                let Some(&position) = requested.get(&tp) else {
                    continue;
                };
                let outcome = partition_outcome(&tp, position, partition);
                outcomes.push((tp, outcome));
            }
        }
        outcomes
    }

    /// Offsets `reset` points at for each partition.
    pub(crate) async fn reset_offsets(
        &self,
        partitions: &[TopicPartition],
        reset: OffsetReset,
    ) -> Result<BTreeMap<TopicPartition, i64>> {
        let timestamp = match reset {
            OffsetReset::Earliest => Offset::EARLIEST.value(),
            OffsetReset::Latest => Offset::LATEST.value(),
            OffsetReset::None => {
                let tp = partitions.first();
                return Err(Error::Fatal {
                    reason: "no committed offset and auto.offset.reset is none".to_string(),
                    context: ErrorContext {
                        topic: tp.map(|tp| tp.topic.clone()),
                        partition: tp.map(|tp| tp.partition),
                        offset: None,
                        code: Some(KafkaCode::OffsetOutOfRange),
                    },
                });
            }
        };

        let mut by_leader: HashMap<BrokerId, ListOffsetsRequest> = HashMap::new();
        for tp in partitions {
            let leader = self.core.metadata().require_leader(tp)?;
            by_leader
                .entry(leader.id)
                .or_default()
                .add_partition(&tp.topic, tp.partition, timestamp);
        }

        let transport = self.core.transport();
        let responses = join_all(
            by_leader
                .into_iter()
                .map(|(leader, request)| transport.call(leader, request)),
        )
        .await;

        let mut offsets = BTreeMap::new();
        for response in responses {
            for topic in response?.topics {
                for p in topic.partitions {
                    if p.error_code != KafkaCode::None {
                        return Err(Error::from_code(
                            p.error_code,
                            ErrorContext::new().topic(topic.name.clone()).partition(p.partition_index),
                        ));
                    }
                    offsets.insert(TopicPartition::new(topic.name.clone(), p.partition_index), p.offset);
                }
            }
        }
        debug!(?reset, partitions = offsets.len(), "Reset offsets resolved");
        Ok(offsets)
    }
}

fn partition_outcome(tp: &TopicPartition, position: i64, partition: FetchPartitionResponse) -> PartitionFetch {
    match partition.error_code {
        KafkaCode::None => {}
        KafkaCode::OffsetOutOfRange => return PartitionFetch::OutOfRange,
        code => {
            return PartitionFetch::Failed(Error::from_code(
                code,
                ErrorContext::new()
                    .topic(tp.topic.clone())
                    .partition(tp.partition)
                    .offset(position),
            ));
        }
    }

    let batches = match decode_record_batches(&partition.records) {
        Ok(batches) => batches,
        Err(e) => return PartitionFetch::Failed(e.with_partition(&tp.topic, tp.partition)),
    };
    let records: Vec<ConsumerRecord> = batches
        .into_iter()
        .flat_map(|batch| records_from_batch(&tp.topic, tp.partition, batch, position).collect::<Vec<_>>())
        .collect();
    if !records.is_empty() {
        metrics::RECORDS_CONSUMED
            .with_label_values(&[&tp.topic])
            .inc_by(records.len() as u64);
    }
    PartitionFetch::Records(records)
}

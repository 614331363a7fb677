//! In-memory [`Transport`] used by this crate's own integration tests (and
//! exposed, behind the `test-util` feature, for downstream testing) — no
//! network, no `rdkafka`, fully deterministic given scripted inputs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::record::{Record, RecordBatch};
use crate::topic_partition::{FallbackOffset, OffsetSpec, Topic, TopicPartition};
use crate::transport::{
    FetchPartitionData, FetchRequest, FetchResponse, KafkaErrorCode, ListOffsetsRequest,
    ListOffsetsResponse, MetadataRequest, MetadataResponse, PartitionMetadata, Transport,
    TopicMetadata as WireTopicMetadata,
};
use crate::error::TransportError;

struct MockTopicState {
    partitions: Vec<MockPartitionMeta>,
    error: Option<KafkaErrorCode>,
}

#[derive(Clone)]
struct MockPartitionMeta {
    partition: i32,
    leader_id: Option<i32>,
}

struct MockState {
    topics: HashMap<Topic, MockTopicState>,
    logs: HashMap<TopicPartition, Vec<Record>>,
    injected_errors: HashMap<TopicPartition, KafkaErrorCode>,
    committed: HashMap<TopicPartition, i64>,
    next_timestamp_ms: i64,
}

pub struct MockTransport {
    state: Mutex<MockState>,
    fetch_batch_size: usize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                topics: HashMap::new(),
                logs: HashMap::new(),
                injected_errors: HashMap::new(),
                committed: HashMap::new(),
                next_timestamp_ms: 1,
            }),
            fetch_batch_size: 100,
        }
    }

    pub fn create_topic(&self, topic: &str, num_partitions: i32, leader_id: i32) {
        let topic: Topic = Topic::from(topic);
        let mut state = self.state.lock().unwrap();
        let partitions = (0..num_partitions)
            .map(|p| MockPartitionMeta { partition: p, leader_id: Some(leader_id) })
            .collect::<Vec<_>>();
        for p in &partitions {
            state
                .logs
                .entry(TopicPartition::new(topic.clone(), p.partition))
                .or_insert_with(Vec::new);
        }
        state.topics.insert(topic, MockTopicState { partitions, error: None });
    }

    /// Simulates a topic deletion: it disappears from metadata responses
    /// entirely (the missing-topic timeout path is what should notice this).
    pub fn delete_topic(&self, topic: &str) {
        self.state.lock().unwrap().topics.remove(topic);
    }

    pub fn set_partition_leader(&self, topic: &str, partition: i32, leader_id: i32) {
        let mut state = self.state.lock().unwrap();
        if let Some(t) = state.topics.get_mut(topic) {
            if let Some(p) = t.partitions.iter_mut().find(|p| p.partition == partition) {
                p.leader_id = Some(leader_id);
            }
        }
    }

    pub fn produce(&self, topic: &str, partition: i32, key: Option<&[u8]>, value: &[u8]) -> i64 {
        let topic: Topic = Topic::from(topic);
        let tp = TopicPartition::new(topic, partition);
        let mut state = self.state.lock().unwrap();
        let ts = state.next_timestamp_ms;
        state.next_timestamp_ms += 1;
        let log = state.logs.entry(tp).or_insert_with(Vec::new);
        let offset = log.len() as i64;
        log.push(Record {
            offset,
            timestamp_ms: ts,
            key: key.map(|k| k.to_vec()),
            value: Some(value.to_vec()),
            headers: Vec::new(),
        });
        offset
    }

    pub fn inject_error(&self, topic: &str, partition: i32, code: KafkaErrorCode) {
        self.state
            .lock()
            .unwrap()
            .injected_errors
            .insert(TopicPartition::new(Topic::from(topic), partition), code);
    }

    pub fn clear_error(&self, topic: &str, partition: i32) {
        self.state
            .lock()
            .unwrap()
            .injected_errors
            .remove(&TopicPartition::new(Topic::from(topic), partition));
    }

    pub fn set_committed(&self, topic: &str, partition: i32, offset: i64) {
        self.state
            .lock()
            .unwrap()
            .committed
            .insert(TopicPartition::new(Topic::from(topic), partition), offset);
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(&self, req: FetchRequest) -> Result<FetchResponse, TransportError> {
        let mut state = self.state.lock().unwrap();
        let mut partitions = Vec::with_capacity(req.partitions.len());

        for part in req.partitions {
            if let Some(code) = state.injected_errors.get(&part.tp).copied() {
                partitions.push(crate::transport::FetchPartitionResponse {
                    tp: part.tp,
                    result: Err(code),
                });
                continue;
            }

            let log = state.logs.entry(part.tp.clone()).or_insert_with(Vec::new);
            let start = part.fetch_offset.max(0) as usize;
            let records: Vec<Record> = log
                .iter()
                .skip(start)
                .take(self.fetch_batch_size)
                .cloned()
                .collect();
            let hwm = log.len() as i64;

            partitions.push(crate::transport::FetchPartitionResponse {
                tp: part.tp.clone(),
                result: Ok(FetchPartitionData {
                    batch: RecordBatch { tp: part.tp, records },
                    high_water_mark: hwm,
                    last_stable_offset: hwm,
                }),
            });
        }

        Ok(FetchResponse { partitions })
    }

    async fn list_offsets(
        &self,
        req: ListOffsetsRequest,
    ) -> Result<ListOffsetsResponse, TransportError> {
        let state = self.state.lock().unwrap();
        let mut partitions = Vec::with_capacity(req.partitions.len());

        for (tp, spec) in req.partitions {
            let offset = resolve(&state, &tp, spec);
            partitions.push((tp, offset));
        }

        Ok(ListOffsetsResponse { partitions })
    }

    async fn metadata(&self, req: MetadataRequest) -> Result<MetadataResponse, TransportError> {
        let state = self.state.lock().unwrap();
        let mut topics = HashMap::new();

        let wanted: Option<std::collections::HashSet<&Topic>> =
            req.topics.as_ref().map(|ts| ts.iter().collect());

        for (topic, meta) in &state.topics {
            if let Some(w) = &wanted {
                if !w.contains(topic) {
                    continue;
                }
            }
            topics.insert(
                topic.clone(),
                WireTopicMetadata {
                    partitions: meta
                        .partitions
                        .iter()
                        .map(|p| PartitionMetadata {
                            partition: p.partition,
                            leader_id: p.leader_id,
                            leader_epoch: 0,
                            replicas: p.leader_id.into_iter().collect(),
                            isr: p.leader_id.into_iter().collect(),
                        })
                        .collect(),
                    error: meta.error,
                },
            );
        }

        Ok(MetadataResponse { topics })
    }
}

fn resolve(state: &MockState, tp: &TopicPartition, spec: OffsetSpec) -> Result<i64, KafkaErrorCode> {
    match spec {
        OffsetSpec::Literal(n) => Ok(n),
        OffsetSpec::Earliest => Ok(0),
        OffsetSpec::Latest => Ok(state.logs.get(tp).map(|l| l.len() as i64).unwrap_or(0)),
        OffsetSpec::ByTimestamp(ts) => state
            .logs
            .get(tp)
            .and_then(|log| log.iter().find(|r| r.timestamp_ms >= ts).map(|r| r.offset))
            .ok_or(KafkaErrorCode::OffsetOutOfRange),
        OffsetSpec::CommittedWithFallback(fallback) => {
            if let Some(committed) = state.committed.get(tp) {
                Ok(*committed)
            } else {
                resolve(state, tp, fallback_to_spec(fallback))
            }
        },
    }
}

fn fallback_to_spec(f: FallbackOffset) -> OffsetSpec {
    match f {
        FallbackOffset::Earliest => OffsetSpec::Earliest,
        FallbackOffset::Latest => OffsetSpec::Latest,
        FallbackOffset::Literal(n) => OffsetSpec::Literal(n),
    }
}

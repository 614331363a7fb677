//! Subscription Controller (C3): translates caller intent and regex matches
//! against metadata into Assignment Set deltas.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::assignment::AssignmentSet;
use crate::buffer::BufferSet;
use crate::config::Config;
use crate::metadata::{MetadataEvent, MetadataHandle};
use crate::purge::PurgeCoordinator;
use crate::topic_partition::{EpochOffset, OffsetSpec, Topic, TopicPartition};
use std::sync::Arc;

/// Assignment changes and offset commits mediated by a consumer-group
/// coordinator. Rebalancing algorithms themselves are an external
/// collaborator per spec.md's scope — this trait is the seam, not an
/// implementation of one.
#[async_trait]
pub trait GroupCoordinator: Send + Sync {
    async fn subscribe(&self, topics: Vec<Topic>);
    /// Blocks until the coordinator has a new assignment to report.
    async fn next_assignment(&self) -> GroupAssignmentEvent;
    async fn committed_offset(&self, tp: &TopicPartition) -> Option<EpochOffset>;
}

#[derive(Debug, Clone)]
pub struct GroupAssignmentEvent {
    pub assigned: Vec<TopicPartition>,
    pub revoked: Vec<TopicPartition>,
}

/// Used when no `ConsumerGroup` is configured, and as a test double; never
/// produces an assignment on its own.
pub struct NullGroupCoordinator;

#[async_trait]
impl GroupCoordinator for NullGroupCoordinator {
    async fn subscribe(&self, _topics: Vec<Topic>) {}

    async fn next_assignment(&self) -> GroupAssignmentEvent {
        std::future::pending().await
    }

    async fn committed_offset(&self, _tp: &TopicPartition) -> Option<EpochOffset> {
        None
    }
}

enum Mode {
    Direct,
    Group(Arc<dyn GroupCoordinator>),
}

pub struct SubscriptionController {
    assignment: Arc<AssignmentSet>,
    metadata: MetadataHandle,
    buffer: Arc<BufferSet>,
    purge: Mutex<Option<Arc<PurgeCoordinator>>>,
    mode: Mode,
    explicit_topics: Mutex<HashSet<Topic>>,
    default_offset_reset: OffsetSpec,
}

impl SubscriptionController {
    pub fn new(
        assignment: Arc<AssignmentSet>,
        metadata: MetadataHandle,
        buffer: Arc<BufferSet>,
        config: &Config,
        group: Option<Arc<dyn GroupCoordinator>>,
    ) -> Arc<Self> {
        let mode = match group {
            Some(g) => Mode::Group(g),
            None => Mode::Direct,
        };
        Arc::new(Self {
            assignment,
            metadata,
            buffer,
            purge: Mutex::new(None),
            mode,
            explicit_topics: Mutex::new(HashSet::new()),
            default_offset_reset: config.auto_offset_reset,
        })
    }

    pub fn set_purge_coordinator(&self, purge: Arc<PurgeCoordinator>) {
        *self.purge.lock().unwrap() = Some(purge);
    }

    fn purge(&self) -> Arc<PurgeCoordinator> {
        self.purge.lock().unwrap().clone().expect("purge coordinator wired before use")
    }

    pub fn purge_handle(&self) -> Arc<PurgeCoordinator> {
        self.purge()
    }

    pub async fn add_consume_topics(&self, topics: Vec<String>) {
        let topics: Vec<Topic> = topics.into_iter().map(Topic::from).collect();
        {
            let mut explicit = self.explicit_topics.lock().unwrap();
            for t in &topics {
                explicit.insert(t.clone());
            }
        }
        for t in &topics {
            self.metadata.watch_topic(t.clone());
        }
        if let Mode::Group(g) = &self.mode {
            g.subscribe(self.explicit_topics.lock().unwrap().iter().cloned().collect()).await;
        }
        self.reconcile_explicit_topics().await;
    }

    pub fn add_consume_partitions(&self, spec: HashMap<String, HashMap<i32, OffsetSpec>>) {
        let mut tps = Vec::new();
        for (topic, partitions) in spec {
            let topic: Topic = Topic::from(topic);
            self.metadata.watch_topic(topic.clone());
            for (partition, offset) in partitions {
                tps.push((TopicPartition::new(topic.clone(), partition), Some(offset)));
            }
        }
        self.assignment.assign(tps);
    }

    /// Removal of partitions/topics not currently assigned is a no-op and
    /// never errors (spec.md P5). Also drops any buffered records for the
    /// removed partitions — the `FetchBuffer` invariant (spec.md §3) is
    /// "empty when the partition is not assigned," not just "no longer
    /// fetched into."
    pub fn remove_consume_partitions(&self, spec: HashMap<String, Vec<i32>>) {
        let mut tps = Vec::new();
        for (topic, partitions) in spec {
            let topic: Topic = Topic::from(topic);
            for partition in partitions {
                tps.push(TopicPartition::new(topic.clone(), partition));
            }
        }
        self.assignment.unassign(&tps);
        for tp in &tps {
            self.buffer.remove_partition(tp);
        }
    }

    pub fn pause_fetch_topics(&self, topics: Vec<String>) {
        let topics: Vec<Topic> = topics.into_iter().map(Topic::from).collect();
        self.assignment.pause_topics(&topics);
    }

    pub fn resume_fetch_topics(&self, topics: Vec<String>) {
        let topics: Vec<Topic> = topics.into_iter().map(Topic::from).collect();
        self.assignment.resume_topics(&topics);
    }

    pub fn pause_fetch_partitions(&self, spec: HashMap<String, Vec<i32>>) {
        let tps = flatten(spec);
        self.assignment.pause_partitions(&tps);
    }

    pub fn resume_fetch_partitions(&self, spec: HashMap<String, Vec<i32>>) {
        let tps = flatten(spec);
        self.assignment.resume_partitions(&tps);
    }

    /// Seeds/forces offsets. In group mode, a seed still wins over a
    /// committed offset if present (spec.md §4.3): the scheduler only calls
    /// `ListOffsets`/committed-offset resolution for partitions that still
    /// have `pending_offset_spec` set, and `set_offsets` clears that.
    pub fn set_offsets(&self, spec: HashMap<String, HashMap<i32, EpochOffset>>) {
        let mut offsets = HashMap::new();
        for (topic, partitions) in spec {
            let topic: Topic = Topic::from(topic);
            for (partition, eo) in partitions {
                offsets.insert(TopicPartition::new(topic.clone(), partition), eo);
            }
        }
        self.assignment.set_offsets(offsets);
    }

    pub async fn consume_regex(&self, pattern: &str) -> Result<(), regex::Error> {
        let re = Regex::new(pattern)?;
        self.metadata.set_regex(Some(re));
        Ok(())
    }

    /// Applies newly-known partitions for explicitly subscribed (non-regex)
    /// topics at `AutoOffsetReset` unless a seed already exists.
    async fn reconcile_explicit_topics(&self) {
        let snapshot = self.metadata.current();
        let explicit = self.explicit_topics.lock().unwrap().clone();
        let mut tps = Vec::new();
        for topic in &explicit {
            let Some(meta) = snapshot.topics.get(topic) else { continue };
            for p in &meta.partitions {
                let tp = TopicPartition::new(topic.clone(), p.partition);
                if !self.assignment.is_assigned(&tp) {
                    tps.push((tp, Some(self.default_offset_reset)));
                }
            }
        }
        if !tps.is_empty() {
            self.assignment.assign(tps);
        }
    }

    /// Applies a regex match-set diff. Removals are routed through the same
    /// `PurgeCoordinator` the direct-mode missing-topic timeout uses (spec.md
    /// §4.7: "Regex consumers must internally purge topics that have been
    /// missing long enough") rather than unassigning directly — a raw
    /// unassign skips the purge-generation bump, so an in-flight fetch for
    /// the just-unmatched topic could still land and be pushed into the
    /// buffer after this returns.
    async fn apply_regex_diff(&self, added: Vec<Topic>, removed: Vec<Topic>) {
        let snapshot = self.metadata.current();
        let mut tps = Vec::new();
        for topic in &added {
            if let Some(meta) = snapshot.topics.get(topic) {
                for p in &meta.partitions {
                    tps.push((
                        TopicPartition::new(topic.clone(), p.partition),
                        Some(self.default_offset_reset),
                    ));
                }
            }
        }
        if !tps.is_empty() {
            self.assignment.assign(tps);
        }
        if !removed.is_empty() {
            self.purge().purge_topics(removed).await;
        }
    }

    /// Background task: drains metadata events and reacts. Also drives the
    /// group-coordinator assignment stream when configured.
    pub async fn run(self: Arc<Self>, mut metadata_events: mpsc::UnboundedReceiver<MetadataEvent>) {
        let group = match &self.mode {
            Mode::Group(g) => Some(Arc::clone(g)),
            Mode::Direct => None,
        };

        loop {
            tokio::select! {
                event = metadata_events.recv() => {
                    match event {
                        Some(MetadataEvent::Refreshed(_)) => {
                            self.reconcile_explicit_topics().await;
                        },
                        Some(MetadataEvent::RegexMatchChanged { added, removed }) => {
                            debug!(added = added.len(), removed = removed.len(), "regex match set changed");
                            self.apply_regex_diff(added, removed).await;
                        },
                        Some(MetadataEvent::TopicMissingTimedOut(topic)) => {
                            warn!(topic = %topic, "missing-topic timeout, purging");
                            self.purge().purge_topics(vec![topic]).await;
                        },
                        None => return,
                    }
                },
                assignment_event = async {
                    match &group {
                        Some(g) => Some(g.next_assignment().await),
                        None => std::future::pending().await,
                    }
                } => {
                    if let Some(ev) = assignment_event {
                        let assigned: Vec<_> = ev.assigned.into_iter().map(|tp| (tp, None)).collect();
                        self.assignment.assign(assigned);
                        self.assignment.unassign(&ev.revoked);
                        for tp in &ev.revoked {
                            self.buffer.remove_partition(tp);
                        }
                    }
                },
            }
        }
    }
}

fn flatten(spec: HashMap<String, Vec<i32>>) -> Vec<TopicPartition> {
    spec.into_iter()
        .flat_map(|(topic, partitions)| {
            let topic: Topic = Topic::from(topic);
            partitions.into_iter().map(move |p| TopicPartition::new(topic.clone(), p))
        })
        .collect()
}

//! Purge/Remove Coordinator (C7): the hardest cross-cutting operation,
//! because records may already be in flight or buffered when a topic is
//! torn down.
//!
//! Contract (spec.md §4.7), unchanged: after `purge_topics` returns, no
//! subsequent poll returns records from the purged topics, any in-flight
//! fetch referencing them is dropped before reaching the buffer, metadata
//! forgets them, and a later re-add is a fresh subscription.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;

use crate::assignment::AssignmentSet;
use crate::buffer::BufferSet;
use crate::metadata::MetadataHandle;
use crate::source_manager::SourceManager;
use crate::topic_partition::Topic;

pub struct PurgeCoordinator {
    assignment: Arc<AssignmentSet>,
    buffer: Arc<BufferSet>,
    metadata: MetadataHandle,
    source_manager: Arc<SourceManager>,
}

impl PurgeCoordinator {
    pub fn new(
        assignment: Arc<AssignmentSet>,
        buffer: Arc<BufferSet>,
        metadata: MetadataHandle,
        source_manager: Arc<SourceManager>,
    ) -> Arc<Self> {
        Arc::new(Self { assignment, buffer, metadata, source_manager })
    }

    pub async fn purge_topics(&self, topics: Vec<Topic>) {
        for topic in &topics {
            // Bump the purge generation *before* touching assignment state:
            // any fetch already in flight for this topic was tagged with the
            // prior generation and will be dropped by the scheduler when its
            // response lands, regardless of how far teardown below has
            // progressed.
            self.assignment.bump_purge_generation(topic);

            let doomed: Vec<_> =
                self.assignment.snapshot().into_iter().filter(|p| &p.tp.topic == topic).collect();
            let affected_brokers: HashSet<i32> =
                doomed.iter().filter_map(|p| p.source_broker).collect();

            self.assignment.unassign_topic(topic);
            for p in &doomed {
                self.buffer.remove_partition(&p.tp);
                self.assignment.forget_seed(&p.tp);
            }

            for broker in affected_brokers {
                self.source_manager.wake_broker(broker);
            }

            // Forgets metadata and the regex match snapshot, so a regex
            // consumer's fetch session stops listing the topic entirely
            // rather than merely surfacing a deleted error, and a later
            // `AddConsumeTopics` is accepted as a fresh subscription.
            self.metadata.forget_topic(topic);

            info!(topic = %topic, "purged topic from client");
        }
    }
}

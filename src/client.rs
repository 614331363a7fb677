//! `Client` (C0): the public facade. Owns C1–C7 and exposes spec.md §6's
//! caller API, spawning the background tasks described in §5 on
//! construction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::assignment::AssignmentSet;
use crate::buffer::{BufferSet, Fetches};
use crate::config::Config;
use crate::error::ClientError;
use crate::metadata::MetadataCache;
use crate::purge::PurgeCoordinator;
use crate::source_manager::SourceManager;
use crate::subscription::{GroupCoordinator, SubscriptionController};
use crate::topic_partition::{EpochOffset, OffsetSpec, TopicPartition};
use crate::transport::{RdKafkaTransport, Transport};

pub struct Client {
    config: Arc<Config>,
    assignment: Arc<AssignmentSet>,
    subscription: Arc<SubscriptionController>,
    buffer: Arc<BufferSet>,
    source_manager: Arc<SourceManager>,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    pub fn new(config: Config) -> Result<Self, ClientError> {
        let group_id = config.consumer_group.clone().unwrap_or_else(|| format!("konsume-{}", Uuid::new_v4()));
        let transport = Arc::new(RdKafkaTransport::new(&config.bootstrap_servers, &group_id)?);
        Self::with_transport(config, transport, None)
    }

    pub fn with_group_coordinator(
        config: Config,
        group: Arc<dyn GroupCoordinator>,
    ) -> Result<Self, ClientError> {
        let group_id = config
            .consumer_group
            .clone()
            .ok_or_else(|| ClientError::InvalidConfig("consumer_group must be set for group mode".into()))?;
        let transport = Arc::new(RdKafkaTransport::new(&config.bootstrap_servers, &group_id)?);
        Self::with_transport(config, transport, Some(group))
    }

    /// Used by integration tests to inject a `MockTransport`.
    pub fn with_transport(
        config: Config,
        transport: Arc<dyn Transport>,
        group: Option<Arc<dyn GroupCoordinator>>,
    ) -> Result<Self, ClientError> {
        let config = Arc::new(config);
        let (assignment, assignment_changes) = AssignmentSet::new();
        let (metadata, metadata_events) = MetadataCache::new(&config);
        let buffer = Arc::new(BufferSet::new(config.backpressure_soft_limit));

        let source_manager = SourceManager::new(
            Arc::clone(&assignment),
            Arc::clone(&metadata),
            Arc::clone(&buffer),
            Arc::clone(&transport),
            Arc::clone(&config),
            group.clone(),
        );

        let purge = PurgeCoordinator::new(
            Arc::clone(&assignment),
            Arc::clone(&buffer),
            Arc::clone(&metadata),
            Arc::clone(&source_manager),
        );
        source_manager.set_purge_coordinator(Arc::clone(&purge));

        let subscription = SubscriptionController::new(
            Arc::clone(&assignment),
            Arc::clone(&metadata),
            Arc::clone(&buffer),
            &config,
            group,
        );
        subscription.set_purge_coordinator(Arc::clone(&purge));

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(Arc::clone(&metadata).run(Arc::clone(&transport))));
        tasks.push(tokio::spawn(Arc::clone(&source_manager).run(assignment_changes)));
        tasks.push(tokio::spawn(Arc::clone(&subscription).run(metadata_events)));

        Ok(Self { config, assignment, subscription, buffer, source_manager, tasks })
    }

    pub async fn add_consume_topics(&self, topics: impl IntoIterator<Item = impl Into<String>>) {
        self.subscription.add_consume_topics(topics.into_iter().map(Into::into).collect()).await;
    }

    pub fn add_consume_partitions(&self, spec: HashMap<String, HashMap<i32, OffsetSpec>>) {
        self.subscription.add_consume_partitions(spec);
    }

    pub fn remove_consume_partitions(&self, spec: HashMap<String, Vec<i32>>) {
        self.subscription.remove_consume_partitions(spec);
    }

    pub fn pause_fetch_topics(&self, topics: impl IntoIterator<Item = impl Into<String>>) {
        self.subscription.pause_fetch_topics(topics.into_iter().map(Into::into).collect());
    }

    pub fn resume_fetch_topics(&self, topics: impl IntoIterator<Item = impl Into<String>>) {
        self.subscription.resume_fetch_topics(topics.into_iter().map(Into::into).collect());
    }

    pub fn pause_fetch_partitions(&self, spec: HashMap<String, Vec<i32>>) {
        self.subscription.pause_fetch_partitions(spec);
    }

    pub fn resume_fetch_partitions(&self, spec: HashMap<String, Vec<i32>>) {
        self.subscription.resume_fetch_partitions(spec);
    }

    pub fn set_offsets(&self, spec: HashMap<String, HashMap<i32, EpochOffset>>) {
        self.subscription.set_offsets(spec);
    }

    pub async fn consume_regex(&self, pattern: &str) -> Result<(), regex::Error> {
        self.subscription.consume_regex(pattern).await
    }

    pub async fn purge_topics_from_client(&self, topics: impl IntoIterator<Item = impl Into<String>>) {
        let topics: Vec<_> = topics.into_iter().map(|t| crate::topic_partition::Topic::from(t.into())).collect();
        // Route through the subscription controller's purge handle so the
        // same teardown path used for missing-topic timeouts is used here.
        self.subscription_purge().purge_topics(topics).await;
    }

    fn subscription_purge(&self) -> Arc<PurgeCoordinator> {
        // Constructed once in `new`; cheap to re-derive via the same Arc the
        // subscription controller holds.
        self.subscription.purge_handle()
    }

    pub async fn poll_fetches(&self, timeout: Duration) -> Fetches {
        self.buffer.poll_fetches(timeout).await
    }

    pub async fn poll_records(&self, timeout: Duration, max: usize) -> Fetches {
        self.buffer.poll_records(timeout, max).await
    }

    pub fn force_reconcile(&self) {
        self.source_manager.force_reconcile();
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn assigned_partitions(&self) -> Vec<TopicPartition> {
        self.assignment.snapshot().into_iter().map(|p| p.tp).collect()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.source_manager.shutdown();
        for task in &self.tasks {
            task.abort();
        }
    }
}

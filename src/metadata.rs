//! Metadata Cache (C1): caches the latest topic→partition→leader map, serves
//! it to the rest of the crate, and invalidates/refreshes it on the triggers
//! spec.md §4.1 names.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::topic_partition::Topic;
use crate::transport::{MetadataRequest, Transport};

#[derive(Debug, Clone)]
pub struct PartitionMeta {
    pub partition: i32,
    pub leader_id: Option<i32>,
    pub leader_epoch: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
}

#[derive(Debug, Clone)]
pub struct TopicMeta {
    pub partitions: Vec<PartitionMeta>,
    pub error: Option<crate::transport::KafkaErrorCode>,
}

/// Immutable once published; replaced atomically (data model invariant).
#[derive(Debug, Clone)]
pub struct MetadataSnapshot {
    pub generation: u64,
    pub fetched_at: Instant,
    pub topics: HashMap<Topic, TopicMeta>,
}

impl MetadataSnapshot {
    fn empty() -> Self {
        Self { generation: 0, fetched_at: Instant::now(), topics: HashMap::new() }
    }
}

/// Events the metadata task emits for the subscription controller / purge
/// coordinator to react to.
#[derive(Debug, Clone)]
pub enum MetadataEvent {
    /// A subscribed topic hasn't appeared in any successful response for
    /// `MissingTopicDeleteTimeout`; treat it as deleted.
    TopicMissingTimedOut(Topic),
    /// The regex match set changed against the new snapshot.
    RegexMatchChanged { added: Vec<Topic>, removed: Vec<Topic> },
    /// A fresh snapshot was published; generation is included so listeners
    /// can dedupe.
    Refreshed(u64),
}

pub struct MetadataCache {
    snapshot_tx: watch::Sender<Arc<MetadataSnapshot>>,
    pub snapshot_rx: watch::Receiver<Arc<MetadataSnapshot>>,
    wake: Notify,
    watched_topics: Mutex<HashSet<Topic>>,
    regex: Mutex<Option<Regex>>,
    last_match: Mutex<HashSet<Topic>>,
    missing_since: Mutex<HashMap<Topic, Instant>>,
    min_age: Duration,
    missing_timeout: Duration,
    events_tx: mpsc::UnboundedSender<MetadataEvent>,
}

impl MetadataCache {
    pub fn new(config: &Config) -> (Arc<Self>, mpsc::UnboundedReceiver<MetadataEvent>) {
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(MetadataSnapshot::empty()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cache = Arc::new(Self {
            snapshot_tx,
            snapshot_rx,
            wake: Notify::new(),
            watched_topics: Mutex::new(HashSet::new()),
            regex: Mutex::new(None),
            last_match: Mutex::new(HashSet::new()),
            missing_since: Mutex::new(HashMap::new()),
            min_age: config.metadata_min_age,
            missing_timeout: config.missing_topic_delete_timeout,
            events_tx,
        });
        (cache, events_rx)
    }

    pub fn current(&self) -> Arc<MetadataSnapshot> {
        self.snapshot_rx.borrow().clone()
    }

    pub fn watch_topic(&self, topic: Topic) {
        self.watched_topics.lock().unwrap().insert(topic);
        self.request_refresh();
    }

    pub fn unwatch_topic(&self, topic: &Topic) {
        self.watched_topics.lock().unwrap().remove(topic);
        self.missing_since.lock().unwrap().remove(topic);
        self.last_match.lock().unwrap().remove(topic);
    }

    pub fn set_regex(&self, pattern: Option<Regex>) {
        *self.regex.lock().unwrap() = pattern;
        self.request_refresh();
    }

    /// Coalesces concurrent refresh requests for free: `Notify` keeps at most
    /// one outstanding permit, so N calls before the metadata task wakes up
    /// collapse into a single refresh, matching spec.md's debounce rule.
    pub fn request_refresh(&self) {
        self.wake.notify_one();
    }

    pub async fn wait_for_refresh(&self) {
        let gen = self.current().generation;
        let mut rx = self.snapshot_rx.clone();
        self.request_refresh();
        let _ = rx.wait_for(|s| s.generation > gen).await;
    }

    /// Background task: the sole owner of refresh debouncing and the
    /// missing-topic clock.
    pub async fn run(self: Arc<Self>, transport: Arc<dyn Transport>) {
        loop {
            tokio::select! {
                _ = self.wake.notified() => {},
                _ = tokio::time::sleep(self.min_age.max(Duration::from_secs(1))) => {},
            }

            let age = self.current().fetched_at.elapsed();
            if self.current().generation != 0 && age < self.min_age {
                continue;
            }

            let regex = self.regex.lock().unwrap().clone();
            let topics_filter = if regex.is_some() {
                None
            } else {
                let watched = self.watched_topics.lock().unwrap();
                if watched.is_empty() {
                    continue;
                }
                Some(watched.iter().cloned().collect::<Vec<_>>())
            };

            match transport.metadata(MetadataRequest { topics: topics_filter }).await {
                Ok(resp) => self.apply(resp),
                Err(e) => {
                    warn!(error = %e, "metadata refresh failed");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                },
            }
        }
    }

    fn apply(&self, resp: crate::transport::MetadataResponse) {
        let now = Instant::now();
        let next_gen = self.current().generation + 1;

        // Regex match diffing runs before the missing-topic timer below so a
        // freshly-matched topic is registered as watched in time to be
        // covered by the same timer on this very pass.
        if let Some(re) = self.regex.lock().unwrap().as_ref() {
            let matched: HashSet<Topic> =
                resp.topics.keys().filter(|t| re.is_match(t)).cloned().collect();
            let mut last = self.last_match.lock().unwrap();
            let added: Vec<Topic> = matched.difference(&last).cloned().collect();
            let dropped_from_match: Vec<Topic> = last.difference(&matched).cloned().collect();

            if !added.is_empty() {
                let mut watched = self.watched_topics.lock().unwrap();
                for topic in &added {
                    watched.insert(topic.clone());
                }
            }

            // A topic that drops out of the match set but is still reported
            // by the broker simply stopped matching the pattern: remove it
            // right away. One that's vanished from the response entirely is
            // left to the missing-topic timer below instead, so deletion
            // detection for regex-discovered topics goes through the same
            // grace period as direct subscriptions (spec.md §4.7).
            let removed: Vec<Topic> = dropped_from_match
                .into_iter()
                .filter(|t| resp.topics.contains_key(t))
                .collect();

            if !added.is_empty() || !removed.is_empty() {
                let _ = self.events_tx.send(MetadataEvent::RegexMatchChanged {
                    added: added.clone(),
                    removed,
                });
            }
            *last = matched;
        }

        let watched = self.watched_topics.lock().unwrap().clone();
        let mut missing = self.missing_since.lock().unwrap();
        for topic in &watched {
            if resp.topics.contains_key(topic) {
                missing.remove(topic);
            } else {
                let since = *missing.entry(topic.clone()).or_insert(now);
                if now.duration_since(since) >= self.missing_timeout {
                    info!(topic = %topic, "topic missing past delete timeout, emitting removal");
                    let _ = self.events_tx.send(MetadataEvent::TopicMissingTimedOut(topic.clone()));
                }
            }
        }
        drop(missing);

        let topics = resp
            .topics
            .into_iter()
            .map(|(t, m)| {
                (
                    t,
                    TopicMeta {
                        partitions: m
                            .partitions
                            .into_iter()
                            .map(|p| PartitionMeta {
                                partition: p.partition,
                                leader_id: p.leader_id,
                                leader_epoch: p.leader_epoch,
                                replicas: p.replicas,
                                isr: p.isr,
                            })
                            .collect(),
                        error: m.error,
                    },
                )
            })
            .collect();

        let snapshot = Arc::new(MetadataSnapshot { generation: next_gen, fetched_at: now, topics });
        debug!(generation = next_gen, "published metadata snapshot");
        let _ = self.snapshot_tx.send(snapshot);
        let _ = self.events_tx.send(MetadataEvent::Refreshed(next_gen));
    }

    /// Forgets a purged topic entirely: no missing-topic clock, no regex
    /// match memory, so a later re-add starts fresh (spec.md §4.7).
    pub fn forget_topic(&self, topic: &Topic) {
        self.unwatch_topic(topic);
    }
}

/// Thin shared-handle type so other components don't need to know
/// `MetadataCache`'s internal locking strategy.
pub type MetadataHandle = Arc<MetadataCache>;

#[allow(dead_code)]
fn _assert_sync_send() {
    fn is_send_sync<T: Send + Sync>() {}
    is_send_sync::<MetadataCache>();
}

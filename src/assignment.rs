//! Assignment Set (C2): the authoritative set of `(topic, partition)` rows
//! being consumed, their offsets/epochs/pause bits, serialized through a
//! single critical section (spec.md §4.2 — this crate's Open Question
//! resolution: one coarse lock rather than per-partition striping, since
//! nothing in the corpus this crate is grounded on reaches for lock
//! striping at this scale; see DESIGN.md).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::error::FetchError;
use crate::topic_partition::{EpochOffset, OffsetSpec, Topic, TopicPartition};

#[derive(Debug, Clone)]
pub struct PartitionState {
    pub tp: TopicPartition,
    pub leader_id: Option<i32>,
    pub leader_epoch: i32,
    /// `None` means the partition still needs `ListOffsets` resolution
    /// before it is eligible for fetching.
    pub current_offset: Option<i64>,
    pub high_water_mark: i64,
    pub last_stable_offset: i64,
    pub paused_by_user: bool,
    pub paused_by_topic: bool,
    pub excluded_backpressure: bool,
    pub assigned: bool,
    pub source_broker: Option<i32>,
    pub epoch_known: Option<i32>,
    pub sticky_error: Option<FetchError>,
    /// Deferred offset request, set when the partition was assigned without
    /// an explicit spec and is waiting on `ListOffsets`.
    pub pending_offset_spec: Option<OffsetSpec>,
}

impl PartitionState {
    fn new(tp: TopicPartition) -> Self {
        Self {
            tp,
            leader_id: None,
            leader_epoch: 0,
            current_offset: None,
            high_water_mark: 0,
            last_stable_offset: 0,
            paused_by_user: false,
            paused_by_topic: false,
            excluded_backpressure: false,
            assigned: true,
            source_broker: None,
            epoch_known: None,
            sticky_error: None,
            pending_offset_spec: None,
        }
    }

    /// Pause vs backpressure share one aggregate bit; the scheduler only
    /// reads this, never the individual reasons (spec.md §9 design note).
    pub fn excluded_from_fetch(&self) -> bool {
        self.paused_by_user || self.paused_by_topic || self.excluded_backpressure
    }

    pub fn needs_offset(&self) -> bool {
        self.current_offset.is_none()
    }
}

#[derive(Debug, Clone)]
pub enum AssignmentChange {
    Assigned(Vec<TopicPartition>),
    Unassigned(Vec<TopicPartition>),
    PauseChanged(Vec<TopicPartition>),
    OffsetsSeeded(Vec<TopicPartition>),
    LeaderChanged(Vec<TopicPartition>),
}

struct Inner {
    partitions: BTreeMap<TopicPartition, PartitionState>,
    paused_topics: HashSet<Topic>,
    /// Pre-seeded offsets from `SetOffsets`, applied once a matching
    /// partition becomes known — survives the partition becoming known
    /// later, per spec.md §4.3.
    seeded_offsets: HashMap<TopicPartition, EpochOffset>,
    /// Bumped on purge; a fetch response tagged with a stale generation for
    /// its topic is dropped before reaching the buffer (spec.md §4.7).
    purge_generation: HashMap<Topic, u64>,
}

pub struct AssignmentSet {
    inner: Mutex<Inner>,
    change_tx: mpsc::UnboundedSender<AssignmentChange>,
}

impl AssignmentSet {
    pub fn new() -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<AssignmentChange>) {
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let set = std::sync::Arc::new(Self {
            inner: Mutex::new(Inner {
                partitions: BTreeMap::new(),
                paused_topics: HashSet::new(),
                seeded_offsets: HashMap::new(),
                purge_generation: HashMap::new(),
            }),
            change_tx,
        });
        (set, change_rx)
    }

    fn emit(&self, change: AssignmentChange) {
        let _ = self.change_tx.send(change);
    }

    /// Idempotent: assigning an already-assigned partition is a no-op except
    /// for an explicit offset override.
    pub fn assign(&self, tps: Vec<(TopicPartition, Option<OffsetSpec>)>) {
        let mut inner = self.inner.lock().unwrap();
        let mut newly = Vec::new();
        for (tp, spec) in tps {
            let seeded = inner.seeded_offsets.get(&tp).copied();
            let paused_by_topic = inner.paused_topics.contains(&tp.topic);
            let entry = inner.partitions.entry(tp.clone()).or_insert_with(|| {
                newly.push(tp.clone());
                PartitionState::new(tp.clone())
            });
            entry.paused_by_topic = paused_by_topic;
            if let Some(seed) = seeded {
                entry.current_offset = Some(seed.offset);
                entry.epoch_known = seed.epoch;
            } else if let Some(spec) = spec {
                match spec {
                    OffsetSpec::Literal(off) => {
                        entry.current_offset = Some(off);
                        entry.pending_offset_spec = None;
                    },
                    other => entry.pending_offset_spec = Some(other),
                }
            } else if entry.current_offset.is_none() && entry.pending_offset_spec.is_none() {
                entry.pending_offset_spec = Some(OffsetSpec::Latest);
            }
        }
        if !newly.is_empty() {
            self.emit(AssignmentChange::Assigned(newly));
        }
    }

    /// Unassigning partitions that aren't currently assigned (including
    /// unknown topics) is a no-op, never an error (spec.md P5).
    pub fn unassign(&self, tps: &[TopicPartition]) {
        let mut inner = self.inner.lock().unwrap();
        let mut removed = Vec::new();
        for tp in tps {
            if inner.partitions.remove(tp).is_some() {
                removed.push(tp.clone());
            }
        }
        drop(inner);
        if !removed.is_empty() {
            self.emit(AssignmentChange::Unassigned(removed));
        }
    }

    pub fn unassign_topic(&self, topic: &Topic) {
        let mut inner = self.inner.lock().unwrap();
        let doomed: Vec<TopicPartition> = inner
            .partitions
            .keys()
            .filter(|tp| &tp.topic == topic)
            .cloned()
            .collect();
        for tp in &doomed {
            inner.partitions.remove(tp);
        }
        drop(inner);
        if !doomed.is_empty() {
            self.emit(AssignmentChange::Unassigned(doomed));
        }
    }

    pub fn pause_partitions(&self, tps: &[TopicPartition]) {
        let mut inner = self.inner.lock().unwrap();
        let mut changed = Vec::new();
        for tp in tps {
            if let Some(p) = inner.partitions.get_mut(tp) {
                if !p.paused_by_user {
                    p.paused_by_user = true;
                    changed.push(tp.clone());
                }
            }
        }
        drop(inner);
        if !changed.is_empty() {
            self.emit(AssignmentChange::PauseChanged(changed));
        }
    }

    pub fn resume_partitions(&self, tps: &[TopicPartition]) {
        let mut inner = self.inner.lock().unwrap();
        let mut changed = Vec::new();
        for tp in tps {
            if let Some(p) = inner.partitions.get_mut(tp) {
                if p.paused_by_user {
                    p.paused_by_user = false;
                    changed.push(tp.clone());
                }
            }
        }
        drop(inner);
        if !changed.is_empty() {
            self.emit(AssignmentChange::PauseChanged(changed));
        }
    }

    pub fn pause_topics(&self, topics: &[Topic]) {
        let mut inner = self.inner.lock().unwrap();
        let mut changed = Vec::new();
        for topic in topics {
            inner.paused_topics.insert(topic.clone());
        }
        for p in inner.partitions.values_mut() {
            if topics.contains(&p.tp.topic) && !p.paused_by_topic {
                p.paused_by_topic = true;
                changed.push(p.tp.clone());
            }
        }
        drop(inner);
        if !changed.is_empty() {
            self.emit(AssignmentChange::PauseChanged(changed));
        }
    }

    pub fn resume_topics(&self, topics: &[Topic]) {
        let mut inner = self.inner.lock().unwrap();
        for topic in topics {
            inner.paused_topics.remove(topic);
        }
        let mut changed = Vec::new();
        for p in inner.partitions.values_mut() {
            if topics.contains(&p.tp.topic) && p.paused_by_topic {
                p.paused_by_topic = false;
                changed.push(p.tp.clone());
            }
        }
        drop(inner);
        if !changed.is_empty() {
            self.emit(AssignmentChange::PauseChanged(changed));
        }
    }

    /// Forces/seeds offsets even for not-yet-known partitions; the seed
    /// survives until the partition is assigned (spec.md §4.3).
    pub fn set_offsets(&self, offsets: HashMap<TopicPartition, EpochOffset>) {
        let mut inner = self.inner.lock().unwrap();
        let mut applied = Vec::new();
        for (tp, eo) in offsets {
            if let Some(p) = inner.partitions.get_mut(&tp) {
                p.current_offset = Some(eo.offset);
                p.epoch_known = eo.epoch;
                p.pending_offset_spec = None;
                applied.push(tp.clone());
            }
            inner.seeded_offsets.insert(tp, eo);
        }
        drop(inner);
        if !applied.is_empty() {
            self.emit(AssignmentChange::OffsetsSeeded(applied));
        }
    }

    /// Leader epoch is monotonically non-decreasing; a stale (lower) epoch
    /// is ignored (spec.md §4.6).
    pub fn update_leader(&self, tp: &TopicPartition, leader_id: Option<i32>, leader_epoch: i32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if let Some(p) = inner.partitions.get_mut(tp) {
            if leader_epoch < p.leader_epoch {
                return false;
            }
            let changed = p.leader_id != leader_id || p.leader_epoch != leader_epoch;
            p.leader_id = leader_id;
            p.leader_epoch = leader_epoch;
            return changed;
        }
        false
    }

    pub fn set_source_broker(&self, tp: &TopicPartition, broker: Option<i32>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(p) = inner.partitions.get_mut(tp) {
            p.source_broker = broker;
        }
    }

    pub fn mark_offset_resolved(&self, tp: &TopicPartition, offset: i64, epoch: Option<i32>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(p) = inner.partitions.get_mut(tp) {
            p.current_offset = Some(offset);
            p.epoch_known = epoch;
            p.pending_offset_spec = None;
        }
    }

    pub fn advance_offset(&self, tp: &TopicPartition, new_offset: i64, hwm: i64, lso: i64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(p) = inner.partitions.get_mut(tp) {
            p.current_offset = Some(new_offset);
            p.high_water_mark = hwm;
            p.last_stable_offset = lso;
        }
    }

    pub fn set_sticky_error(&self, tp: &TopicPartition, err: Option<FetchError>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(p) = inner.partitions.get_mut(tp) {
            p.sticky_error = err;
        }
    }

    pub fn set_backpressure_excluded(&self, tp: &TopicPartition, excluded: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(p) = inner.partitions.get_mut(tp) {
            p.excluded_backpressure = excluded;
        }
    }

    /// Linearizable snapshot for readers: a clone taken under the single
    /// critical section.
    pub fn snapshot(&self) -> Vec<PartitionState> {
        self.inner.lock().unwrap().partitions.values().cloned().collect()
    }

    pub fn snapshot_for_broker(&self, broker: i32) -> Vec<PartitionState> {
        self.inner
            .lock()
            .unwrap()
            .partitions
            .values()
            .filter(|p| p.source_broker == Some(broker))
            .cloned()
            .collect()
    }

    pub fn get(&self, tp: &TopicPartition) -> Option<PartitionState> {
        self.inner.lock().unwrap().partitions.get(tp).cloned()
    }

    pub fn is_assigned(&self, tp: &TopicPartition) -> bool {
        self.inner.lock().unwrap().partitions.contains_key(tp)
    }

    pub fn purge_generation(&self, topic: &Topic) -> u64 {
        *self.inner.lock().unwrap().purge_generation.get(topic).unwrap_or(&0)
    }

    pub fn bump_purge_generation(&self, topic: &Topic) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let gen = inner.purge_generation.entry(topic.clone()).or_insert(0);
        *gen += 1;
        *gen
    }

    pub fn forget_seed(&self, tp: &TopicPartition) {
        self.inner.lock().unwrap().seeded_offsets.remove(tp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp(topic: &str, partition: i32) -> TopicPartition {
        TopicPartition::new(Topic::from(topic), partition)
    }

    #[test]
    fn set_offsets_seed_wins_over_explicit_spec_on_assign() {
        let (set, _rx) = AssignmentSet::new();
        set.set_offsets(HashMap::from([(tp("orders", 0), EpochOffset::new(42, Some(3)))]));
        set.assign(vec![(tp("orders", 0), Some(OffsetSpec::Latest))]);

        let p = set.get(&tp("orders", 0)).expect("assigned");
        assert_eq!(p.current_offset, Some(42));
        assert_eq!(p.epoch_known, Some(3));
    }

    #[test]
    fn unassigning_unknown_partitions_is_a_silent_no_op() {
        let (set, _rx) = AssignmentSet::new();
        set.unassign(&[tp("nope", 0)]);
        assert!(set.snapshot().is_empty());
    }

    #[test]
    fn stale_leader_epoch_is_ignored() {
        let (set, _rx) = AssignmentSet::new();
        set.assign(vec![(tp("orders", 0), Some(OffsetSpec::Earliest))]);
        assert!(set.update_leader(&tp("orders", 0), Some(1), 5));
        assert!(!set.update_leader(&tp("orders", 0), Some(2), 3));
        let p = set.get(&tp("orders", 0)).unwrap();
        assert_eq!(p.leader_id, Some(1));
        assert_eq!(p.leader_epoch, 5);
    }

    #[test]
    fn pausing_a_topic_pauses_its_already_assigned_partitions() {
        let (set, _rx) = AssignmentSet::new();
        set.assign(vec![(tp("orders", 0), Some(OffsetSpec::Earliest))]);
        set.pause_topics(&[Topic::from("orders")]);
        assert!(set.get(&tp("orders", 0)).unwrap().excluded_from_fetch());

        // A partition assigned after the topic-level pause also inherits it.
        set.assign(vec![(tp("orders", 1), Some(OffsetSpec::Earliest))]);
        assert!(set.get(&tp("orders", 1)).unwrap().excluded_from_fetch());
    }

    #[test]
    fn purge_generation_starts_at_zero_and_increments() {
        let (set, _rx) = AssignmentSet::new();
        let topic = Topic::from("orders");
        assert_eq!(set.purge_generation(&topic), 0);
        assert_eq!(set.bump_purge_generation(&topic), 1);
        assert_eq!(set.bump_purge_generation(&topic), 2);
        assert_eq!(set.purge_generation(&topic), 2);
    }
}

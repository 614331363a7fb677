//! Buffer & Poll Surface (C5): per-partition FIFOs of delivered fetch
//! responses, plus the caller-facing `PollFetches`/`PollRecords` operations.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{FetchError, PollError};
use crate::record::{Record, RecordBatch};
use crate::topic_partition::TopicPartition;

struct PartitionBuffer {
    queue: VecDeque<Record>,
    sticky_error: Option<FetchError>,
}

impl PartitionBuffer {
    fn new() -> Self {
        Self { queue: VecDeque::new(), sticky_error: None }
    }
}

pub struct BufferSet {
    inner: Mutex<HashMap<TopicPartition, PartitionBuffer>>,
    notify: Notify,
    pub(crate) backpressure_soft_limit: usize,
}

impl BufferSet {
    pub fn new(backpressure_soft_limit: usize) -> Self {
        Self { inner: Mutex::new(HashMap::new()), notify: Notify::new(), backpressure_soft_limit }
    }

    pub fn ensure_partition(&self, tp: &TopicPartition) {
        self.inner.lock().unwrap().entry(tp.clone()).or_insert_with(PartitionBuffer::new);
    }

    /// Drops all buffered state for a partition; used on unassign/purge. A
    /// later re-add of the same partition starts with an empty buffer, so
    /// pre-purge records never reappear (spec.md P4).
    pub fn remove_partition(&self, tp: &TopicPartition) {
        self.inner.lock().unwrap().remove(tp);
    }

    /// Pushes a freshly-fetched batch. Paused partitions never reach here
    /// (the scheduler excludes them from the fetch request), so this never
    /// needs to special-case pause — only purge races, handled by the
    /// caller checking the assignment's purge generation before calling in.
    pub fn push_batch(&self, batch: RecordBatch) {
        if batch.records.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let buf = inner.entry(batch.tp).or_insert_with(PartitionBuffer::new);
        buf.queue.extend(batch.records);
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn set_sticky_error(&self, tp: &TopicPartition, err: Option<FetchError>) {
        let mut inner = self.inner.lock().unwrap();
        let buf = inner.entry(tp.clone()).or_insert_with(PartitionBuffer::new);
        buf.sticky_error = err;
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn queue_len(&self, tp: &TopicPartition) -> usize {
        self.inner.lock().unwrap().get(tp).map(|b| b.queue.len()).unwrap_or(0)
    }

    fn has_data(&self) -> bool {
        self.inner.lock().unwrap().values().any(|b| !b.queue.is_empty() || b.sticky_error.is_some())
    }

    /// Drains every partition's buffer in full.
    fn drain_all(&self) -> Fetches {
        let mut inner = self.inner.lock().unwrap();
        let mut records = Vec::new();
        let mut errors = Vec::new();
        for (tp, buf) in inner.iter_mut() {
            if !buf.queue.is_empty() {
                records.push((tp.clone(), buf.queue.drain(..).collect::<Vec<_>>()));
            }
            if let Some(err) = buf.sticky_error.take() {
                errors.push((tp.clone(), err));
            }
        }
        Fetches { records, errors, err0: None }
    }

    /// Drains up to `max` records total, round-robin across partitions with
    /// data, preserving per-partition order.
    fn drain_round_robin(&self, max: usize) -> Fetches {
        let mut inner = self.inner.lock().unwrap();
        let mut per_partition: HashMap<TopicPartition, Vec<Record>> = HashMap::new();
        let mut errors = Vec::new();
        let mut remaining = max;

        let mut active: Vec<TopicPartition> =
            inner.iter().filter(|(_, b)| !b.queue.is_empty()).map(|(tp, _)| tp.clone()).collect();
        active.sort();

        'outer: while remaining > 0 && !active.is_empty() {
            active.retain(|tp| inner.get(tp).map(|b| !b.queue.is_empty()).unwrap_or(false));
            if active.is_empty() {
                break;
            }
            for tp in active.clone() {
                if remaining == 0 {
                    break 'outer;
                }
                if let Some(buf) = inner.get_mut(&tp) {
                    if let Some(rec) = buf.queue.pop_front() {
                        per_partition.entry(tp).or_default().push(rec);
                        remaining -= 1;
                    }
                }
            }
        }

        for (tp, buf) in inner.iter_mut() {
            if let Some(err) = buf.sticky_error.take() {
                errors.push((tp.clone(), err));
            }
        }

        let records = per_partition.into_iter().collect();
        Fetches { records, errors, err0: None }
    }

    /// Blocks until data/errors are available or `timeout` elapses. On
    /// timeout with nothing available, returns a `Fetches` carrying the
    /// `Err0` sentinel rather than a per-partition error (spec.md §4.5,
    /// taxonomy class 5).
    pub async fn poll_fetches(&self, timeout: Duration) -> Fetches {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.has_data() {
                return self.drain_all();
            }
            let notified = self.notify.notified();
            tokio::select! {
                _ = notified => {},
                _ = tokio::time::sleep_until(deadline) => {
                    if self.has_data() {
                        return self.drain_all();
                    }
                    return Fetches { records: Vec::new(), errors: Vec::new(), err0: Some(PollError::DeadlineElapsed) };
                },
            }
        }
    }

    pub async fn poll_records(&self, timeout: Duration, max: usize) -> Fetches {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.has_data() {
                return self.drain_round_robin(max);
            }
            let notified = self.notify.notified();
            tokio::select! {
                _ = notified => {},
                _ = tokio::time::sleep_until(deadline) => {
                    if self.has_data() {
                        return self.drain_round_robin(max);
                    }
                    return Fetches { records: Vec::new(), errors: Vec::new(), err0: Some(PollError::DeadlineElapsed) };
                },
            }
        }
    }

    pub fn wake_waiters(&self) {
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp(topic: &str, partition: i32) -> TopicPartition {
        TopicPartition::new(std::sync::Arc::<str>::from(topic), partition)
    }

    fn rec(offset: i64) -> Record {
        Record { offset, timestamp_ms: offset, key: None, value: Some(vec![offset as u8]), headers: Vec::new() }
    }

    #[tokio::test]
    async fn poll_records_round_robins_across_partitions_preserving_order() {
        let buf = BufferSet::new(64);
        buf.push_batch(RecordBatch { tp: tp("t", 0), records: vec![rec(0), rec(1), rec(2)] });
        buf.push_batch(RecordBatch { tp: tp("t", 1), records: vec![rec(10), rec(11)] });

        let fetches = buf.poll_records(Duration::from_millis(50), 4).await;
        assert_eq!(fetches.num_records(), 4);

        let from_p0: Vec<i64> = fetches
            .records()
            .filter(|(tp, _)| tp.partition == 0)
            .map(|(_, r)| r.offset)
            .collect();
        let from_p1: Vec<i64> = fetches
            .records()
            .filter(|(tp, _)| tp.partition == 1)
            .map(|(_, r)| r.offset)
            .collect();
        assert_eq!(from_p0, vec![0, 1]);
        assert_eq!(from_p1, vec![10, 11]);
    }

    #[tokio::test]
    async fn poll_fetches_returns_deadline_elapsed_sentinel_when_empty() {
        let buf = BufferSet::new(64);
        let fetches = buf.poll_fetches(Duration::from_millis(20)).await;
        assert!(fetches.records.is_empty());
        assert!(matches!(fetches.err0, Some(PollError::DeadlineElapsed)));
    }

    #[tokio::test]
    async fn removing_a_partition_drops_its_buffered_records() {
        let buf = BufferSet::new(64);
        let t = tp("t", 0);
        buf.push_batch(RecordBatch { tp: t.clone(), records: vec![rec(0)] });
        buf.remove_partition(&t);
        assert_eq!(buf.queue_len(&t), 0);
    }
}

/// A snapshot of records and errors returned by one poll call.
#[derive(Debug, Default)]
pub struct Fetches {
    pub records: Vec<(TopicPartition, Vec<Record>)>,
    pub errors: Vec<(TopicPartition, FetchError)>,
    pub err0: Option<PollError>,
}

impl Fetches {
    pub fn each_record(&self, mut f: impl FnMut(&TopicPartition, &Record)) {
        for (tp, records) in &self.records {
            for r in records {
                f(tp, r);
            }
        }
    }

    pub fn each_topic(&self, mut f: impl FnMut(&str, &[(TopicPartition, Vec<Record>)])) {
        use std::collections::BTreeMap;
        let mut by_topic: BTreeMap<&str, Vec<(TopicPartition, Vec<Record>)>> = BTreeMap::new();
        for (tp, records) in &self.records {
            by_topic.entry(&tp.topic).or_default().push((tp.clone(), records.clone()));
        }
        for (topic, group) in by_topic {
            f(topic, &group);
        }
    }

    pub fn each_error(&self, mut f: impl FnMut(&TopicPartition, &FetchError)) {
        for (tp, err) in &self.errors {
            f(tp, err);
        }
    }

    pub fn num_records(&self) -> usize {
        self.records.iter().map(|(_, r)| r.len()).sum()
    }

    pub fn records(&self) -> impl Iterator<Item = (&TopicPartition, &Record)> {
        self.records.iter().flat_map(|(tp, rs)| rs.iter().map(move |r| (tp, r)))
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.errors.is_empty() && self.err0.is_none()
    }
}

use std::sync::Arc;

/// Topic names are reference-counted so metadata refreshes, assignment rows,
/// and buffers can all point at the same allocation instead of cloning a
/// `String` per partition per refresh.
pub type Topic = Arc<str>;

/// `(topic, partition)` identity, as spec'd in the data model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: Topic,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<Arc<str>>, partition: i32) -> Self {
        Self { topic: topic.into(), partition }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

/// What offset a fresh assignment (or a `SetOffsets` seed) should start from.
///
/// Mirrors the abstract `Offset` entity in the data model: a literal offset,
/// one of the two named resets, a timestamp lookup, or "use the committed
/// offset, falling back to a reset policy if none exists."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetSpec {
    Literal(i64),
    Earliest,
    Latest,
    ByTimestamp(i64),
    CommittedWithFallback(FallbackOffset),
}

/// The non-recursive subset of [`OffsetSpec`] usable as a committed-offset
/// fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackOffset {
    Earliest,
    Latest,
    Literal(i64),
}

impl OffsetSpec {
    pub fn at(offset: i64) -> Self {
        OffsetSpec::Literal(offset)
    }
}

/// A forced/seeded offset with an optional known leader epoch.
///
/// `epoch: None` is the Rust rendition of spec.md's "`Epoch = -1` means no
/// epoch known" sentinel: don't send an epoch on the next fetch, and accept
/// whatever epoch the broker reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochOffset {
    pub offset: i64,
    pub epoch: Option<i32>,
}

impl EpochOffset {
    pub fn new(offset: i64, epoch: Option<i32>) -> Self {
        Self { offset, epoch }
    }
}

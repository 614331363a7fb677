use crate::topic_partition::TopicPartition;

/// A single decoded record, already offset/timestamp/header-resolved by the
/// transport. Encoding/decoding the wire format itself lives in the
/// transport's collaborator, not here.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Record {
    pub offset: i64,
    pub timestamp_ms: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub headers: Vec<(String, Vec<u8>)>,
}

/// One partition's worth of records as returned by a single fetch response.
#[derive(Debug, Clone)]
pub struct RecordBatch {
    pub tp: TopicPartition,
    pub records: Vec<Record>,
}

impl RecordBatch {
    pub fn last_offset(&self) -> Option<i64> {
        self.records.last().map(|r| r.offset)
    }
}

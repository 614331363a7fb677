use std::time::Duration;

/// Enumerated configuration, matching spec.md §6's configuration table.
///
/// `RecordPartitioner` and `DefaultProduceTopic` are producer-only and kept
/// for API completeness (a caller building both halves of a client off one
/// `Config` shouldn't have to maintain two types) — this crate's own paths
/// never read them.
#[derive(Debug, Clone)]
pub struct Config {
    pub bootstrap_servers: String,

    /// `-1` = infinite retries for transient "unknown topic" conditions.
    pub unknown_topic_retries: i32,

    /// Refresh debounce floor: a metadata refresh already younger than this
    /// is reused instead of triggering a new fetch.
    pub metadata_min_age: Duration,

    /// Broker-side long-poll ceiling, and the scheduler's wake ceiling.
    pub fetch_max_wait: Duration,

    /// Surface retryable per-partition errors to the caller instead of
    /// swallowing them.
    pub keep_retryable_fetch_errors: bool,

    /// Treat `ConsumeTopics` entries as regex patterns rather than literal
    /// topic names.
    pub consume_regex: bool,

    /// Switches to group-coordinated assignment when set.
    pub consumer_group: Option<String>,

    /// Producer-only; listed for completeness.
    pub record_partitioner: RecordPartitioner,

    /// Producer-only; listed for completeness.
    pub default_produce_topic: Option<String>,

    /// A subscribed topic absent from every successful metadata response for
    /// this long is treated as deleted.
    pub missing_topic_delete_timeout: Duration,

    /// Per-partition fetch byte cap, adjusted downward under backpressure.
    pub max_partition_bytes: i32,

    /// Per-partition buffered-batch count above which a partition is
    /// internally excluded from fetch requests (shares the pause mechanism).
    pub backpressure_soft_limit: usize,

    /// How long an empty `BrokerSource` lingers before being torn down, to
    /// avoid thrashing across rapid reassignments.
    pub broker_source_grace_window: Duration,

    /// Default offset reset applied to newly-discovered partitions that have
    /// no explicit offset and no `SetOffsets` seed.
    pub auto_offset_reset: crate::topic_partition::OffsetSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordPartitioner {
    Manual,
    RoundRobin,
}

impl Config {
    pub fn builder(bootstrap_servers: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(bootstrap_servers)
    }
}

#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            config: Config {
                bootstrap_servers: bootstrap_servers.into(),
                unknown_topic_retries: -1,
                metadata_min_age: Duration::from_millis(250),
                fetch_max_wait: Duration::from_millis(500),
                keep_retryable_fetch_errors: false,
                consume_regex: false,
                consumer_group: None,
                record_partitioner: RecordPartitioner::RoundRobin,
                default_produce_topic: None,
                missing_topic_delete_timeout: Duration::from_secs(15),
                max_partition_bytes: 1 << 20,
                backpressure_soft_limit: 64,
                broker_source_grace_window: Duration::from_secs(5),
                auto_offset_reset: crate::topic_partition::OffsetSpec::Latest,
            },
        }
    }

    pub fn unknown_topic_retries(mut self, v: i32) -> Self {
        self.config.unknown_topic_retries = v;
        self
    }

    pub fn metadata_min_age(mut self, v: Duration) -> Self {
        self.config.metadata_min_age = v;
        self
    }

    pub fn fetch_max_wait(mut self, v: Duration) -> Self {
        self.config.fetch_max_wait = v;
        self
    }

    pub fn keep_retryable_fetch_errors(mut self, v: bool) -> Self {
        self.config.keep_retryable_fetch_errors = v;
        self
    }

    pub fn consume_regex(mut self, v: bool) -> Self {
        self.config.consume_regex = v;
        self
    }

    pub fn consumer_group(mut self, v: impl Into<String>) -> Self {
        self.config.consumer_group = Some(v.into());
        self
    }

    pub fn record_partitioner(mut self, v: RecordPartitioner) -> Self {
        self.config.record_partitioner = v;
        self
    }

    pub fn default_produce_topic(mut self, v: impl Into<String>) -> Self {
        self.config.default_produce_topic = Some(v.into());
        self
    }

    pub fn missing_topic_delete_timeout(mut self, v: Duration) -> Self {
        self.config.missing_topic_delete_timeout = v;
        self
    }

    pub fn max_partition_bytes(mut self, v: i32) -> Self {
        self.config.max_partition_bytes = v;
        self
    }

    pub fn backpressure_soft_limit(mut self, v: usize) -> Self {
        self.config.backpressure_soft_limit = v;
        self
    }

    pub fn auto_offset_reset(mut self, v: crate::topic_partition::OffsetSpec) -> Self {
        self.config.auto_offset_reset = v;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

//! Consumer subsystem for a Kafka wire-protocol client: subscription
//! management, metadata-driven assignment, per-broker fetch scheduling, and
//! buffered polling.
//!
//! The producer path, the wire codec itself, consumer-group rebalance
//! internals, and SASL/TLS configuration are treated as external
//! collaborators — see [`transport`] for the one seam this crate reaches
//! through to the network, and [`subscription::GroupCoordinator`] for the
//! group-rebalance seam.

pub mod assignment;
pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod metadata;
pub mod purge;
pub mod record;
pub mod scheduler;
pub mod source_manager;
pub mod subscription;
pub mod topic_partition;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::Client;
pub use config::{Config, ConfigBuilder, RecordPartitioner};
pub use error::{ClientError, FetchError, PollError, RetryableReason, TransportError};
pub use record::{Record, RecordBatch};
pub use topic_partition::{EpochOffset, FallbackOffset, OffsetSpec, Topic, TopicPartition};

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the [`crate::transport::Transport`] boundary.
///
/// This is the only place `rdkafka`'s own error type crosses into the rest of
/// the crate.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport timed out after {0:?}")]
    Timeout(Duration),
    #[error("kafka client error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("broker {0} has no known connection")]
    UnknownBroker(i32),
    #[error("transport is shutting down")]
    Closed,
}

/// Transient per-partition error classes (taxonomy class 1 in the design doc).
///
/// These are consumed internally by the fetch scheduler unless
/// [`crate::config::Config::keep_retryable_fetch_errors`] is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RetryableReason {
    #[error("not leader or follower")]
    NotLeaderOrFollower,
    #[error("leader not available")]
    LeaderNotAvailable,
    #[error("fenced leader epoch")]
    FencedLeaderEpoch,
    #[error("unknown leader epoch")]
    UnknownLeaderEpoch,
}

/// Sticky per-partition errors surfaced through [`crate::buffer::Fetches`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FetchError {
    #[error("unknown topic or partition")]
    UnknownTopicOrPartition,
    #[error("unknown topic id")]
    UnknownTopicId,
    #[error("offset out of range, no reset policy applies")]
    OffsetOutOfRange,
    #[error("not authorized to read this topic")]
    TopicAuthorizationFailed,
    #[error(transparent)]
    Retryable(#[from] RetryableReason),
}

/// The `Err0` sentinel on a [`crate::buffer::Fetches`] snapshot: a poll-level
/// condition, never a per-partition one.
#[derive(Debug, Clone, Error)]
pub enum PollError {
    #[error("poll deadline elapsed before any data arrived")]
    DeadlineElapsed,
    #[error("poll was cancelled")]
    Cancelled,
}

/// Fatal or construction-time errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to set up transport: {0}")]
    Transport(#[from] TransportError),
    #[error("client has been closed")]
    Closed,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

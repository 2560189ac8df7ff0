//! Durable queue adapter.
//!
//! The capture side publishes serialized records through [`LogPublisher`]; the
//! forwarder pulls them back through [`LogSource`] and acknowledges each
//! [`Delivery`] individually. Two brokers implement these seams:
//!
//! - [`jetstream`]: NATS JetStream (the production broker)
//! - [`memory`]: an in-process broker with the same ack semantics

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub mod jetstream;
pub mod memory;

pub use jetstream::{JetStreamQueue, JetStreamSource};
pub use memory::{MemoryBroker, MemorySource};

/// Errors surfaced by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Failed to connect to broker: {0}")]
    Connect(String),

    #[error("Failed to set up topic {topic}: {message}")]
    Topic { topic: String, message: String },

    #[error("Failed to set up consumer {consumer}: {message}")]
    Consumer { consumer: String, message: String },

    #[error("Publish to {subject} failed: {message}")]
    Publish { subject: String, message: String },

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Acknowledgment failed: {0}")]
    Ack(String),

    /// An operation needed a topic that has not been ensured yet
    #[error("Topic not set up; call ensure_topic first")]
    NoTopic,
}

/// Storage medium of the durable topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    File,
    Memory,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::File => write!(f, "file"),
            StorageKind::Memory => write!(f, "memory"),
        }
    }
}

/// Requested configuration for a durable topic.
///
/// Topics always use work-queue retention: a message is removed once one
/// consumer acknowledges it.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub storage: StorageKind,
    pub max_age: Duration,
    pub replicas: usize,
}

impl TopicConfig {
    /// Work-queue topic built from the process configuration.
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            name: config.stream_name.clone(),
            subjects: config.subjects.clone(),
            storage: config.storage,
            max_age: config.max_age,
            replicas: config.replicas,
        }
    }
}

/// Publishing half of the queue, used on the request path.
#[async_trait]
pub trait LogPublisher: Send + Sync {
    /// Publish one payload and wait for the broker's acknowledgment.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), QueueError>;
}

/// Acknowledges one fetched message.
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(&self) -> Result<(), QueueError>;
}

/// A fetched message together with its acknowledgment handle.
pub struct Delivery {
    pub subject: String,
    pub payload: Bytes,
    handle: Box<dyn AckHandle>,
}

impl Delivery {
    pub fn new(subject: impl Into<String>, payload: Bytes, handle: Box<dyn AckHandle>) -> Self {
        Self {
            subject: subject.into(),
            payload,
            handle,
        }
    }

    /// Acknowledge this message so the broker never redelivers it.
    pub async fn ack(&self) -> Result<(), QueueError> {
        self.handle.ack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Result of a single fetch call.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Between one and `max_count` messages, in queue order
    Messages(Vec<Delivery>),
    /// The wait elapsed with nothing available
    Timeout,
}

/// Pulling half of the queue, used by the forwarder.
#[async_trait]
pub trait LogSource: Send {
    /// Fetch up to `max_count` messages, waiting at most `max_wait`.
    ///
    /// Returns [`FetchOutcome::Timeout`] rather than an error when nothing is
    /// available; `Err` is reserved for broker failures.
    async fn fetch_batch(
        &mut self,
        max_count: usize,
        max_wait: Duration,
    ) -> Result<FetchOutcome, QueueError>;
}

/// Match a subject against a pattern with `*` (one token) and `>` (one or more
/// trailing tokens) wildcards.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_matches_literal() {
        assert!(subject_matches("logs.api", "logs.api"));
        assert!(!subject_matches("logs.api", "logs.web"));
        assert!(!subject_matches("logs.api", "logs.api.v2"));
    }

    #[test]
    fn test_subject_matches_wildcards() {
        assert!(subject_matches("logs.>", "logs.api"));
        assert!(subject_matches("logs.>", "logs.api.v2"));
        assert!(!subject_matches("logs.>", "logs"));
        assert!(subject_matches("logs.*", "logs.api"));
        assert!(!subject_matches("logs.*", "logs.api.v2"));
        assert!(!subject_matches("metrics.>", "logs.api"));
    }

    #[test]
    fn test_storage_kind_display() {
        assert_eq!(StorageKind::File.to_string(), "file");
        assert_eq!(StorageKind::Memory.to_string(), "memory");
    }
}

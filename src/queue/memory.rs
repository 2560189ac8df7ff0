//! In-process broker with JetStream-like work-queue semantics.
//!
//! Messages stay pending after a fetch until acknowledged; unacknowledged
//! messages can be put back with [`MemoryBroker::redeliver_unacked`], which
//! stands in for the broker's ack-wait expiry. Used by the test suites and for
//! running the pipeline without a NATS server.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{
    subject_matches, AckHandle, Delivery, FetchOutcome, LogPublisher, LogSource, QueueError,
    TopicConfig,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    subject: String,
    payload: Bytes,
}

#[derive(Debug, Default)]
struct BrokerState {
    topic: Option<TopicConfig>,
    consumers: BTreeMap<String, String>,
    ready: VecDeque<StoredMessage>,
    pending: BTreeMap<u64, StoredMessage>,
    next_seq: u64,
    acked: u64,
    deliveries: u64,
    unavailable: bool,
}

/// Shared handle to an in-memory broker. Clones refer to the same broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // A poisoned lock only means a test panicked mid-operation
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create or replace the topic configuration.
    pub fn ensure_topic(&self, config: &TopicConfig) -> Result<(), QueueError> {
        let mut state = self.state();
        if state.unavailable {
            return Err(QueueError::Connect("broker unavailable".to_string()));
        }
        debug!(topic = %config.name, existed = state.topic.is_some(), "Memory topic ensured");
        state.topic = Some(config.clone());
        Ok(())
    }

    /// Register a durable consumer and return a source bound to it.
    ///
    /// Calling this again with the same name returns another source sharing
    /// the consumer's position.
    pub fn ensure_consumer(
        &self,
        durable_name: &str,
        filter_subject: &str,
    ) -> Result<MemorySource, QueueError> {
        let mut state = self.state();
        if state.topic.is_none() {
            return Err(QueueError::NoTopic);
        }
        state
            .consumers
            .entry(durable_name.to_string())
            .or_insert_with(|| filter_subject.to_string());
        let filter = state.consumers[durable_name].clone();

        Ok(MemorySource {
            broker: self.clone(),
            filter,
        })
    }

    /// Make every publish and fetch fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Put every fetched-but-unacknowledged message back at the head of the queue.
    pub fn redeliver_unacked(&self) -> usize {
        let mut state = self.state();
        let pending = std::mem::take(&mut state.pending);
        let count = pending.len();
        for (_, message) in pending.into_iter().rev() {
            state.ready.push_front(message);
        }
        drop(state);
        if count > 0 {
            self.notify.notify_waiters();
        }
        count
    }

    /// Messages waiting to be fetched.
    pub fn ready_count(&self) -> usize {
        self.state().ready.len()
    }

    /// Messages fetched but not yet acknowledged.
    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Total acknowledgments received.
    pub fn acked_count(&self) -> u64 {
        self.state().acked
    }

    /// Total messages handed out by fetches, redeliveries included.
    pub fn delivery_count(&self) -> u64 {
        self.state().deliveries
    }

    fn take_ready(&self, filter: &str, max_count: usize) -> Result<Vec<Delivery>, QueueError> {
        let mut state = self.state();
        if state.unavailable {
            return Err(QueueError::Fetch("broker unavailable".to_string()));
        }

        let mut taken = Vec::new();
        let mut index = 0;
        while index < state.ready.len() && taken.len() < max_count {
            if subject_matches(filter, &state.ready[index].subject) {
                if let Some(message) = state.ready.remove(index) {
                    taken.push(message);
                }
            } else {
                index += 1;
            }
        }

        state.deliveries += taken.len() as u64;
        let deliveries = taken
            .into_iter()
            .map(|message| {
                state.pending.insert(message.seq, message.clone());
                Delivery::new(
                    message.subject,
                    message.payload,
                    Box::new(MemoryAck {
                        broker: self.clone(),
                        seq: message.seq,
                    }),
                )
            })
            .collect();
        Ok(deliveries)
    }

    fn ack(&self, seq: u64) {
        let mut state = self.state();
        if state.pending.remove(&seq).is_some() {
            state.acked += 1;
        }
    }
}

#[async_trait]
impl LogPublisher for MemoryBroker {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), QueueError> {
        let mut state = self.state();
        let publish_error = |message: &str| QueueError::Publish {
            subject: subject.to_string(),
            message: message.to_string(),
        };

        if state.unavailable {
            return Err(publish_error("broker unavailable"));
        }
        let bound = state
            .topic
            .as_ref()
            .map(|topic| topic.subjects.iter().any(|p| subject_matches(p, subject)))
            .unwrap_or(false);
        if !bound {
            return Err(publish_error("no topic bound to subject"));
        }

        state.next_seq += 1;
        let seq = state.next_seq;
        state.ready.push_back(StoredMessage {
            seq,
            subject: subject.to_string(),
            payload,
        });
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }
}

/// Pull source over a [`MemoryBroker`] consumer.
#[derive(Debug, Clone)]
pub struct MemorySource {
    broker: MemoryBroker,
    filter: String,
}

#[async_trait]
impl LogSource for MemorySource {
    async fn fetch_batch(
        &mut self,
        max_count: usize,
        max_wait: Duration,
    ) -> Result<FetchOutcome, QueueError> {
        let deadline = Instant::now() + max_wait;

        loop {
            // Register interest before checking so a publish in between is not missed
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deliveries = self.broker.take_ready(&self.filter, max_count)?;
            if !deliveries.is_empty() {
                return Ok(FetchOutcome::Messages(deliveries));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(FetchOutcome::Timeout);
            }
        }
    }
}

struct MemoryAck {
    broker: MemoryBroker,
    seq: u64,
}

#[async_trait]
impl AckHandle for MemoryAck {
    async fn ack(&self) -> Result<(), QueueError> {
        self.broker.ack(self.seq);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::StorageKind;

    fn topic() -> TopicConfig {
        TopicConfig {
            name: "logs".to_string(),
            subjects: vec!["logs.>".to_string()],
            storage: StorageKind::Memory,
            max_age: Duration::from_secs(60),
            replicas: 1,
        }
    }

    fn broker_with_topic() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.ensure_topic(&topic()).unwrap();
        broker
    }

    fn messages(outcome: FetchOutcome) -> Vec<Delivery> {
        match outcome {
            FetchOutcome::Messages(deliveries) => deliveries,
            FetchOutcome::Timeout => panic!("expected messages, got timeout"),
        }
    }

    #[tokio::test]
    async fn test_publish_requires_bound_subject() {
        let broker = broker_with_topic();

        assert!(broker.publish("logs.api", Bytes::from_static(b"a")).await.is_ok());
        let result = broker.publish("metrics.api", Bytes::from_static(b"b")).await;
        assert!(matches!(result, Err(QueueError::Publish { .. })));
        assert_eq!(broker.ready_count(), 1);
    }

    #[tokio::test]
    async fn test_ensure_consumer_requires_topic() {
        let broker = MemoryBroker::new();
        assert!(matches!(
            broker.ensure_consumer("c", "logs.>"),
            Err(QueueError::NoTopic)
        ));
    }

    #[tokio::test]
    async fn test_ensure_topic_is_idempotent() {
        let broker = broker_with_topic();
        broker.publish("logs.api", Bytes::from_static(b"a")).await.unwrap();
        broker.ensure_topic(&topic()).unwrap();
        assert_eq!(broker.ready_count(), 1);
    }

    #[tokio::test]
    async fn test_fetch_returns_at_most_max_count_in_order() {
        let broker = broker_with_topic();
        for i in 0..5 {
            broker
                .publish("logs.api", Bytes::from(format!("m{}", i)))
                .await
                .unwrap();
        }
        let mut source = broker.ensure_consumer("c", "logs.>").unwrap();

        let batch = messages(source.fetch_batch(3, Duration::from_millis(10)).await.unwrap());
        let payloads: Vec<_> = batch.iter().map(|d| d.payload.clone()).collect();
        assert_eq!(payloads, vec!["m0", "m1", "m2"]);
        assert_eq!(broker.pending_count(), 3);
        assert_eq!(broker.ready_count(), 2);
    }

    #[tokio::test]
    async fn test_fetch_times_out_when_empty() {
        let broker = broker_with_topic();
        let mut source = broker.ensure_consumer("c", "logs.>").unwrap();

        let started = Instant::now();
        let outcome = source.fetch_batch(10, Duration::from_millis(50)).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_fetch_wakes_on_publish() {
        let broker = broker_with_topic();
        let mut source = broker.ensure_consumer("c", "logs.>").unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher
                .publish("logs.api", Bytes::from_static(b"late"))
                .await
                .unwrap();
        });

        let batch = messages(source.fetch_batch(10, Duration::from_secs(2)).await.unwrap());
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_ack_removes_pending_and_unacked_are_redelivered() {
        let broker = broker_with_topic();
        broker.publish("logs.api", Bytes::from_static(b"a")).await.unwrap();
        broker.publish("logs.api", Bytes::from_static(b"b")).await.unwrap();
        let mut source = broker.ensure_consumer("c", "logs.>").unwrap();

        let batch = messages(source.fetch_batch(10, Duration::from_millis(10)).await.unwrap());
        batch[0].ack().await.unwrap();
        assert_eq!(broker.acked_count(), 1);

        assert_eq!(broker.redeliver_unacked(), 1);
        let again = messages(source.fetch_batch(10, Duration::from_millis(10)).await.unwrap());
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].payload, "b");
        assert_eq!(broker.delivery_count(), 3);
    }

    #[tokio::test]
    async fn test_filter_subject_limits_fetch() {
        let broker = broker_with_topic();
        broker.publish("logs.api", Bytes::from_static(b"api")).await.unwrap();
        broker.publish("logs.web", Bytes::from_static(b"web")).await.unwrap();
        let mut source = broker.ensure_consumer("web-only", "logs.web").unwrap();

        let batch = messages(source.fetch_batch(10, Duration::from_millis(10)).await.unwrap());
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].subject, "logs.web");
    }

    #[tokio::test]
    async fn test_unavailable_broker_fails_operations() {
        let broker = broker_with_topic();
        let mut source = broker.ensure_consumer("c", "logs.>").unwrap();
        broker.set_unavailable(true);

        assert!(broker.publish("logs.api", Bytes::from_static(b"a")).await.is_err());
        assert!(matches!(
            source.fetch_batch(1, Duration::from_millis(10)).await,
            Err(QueueError::Fetch(_))
        ));
    }
}

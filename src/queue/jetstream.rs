//! NATS JetStream implementation of the queue adapter.

use std::time::Duration;

use async_nats::jetstream::{self, consumer, stream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{
    AckHandle, Delivery, FetchOutcome, LogPublisher, LogSource, QueueError, StorageKind,
    TopicConfig,
};

/// Delay between reconnection attempts after the connection drops.
const RECONNECT_WAIT: Duration = Duration::from_secs(2);

/// Bound on a single broker round-trip, including publish acknowledgments.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection to a JetStream-enabled NATS server.
pub struct JetStreamQueue {
    client: async_nats::Client,
    context: jetstream::Context,
    topic: Option<String>,
}

impl JetStreamQueue {
    /// Connect to the broker.
    ///
    /// The initial connection is not retried: a broker that cannot be reached
    /// at startup is fatal. Later disconnects reconnect indefinitely.
    pub async fn connect(url: &str, connection_name: &str) -> Result<Self, QueueError> {
        let options = async_nats::ConnectOptions::new()
            .name(connection_name)
            .request_timeout(Some(REQUEST_TIMEOUT))
            .reconnect_delay_callback(|_attempts| RECONNECT_WAIT)
            .event_callback(|event| async move {
                match event {
                    async_nats::Event::Disconnected => warn!("NATS disconnected"),
                    async_nats::Event::Connected => info!("NATS reconnected"),
                    other => debug!(event = %other, "NATS event"),
                }
            });

        let client = options
            .connect(url)
            .await
            .map_err(|e| QueueError::Connect(e.to_string()))?;
        let context = jetstream::new(client.clone());

        info!(url = %url, connection = %connection_name, "Connected to NATS");

        Ok(Self {
            client,
            context,
            topic: None,
        })
    }

    /// Create the durable topic, or reconcile an existing one to `config`.
    ///
    /// Publisher and consumer both call this at startup; when both race to
    /// create the topic the loser falls back to an update.
    pub async fn ensure_topic(&mut self, config: &TopicConfig) -> Result<(), QueueError> {
        let stream_config = stream_config(config);
        let topic_error = |e: &dyn std::fmt::Display| QueueError::Topic {
            topic: config.name.clone(),
            message: e.to_string(),
        };

        if self.context.get_stream(&config.name).await.is_ok() {
            self.context
                .update_stream(&stream_config)
                .await
                .map_err(|e| topic_error(&e))?;
            info!(topic = %config.name, "Topic updated");
        } else {
            match self.context.create_stream(stream_config.clone()).await {
                Ok(_) => info!(topic = %config.name, "Topic created"),
                Err(create_err) => {
                    debug!(
                        topic = %config.name,
                        error = %create_err,
                        "Create failed, reconciling existing topic"
                    );
                    self.context
                        .update_stream(&stream_config)
                        .await
                        .map_err(|e| topic_error(&e))?;
                    info!(topic = %config.name, "Topic updated");
                }
            }
        }

        self.topic = Some(config.name.clone());
        Ok(())
    }

    /// Create (if absent) a durable pull consumer and return a source bound to it.
    pub async fn ensure_consumer(
        &self,
        durable_name: &str,
        filter_subject: &str,
    ) -> Result<JetStreamSource, QueueError> {
        let topic = self.topic.as_deref().ok_or(QueueError::NoTopic)?;
        let consumer_error = |e: &dyn std::fmt::Display| QueueError::Consumer {
            consumer: durable_name.to_string(),
            message: e.to_string(),
        };

        let stream = self
            .context
            .get_stream(topic)
            .await
            .map_err(|e| consumer_error(&e))?;

        let consumer = stream
            .get_or_create_consumer(
                durable_name,
                consumer::pull::Config {
                    durable_name: Some(durable_name.to_string()),
                    ack_policy: consumer::AckPolicy::Explicit,
                    filter_subject: filter_subject.to_string(),
                    max_deliver: -1,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| consumer_error(&e))?;

        info!(
            topic = %topic,
            consumer = %durable_name,
            filter = %filter_subject,
            "Pull consumer ready"
        );

        Ok(JetStreamSource { consumer })
    }

    /// Flush pending writes and close the connection.
    pub async fn close(&self) {
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "Failed to flush NATS connection on close");
        }
    }
}

#[async_trait]
impl LogPublisher for JetStreamQueue {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), QueueError> {
        let publish_error = |e: &dyn std::fmt::Display| QueueError::Publish {
            subject: subject.to_string(),
            message: e.to_string(),
        };

        let ack = self
            .context
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| publish_error(&e))?;
        ack.await.map_err(|e| publish_error(&e))?;
        Ok(())
    }
}

/// Pull-based source bound to one durable consumer.
pub struct JetStreamSource {
    consumer: consumer::Consumer<consumer::pull::Config>,
}

#[async_trait]
impl LogSource for JetStreamSource {
    async fn fetch_batch(
        &mut self,
        max_count: usize,
        max_wait: Duration,
    ) -> Result<FetchOutcome, QueueError> {
        let mut batch = self
            .consumer
            .batch()
            .max_messages(max_count)
            .expires(max_wait)
            .messages()
            .await
            .map_err(|e| QueueError::Fetch(e.to_string()))?;

        let mut deliveries = Vec::with_capacity(max_count);
        while let Some(message) = batch.next().await {
            let message = message.map_err(|e| QueueError::Fetch(e.to_string()))?;
            let subject = message.subject.to_string();
            let payload = message.payload.clone();
            deliveries.push(Delivery::new(
                subject,
                payload,
                Box::new(JetStreamAck { message }),
            ));
        }

        if deliveries.is_empty() {
            Ok(FetchOutcome::Timeout)
        } else {
            Ok(FetchOutcome::Messages(deliveries))
        }
    }
}

struct JetStreamAck {
    message: jetstream::Message,
}

#[async_trait]
impl AckHandle for JetStreamAck {
    async fn ack(&self) -> Result<(), QueueError> {
        self.message
            .ack()
            .await
            .map_err(|e| QueueError::Ack(e.to_string()))
    }
}

fn stream_config(config: &TopicConfig) -> stream::Config {
    stream::Config {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        retention: stream::RetentionPolicy::WorkQueue,
        storage: match config.storage {
            StorageKind::File => stream::StorageType::File,
            StorageKind::Memory => stream::StorageType::Memory,
        },
        max_age: config.max_age,
        num_replicas: config.replicas,
        discard: stream::DiscardPolicy::Old,
        max_messages: -1,
        max_bytes: -1,
        ..Default::default()
    }
}

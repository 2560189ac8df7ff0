//! LogTrace Library
//!
//! Components for capturing HTTP request logs and shipping them to Loki
//! through a durable queue:
//!
//! - **capture**: axum middleware that records every request/response exchange
//! - **record**: the log record model and body capture rules
//! - **queue**: durable queue adapter (NATS JetStream, plus an in-memory broker)
//! - **forwarder**: batching consumer draining the queue into the sink
//! - **sink**: Loki push client
//! - **config**: Environment-based configuration
//! - **telemetry**: logging setup and OTLP span export
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use logtrace::config::Config;
//! use logtrace::forwarder::{Forwarder, ForwarderConfig};
//! use logtrace::queue::{JetStreamQueue, TopicConfig};
//! use logtrace::sink::LokiClient;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!
//!     let mut queue = JetStreamQueue::connect(&config.nats_url, "logtrace-consumer").await?;
//!     queue.ensure_topic(&TopicConfig::from_config(&config)).await?;
//!     let source = queue
//!         .ensure_consumer(&config.consumer_name, config.filter_subject())
//!         .await?;
//!
//!     let sink = Arc::new(LokiClient::new(&config)?);
//!     let forwarder = Forwarder::new(sink, ForwarderConfig::from_config(&config));
//!     let stats = forwarder.run(source, CancellationToken::new()).await;
//!     println!("flushed {} records", stats.records_flushed);
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod config;
pub mod forwarder;
pub mod queue;
pub mod record;
pub mod sink;
pub mod telemetry;

pub use capture::{capture, CaptureState, RequestError, TRACE_ID_HEADER};
pub use config::{Config, ConfigError};
pub use forwarder::{Forwarder, ForwarderConfig, ForwarderStats, TimerPolicy};
pub use queue::{
    Delivery, FetchOutcome, JetStreamQueue, JetStreamSource, LogPublisher, LogSource, MemoryBroker,
    MemorySource, QueueError, TopicConfig,
};
pub use record::LogRecord;
pub use sink::{LogSink, LokiClient, SinkError};
pub use telemetry::TelemetryError;

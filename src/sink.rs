//! Storage sink for forwarding records to a Loki-compatible push endpoint.
//!
//! Records are grouped into labeled streams and delivered in a single POST.
//! The sink never retries; the forwarder decides what happens on failure.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::record::LogRecord;

/// Errors that can occur while delivering to the sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// HTTP request failed before a response was received
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// Request timeout
    #[error("Request timed out")]
    Timeout,

    /// Sink answered with status >= 400
    #[error("Sink returned error status {code}: {body}")]
    Status { code: StatusCode, body: String },

    /// A record could not be serialized into a log line
    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// Client configuration error
    #[error("Client configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for SinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SinkError::Timeout
        } else {
            SinkError::Request(err)
        }
    }
}

/// Destination for flushed records.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Deliver many records as one grouped request.
    async fn send_batch(&self, records: &[LogRecord]) -> Result<(), SinkError>;

    /// Deliver one record on its own.
    async fn send_one(&self, record: &LogRecord) -> Result<(), SinkError>;
}

/// Body of a Loki push request.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PushRequest {
    pub streams: Vec<StreamGroup>,
}

/// One labeled stream of `[timestamp, line]` pairs.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StreamGroup {
    #[serde(rename = "stream")]
    pub labels: BTreeMap<String, String>,
    pub values: Vec<[String; 2]>,
}

impl PushRequest {
    /// Group records by service, environment and trace id.
    ///
    /// Each group takes its labels from its first record; groups keep the
    /// order in which their first record appears.
    pub fn grouped(records: &[LogRecord]) -> Result<Self, SinkError> {
        let mut streams: Vec<StreamGroup> = Vec::new();
        let mut index_by_key: HashMap<(&str, &str, &str), usize> = HashMap::new();

        for record in records {
            let index = *index_by_key
                .entry(record.stream_key())
                .or_insert_with(|| {
                    streams.push(StreamGroup {
                        labels: group_labels(record),
                        values: Vec::new(),
                    });
                    streams.len() - 1
                });
            streams[index].values.push(log_value(record)?);
        }

        Ok(Self { streams })
    }

    /// A single-record request with the request line in the labels.
    pub fn single(record: &LogRecord) -> Result<Self, SinkError> {
        let mut labels = group_labels(record);
        labels.insert("method".to_string(), record.method.clone());
        labels.insert("status".to_string(), record.status.to_string());

        Ok(Self {
            streams: vec![StreamGroup {
                labels,
                values: vec![log_value(record)?],
            }],
        })
    }

    /// Number of log lines across all streams.
    pub fn line_count(&self) -> usize {
        self.streams.iter().map(|s| s.values.len()).sum()
    }
}

fn group_labels(record: &LogRecord) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("service".to_string(), record.service_name.clone()),
        ("environment".to_string(), record.environment.clone()),
        ("trace_id".to_string(), record.trace_id.clone()),
    ])
}

fn log_value(record: &LogRecord) -> Result<[String; 2], SinkError> {
    let line = serde_json::to_string(record)?;
    Ok([record.timestamp_nanos().to_string(), line])
}

/// HTTP client for a Loki push endpoint.
///
/// The underlying `reqwest::Client` is reused across calls for connection pooling.
pub struct LokiClient {
    client: Client,
    push_url: String,
    timeout: Duration,
}

impl LokiClient {
    /// Create a client for the push URL and timeout in `config`.
    pub fn new(config: &Config) -> Result<Self, SinkError> {
        Self::with_settings(config.loki_url.clone(), config.loki_timeout)
    }

    /// Create a client with explicit settings.
    pub fn with_settings(push_url: impl Into<String>, timeout: Duration) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| SinkError::Config(e.to_string()))?;

        Ok(Self {
            client,
            push_url: push_url.into(),
            timeout,
        })
    }

    pub fn push_url(&self) -> &str {
        &self.push_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// POST one push request; status >= 400 is a failure.
    async fn push(&self, request: &PushRequest) -> Result<(), SinkError> {
        debug!(
            streams = request.streams.len(),
            lines = request.line_count(),
            url = %self.push_url,
            "Pushing to sink"
        );

        let response = self
            .client
            .post(&self.push_url)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(SinkError::Status { code: status, body });
        }

        Ok(())
    }
}

#[async_trait]
impl LogSink for LokiClient {
    async fn send_batch(&self, records: &[LogRecord]) -> Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }
        let request = PushRequest::grouped(records)?;
        self.push(&request).await
    }

    async fn send_one(&self, record: &LogRecord) -> Result<(), SinkError> {
        let request = PushRequest::single(record)?;
        self.push(&request).await
    }
}

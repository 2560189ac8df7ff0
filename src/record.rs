//! Log record model for captured request/response exchanges.
//!
//! A [`LogRecord`] is created once per request by the capture middleware,
//! serialized to JSON for queue transport, and decoded once by the forwarder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Maximum number of characters kept from a captured body.
pub const MAX_BODY_CHARS: usize = 10_000;

/// Bytes of a body buffered for capture.
///
/// A character is at most four bytes, so this prefix always holds more than
/// [`MAX_BODY_CHARS`] characters when the body is longer than the prefix and
/// [`capture_body`] still marks it as truncated.
pub const MAX_CAPTURE_BYTES: usize = (MAX_BODY_CHARS + 1) * 4;

/// Marker appended to bodies cut at [`MAX_BODY_CHARS`].
pub const TRUNCATION_MARKER: &str = "... (truncated)";

/// Content type fragments that mark a body as binary.
const BINARY_CONTENT_TYPES: &[&str] = &[
    "image/",
    "video/",
    "audio/",
    "application/octet-stream",
    "application/pdf",
    "application/zip",
];

/// One structured log entry for a single request/response cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Trace identifier, never empty
    pub trace_id: String,

    /// Span identifier, empty when no span was started
    #[serde(default)]
    pub span_id: String,

    /// When the response finished
    pub timestamp: DateTime<Utc>,

    pub method: String,
    pub path: String,
    pub status: u16,

    /// Time spent handling the request, in milliseconds
    #[serde(rename = "latency_ms")]
    pub latency: f64,

    #[serde(default)]
    pub client_ip: String,

    #[serde(default)]
    pub user_agent: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,

    /// Request headers, first value per name
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    pub service_name: String,
    pub environment: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LogRecord {
    /// Create a record with the request line filled in and everything else empty.
    ///
    /// The capture middleware fills the remaining fields; tests use this as a
    /// compact constructor.
    pub fn new(
        trace_id: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        status: u16,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: String::new(),
            timestamp: Utc::now(),
            method: method.into(),
            path: path.into(),
            status,
            latency: 0.0,
            client_ip: String::new(),
            user_agent: String::new(),
            request_body: None,
            response_body: None,
            headers: HashMap::new(),
            service_name: String::new(),
            environment: String::new(),
            error: None,
        }
    }

    /// Set the service name and environment labels.
    pub fn with_service(
        mut self,
        service_name: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        self.service_name = service_name.into();
        self.environment = environment.into();
        self
    }

    /// Serialize to the JSON bytes published on the queue.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a queue payload.
    pub fn from_bytes(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Labels that group records into one stream: service, environment and
    /// trace id.
    pub fn stream_key(&self) -> (&str, &str, &str) {
        (&self.service_name, &self.environment, &self.trace_id)
    }

    /// Timestamp as unix nanoseconds.
    pub fn timestamp_nanos(&self) -> i64 {
        self.timestamp
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.timestamp.timestamp_micros().saturating_mul(1_000))
    }
}

/// Resolve the trace id for a record.
///
/// An all-zero or empty upstream id means no trace is active; a fresh UUID is
/// generated so that every record stays traceable.
pub fn resolve_trace_id(upstream: &str) -> String {
    if upstream.is_empty() || upstream.bytes().all(|b| b == b'0') {
        Uuid::new_v4().to_string()
    } else {
        upstream.to_string()
    }
}

/// Whether a content type names binary data. Matching is case-sensitive.
pub fn is_binary_content(content_type: &str) -> bool {
    if content_type.is_empty() {
        return false;
    }
    BINARY_CONTENT_TYPES
        .iter()
        .any(|fragment| content_type.contains(fragment))
}

/// Turn captured body bytes into the stored form.
///
/// Returns `None` for an empty body. Longer bodies keep their first
/// [`MAX_BODY_CHARS`] characters followed by [`TRUNCATION_MARKER`].
pub fn capture_body(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(bytes);
    match text.char_indices().nth(MAX_BODY_CHARS) {
        Some((cut, _)) => {
            let mut truncated = String::with_capacity(cut + TRUNCATION_MARKER.len());
            truncated.push_str(&text[..cut]);
            truncated.push_str(TRUNCATION_MARKER);
            Some(truncated)
        }
        None => Some(text.into_owned()),
    }
}

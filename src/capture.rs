//! Request/response capture middleware.
//!
//! Wraps every request, resolves its trace id, keeps the start of request and
//! response bodies where they are textual, and publishes one [`LogRecord`] per
//! exchange to the durable queue.
//!
//! Bodies are never held back. The request body is read up to
//! [`MAX_CAPTURE_BYTES`] before the handler runs and the rest streams through
//! untouched. The response body is tapped as it streams to the client, so
//! event streams and long downloads start right away. The record is published
//! once the response body has been sent or dropped.
//!
//! ```no_run
//! use std::sync::Arc;
//! use axum::{middleware, routing::get, Router};
//! use logtrace::capture::{capture, CaptureState};
//! use logtrace::queue::MemoryBroker;
//!
//! let state = CaptureState::new(Arc::new(MemoryBroker::new()), "api", "development");
//! let app: Router = Router::new()
//!     .route("/ping", get(|| async { "pong" }))
//!     .layer(middleware::from_fn_with_state(state, capture));
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, HttpBody};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::{stream, StreamExt};
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer, TracerProvider};
use opentelemetry::{Context, KeyValue};
use opentelemetry_http::HeaderExtractor;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::queue::LogPublisher;
use crate::record::{
    capture_body, is_binary_content, resolve_trace_id, LogRecord, MAX_CAPTURE_BYTES,
};

/// Response header carrying the resolved trace id.
pub const TRACE_ID_HEADER: &str = "x-trace-id";

const TRACER_NAME: &str = "logtrace.capture";

/// Error information a handler attaches to its response.
///
/// The message ends up in the record's `error` field:
///
/// ```
/// use axum::response::{IntoResponse, Response};
/// use axum::http::StatusCode;
/// use logtrace::capture::RequestError;
///
/// fn failed() -> Response {
///     let mut response = StatusCode::INTERNAL_SERVER_ERROR.into_response();
///     response.extensions_mut().insert(RequestError::new("database unavailable"));
///     response
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestError(pub String);

impl RequestError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Shared state of the capture middleware.
#[derive(Clone)]
pub struct CaptureState {
    publisher: Arc<dyn LogPublisher>,
    subject: String,
    service_name: String,
    environment: String,
    tracer_provider: Option<SdkTracerProvider>,
}

impl CaptureState {
    /// Records are published on `logs.<service_name>`.
    pub fn new(
        publisher: Arc<dyn LogPublisher>,
        service_name: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        let service_name = service_name.into();
        Self {
            publisher,
            subject: format!("logs.{}", service_name),
            service_name,
            environment: environment.into(),
            tracer_provider: None,
        }
    }

    /// Start a server span per request with this provider.
    pub fn with_tracer_provider(mut self, provider: SdkTracerProvider) -> Self {
        self.tracer_provider = Some(provider);
        self
    }

    /// Context for this request: the upstream `traceparent` context, with a
    /// new server span on top when a tracer provider is configured.
    fn request_context(&self, headers: &HeaderMap, span_name: String) -> (Context, bool) {
        let parent = TraceContextPropagator::new().extract(&HeaderExtractor(headers));

        match &self.tracer_provider {
            Some(provider) => {
                let tracer = provider.tracer(TRACER_NAME);
                let span = tracer
                    .span_builder(span_name)
                    .with_kind(SpanKind::Server)
                    .start_with_context(&tracer, &parent);
                (parent.with_span(span), true)
            }
            None => (parent, false),
        }
    }
}

/// Capture middleware; install with `axum::middleware::from_fn_with_state`.
pub async fn capture(State(state): State<CaptureState>, request: Request, next: Next) -> Response {
    let start = Instant::now();
    let (mut parts, body) = request.into_parts();

    let method = parts.method.to_string();
    let path = parts.uri.path().to_string();
    let (cx, span_started) = state.request_context(&parts.headers, format!("{} {}", method, path));
    let span_context = cx.span().span_context().clone();
    let trace_id = resolve_trace_id(&span_context.trace_id().to_string());

    let mut record = LogRecord::new(trace_id, method, path, 0)
        .with_service(state.service_name.clone(), state.environment.clone());
    if span_started {
        record.span_id = span_context.span_id().to_string();
    }
    record.headers = first_values(&parts.headers);
    record.user_agent = header_str(&parts.headers, USER_AGENT.as_str()).to_string();
    record.client_ip = client_ip(
        &parts.headers,
        parts.extensions.get::<ConnectInfo<SocketAddr>>(),
    );
    let request_content_type = header_str(&parts.headers, CONTENT_TYPE.as_str()).to_string();
    parts.extensions.insert(cx.clone());

    let mut errors: Vec<String> = Vec::new();
    let mut response = if skip_request_body(&request_content_type) {
        next.run(Request::from_parts(parts, body)).await
    } else {
        match read_prefix(body, MAX_CAPTURE_BYTES).await {
            Ok((prefix, body)) => {
                record.request_body = capture_body(&prefix);
                next.run(Request::from_parts(parts, body)).await
            }
            Err(e) => {
                warn!(error = %e, trace_id = %record.trace_id, "Failed to read request body");
                errors.push(format!("failed to read request body: {}", e));
                (StatusCode::BAD_REQUEST, "failed to read request body").into_response()
            }
        }
    };

    if let Some(RequestError(message)) = response.extensions().get::<RequestError>() {
        errors.push(message.clone());
    }

    let response_content_type = header_str(response.headers(), CONTENT_TYPE.as_str()).to_string();
    let mut tapped = None;
    if !is_binary_content(&response_content_type) && !response.body().is_end_stream() {
        let (mut response_parts, body) = response.into_parts();
        // The tapped body no longer reports its length, so pin it in the head
        if let Some(len) = body.size_hint().exact() {
            response_parts
                .headers
                .entry(CONTENT_LENGTH)
                .or_insert_with(|| HeaderValue::from(len));
        }
        let (body, rx) = tap_body(body, MAX_CAPTURE_BYTES);
        tapped = Some(rx);
        response = Response::from_parts(response_parts, body);
    }

    match HeaderValue::from_str(&record.trace_id) {
        Ok(value) => {
            response
                .headers_mut()
                .insert(HeaderName::from_static(TRACE_ID_HEADER), value);
        }
        Err(e) => {
            warn!(error = %e, trace_id = %record.trace_id, "Trace id is not a valid header value")
        }
    }

    record.status = response.status().as_u16();
    let exchange = Exchange {
        state,
        record,
        errors,
        start,
        cx,
        span_started,
    };
    tokio::spawn(exchange.finish(tapped));

    response
}

/// A request whose response is still streaming to the client.
struct Exchange {
    state: CaptureState,
    record: LogRecord,
    errors: Vec<String>,
    start: Instant,
    cx: Context,
    span_started: bool,
}

impl Exchange {
    /// Wait for the response body, then complete the record, close the span
    /// and publish.
    async fn finish(mut self, tapped: Option<oneshot::Receiver<TappedBody>>) {
        if let Some(rx) = tapped {
            let tapped = rx.await.unwrap_or_default();
            self.record.response_body = capture_body(&tapped.prefix);
            if let Some(error) = tapped.error {
                warn!(
                    error = %error,
                    trace_id = %self.record.trace_id,
                    "Failed to read response body"
                );
                self.errors.push(error);
            }
        }

        let record = &mut self.record;
        record.timestamp = Utc::now();
        record.latency = self.start.elapsed().as_micros() as f64 / 1000.0;
        if !self.errors.is_empty() {
            record.error = Some(self.errors.join("; "));
        }

        if self.span_started {
            let span = self.cx.span();
            span.set_attribute(KeyValue::new("http.method", record.method.clone()));
            span.set_attribute(KeyValue::new("http.target", record.path.clone()));
            span.set_attribute(KeyValue::new("http.status_code", i64::from(record.status)));
            if record.status >= 500 {
                span.set_status(Status::error(
                    record
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("HTTP {}", record.status)),
                ));
            }
        }

        publish_record(&self.state, &self.record).await;

        if self.span_started {
            self.cx.span().end();
        }
    }
}

/// What a [`BodyTap`] saw of a body.
#[derive(Debug, Default)]
struct TappedBody {
    prefix: Vec<u8>,
    error: Option<String>,
}

/// Keeps the first `limit` bytes of a body as it streams past. The result is
/// sent when the body is dropped, after its last frame or on disconnect.
struct BodyTap {
    seen: TappedBody,
    limit: usize,
    done: Option<oneshot::Sender<TappedBody>>,
}

impl BodyTap {
    fn observe(&mut self, chunk: &Result<Bytes, axum::Error>) {
        match chunk {
            Ok(bytes) => {
                let room = self.limit.saturating_sub(self.seen.prefix.len());
                self.seen
                    .prefix
                    .extend_from_slice(&bytes[..room.min(bytes.len())]);
            }
            Err(e) => {
                self.seen
                    .error
                    .get_or_insert_with(|| format!("failed to read response body: {}", e));
            }
        }
    }
}

impl Drop for BodyTap {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            // The receiver only goes away with the runtime
            let _ = done.send(std::mem::take(&mut self.seen));
        }
    }
}

/// Pass every chunk of `body` through unchanged while keeping a copy of the
/// first `limit` bytes.
fn tap_body(body: Body, limit: usize) -> (Body, oneshot::Receiver<TappedBody>) {
    let (done, rx) = oneshot::channel();
    let mut tap = BodyTap {
        seen: TappedBody::default(),
        limit,
        done: Some(done),
    };
    let tapped = body.into_data_stream().map(move |chunk| {
        tap.observe(&chunk);
        chunk
    });
    (Body::from_stream(tapped), rx)
}

/// Read the first `limit` bytes of a body.
///
/// Returns the prefix and a body that still yields every byte. At most one
/// chunk past `limit` is buffered; the rest is streamed on demand.
async fn read_prefix(body: Body, limit: usize) -> Result<(Bytes, Body), axum::Error> {
    let mut data = body.into_data_stream();
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut read = 0;

    while read < limit {
        match data.next().await {
            Some(chunk) => {
                let chunk = chunk?;
                read += chunk.len();
                chunks.push(chunk);
            }
            None => {
                let bytes = concat(&chunks, read);
                return Ok((bytes.clone(), Body::from(bytes)));
            }
        }
    }

    let mut prefix = concat(&chunks, read);
    prefix.truncate(limit);
    let rest = stream::iter(chunks.into_iter().map(Ok::<_, axum::Error>)).chain(data);
    Ok((prefix, Body::from_stream(rest)))
}

fn concat(chunks: &[Bytes], len: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(len);
    for chunk in chunks {
        buf.extend_from_slice(chunk);
    }
    buf.freeze()
}

/// Publish a record; failures never reach the caller.
async fn publish_record(state: &CaptureState, record: &LogRecord) {
    let payload = match record.to_bytes() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, trace_id = %record.trace_id, "Failed to serialize log record");
            return;
        }
    };

    match state
        .publisher
        .publish(&state.subject, Bytes::from(payload))
        .await
    {
        Ok(()) => debug!(
            trace_id = %record.trace_id,
            subject = %state.subject,
            status = record.status,
            "Log record published"
        ),
        Err(e) => warn!(
            error = %e,
            trace_id = %record.trace_id,
            subject = %state.subject,
            "Failed to publish log record"
        ),
    }
}

fn skip_request_body(content_type: &str) -> bool {
    content_type.contains("multipart/form-data") || is_binary_content(content_type)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// One value per header name; the first one wins.
fn first_values(headers: &HeaderMap) -> HashMap<String, String> {
    let mut result = HashMap::new();
    for (name, value) in headers {
        result
            .entry(name.as_str().to_string())
            .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    result
}

/// Client address: forwarding headers first, then the peer address.
fn client_ip(headers: &HeaderMap, peer: Option<&ConnectInfo<SocketAddr>>) -> String {
    let forwarded = header_str(headers, "x-forwarded-for")
        .split(',')
        .next()
        .map(str::trim)
        .unwrap_or("");
    if !forwarded.is_empty() {
        return forwarded.to_string();
    }

    let real_ip = header_str(headers, "x-real-ip").trim();
    if !real_ip.is_empty() {
        return real_ip.to_string();
    }

    peer.map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default()
}

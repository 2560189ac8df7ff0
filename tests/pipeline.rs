//! End-to-end pipeline tests: capture middleware -> in-memory broker ->
//! forwarder -> mock Loki endpoint.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::routing::{get, post};
use axum::{middleware, Router};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use logtrace::capture::{capture, CaptureState, TRACE_ID_HEADER};
use logtrace::forwarder::{Forwarder, ForwarderConfig, ForwarderStats, TimerPolicy};
use logtrace::queue::{MemoryBroker, StorageKind, TopicConfig};
use logtrace::record::LogRecord;
use logtrace::sink::LokiClient;

const PUSH_PATH: &str = "/loki/api/v1/push";

fn broker() -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker
        .ensure_topic(&TopicConfig {
            name: "logs".to_string(),
            subjects: vec!["logs.>".to_string()],
            storage: StorageKind::Memory,
            max_age: Duration::from_secs(60),
            replicas: 1,
        })
        .unwrap();
    broker
}

fn app(broker: &MemoryBroker) -> Router {
    let state = CaptureState::new(Arc::new(broker.clone()), "orders", "staging");
    Router::new()
        .route("/ping", get(|| async { "pong" }))
        .route(
            "/upload",
            post(|| async { ([("content-type", "image/png")], vec![0u8; 500]) }),
        )
        .layer(middleware::from_fn_with_state(state, capture))
}

async fn loki(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(PUSH_PATH))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

fn start_forwarder(
    broker: &MemoryBroker,
    server: &MockServer,
    batch_size: usize,
) -> (CancellationToken, JoinHandle<ForwarderStats>) {
    let sink = LokiClient::with_settings(
        format!("{}{}", server.uri(), PUSH_PATH),
        Duration::from_secs(5),
    )
    .unwrap();
    let config = ForwarderConfig {
        batch_size,
        batch_timeout: Duration::from_millis(200),
        fetch_wait: Duration::from_millis(50),
        timer_policy: TimerPolicy::SinceFirstRecord,
    };
    let source = broker.ensure_consumer("loki-consumer", "logs.>").unwrap();

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move {
        Forwarder::new(Arc::new(sink), config)
            .run(source, token)
            .await
    });
    (shutdown, handle)
}

async fn pushed_bodies(server: &MockServer, expected: usize) -> Vec<Value> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let requests = server.received_requests().await.unwrap_or_default();
            if requests.len() >= expected {
                return requests
                    .iter()
                    .map(|r| serde_json::from_slice(&r.body).unwrap())
                    .collect::<Vec<Value>>();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Loki did not receive the expected pushes")
}

fn lines(body: &Value) -> Vec<LogRecord> {
    body["streams"]
        .as_array()
        .unwrap()
        .iter()
        .flat_map(|stream| stream["values"].as_array().unwrap().clone())
        .map(|value| serde_json::from_str(value[1].as_str().unwrap()).unwrap())
        .collect()
}

async fn send_get(app: &Router, uri: &str) -> String {
    let response = app
        .clone()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    response.headers()[TRACE_ID_HEADER]
        .to_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn test_captured_requests_reach_loki_grouped_by_trace() {
    let broker = broker();
    let server = loki(204).await;
    let app = app(&broker);

    let mut trace_ids = Vec::new();
    for _ in 0..3 {
        trace_ids.push(send_get(&app, "/ping").await);
    }

    let (shutdown, handle) = start_forwarder(&broker, &server, 100);
    let bodies = pushed_bodies(&server, 1).await;
    shutdown.cancel();
    let stats = handle.await.unwrap();

    assert_eq!(bodies.len(), 1);
    let streams = bodies[0]["streams"].as_array().unwrap();
    assert_eq!(streams.len(), 3);
    // Records are published as each response completes, so compare as sets
    let mut streamed: Vec<String> = streams
        .iter()
        .map(|stream| stream["stream"]["trace_id"].as_str().unwrap().to_string())
        .collect();
    streamed.sort();
    trace_ids.sort();
    assert_eq!(streamed, trace_ids);
    for stream in streams {
        assert_eq!(stream["stream"]["service"], "orders");
        assert_eq!(stream["stream"]["environment"], "staging");
    }

    let records = lines(&bodies[0]);
    assert!(records.iter().all(|r| r.path == "/ping" && r.status == 200));
    assert_eq!(stats.records_flushed, 3);
    assert_eq!(broker.pending_count(), 0);
}

#[tokio::test]
async fn test_binary_upload_reaches_loki_without_bodies() {
    let broker = broker();
    let server = loki(204).await;
    let app = app(&broker);

    let response = app
        .clone()
        .oneshot(
            Request::post("/upload")
                .header("content-type", "image/png")
                .body(Body::from(vec![1u8; 500]))
                .unwrap(),
        )
        .await
        .unwrap();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.len(), 500);

    let (shutdown, handle) = start_forwarder(&broker, &server, 100);
    let bodies = pushed_bodies(&server, 1).await;
    shutdown.cancel();
    handle.await.unwrap();

    let records = lines(&bodies[0]);
    assert_eq!(records.len(), 1);
    assert!(records[0].request_body.is_none());
    assert!(records[0].response_body.is_none());
}

#[tokio::test]
async fn test_rejected_batch_is_retried_per_record() {
    let broker = broker();
    let server = loki(500).await;
    let app = app(&broker);

    for _ in 0..3 {
        send_get(&app, "/ping").await;
    }

    let (shutdown, handle) = start_forwarder(&broker, &server, 3);
    let bodies = pushed_bodies(&server, 4).await;
    // Give the forwarder a moment to prove it sends nothing more
    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown.cancel();
    let stats = handle.await.unwrap();

    assert_eq!(server.received_requests().await.unwrap().len(), 4);
    assert_eq!(lines(&bodies[0]).len(), 3);
    for single in &bodies[1..] {
        let stream = &single["streams"][0];
        assert_eq!(stream["stream"]["method"], "GET");
        assert_eq!(stream["stream"]["status"], "200");
        assert_eq!(stream["values"].as_array().unwrap().len(), 1);
    }

    assert_eq!(stats.batch_failures, 1);
    assert_eq!(stats.records_dropped, 3);
    assert_eq!(stats.records_flushed, 0);
    // Acked before delivery, so nothing is redelivered
    assert_eq!(broker.pending_count(), 0);
    assert_eq!(broker.redeliver_unacked(), 0);
}

#[tokio::test]
async fn test_records_published_while_forwarder_runs() {
    let broker = broker();
    let server = loki(204).await;
    let app = app(&broker);

    let (shutdown, handle) = start_forwarder(&broker, &server, 2);
    send_get(&app, "/ping").await;
    send_get(&app, "/ping").await;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let requests = server.received_requests().await.unwrap_or_default();
            let delivered: usize = requests
                .iter()
                .map(|r| lines(&serde_json::from_slice(&r.body).unwrap()).len())
                .sum();
            if delivered == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("records were not delivered");
    shutdown.cancel();
    let stats = handle.await.unwrap();

    assert_eq!(stats.records_received, 2);
    assert_eq!(stats.records_flushed, 2);
}

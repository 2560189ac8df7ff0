//! LogTrace API - demo service wrapped in the capture middleware
//!
//! Every request is recorded and published to the durable log queue on
//! `logs.<SERVICE_NAME>`; spans are exported over OTLP when `OTLP_ENDPOINT`
//! is non-empty.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{middleware, Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info};

use logtrace::capture::{capture, CaptureState, RequestError};
use logtrace::config::Config;
use logtrace::queue::{JetStreamQueue, TopicConfig};
use logtrace::telemetry::{init_logging, shutdown_tracer, tracer_provider};

#[derive(Debug, Clone, Serialize)]
struct User {
    id: u64,
    name: &'static str,
    email: &'static str,
}

const USERS: [User; 2] = [
    User {
        id: 1,
        name: "Alice",
        email: "alice@example.com",
    },
    User {
        id: 2,
        name: "Bob",
        email: "bob@example.com",
    },
];

#[tokio::main]
async fn main() {
    init_logging();

    info!("Starting LogTrace API...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                service = %config.service_name,
                environment = %config.environment,
                port = config.port,
                nats_url = %config.nats_url,
                subject = %config.log_subject(),
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let provider = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => match tracer_provider(&config.service_name, endpoint) {
            Ok(provider) => Some(provider),
            Err(e) => {
                error!(error = %e, "Failed to initialize span export");
                std::process::exit(1);
            }
        },
        None => {
            info!("Span export disabled");
            None
        }
    };

    let mut queue = match JetStreamQueue::connect(&config.nats_url, &config.service_name).await {
        Ok(queue) => queue,
        Err(e) => {
            error!(error = %e, "Failed to connect to NATS");
            std::process::exit(1);
        }
    };
    if let Err(e) = queue.ensure_topic(&TopicConfig::from_config(&config)).await {
        error!(error = %e, "Failed to set up topic");
        std::process::exit(1);
    }
    let queue = Arc::new(queue);

    let mut state = CaptureState::new(queue.clone(), &config.service_name, &config.environment);
    if let Some(provider) = &provider {
        state = state.with_tracer_provider(provider.clone());
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %addr, "Failed to bind listener");
            std::process::exit(1);
        }
    };

    info!(addr = %addr, "LogTrace API listening. Press Ctrl+C to stop.");
    let served = axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;
    if let Err(e) = served {
        error!(error = %e, "Server error");
    }

    queue.close().await;
    if let Some(provider) = &provider {
        shutdown_tracer(provider);
    }
    info!("LogTrace API stopped");
}

fn router(state: CaptureState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/api/v1/users", get(list_users).post(create_user))
        .route("/api/v1/users/:id", get(get_user))
        .route("/api/v1/error", get(fail))
        .layer(middleware::from_fn_with_state(state, capture))
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping..."),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }
}

async fn ping() -> &'static str {
    "pong"
}

async fn list_users() -> Json<Vec<User>> {
    Json(USERS.to_vec())
}

async fn get_user(Path(id): Path<u64>) -> Response {
    match USERS.iter().find(|user| user.id == id) {
        Some(user) => Json(user.clone()).into_response(),
        None => {
            let message = format!("user {} not found", id);
            let mut response =
                (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response();
            response.extensions_mut().insert(RequestError::new(message));
            response
        }
    }
}

async fn create_user(Json(user): Json<Value>) -> (StatusCode, Json<Value>) {
    (StatusCode::CREATED, Json(user))
}

async fn fail() -> Response {
    let message = "simulated internal error";
    let mut response = (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message })),
    )
        .into_response();
    response.extensions_mut().insert(RequestError::new(message));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use logtrace::queue::{FetchOutcome, LogSource, MemoryBroker, StorageKind};
    use logtrace::record::LogRecord;
    use logtrace::TRACE_ID_HEADER;
    use std::time::Duration;
    use tower::ServiceExt;

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
        router(CaptureState::new(Arc::new(broker.clone()), "demo", "test"))
    }

    async fn last_record(broker: &MemoryBroker) -> LogRecord {
        let mut source = broker.ensure_consumer("test", "logs.demo").unwrap();
        match source.fetch_batch(100, Duration::from_secs(1)).await.unwrap() {
            FetchOutcome::Messages(deliveries) => {
                LogRecord::from_bytes(&deliveries.last().unwrap().payload).unwrap()
            }
            FetchOutcome::Timeout => panic!("no record published"),
        }
    }

    #[tokio::test]
    async fn test_ping() {
        let broker = broker();
        let response = app(&broker)
            .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(TRACE_ID_HEADER));
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, "pong");
    }

    #[tokio::test]
    async fn test_get_user_not_found_records_error() {
        let broker = broker();
        let response = app(&broker)
            .oneshot(Request::get("/api/v1/users/42").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        drop(response);
        let record = last_record(&broker).await;
        assert_eq!(record.status, 404);
        assert_eq!(record.error.as_deref(), Some("user 42 not found"));
    }

    #[tokio::test]
    async fn test_create_user_echoes_body() {
        let broker = broker();
        let payload = r#"{"name":"Carol"}"#;
        let response = app(&broker)
            .oneshot(
                Request::post("/api/v1/users")
                    .header("content-type", "application/json")
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, payload);

        let record = last_record(&broker).await;
        assert_eq!(record.request_body.as_deref(), Some(payload));
        assert_eq!(record.response_body.as_deref(), Some(payload));
    }

    #[tokio::test]
    async fn test_error_route() {
        let broker = broker();
        let response = app(&broker)
            .oneshot(Request::get("/api/v1/error").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        drop(response);
        let record = last_record(&broker).await;
        assert_eq!(record.error.as_deref(), Some("simulated internal error"));
    }
}

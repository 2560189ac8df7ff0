//! Process logging and distributed-trace span export.
//!
//! The tracer provider is built explicitly and handed to the components that
//! start spans; nothing is installed globally.

use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::span_processor_with_async_runtime::BatchSpanProcessor;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to build span exporter: {0}")]
    Exporter(String),
}

/// Initialize the tracing subscriber with environment-based filtering.
///
/// `RUST_LOG` overrides the default `info` level.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Build a tracer provider exporting spans over OTLP/HTTP to `endpoint`.
///
/// Must be called inside a tokio runtime; the batch processor runs on it.
pub fn tracer_provider(
    service_name: &str,
    endpoint: &str,
) -> Result<SdkTracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter(e.to_string()))?;

    let processor = BatchSpanProcessor::builder(exporter, runtime::Tokio).build();

    let provider = SdkTracerProvider::builder()
        .with_span_processor(processor)
        .with_resource(
            Resource::builder()
                .with_service_name(service_name.to_string())
                .build(),
        )
        .build();

    info!(endpoint = %endpoint, service = %service_name, "Span export enabled");
    Ok(provider)
}

/// Flush pending spans and stop the exporter.
pub fn shutdown_tracer(provider: &SdkTracerProvider) {
    if let Err(e) = provider.shutdown() {
        warn!(error = %e, "Error shutting down tracer provider");
    }
}

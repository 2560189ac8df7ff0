//! LogTrace Consumer - drains the durable log queue into Loki
//!
//! Pulls captured request records from the NATS JetStream topic, batches
//! them, and pushes each batch to the Loki push API.
//!
//! ## Features
//!
//! - Durable pull consumer with explicit acknowledgment
//! - Size-based and age-based batch flushing
//! - Per-record fallback when Loki rejects a batch
//! - Graceful shutdown on Ctrl+C with a final flush
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `NATS_URL`: Broker URL (default: nats://localhost:4222)
//! - `NATS_STREAM` / `NATS_SUBJECT`: Topic name and subject filter (default: logs / logs.>)
//! - `NATS_CONSUMER`: Durable consumer name (default: loki-consumer)
//! - `LOKI_URL`: Loki push endpoint (default: http://localhost:3100/loki/api/v1/push)
//! - `BATCH_SIZE`: Records per batch (default: 100)
//! - `BATCH_TIMEOUT_MS`: Maximum batch age in milliseconds (default: 1000)
//! - `FETCH_WAIT_MS`: Wait per fetch in milliseconds (default: 500)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use logtrace::config::Config;
use logtrace::forwarder::{Forwarder, ForwarderConfig};
use logtrace::queue::{JetStreamQueue, TopicConfig};
use logtrace::sink::LokiClient;
use logtrace::telemetry::init_logging;

/// Name the consumer connection reports to the broker
const CONNECTION_NAME: &str = "logtrace-consumer";

/// Upper bound on the time allowed for the final flush
const MAX_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    init_logging();

    info!("Starting LogTrace consumer...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                nats_url = %config.nats_url,
                stream = %config.stream_name,
                consumer = %config.consumer_name,
                loki_url = %config.loki_url,
                batch_size = config.batch_size,
                batch_timeout_ms = config.batch_timeout.as_millis() as u64,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let mut queue = match JetStreamQueue::connect(&config.nats_url, CONNECTION_NAME).await {
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

    let source = match queue
        .ensure_consumer(&config.consumer_name, config.filter_subject())
        .await
    {
        Ok(source) => source,
        Err(e) => {
            error!(error = %e, "Failed to set up consumer");
            std::process::exit(1);
        }
    };

    let sink = match LokiClient::new(&config) {
        Ok(client) => {
            info!(push_url = %client.push_url(), "Loki client initialized");
            Arc::new(client)
        }
        Err(e) => {
            error!(error = %e, "Failed to create Loki client");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let forwarder = Forwarder::new(sink, ForwarderConfig::from_config(&config));
    let token = shutdown.clone();
    let mut forwarder_handle =
        tokio::spawn(async move { forwarder.run(source, token).await });

    info!("LogTrace consumer running. Press Ctrl+C to stop.");
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Shutdown signal received, stopping..."),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
        }
        result = &mut forwarder_handle => {
            // Only reachable if the forwarder task died on its own
            error!(result = ?result.map(|_| ()), "Forwarder stopped unexpectedly");
            queue.close().await;
            std::process::exit(1);
        }
    }

    shutdown.cancel();

    let grace = shutdown_grace(&config);
    match tokio::time::timeout(grace, forwarder_handle).await {
        Ok(Ok(stats)) => {
            info!(
                received = stats.records_received,
                flushed = stats.records_flushed,
                dropped = stats.records_dropped,
                poison = stats.poison_messages,
                "Forwarder shut down gracefully"
            );
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Forwarder task panicked during shutdown");
        }
        Err(_) => {
            warn!("Forwarder shutdown timed out after {:?}", grace);
        }
    }

    queue.close().await;
    info!("LogTrace consumer stopped");
}

/// Time for the pump to finish its current fetch and the batcher to flush.
fn shutdown_grace(config: &Config) -> Duration {
    (config.fetch_wait + config.batch_timeout + config.loki_timeout).min(MAX_SHUTDOWN_GRACE)
}

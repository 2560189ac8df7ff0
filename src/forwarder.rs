//! Batching forwarder from the durable queue to the storage sink.
//!
//! Two tasks cooperate:
//! - a fetch pump pulls messages from a [`LogSource`], decodes and acks them,
//!   and hands records to the batcher over a bounded channel;
//! - the batcher owns the pending batch and flushes it to a [`LogSink`] when
//!   it reaches `batch_size`, when its age deadline elapses, or when the pump
//!   stops.
//!
//! Messages are acknowledged as soon as they are decoded, before the sink has
//! accepted them. A batch that the sink rejects is retried record by record
//! once; records that still fail are dropped and logged.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::queue::{FetchOutcome, LogSource};
use crate::record::LogRecord;
use crate::sink::LogSink;

/// Base pause after a failed fetch before the pump tries again.
pub const FETCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on the random delay added to [`FETCH_ERROR_BACKOFF`].
const FETCH_ERROR_JITTER_MS: u64 = 250;

/// When the age deadline of a batch is (re)armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerPolicy {
    /// Armed by the first record entering an empty batch; later records do
    /// not move it.
    #[default]
    SinceFirstRecord,

    /// Re-armed by every record; a steady trickle defers the age flush
    /// until the batch fills.
    Debounced,
}

/// Configuration for the forwarder.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Records per flush, and the maximum fetched per pull
    pub batch_size: usize,

    /// Maximum age of a non-empty batch before it is flushed
    pub batch_timeout: Duration,

    /// How long one fetch waits for messages
    pub fetch_wait: Duration,

    pub timer_policy: TimerPolicy,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout: Duration::from_millis(1000),
            fetch_wait: Duration::from_millis(500),
            timer_policy: TimerPolicy::default(),
        }
    }
}

impl ForwarderConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.batch_size,
            batch_timeout: config.batch_timeout,
            fetch_wait: config.fetch_wait,
            timer_policy: TimerPolicy::default(),
        }
    }

    pub fn with_timer_policy(mut self, timer_policy: TimerPolicy) -> Self {
        self.timer_policy = timer_policy;
        self
    }
}

/// Counters reported when the forwarder stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    /// Records decoded and added to a batch
    pub records_received: u64,

    /// Records the sink accepted, in batches or individually
    pub records_flushed: u64,

    /// Flushes triggered by reaching `batch_size`
    pub size_flushes: u64,

    /// Flushes triggered by the age deadline
    pub time_flushes: u64,

    /// Final flushes on shutdown
    pub shutdown_flushes: u64,

    /// Payloads that failed to decode; acked and dropped
    pub poison_messages: u64,

    /// Batches the sink rejected
    pub batch_failures: u64,

    /// Records delivered individually after their batch was rejected
    pub fallback_delivered: u64,

    /// Records that failed individual delivery too
    pub records_dropped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTrigger {
    Size,
    Time,
    Shutdown,
}

impl FlushTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Time => "time",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

/// Drains a queue source into a storage sink in batches.
pub struct Forwarder {
    sink: Arc<dyn LogSink>,
    config: ForwarderConfig,
}

impl Forwarder {
    pub fn new(sink: Arc<dyn LogSink>, config: ForwarderConfig) -> Self {
        Self { sink, config }
    }

    /// Run until `shutdown` is cancelled, then flush what remains and return
    /// the final counters.
    pub async fn run<S>(&self, source: S, shutdown: CancellationToken) -> ForwarderStats
    where
        S: LogSource + 'static,
    {
        let batch_size = self.config.batch_size.max(1);
        let (tx, rx) = mpsc::channel(batch_size);

        info!(
            batch_size = batch_size,
            batch_timeout_ms = self.config.batch_timeout.as_millis() as u64,
            fetch_wait_ms = self.config.fetch_wait.as_millis() as u64,
            timer_policy = ?self.config.timer_policy,
            "Forwarder started"
        );

        let pump = tokio::spawn(run_pump(
            source,
            tx,
            batch_size,
            self.config.fetch_wait,
            shutdown,
        ));

        let mut stats = Batcher::new(self.sink.clone(), &self.config).run(rx).await;

        match pump.await {
            Ok(poison_messages) => stats.poison_messages = poison_messages,
            Err(e) => error!(error = %e, "Fetch pump task failed"),
        }

        info!(
            received = stats.records_received,
            flushed = stats.records_flushed,
            dropped = stats.records_dropped,
            poison = stats.poison_messages,
            "Forwarder stopped"
        );
        stats
    }
}

/// Fetch, decode and ack until cancelled. Returns the poison message count.
async fn run_pump<S: LogSource>(
    mut source: S,
    tx: mpsc::Sender<LogRecord>,
    batch_size: usize,
    fetch_wait: Duration,
    shutdown: CancellationToken,
) -> u64 {
    let mut poison_messages = 0;

    while !shutdown.is_cancelled() {
        let deliveries = match source.fetch_batch(batch_size, fetch_wait).await {
            Ok(FetchOutcome::Messages(deliveries)) => deliveries,
            Ok(FetchOutcome::Timeout) => continue,
            Err(e) => {
                let backoff = fetch_backoff();
                warn!(
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "Fetch failed, retrying"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(backoff) => continue,
                }
            }
        };

        debug!(count = deliveries.len(), "Fetched messages");

        for delivery in deliveries {
            let decoded = LogRecord::from_bytes(&delivery.payload);

            if let Err(e) = delivery.ack().await {
                warn!(error = %e, subject = %delivery.subject, "Failed to ack message");
            }

            match decoded {
                Ok(record) => {
                    if tx.send(record).await.is_err() {
                        warn!("Batcher closed, stopping fetch pump");
                        return poison_messages;
                    }
                }
                Err(e) => {
                    poison_messages += 1;
                    warn!(
                        error = %e,
                        subject = %delivery.subject,
                        bytes = delivery.payload.len(),
                        "Dropping undecodable message"
                    );
                }
            }
        }
    }

    debug!("Fetch pump stopped");
    poison_messages
}

fn fetch_backoff() -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=FETCH_ERROR_JITTER_MS);
    FETCH_ERROR_BACKOFF + Duration::from_millis(jitter)
}

/// Sole owner of the pending batch.
struct Batcher {
    sink: Arc<dyn LogSink>,
    batch: Vec<LogRecord>,
    batch_size: usize,
    batch_timeout: Duration,
    timer_policy: TimerPolicy,
    deadline: Option<Instant>,
    stats: ForwarderStats,
}

impl Batcher {
    fn new(sink: Arc<dyn LogSink>, config: &ForwarderConfig) -> Self {
        let batch_size = config.batch_size.max(1);
        Self {
            sink,
            batch: Vec::with_capacity(batch_size),
            batch_size,
            batch_timeout: config.batch_timeout,
            timer_policy: config.timer_policy,
            deadline: None,
            stats: ForwarderStats::default(),
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<LogRecord>) -> ForwarderStats {
        loop {
            // The sleep is built even while its branch is disabled
            let deadline = self.deadline.unwrap_or_else(Instant::now);

            tokio::select! {
                maybe_record = rx.recv() => {
                    match maybe_record {
                        Some(record) => {
                            if self.push(record) {
                                self.flush(FlushTrigger::Size).await;
                            }
                        }
                        None => {
                            if !self.batch.is_empty() {
                                info!(
                                    remaining = self.batch.len(),
                                    "Channel closed, flushing remaining records"
                                );
                                self.flush(FlushTrigger::Shutdown).await;
                            }
                            return self.stats;
                        }
                    }
                }

                _ = sleep_until(deadline), if self.deadline.is_some() => {
                    if !self.batch.is_empty() {
                        self.flush(FlushTrigger::Time).await;
                    } else {
                        self.deadline = None;
                    }
                }
            }
        }
    }

    /// Append a record and arm the deadline. Returns true when the batch is full.
    fn push(&mut self, record: LogRecord) -> bool {
        self.stats.records_received += 1;
        self.batch.push(record);

        match self.timer_policy {
            TimerPolicy::SinceFirstRecord => {
                if self.deadline.is_none() {
                    self.deadline = Some(Instant::now() + self.batch_timeout);
                }
            }
            TimerPolicy::Debounced => {
                self.deadline = Some(Instant::now() + self.batch_timeout);
            }
        }

        self.batch.len() >= self.batch_size
    }

    async fn flush(&mut self, trigger: FlushTrigger) {
        let records = std::mem::replace(&mut self.batch, Vec::with_capacity(self.batch_size));
        self.deadline = None;

        match trigger {
            FlushTrigger::Size => self.stats.size_flushes += 1,
            FlushTrigger::Time => self.stats.time_flushes += 1,
            FlushTrigger::Shutdown => self.stats.shutdown_flushes += 1,
        }

        debug!(
            batch_size = records.len(),
            trigger = trigger.as_str(),
            "Flushing batch"
        );

        match self.sink.send_batch(&records).await {
            Ok(()) => {
                self.stats.records_flushed += records.len() as u64;
                info!(
                    records = records.len(),
                    trigger = trigger.as_str(),
                    "Batch delivered"
                );
            }
            Err(e) => {
                self.stats.batch_failures += 1;
                warn!(
                    error = %e,
                    records = records.len(),
                    "Batch rejected, delivering records individually"
                );
                for record in &records {
                    self.deliver_one(record).await;
                }
            }
        }
    }

    async fn deliver_one(&mut self, record: &LogRecord) {
        match self.sink.send_one(record).await {
            Ok(()) => {
                self.stats.records_flushed += 1;
                self.stats.fallback_delivered += 1;
                debug!(trace_id = %record.trace_id, "Record delivered individually");
            }
            Err(e) => {
                self.stats.records_dropped += 1;
                error!(
                    error = %e,
                    trace_id = %record.trace_id,
                    path = %record.path,
                    "Dropping record after individual delivery failed"
                );
            }
        }
    }
}

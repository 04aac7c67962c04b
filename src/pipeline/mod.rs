//! Frame processing pipeline.
//!
//! Pulls deliveries from the [`FrameSource`], runs each one through its own
//! task (`received → inferring → persisting → terminal`), and drives the
//! ack / nack / dead-letter decision from the typed outcome of every stage.
//! A delivery is acknowledged only after its result or its dead-letter entry
//! is durable. Every settled delivery gets a status reply.

mod job;

use std::sync::Arc;
use std::time::Duration;
use strum::IntoStaticStr;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

use crate::config::AppConfig;
use crate::models::frame::Delivery;
use crate::services::dead_letter::DeadLetterSink;
use crate::services::inference::InferenceEngine;
use crate::services::queue::FrameSource;
use crate::services::result_store::ResultStore;
use crate::services::retry::RetryPolicy;
use crate::services::status::StatusPublisher;

/// After the grace period, how long force-requeueing tasks get to settle
/// before they are aborted.
const FORCE_SETTLE_LIMIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Longest a single receive call waits for a delivery. A receive in
    /// progress is never abandoned, so this also bounds how long shutdown
    /// waits before draining.
    pub receive_timeout: Duration,
    /// Longest resolving a payload reference may take.
    pub payload_timeout: Duration,
    /// Time in-flight jobs get to finish after shutdown is requested.
    pub shutdown_grace: Duration,
    /// Deliveries held at once. Pulling pauses when this many are in flight.
    pub max_in_flight: usize,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            receive_timeout: config.receive_timeout(),
            payload_timeout: config.payload_timeout(),
            shutdown_grace: config.shutdown_grace(),
            max_in_flight: config.prefetch.max(config.inference_concurrency),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(5),
            payload_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
            max_in_flight: 8,
        }
    }
}

/// Where a job's task left it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Terminal {
    Acknowledged,
    /// Result committed but every ack try failed. The delivery stays held
    /// until recovery and resolves as a conflict when redelivered.
    Unacknowledged,
    DeadLettered,
    Dropped,
    /// Handed back to the queue for a later attempt: shutdown during backoff,
    /// a delivery received after shutdown, or an unavailable dead-letter sink.
    Requeued,
    /// Still inferring or persisting when the grace period ran out.
    ForceRequeued,
}

/// Tally of how every job taken during a run ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub acknowledged: usize,
    pub unacknowledged: usize,
    pub dead_lettered: usize,
    pub dropped: usize,
    pub requeued: usize,
    pub force_requeued: usize,
    /// Tasks that panicked or had to be aborted; their deliveries are
    /// recovered from the processing list.
    pub abandoned: usize,
}

impl DrainReport {
    /// True when nothing had to be cut short at shutdown.
    pub fn is_clean(&self) -> bool {
        self.force_requeued == 0 && self.abandoned == 0
    }

    fn record(&mut self, terminal: Terminal) {
        let label: &'static str = terminal.into();
        metrics::counter!("frames_terminal_total", "outcome" => label).increment(1);
        match terminal {
            Terminal::Acknowledged => self.acknowledged += 1,
            Terminal::Unacknowledged => self.unacknowledged += 1,
            Terminal::DeadLettered => self.dead_lettered += 1,
            Terminal::Dropped => self.dropped += 1,
            Terminal::Requeued => self.requeued += 1,
            Terminal::ForceRequeued => self.force_requeued += 1,
        }
    }

    fn record_join(&mut self, joined: Result<Terminal, JoinError>) {
        match joined {
            Ok(terminal) => self.record(terminal),
            Err(e) => {
                tracing::error!(error = %e, "Frame job task did not complete");
                self.abandoned += 1;
            }
        }
    }
}

pub struct ProcessingPipeline {
    source: Arc<dyn FrameSource>,
    engine: Arc<InferenceEngine>,
    store: Arc<dyn ResultStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    status: Arc<dyn StatusPublisher>,
    retry: RetryPolicy,
    settings: PipelineSettings,
}

impl ProcessingPipeline {
    pub fn new(
        source: Arc<dyn FrameSource>,
        engine: Arc<InferenceEngine>,
        store: Arc<dyn ResultStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
        status: Arc<dyn StatusPublisher>,
        retry: RetryPolicy,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            engine,
            store,
            dead_letters,
            status,
            retry,
            settings,
        }
    }

    /// Process deliveries until `shutdown` fires, then drain.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> DrainReport {
        let mut report = DrainReport::default();
        self.recover("startup").await;

        let force = CancellationToken::new();
        let mut tasks: JoinSet<Terminal> = JoinSet::new();
        let mut transport_failures: u32 = 0;

        tracing::info!(
            max_in_flight = self.settings.max_in_flight,
            accelerator_slots = self.engine.capacity(),
            "Frame pipeline started"
        );

        loop {
            while let Some(joined) = tasks.try_join_next() {
                report.record_join(joined);
            }

            if tasks.len() >= self.settings.max_in_flight {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    Some(joined) = tasks.join_next() => {
                        report.record_join(joined);
                        continue;
                    }
                }
            }

            if shutdown.is_cancelled() {
                break;
            }

            // Not raced against shutdown: a blocking pop dropped mid-flight
            // still completes on the server, leaving a delivery in the
            // processing list that nothing owns.
            let received = self.source.receive(self.settings.receive_timeout).await;

            match received {
                Ok(None) => {
                    transport_failures = 0;
                    tracing::trace!("No frames within receive timeout");
                }
                Ok(Some(delivery)) => {
                    transport_failures = 0;
                    metrics::counter!("frames_received_total").increment(1);
                    if shutdown.is_cancelled() {
                        tracing::info!("Frame received after shutdown was requested, handing it back");
                        report.record(self.requeue(delivery.tag(), Terminal::Requeued).await);
                        break;
                    }
                    self.spawn_job(&mut tasks, delivery, &shutdown, &force);
                }
                Err(e) => {
                    transport_failures = transport_failures.saturating_add(1);
                    let delay = self.retry.backoff(transport_failures);
                    tracing::warn!(
                        error = %e,
                        consecutive_failures = transport_failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "Frame queue unavailable, reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        tracing::info!(
            in_flight = tasks.len(),
            grace_ms = self.settings.shutdown_grace.as_millis() as u64,
            "Shutdown requested, draining in-flight frames"
        );
        self.drain(tasks, &force, &mut report).await;

        // Returns deliveries whose ack or requeue never landed.
        self.recover("shutdown").await;

        tracing::info!(?report, "Frame pipeline stopped");
        report
    }

    fn spawn_job(
        self: &Arc<Self>,
        tasks: &mut JoinSet<Terminal>,
        delivery: Delivery,
        shutdown: &CancellationToken,
        force: &CancellationToken,
    ) {
        let span = match &delivery {
            Delivery::Frame(job) => info_span!(
                "frame_job",
                job_id = %job.job_id,
                stream_id = %job.stream_id,
                sequence_number = job.sequence_number,
            ),
            Delivery::Malformed(m) => info_span!(
                "frame_job",
                job_id = m.job_id.as_deref().unwrap_or("unknown"),
                malformed = true,
            ),
        };

        let pipeline = Arc::clone(self);
        let shutdown = shutdown.clone();
        let force = force.clone();
        tasks.spawn(
            async move { pipeline.handle(delivery, &shutdown, &force).await }.instrument(span),
        );
    }

    async fn drain(&self, mut tasks: JoinSet<Terminal>, force: &CancellationToken, report: &mut DrainReport) {
        let grace = tokio::time::sleep(self.settings.shutdown_grace);
        tokio::pin!(grace);

        loop {
            tokio::select! {
                _ = &mut grace => break,
                joined = tasks.join_next() => match joined {
                    Some(joined) => report.record_join(joined),
                    None => return,
                },
            }
        }

        tracing::warn!(
            remaining = tasks.len(),
            "Grace period elapsed, force-requeueing in-flight frames"
        );
        force.cancel();

        let settle = async {
            while let Some(joined) = tasks.join_next().await {
                report.record_join(joined);
            }
        };
        if tokio::time::timeout(FORCE_SETTLE_LIMIT, settle).await.is_err() {
            tracing::error!(remaining = tasks.len(), "Frame jobs did not settle after force-requeue, aborting");
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                report.record_join(joined);
            }
        }
    }

    async fn recover(&self, phase: &str) {
        match self.source.recover_in_flight().await {
            Ok(0) => {}
            Ok(moved) => tracing::info!(moved, phase, "Returned unacknowledged frames to the queue"),
            Err(e) => tracing::warn!(error = %e, phase, "Could not return unacknowledged frames to the queue"),
        }
    }
}

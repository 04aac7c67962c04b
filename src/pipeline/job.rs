use chrono::Utc;
use std::fmt::Display;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{ProcessingPipeline, Terminal};
use crate::models::frame::{Delivery, DeliveryTag, FrameJob, MalformedDelivery};
use crate::models::job::DeadLetterRecord;
use crate::models::outcome::{Failure, FailureKind, ProcessingOutcome};
use crate::models::status::{FrameState, FrameStatus};
use crate::services::result_store::PersistOutcome;
use crate::services::retry::RetryDecision;

/// Tries for a broker or sink write that settles a job (ack, requeue,
/// dead-letter) before giving up on it.
const SETTLE_ATTEMPTS: u32 = 3;

/// How one attempt at a frame ended.
enum Attempt {
    /// Outcome and the number of detections submitted.
    Persisted(PersistOutcome, usize),
    Failed(Failure),
}

impl ProcessingPipeline {
    pub(super) async fn handle(
        &self,
        delivery: Delivery,
        shutdown: &CancellationToken,
        force: &CancellationToken,
    ) -> Terminal {
        match delivery {
            Delivery::Frame(job) => self.process(job, shutdown, force).await,
            Delivery::Malformed(malformed) => self.reject_malformed(malformed).await,
        }
    }

    async fn process(&self, job: FrameJob, shutdown: &CancellationToken, force: &CancellationToken) -> Terminal {
        let mut attempt: u32 = 1;
        loop {
            let result = tokio::select! {
                biased;
                _ = force.cancelled() => {
                    tracing::warn!(attempt, "Grace period over mid-attempt, requeueing frame");
                    return self.requeue(&job.delivery_tag, Terminal::ForceRequeued).await;
                }
                result = self.attempt(&job, attempt) => result,
            };

            let failure = match result {
                Attempt::Persisted(outcome, detections) => return self.acknowledge(&job, outcome, detections).await,
                Attempt::Failed(failure) => failure,
            };

            match self.retry.decide(failure.kind, attempt) {
                RetryDecision::Retry(delay) => {
                    tracing::warn!(
                        attempt,
                        kind = %failure.kind,
                        reason = %failure.reason,
                        retry_in_ms = delay.as_millis() as u64,
                        "Frame attempt failed, retrying"
                    );
                    metrics::counter!("frame_retries_total", "kind" => failure.kind.as_ref().to_string()).increment(1);
                    if let Err(e) = self.store.mark_pending(&job, attempt, &failure.reason).await {
                        tracing::debug!(error = %e, "Could not record pending state");
                    }

                    tokio::select! {
                        biased;
                        _ = force.cancelled() => {
                            return self.requeue(&job.delivery_tag, Terminal::ForceRequeued).await;
                        }
                        _ = shutdown.cancelled() => {
                            tracing::info!(attempt, "Shutdown during backoff, returning frame to the queue");
                            return self.requeue(&job.delivery_tag, Terminal::Requeued).await;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                RetryDecision::DeadLetter => return self.dead_letter(&job, attempt, failure).await,
                RetryDecision::Drop => {
                    tracing::info!(
                        kind = %failure.kind,
                        reason = %failure.reason,
                        "Dropping frame with non-actionable failure"
                    );
                    if let Err(e) = self.store.mark_failed(&job, attempt, &failure.reason).await {
                        tracing::debug!(error = %e, "Could not record failed state");
                    }
                    self.ack(&job.delivery_tag).await;
                    self.publish(FrameStatus::failed(&job, FrameState::Dropped, &failure.reason)).await;
                    return Terminal::Dropped;
                }
            }
        }
    }

    /// `inferring → persisting` for one attempt.
    async fn attempt(&self, job: &FrameJob, attempt: u32) -> Attempt {
        let fetched = tokio::time::timeout(self.settings.payload_timeout, self.source.fetch_frame(job)).await;
        let bytes = match fetched {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => return Attempt::Failed(Failure::new(e.kind(), e.to_string())),
            Err(_) => {
                return Attempt::Failed(Failure::new(
                    FailureKind::Transport,
                    format!("payload not resolved within {:?}", self.settings.payload_timeout),
                ))
            }
        };

        let outcome = match self.engine.infer(job, bytes).await {
            Ok(detections) => ProcessingOutcome::Success(detections),
            Err(e) => Failure::new(e.kind(), e.to_string()).into(),
        };

        let detections = match outcome {
            ProcessingOutcome::Success(detections) => detections,
            ProcessingOutcome::TransientFailure(f) | ProcessingOutcome::PermanentFailure(f) => {
                return Attempt::Failed(f)
            }
        };
        tracing::debug!(attempt, detections = detections.len(), "Inference complete");

        match self.store.persist(job, attempt, &detections).await {
            Ok(outcome) => Attempt::Persisted(outcome, detections.len()),
            Err(e) => Attempt::Failed(Failure::new(e.kind(), e.to_string())),
        }
    }

    async fn acknowledge(&self, job: &FrameJob, outcome: PersistOutcome, detections: usize) -> Terminal {
        let status = match outcome {
            PersistOutcome::Committed => {
                tracing::info!(detections, "Frame results committed");
                FrameStatus::committed(job, detections)
            }
            PersistOutcome::Conflict => {
                metrics::counter!("frame_conflicts_total").increment(1);
                tracing::info!("Frame already processed, acknowledging duplicate delivery");
                FrameStatus::duplicate(job)
            }
        };
        let acked = self.ack(&job.delivery_tag).await;
        // The commit is durable either way.
        self.publish(status).await;
        if acked {
            Terminal::Acknowledged
        } else {
            Terminal::Unacknowledged
        }
    }

    async fn dead_letter(&self, job: &FrameJob, attempt: u32, failure: Failure) -> Terminal {
        let record = DeadLetterRecord {
            id: Uuid::new_v4(),
            job_id: job.job_id.clone(),
            stream_id: job.stream_id.clone(),
            sequence_number: Some(job.sequence_number),
            failure_kind: failure.kind,
            reason: failure.reason.clone(),
            attempt_count: attempt,
            timestamp: Utc::now(),
            payload_excerpt: None,
        };

        if !self.write_dead_letter(&record).await {
            return self.requeue(&job.delivery_tag, Terminal::Requeued).await;
        }
        if let Err(e) = self.store.mark_failed(job, attempt, &failure.reason).await {
            tracing::debug!(error = %e, "Could not record failed state");
        }
        self.ack(&job.delivery_tag).await;
        self.publish(FrameStatus::failed(job, FrameState::DeadLettered, &failure.reason)).await;
        Terminal::DeadLettered
    }

    async fn reject_malformed(&self, malformed: MalformedDelivery) -> Terminal {
        tracing::warn!(reason = %malformed.reason, "Rejecting malformed frame message");

        if self.retry.decide(FailureKind::Data, 1) == RetryDecision::Drop {
            self.ack(&malformed.delivery_tag).await;
            self.publish(FrameStatus::rejected(&malformed, FrameState::Dropped)).await;
            return Terminal::Dropped;
        }

        let unknown = || "unknown".to_string();
        let record = DeadLetterRecord {
            id: Uuid::new_v4(),
            job_id: malformed.job_id.clone().unwrap_or_else(unknown),
            stream_id: malformed.stream_id.clone().unwrap_or_else(unknown),
            sequence_number: malformed.sequence_number,
            failure_kind: FailureKind::Data,
            reason: malformed.reason.clone(),
            attempt_count: 1,
            timestamp: Utc::now(),
            payload_excerpt: Some(malformed.excerpt.clone()),
        };

        if !self.write_dead_letter(&record).await {
            return self.requeue(&malformed.delivery_tag, Terminal::Requeued).await;
        }
        self.ack(&malformed.delivery_tag).await;
        self.publish(FrameStatus::rejected(&malformed, FrameState::DeadLettered)).await;
        Terminal::DeadLettered
    }

    async fn write_dead_letter(&self, record: &DeadLetterRecord) -> bool {
        match self.settle("dead-letter", || self.dead_letters.record(record)).await {
            Ok(()) => {
                metrics::counter!("frames_dead_lettered_total", "kind" => record.failure_kind.as_ref().to_string())
                    .increment(1);
                tracing::warn!(
                    dead_letter_id = %record.id,
                    kind = %record.failure_kind,
                    reason = %record.reason,
                    attempts = record.attempt_count,
                    "Frame dead-lettered"
                );
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Dead-letter sink unavailable, requeueing frame");
                false
            }
        }
    }

    /// Ack after the result is durable. On failure the delivery stays in the
    /// processing list and its redelivery resolves as a conflict.
    async fn ack(&self, tag: &DeliveryTag) -> bool {
        match self.settle("ack", || self.source.ack(tag)).await {
            Ok(()) => true,
            Err(e) => {
                metrics::counter!("frame_ack_failures_total").increment(1);
                tracing::error!(error = %e, "Could not acknowledge frame, it will be redelivered");
                false
            }
        }
    }

    /// Best effort: a lost reply never changes how the frame settled.
    async fn publish(&self, status: FrameStatus) {
        if let Err(e) = self.status.publish(&status).await {
            metrics::counter!("frame_status_failures_total").increment(1);
            tracing::warn!(error = %e, code = status.code, "Could not publish frame status");
        }
    }

    pub(super) async fn requeue(&self, tag: &DeliveryTag, terminal: Terminal) -> Terminal {
        if let Err(e) = self.settle("requeue", || self.source.nack(tag, true)).await {
            tracing::error!(error = %e, "Could not requeue frame, leaving it for recovery");
        }
        terminal
    }

    async fn settle<F, Fut, E>(&self, op: &str, mut call: F) -> Result<(), E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let mut tries = 1;
        loop {
            match call().await {
                Ok(()) => return Ok(()),
                Err(e) if tries >= SETTLE_ATTEMPTS => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, op, tries, "Settling frame failed, retrying");
                    tokio::time::sleep(self.retry.backoff(tries)).await;
                    tries += 1;
                }
            }
        }
    }
}

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::{Duration, Instant};

use crate::db::queries;
use crate::models::detection::Detection;
use crate::models::frame::FrameJob;
use crate::models::job::JobState;
use crate::models::outcome::FailureKind;

/// How a successful `persist` call resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Detections and the `processed` transition committed together.
    Committed,
    /// The frame was already `processed`; nothing was written.
    Conflict,
}

/// Transactional store for detections and job status bookkeeping.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Atomically write the detections and mark the frame `processed`.
    async fn persist(&self, job: &FrameJob, attempt: u32, detections: &[Detection]) -> Result<PersistOutcome, StoreError>;

    /// Note that the frame is waiting for another attempt.
    async fn mark_pending(&self, job: &FrameJob, attempt: u32, reason: &str) -> Result<(), StoreError>;

    /// Note that the frame was dead-lettered.
    async fn mark_failed(&self, job: &FrameJob, attempt: u32, reason: &str) -> Result<(), StoreError>;
}

/// [`ResultStore`] over a bounded PostgreSQL pool.
#[derive(Clone)]
pub struct PgResultStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgResultStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn persist_inner(&self, job: &FrameJob, attempt: u32, detections: &[Detection]) -> Result<PersistOutcome, StoreError> {
        // The transaction rolls back when dropped uncommitted, including on
        // timeout, and its connection returns to the pool.
        let mut tx = self.pool.begin().await?;

        if !queries::claim_processed(&mut *tx, job, attempt_i32(attempt)).await? {
            tx.rollback().await?;
            return Ok(PersistOutcome::Conflict);
        }

        let inserted = queries::insert_detections(&mut *tx, detections).await?;
        if inserted != detections.len() as u64 {
            return Err(StoreError::Integrity(format!(
                "inserted {} of {} detections",
                inserted,
                detections.len()
            )));
        }

        queries::raise_stream_progress(&mut *tx, &job.stream_id, job.sequence_number).await?;
        tx.commit().await?;
        Ok(PersistOutcome::Committed)
    }

    async fn record(&self, job: &FrameJob, state: JobState, attempt: u32, reason: &str) -> Result<(), StoreError> {
        let write = queries::record_attempt(&self.pool, job, state, attempt_i32(attempt), Some(reason));
        tokio::time::timeout(self.timeout, write)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))??;
        Ok(())
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    async fn persist(&self, job: &FrameJob, attempt: u32, detections: &[Detection]) -> Result<PersistOutcome, StoreError> {
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.persist_inner(job, attempt, detections))
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?;
        metrics::histogram!("persist_seconds").record(start.elapsed().as_secs_f64());
        outcome
    }

    async fn mark_pending(&self, job: &FrameJob, attempt: u32, reason: &str) -> Result<(), StoreError> {
        self.record(job, JobState::Pending, attempt, reason).await
    }

    async fn mark_failed(&self, job: &FrameJob, attempt: u32, reason: &str) -> Result<(), StoreError> {
        self.record(job, JobState::Failed, attempt, reason).await
    }
}

fn attempt_i32(attempt: u32) -> i32 {
    i32::try_from(attempt).unwrap_or(i32::MAX)
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database did not respond within {0:?}")]
    Timeout(Duration),

    #[error("Data integrity violation: {0}")]
    Integrity(String),
}

impl StoreError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StoreError::Database(e) => classify_sqlx(e),
            StoreError::Timeout(_) => FailureKind::Capacity,
            StoreError::Integrity(_) => FailureKind::Data,
        }
    }
}

/// Sort a driver error into the failure taxonomy by SQLSTATE class.
pub fn classify_sqlx(err: &sqlx::Error) -> FailureKind {
    match err {
        sqlx::Error::PoolTimedOut => FailureKind::Capacity,
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed | sqlx::Error::Protocol(_) => {
            FailureKind::Transport
        }
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some(code) => classify_sqlstate(code),
            None => FailureKind::Transport,
        },
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::RowNotFound => FailureKind::Data,
        _ => FailureKind::Transport,
    }
}

fn classify_sqlstate(code: &str) -> FailureKind {
    match code.get(..2) {
        // connection exception, serialization failure / deadlock, operator intervention
        Some("08") | Some("40") | Some("57") => FailureKind::Transport,
        // insufficient resources, program limit exceeded
        Some("53") | Some("54") => FailureKind::Capacity,
        // data exception, integrity constraint violation, and anything else
        _ => FailureKind::Data,
    }
}

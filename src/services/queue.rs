use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Script};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::models::frame::{Delivery, DeliveryTag, FrameEnvelope, FrameJob, PayloadRef};
use crate::models::outcome::FailureKind;
use crate::services::storage::{BlobStore, StorageError};

/// Longest a single blocking pop waits before the deadline is checked again.
const MAX_BLOCK: Duration = Duration::from_secs(1);

/// Remove the delivery from the processing list and, only if it was still
/// there, hand it back to the consumer end of the queue.
const REQUEUE_SCRIPT: &str = r#"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 1 then
    return redis.call('RPUSH', KEYS[2], ARGV[1])
end
return 0
"#;

/// Durable inbound queue of frame-jobs with manual acknowledgement.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Wait up to `wait` for the next delivery, `None` when nothing arrived.
    /// Messages that fail to parse are returned as [`Delivery::Malformed`],
    /// never skipped.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, SourceError>;

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), SourceError>;

    async fn nack(&self, tag: &DeliveryTag, requeue: bool) -> Result<(), SourceError>;

    /// Resolve the job's payload reference to encoded frame bytes.
    async fn fetch_frame(&self, job: &FrameJob) -> Result<Vec<u8>, SourceError>;

    /// Return deliveries left unacknowledged by a previous run of this worker
    /// to the queue. Returns how many were moved.
    async fn recover_in_flight(&self) -> Result<usize, SourceError>;
}

/// Redis reliable queue: producers `LPUSH` envelopes, this worker `BLMOVE`s
/// them into its own processing list until they are acked.
pub struct RedisFrameSource {
    client: redis::Client,
    commands: ConnectionManager,
    blocking: Mutex<Option<MultiplexedConnection>>,
    queue_key: String,
    processing_key: String,
    requeue: Script,
    blobs: Option<Arc<BlobStore>>,
}

impl RedisFrameSource {
    pub async fn connect(
        redis_url: &str,
        queue_key: &str,
        worker_id: &str,
        blobs: Option<Arc<BlobStore>>,
    ) -> Result<Self, SourceError> {
        let client = redis::Client::open(redis_url)?;
        let commands = client.get_connection_manager().await?;

        Ok(Self {
            client,
            commands,
            blocking: Mutex::new(None),
            queue_key: queue_key.to_string(),
            processing_key: format!("{}:processing:{}", queue_key, worker_id),
            requeue: Script::new(REQUEUE_SCRIPT),
            blobs,
        })
    }

    pub fn processing_key(&self) -> &str {
        &self.processing_key
    }

    /// Push a frame-job onto the queue. Used by producers and tests.
    pub async fn enqueue(&self, envelope: &FrameEnvelope) -> Result<(), SourceError> {
        let payload = envelope.encode().map_err(|e| SourceError::Encode(e.to_string()))?;
        let mut conn = self.commands.clone();
        conn.lpush::<_, _, ()>(&self.queue_key, payload).await?;
        Ok(())
    }

    /// Pending frame-jobs not yet picked up by any worker.
    pub async fn queue_depth(&self) -> Result<u64, SourceError> {
        let mut conn = self.commands.clone();
        Ok(conn.llen(&self.queue_key).await?)
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), SourceError> {
        let mut conn = self.commands.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    async fn pop_blocking(&self, block: Duration) -> Result<Option<String>, SourceError> {
        let mut guard = self.blocking.lock().await;
        if guard.is_none() {
            tracing::debug!(queue = %self.queue_key, "Opening blocking connection to frame queue");
            *guard = Some(self.client.get_multiplexed_async_connection().await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Ok(None);
        };

        let popped = redis::cmd("BLMOVE")
            .arg(&self.queue_key)
            .arg(&self.processing_key)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(block.as_secs_f64().max(0.01))
            .query_async::<Option<String>>(conn)
            .await;

        match popped {
            Ok(message) => Ok(message),
            Err(e) => {
                // Reconnect on the next call.
                *guard = None;
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl FrameSource for RedisFrameSource {
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, SourceError> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            if let Some(raw) = self.pop_blocking(remaining.min(MAX_BLOCK)).await? {
                return Ok(Some(Delivery::from_raw(raw)));
            }
        }
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), SourceError> {
        let mut conn = self.commands.clone();
        let removed: i64 = conn.lrem(&self.processing_key, 1, tag.as_str()).await?;
        if removed == 0 {
            tracing::warn!(processing = %self.processing_key, "Acked delivery was no longer in the processing list");
        }
        Ok(())
    }

    async fn nack(&self, tag: &DeliveryTag, requeue: bool) -> Result<(), SourceError> {
        let mut conn = self.commands.clone();
        if requeue {
            let _: i64 = self
                .requeue
                .key(&self.processing_key)
                .key(&self.queue_key)
                .arg(tag.as_str())
                .invoke_async(&mut conn)
                .await?;
        } else {
            conn.lrem::<_, _, ()>(&self.processing_key, 1, tag.as_str()).await?;
        }
        Ok(())
    }

    async fn fetch_frame(&self, job: &FrameJob) -> Result<Vec<u8>, SourceError> {
        match &job.payload_ref {
            PayloadRef::Inline { data } => Ok(data.clone()),
            PayloadRef::Blob { key } => match &self.blobs {
                Some(blobs) => Ok(blobs.download(key).await?),
                None => Err(SourceError::NoBlobStore(key.clone())),
            },
        }
    }

    async fn recover_in_flight(&self) -> Result<usize, SourceError> {
        let mut conn = self.commands.clone();
        let mut moved = 0;
        // Newest first onto the consumer end, so the oldest is redelivered first.
        loop {
            let next: Option<String> = redis::cmd("LMOVE")
                .arg(&self.processing_key)
                .arg(&self.queue_key)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            match next {
                Some(_) => moved += 1,
                None => return Ok(moved),
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Lost connection to frame queue: {0}")]
    ConnectionLost(#[from] redis::RedisError),

    #[error(transparent)]
    Payload(#[from] StorageError),

    #[error("Frame references blob '{0}' but no blob store is configured")]
    NoBlobStore(String),

    #[error("Failed to encode frame envelope: {0}")]
    Encode(String),
}

impl SourceError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SourceError::ConnectionLost(_) => FailureKind::Transport,
            SourceError::Payload(e) => e.kind(),
            SourceError::NoBlobStore(_) | SourceError::Encode(_) => FailureKind::Data,
        }
    }

    pub fn is_connection_lost(&self) -> bool {
        matches!(self, SourceError::ConnectionLost(_))
    }
}

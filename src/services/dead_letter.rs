use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::models::job::DeadLetterRecord;

/// Append-only destination for frames that will not be retried.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, entry: &DeadLetterRecord) -> Result<(), DeadLetterError>;
}

/// Dead-letter list in Redis, newest entry at the head. Operators replay an
/// entry by re-enqueuing the original frame message.
pub struct RedisDeadLetterSink {
    conn: ConnectionManager,
    key: String,
}

impl RedisDeadLetterSink {
    pub async fn connect(redis_url: &str, key: &str) -> Result<Self, DeadLetterError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            key: key.to_string(),
        })
    }

    /// Most recent entries, newest first.
    pub async fn recent(&self, count: isize) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(&self.key, 0, count.max(1) - 1).await?;
        raw.iter()
            .map(|entry| serde_json::from_str(entry).map_err(DeadLetterError::from))
            .collect()
    }
}

#[async_trait]
impl DeadLetterSink for RedisDeadLetterSink {
    async fn record(&self, entry: &DeadLetterRecord) -> Result<(), DeadLetterError> {
        let payload = serde_json::to_string(entry)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(&self.key, payload).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

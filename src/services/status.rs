use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::models::status::FrameStatus;

/// Destination for per-frame status replies.
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish(&self, status: &FrameStatus) -> Result<(), StatusError>;
}

/// Status replies as a capped Redis list, newest at the head. Consumers
/// `BRPOP` from the tail.
pub struct RedisStatusPublisher {
    conn: ConnectionManager,
    key: String,
    max_len: isize,
}

impl RedisStatusPublisher {
    pub async fn connect(redis_url: &str, key: &str, max_len: usize) -> Result<Self, StatusError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            key: key.to_string(),
            max_len: isize::try_from(max_len.max(1)).unwrap_or(isize::MAX),
        })
    }

    /// Most recent replies, newest first.
    pub async fn recent(&self, count: isize) -> Result<Vec<FrameStatus>, StatusError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(&self.key, 0, count.max(1) - 1).await?;
        raw.iter()
            .map(|entry| serde_json::from_str(entry).map_err(StatusError::from))
            .collect()
    }
}

#[async_trait]
impl StatusPublisher for RedisStatusPublisher {
    async fn publish(&self, status: &FrameStatus) -> Result<(), StatusError> {
        let payload = serde_json::to_string(status)?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .lpush(&self.key, payload)
            .ignore()
            .ltrim(&self.key, 0, self.max_len - 1)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

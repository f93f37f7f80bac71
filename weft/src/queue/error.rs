//! Error type for queue, cache, and pub/sub operations.

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("payload encoding error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("queue client not connected")]
    NotConnected,
}

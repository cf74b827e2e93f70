//! Store error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store configuration error: {0}")]
    Config(String),

    #[error("Store connection error: {0}")]
    Connection(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Stream operation failed: {0}")]
    Stream(String),

    #[error("Consumer group missing: {0}")]
    GroupMissing(String),

    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    #[error("Store adapter is closed")]
    Closed,

    #[error("Redis error: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),

    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),
}

impl StoreError {
    /// True for errors that mean the adapter is gone and loops should stop
    pub fn is_terminal(&self) -> bool {
        matches!(self, StoreError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_is_terminal() {
        assert!(StoreError::Closed.is_terminal());
        assert!(!StoreError::Stream("boom".into()).is_terminal());
    }

    #[test]
    fn test_display() {
        let err = StoreError::GroupMissing("client:abc".to_string());
        assert_eq!(err.to_string(), "Consumer group missing: client:abc");
    }
}

//! Cache error types

use redis::RedisError;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Store connection is closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Producer error: {0}")]
    Producer(Box<dyn std::error::Error + Send + Sync>),
}

impl CacheError {
    /// True when the backing store could not be reached or did not answer in time.
    ///
    /// Transient and permanent store failures are not told apart.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            CacheError::Redis(_)
                | CacheError::Connection(_)
                | CacheError::Timeout(_)
                | CacheError::Closed
        )
    }

    pub(crate) fn producer<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        CacheError::Producer(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_classification() {
        assert!(CacheError::Closed.is_connectivity());
        assert!(CacheError::Timeout(std::time::Duration::from_secs(1)).is_connectivity());
        assert!(CacheError::Connection("refused".to_owned()).is_connectivity());
        assert!(!CacheError::producer("boom").is_connectivity());

        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        assert!(!CacheError::from(json_err).is_connectivity());
    }
}

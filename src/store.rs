//! Backing-store contract
//!
//! Everything the cache and the coordination features need from the key-value
//! store. `RedisStore` is the production implementation; `MemoryStore` runs the
//! same contract in-process.

use std::time::Duration;

use async_trait::async_trait;

use crate::CacheError;

/// `ttl` result for a key that exists without an expiry
pub const TTL_NO_EXPIRY: i64 = -1;
/// `ttl` result for a key that does not exist
pub const TTL_MISSING: i64 = -2;

/// Primitive key-value operations with Redis semantics.
///
/// Atomicity of `set_if_absent`, `increment` and `delete_if_equals` is delegated
/// to the implementation; callers perform no locking of their own.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// GET
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// SET with expiry (SETEX)
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// DEL, returning the number of keys removed
    async fn delete(&self, key: &str) -> Result<u64, CacheError>;

    /// EXISTS
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// TTL in seconds, or [`TTL_NO_EXPIRY`] / [`TTL_MISSING`]
    async fn ttl(&self, key: &str) -> Result<i64, CacheError>;

    /// Create the key only if it does not exist.
    ///
    /// With `ttl` the expiry is applied in the same command (SET NX EX);
    /// without it this is a bare SETNX and the caller must EXPIRE separately.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError>;

    /// EXPIRE, returning whether the key existed
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// INCR, creating the key at 1 without expiry when absent
    async fn increment(&self, key: &str) -> Result<i64, CacheError>;

    /// Delete the key only if it currently holds `expected`, atomically
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, CacheError>;

    /// PING
    async fn ping(&self) -> Result<(), CacheError>;

    /// Release any connections held by the store
    fn close(&self) {}
}

/// Whole seconds for a Redis expiry; Redis rejects a zero expiry.
pub(crate) fn whole_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_secs() {
        assert_eq!(whole_secs(Duration::from_millis(1_999)), 1);
        assert_eq!(whole_secs(Duration::ZERO), 1);
        assert_eq!(whole_secs(Duration::from_secs(300)), 300);
    }
}

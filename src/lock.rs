//! Distributed lock on top of the cache store
//!
//! A lock is the key `{target}:lock`, created with an atomic set-if-absent and
//! bounded by a TTL, so a crashed holder can block others for at most the
//! lock timeout.
//!
//! By default each acquisition stores a random token and release deletes the
//! key only while it still holds that token. A holder whose lock expired
//! mid-computation therefore cannot delete the next holder's lock.
//! [`LockReleaseMode::Unchecked`] keeps the older behavior: constant value,
//! SETNX followed by a separate EXPIRE, and an unconditional DEL on release.

use std::time::Duration;

use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::CacheError;
use crate::cache::Cache;

/// Value written by unchecked-mode locks
const UNCHECKED_MARKER: &str = "1";

/// How a lock is created and released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockReleaseMode {
    /// Per-acquisition token, atomic SET NX EX, compare-and-delete release
    #[default]
    Token,
    /// Constant value, SETNX then EXPIRE, unconditional delete on release
    Unchecked,
}

/// Lock factory bound to a cache
#[derive(Clone)]
pub struct DistributedLock {
    cache: Cache,
    mode: LockReleaseMode,
}

impl DistributedLock {
    pub fn new(cache: Cache, mode: LockReleaseMode) -> Self {
        Self { cache, mode }
    }

    pub fn mode(&self) -> LockReleaseMode {
        self.mode
    }

    /// Store key guarding `target`
    pub fn lock_key(target: &str) -> String {
        format!("{target}:lock")
    }

    /// Try once to take the lock for `target`, held for at most `timeout`.
    ///
    /// `Ok(None)` means another process holds it. Store errors are returned;
    /// the caller decides whether to proceed uncoordinated.
    pub async fn try_acquire(
        &self,
        target: &str,
        timeout: Duration,
    ) -> Result<Option<LockGuard>, CacheError> {
        let key = Self::lock_key(target);

        match self.mode {
            LockReleaseMode::Token => {
                let token = Uuid::new_v4().to_string();
                if !self.cache.set_if_absent(&key, &token, Some(timeout)).await? {
                    debug!("Lock {} is held elsewhere", key);
                    return Ok(None);
                }
                debug!("Acquired lock {}", key);
                Ok(Some(LockGuard::new(self.cache.clone(), key, Some(token))))
            }
            LockReleaseMode::Unchecked => {
                if !self
                    .cache
                    .set_if_absent(&key, UNCHECKED_MARKER, None)
                    .await?
                {
                    debug!("Lock {} is held elsewhere", key);
                    return Ok(None);
                }
                let guard = LockGuard::new(self.cache.clone(), key, None);
                // Not atomic with the SETNX above; a crash in between leaves a lock without TTL.
                let bounded = self.cache.expire(guard.key(), timeout).await;
                if let Err(e) = bounded {
                    error!("Failed to bound lock {} with a TTL: {}", guard.key(), e);
                    guard.release().await;
                    return Err(e);
                }
                debug!("Acquired lock {}", guard.key());
                Ok(Some(guard))
            }
        }
    }
}

/// A held lock.
///
/// Call [`LockGuard::release`] when done. A guard dropped without release (the
/// holder panicked, or its future was cancelled) schedules the release on the
/// current tokio runtime.
pub struct LockGuard {
    cache: Option<Cache>,
    key: String,
    token: Option<String>,
}

impl LockGuard {
    fn new(cache: Cache, key: String, token: Option<String>) -> Self {
        Self {
            cache: Some(cache),
            key,
            token,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock. Returns true when this call removed the lock key.
    pub async fn release(mut self) -> bool {
        match self.cache.take() {
            Some(cache) => release_lock(&cache, &self.key, self.token.as_deref()).await,
            None => false,
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(cache) = self.cache.take() else {
            return;
        };
        let key = std::mem::take(&mut self.key);
        let token = self.token.take();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Lock {} dropped without release; releasing in background", key);
                handle.spawn(async move {
                    release_lock(&cache, &key, token.as_deref()).await;
                });
            }
            Err(_) => {
                warn!(
                    "Lock {} dropped outside a runtime; it will expire via its TTL",
                    key
                );
            }
        }
    }
}

async fn release_lock(cache: &Cache, key: &str, token: Option<&str>) -> bool {
    let Some(token) = token else {
        return cache.delete(key).await > 0;
    };

    match cache.delete_if_equals(key, token).await {
        Ok(true) => {
            debug!("Released lock {}", key);
            true
        }
        Ok(false) => {
            warn!(
                "Lock {} expired or changed hands before release; left untouched",
                key
            );
            false
        }
        Err(e) => {
            error!("Failed to release lock {}: {}", key, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::harness;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_only_one_holder_at_a_time() {
        let h = harness();
        let lock = DistributedLock::new(h.cache.clone(), LockReleaseMode::Token);

        let first = lock.try_acquire("report", TIMEOUT).await.unwrap();
        let guard = first.expect("first acquisition succeeds");
        assert_eq!(guard.key(), "report:lock");
        assert!(lock.try_acquire("report", TIMEOUT).await.unwrap().is_none());
        assert_eq!(h.cache.ttl("report:lock").await, 10);

        assert!(guard.release().await);
        assert!(lock.try_acquire("report", TIMEOUT).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_token_release_leaves_next_holders_lock_alone() {
        let h = harness();
        let lock = DistributedLock::new(h.cache.clone(), LockReleaseMode::Token);

        let stale = lock.try_acquire("job", TIMEOUT).await.unwrap().unwrap();
        h.clock.advance(TIMEOUT);
        let current = lock.try_acquire("job", TIMEOUT).await.unwrap().unwrap();

        assert!(!stale.release().await);
        assert!(h.cache.exists("job:lock").await);
        assert!(current.release().await);
        assert!(!h.cache.exists("job:lock").await);
    }

    #[tokio::test]
    async fn test_unchecked_release_deletes_unconditionally() {
        let h = harness();
        let lock = DistributedLock::new(h.cache.clone(), LockReleaseMode::Unchecked);

        let stale = lock.try_acquire("job", TIMEOUT).await.unwrap().unwrap();
        assert_eq!(h.cache.get_raw("job:lock").await.as_deref(), Some("1"));
        assert_eq!(h.cache.ttl("job:lock").await, 10);

        h.clock.advance(TIMEOUT);
        let _current = lock.try_acquire("job", TIMEOUT).await.unwrap().unwrap();

        // Legacy behavior: the expired holder removes the new holder's lock.
        assert!(stale.release().await);
        assert!(!h.cache.exists("job:lock").await);
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_in_background() {
        let h = harness();
        let lock = DistributedLock::new(h.cache.clone(), LockReleaseMode::Token);

        {
            let _guard = lock.try_acquire("dropped", TIMEOUT).await.unwrap().unwrap();
        }
        for _ in 0..50 {
            if !h.cache.exists("dropped:lock").await {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("dropped guard never released its lock");
    }

    #[tokio::test]
    async fn test_acquire_reports_store_errors() {
        let h = harness();
        let lock = DistributedLock::new(h.cache.clone(), LockReleaseMode::Token);
        h.store.set_available(false);

        let err = lock.try_acquire("k", TIMEOUT).await.err().unwrap();
        assert!(err.is_connectivity());
    }
}

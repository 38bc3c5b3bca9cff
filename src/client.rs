//! All components over one shared store handle

use std::sync::Arc;

use tracing::warn;

use crate::cache::Cache;
use crate::clock::{Clock, SystemClock};
use crate::function_cache::{FunctionCache, FunctionCacheOptions};
use crate::loader::Loader;
use crate::lock::DistributedLock;
use crate::otp::OtpManager;
use crate::rate_limit::RateLimiter;
use crate::redis_store::RedisStore;
use crate::store::KeyValueStore;
use crate::{CacheConfig, CacheError};

/// Cache, loader, OTP manager and rate limiter sharing one store.
///
/// Cheap to clone; pass it (or the individual components) to whatever needs
/// them instead of keeping a process-wide instance.
#[derive(Clone)]
pub struct ShieldCache {
    cache: Cache,
    loader: Loader,
    otp: OtpManager,
    rate_limiter: RateLimiter,
}

impl ShieldCache {
    /// Connect to Redis and build every component on the connection
    pub async fn connect(config: CacheConfig) -> Result<Self, CacheError> {
        let store = RedisStore::connect(&config).await?;
        Ok(Self::with_store(
            Arc::new(store),
            &config,
            Arc::new(SystemClock),
        ))
    }

    /// Build on an existing store handle, e.g. a `MemoryStore`
    pub fn with_store(
        store: Arc<dyn KeyValueStore>,
        config: &CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = Cache::new(store, config);
        let lock = DistributedLock::new(cache.clone(), config.lock_release);

        Self {
            loader: Loader::new(cache.clone(), lock),
            otp: OtpManager::new(cache.clone(), Arc::clone(&clock)),
            rate_limiter: RateLimiter::new(cache.clone(), clock),
            cache,
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    pub fn otp(&self) -> &OtpManager {
        &self.otp
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Function-result cache with its own key prefix and TTL policy
    pub fn function_cache(&self, options: FunctionCacheOptions) -> FunctionCache {
        FunctionCache::new(self.cache.clone(), options)
    }

    /// Whether the store answers PING
    pub async fn ping(&self) -> bool {
        match self.cache.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Store PING failed: {}", e);
                false
            }
        }
    }

    /// Release the store's connections
    pub fn close(&self) {
        self.cache.store().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::function_cache::CallKey;
    use crate::loader::{BoxError, FetchOptions};
    use crate::lock::LockReleaseMode;
    use crate::memory_store::MemoryStore;
    use crate::test_utils::START_SECS;
    use std::time::Duration;

    fn shield(config: CacheConfig) -> (ShieldCache, MemoryStore, ManualClock) {
        let clock = ManualClock::new(START_SECS);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        let shield =
            ShieldCache::with_store(Arc::new(store.clone()), &config, Arc::new(clock.clone()));
        (shield, store, clock)
    }

    #[tokio::test]
    async fn test_components_share_one_store() {
        let (shield, store, _clock) = shield(CacheConfig::default());
        assert!(shield.ping().await);

        let code = shield.otp().issue("a@example.com").await.unwrap();
        assert!(shield.cache().exists("otp:a@example.com").await);
        assert!(
            shield
                .rate_limiter()
                .allow("a@example.com", 1, Duration::from_secs(60))
                .await
        );

        let value: u32 = shield
            .loader()
            .fetch_or_compute(
                "answer",
                || async { Ok::<_, BoxError>(42u32) },
                FetchOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(value, 42);

        let functions = shield.function_cache(FunctionCacheOptions::with_prefix("fn:"));
        let found = functions
            .fetch(&CallKey::new("math", "double").arg(21), || async {
                Ok::<_, BoxError>(Some(42u32))
            })
            .await
            .unwrap();
        assert_eq!(found, Some(42));
        assert!(shield.cache().exists("fn:math:double:21").await);

        assert!(shield.otp().verify("a@example.com", &code).await.is_valid());
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn test_lock_release_mode_comes_from_config() {
        let config = CacheConfig {
            lock_release: LockReleaseMode::Unchecked,
            ..CacheConfig::default()
        };
        let (shield, _store, _clock) = shield(config);

        let value: String = shield
            .loader()
            .fetch_with_lock(
                "report",
                || async { Ok::<_, BoxError>("done".to_owned()) },
                Default::default(),
            )
            .await
            .unwrap();
        assert_eq!(value, "done");
        assert!(!shield.cache().exists("report:lock").await);
    }

    #[tokio::test]
    async fn test_ping_reports_outage() {
        let (shield, store, _clock) = shield(CacheConfig::default());
        store.set_available(false);
        assert!(!shield.ping().await);
        shield.close();
    }
}

//! Fetch-or-compute on top of the cache
//!
//! Three ways to read a key and compute it on a miss:
//! - [`Loader::fetch_or_compute`]: plain read-through, with a stale-value
//!   rescue when the producer fails
//! - [`Loader::fetch_with_lock`]: double-checked locking so only one process
//!   recomputes an absent key (stampede protection)
//! - [`Loader::fetch_with_fallback`]: read-through that substitutes a fallback
//!   value for any failure

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::CacheError;
use crate::cache::Cache;
use crate::lock::DistributedLock;

/// Boxed error returned by producers
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Delay step between polls while another process holds the lock.
/// Attempt `n` waits `n * LOCK_RETRY_STEP`.
pub const LOCK_RETRY_STEP: Duration = Duration::from_millis(100);

/// Options for [`Loader::fetch_or_compute`] and [`Loader::fetch_with_fallback`]
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// TTL for the computed value; `None` uses the cache default
    pub ttl: Option<Duration>,
    /// Stretch the TTL randomly by up to 20%
    pub jitter: bool,
    /// Skip the cache read and always recompute
    pub force_refresh: bool,
}

impl FetchOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    pub fn jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }
}

/// Options for [`Loader::fetch_with_lock`]
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// TTL for the computed value; `None` uses the cache default
    pub ttl: Option<Duration>,
    /// Longest time the lock may be held
    pub lock_timeout: Duration,
    /// Polls made by a caller that lost the lock race before computing itself
    pub max_retries: u32,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            lock_timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

impl LockOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }
}

/// Read-through loader
#[derive(Clone)]
pub struct Loader {
    cache: Cache,
    lock: DistributedLock,
}

impl Loader {
    pub fn new(cache: Cache, lock: DistributedLock) -> Self {
        Self { cache, lock }
    }

    /// Return the cached value for `key`, or compute, cache and return it.
    ///
    /// When the producer fails (and `force_refresh` is off) the cache is read
    /// once more and any value found there is served instead of the error.
    pub async fn fetch_or_compute<T, F, Fut, E>(
        &self,
        key: &str,
        producer: F,
        options: FetchOptions,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        if !options.force_refresh {
            if let Some(value) = self.cache.get::<T>(key).await {
                debug!("Cache hit for key: {}", key);
                return Ok(value);
            }
            debug!("Cache miss for key: {}", key);
        }

        match producer().await {
            Ok(value) => {
                self.cache
                    .set(key, &value, options.ttl, options.jitter)
                    .await;
                Ok(value)
            }
            Err(e) => {
                let err = CacheError::producer(e);
                error!("Producer failed for key {}: {}", key, err);
                if !options.force_refresh {
                    if let Some(stale) = self.cache.get::<T>(key).await {
                        warn!("Serving stale cached value for key {}", key);
                        return Ok(stale);
                    }
                }
                Err(err)
            }
        }
    }

    /// Return the cached value for `key`, letting only one process compute it.
    ///
    /// The lock holder re-checks the cache after acquiring, computes, stores
    /// the result and releases the lock whatever the producer's outcome.
    /// Callers that lose the race poll the cache `max_retries` times with a
    /// linearly growing delay, then call the producer themselves without
    /// caching the result. If the lock cannot be attempted at all (store
    /// unreachable) the producer runs uncoordinated.
    pub async fn fetch_with_lock<T, F, Fut, E>(
        &self,
        key: &str,
        producer: F,
        options: LockOptions,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        if let Some(value) = self.cache.get::<T>(key).await {
            debug!("Cache hit for key: {}", key);
            return Ok(value);
        }

        match self.lock.try_acquire(key, options.lock_timeout).await {
            Ok(Some(guard)) => {
                let result = self.compute_as_holder(key, producer, &options).await;
                guard.release().await;
                result
            }
            Ok(None) => self.wait_for_holder(key, producer, &options).await,
            Err(e) => {
                warn!(
                    "Could not take lock for key {} ({}); computing without coordination",
                    key, e
                );
                producer().await.map_err(CacheError::producer)
            }
        }
    }

    async fn compute_as_holder<T, F, Fut, E>(
        &self,
        key: &str,
        producer: F,
        options: &LockOptions,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        // A previous holder may have finished between our miss and our acquisition.
        if let Some(value) = self.cache.get::<T>(key).await {
            debug!("Value for key {} appeared while taking the lock", key);
            return Ok(value);
        }

        let value = producer().await.map_err(|e| {
            let err = CacheError::producer(e);
            error!("Producer failed for key {} under lock: {}", key, err);
            err
        })?;
        self.cache.set(key, &value, options.ttl, false).await;
        Ok(value)
    }

    async fn wait_for_holder<T, F, Fut, E>(
        &self,
        key: &str,
        producer: F,
        options: &LockOptions,
    ) -> Result<T, CacheError>
    where
        T: DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        for attempt in 1..=options.max_retries {
            tokio::time::sleep(LOCK_RETRY_STEP * attempt).await;
            if let Some(value) = self.cache.get::<T>(key).await {
                debug!("Value for key {} ready after {} polls", key, attempt);
                return Ok(value);
            }
        }

        warn!(
            "Lock for key {} still held after {} polls; calling producer directly",
            key, options.max_retries
        );
        producer().await.map_err(CacheError::producer)
    }

    /// Like [`Loader::fetch_or_compute`], but any failure is logged and
    /// replaced by the fallback's value.
    pub async fn fetch_with_fallback<T, F, Fut, E, FB, FbFut>(
        &self,
        key: &str,
        producer: F,
        fallback: FB,
        options: FetchOptions,
    ) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
        FB: FnOnce() -> FbFut,
        FbFut: Future<Output = T>,
    {
        match self.fetch_or_compute(key, producer, options).await {
            Ok(value) => value,
            Err(e) => {
                error!("Fetch failed for key {}, using fallback: {}", key, e);
                fallback().await
            }
        }
    }
}

//! Function-result cache
//!
//! Caches the result of a call identified by a [`CallKey`]: a namespace, a
//! function name and its arguments. Calls that produce no value are cached
//! with the empty marker, so lookups for things that do not exist stop
//! reaching the backing source (penetration protection).
//!
//! ## Cache Keys
//!
//! `{prefix}{namespace}:{function}:{arg1}:{arg2}:...:{kw1}={v1}:{kw2}={v2}`
//!
//! Keyword arguments are rendered sorted by name, so the order they were added
//! in does not change the key.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::CacheError;
use crate::cache::Cache;
use crate::loader::BoxError;

/// Identity of a cached call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallKey {
    namespace: String,
    function: String,
    args: Vec<String>,
    kwargs: BTreeMap<String, String>,
}

impl CallKey {
    pub fn new(namespace: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            function: function.into(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    /// Append a positional argument
    pub fn arg(mut self, value: impl Display) -> Self {
        self.args.push(value.to_string());
        self
    }

    /// Add a keyword argument
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Display) -> Self {
        self.kwargs.insert(name.into(), value.to_string());
        self
    }

    pub fn render(&self) -> String {
        let params: Vec<String> = self
            .args
            .iter()
            .cloned()
            .chain(self.kwargs.iter().map(|(k, v)| format!("{k}={v}")))
            .collect();
        format!("{}:{}:{}", self.namespace, self.function, params.join(":"))
    }
}

impl Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Caching policy for a [`FunctionCache`]
#[derive(Debug, Clone)]
pub struct FunctionCacheOptions {
    /// Prepended verbatim to every rendered call key
    pub prefix: String,
    /// TTL for real results; `None` uses the cache default
    pub ttl: Option<Duration>,
    /// Stretch result TTLs randomly by up to 20%
    pub jitter: bool,
    /// TTL for cached "no result" markers
    pub empty_ttl: Duration,
}

impl Default for FunctionCacheOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            ttl: None,
            jitter: false,
            empty_ttl: Duration::from_secs(60),
        }
    }
}

impl FunctionCacheOptions {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }
}

/// Cache for results of arbitrary (side-effect free) calls
#[derive(Clone)]
pub struct FunctionCache {
    cache: Cache,
    options: FunctionCacheOptions,
}

impl FunctionCache {
    pub fn new(cache: Cache, options: FunctionCacheOptions) -> Self {
        Self { cache, options }
    }

    /// Store key for a call
    pub fn cache_key(&self, call: &CallKey) -> String {
        format!("{}{}", self.options.prefix, call.render())
    }

    /// Return the cached result of `call`, running `producer` on a miss.
    ///
    /// A cached empty marker returns `Ok(None)` without running the producer.
    /// When the producer fails, a previously cached real value is served
    /// instead of the error.
    pub async fn fetch<T, F, Fut, E>(
        &self,
        call: &CallKey,
        producer: F,
    ) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: Into<BoxError>,
    {
        let key = self.cache_key(call);

        if let Some(hit) = self.cached::<T>(&key).await {
            return Ok(hit);
        }

        match producer().await {
            Ok(None) => {
                debug!("No result for key {}, caching empty marker", key);
                self.cache
                    .set_empty_marker(&key, Some(self.options.empty_ttl))
                    .await;
                Ok(None)
            }
            Ok(Some(value)) => {
                self.cache
                    .set(&key, &value, self.options.ttl, self.options.jitter)
                    .await;
                Ok(Some(value))
            }
            Err(e) => {
                let err = CacheError::producer(e);
                error!("Cached call {} failed: {}", key, err);
                if let Some(raw) = self.cache.get_raw(&key).await {
                    if !Cache::is_empty_marker(&raw) {
                        if let Ok(stale) = Cache::decode::<T>(&raw) {
                            warn!("Serving stale cached value for key {}", key);
                            return Ok(Some(stale));
                        }
                    }
                }
                Err(err)
            }
        }
    }

    /// `Some(None)` for an empty-marker hit, `Some(Some(v))` for a value hit.
    async fn cached<T: DeserializeOwned>(&self, key: &str) -> Option<Option<T>> {
        let raw = self.cache.get_raw(key).await?;
        if Cache::is_empty_marker(&raw) {
            debug!("Empty-marker hit for key {}", key);
            return Some(None);
        }
        match Cache::decode::<T>(&raw) {
            Ok(value) => {
                debug!("Cache hit for key {}", key);
                Some(Some(value))
            }
            Err(e) => {
                warn!("Cached value for key {} does not decode ({}); recomputing", key, e);
                None
            }
        }
    }

    /// Drop the cached result (or empty marker) for a call
    pub async fn invalidate(&self, call: &CallKey) -> bool {
        self.cache.delete(&self.cache_key(call)).await > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::harness;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        id: u64,
        email: String,
    }

    fn user(id: u64) -> User {
        User {
            id,
            email: format!("user{id}@example.com"),
        }
    }

    #[test]
    fn test_call_key_rendering_sorts_keywords() {
        let a = CallKey::new("users", "get_user")
            .arg(1001)
            .arg("active")
            .kwarg("region", "eu")
            .kwarg("expand", true);
        let b = CallKey::new("users", "get_user")
            .arg(1001)
            .arg("active")
            .kwarg("expand", true)
            .kwarg("region", "eu");

        assert_eq!(a.render(), "users:get_user:1001:active:expand=true:region=eu");
        assert_eq!(a.render(), b.render());
        assert_eq!(a.to_string(), a.render());
        assert_eq!(CallKey::new("m", "f").render(), "m:f:");
    }

    #[tokio::test]
    async fn test_hit_skips_producer() {
        let h = harness();
        let functions = FunctionCache::new(
            h.cache.clone(),
            FunctionCacheOptions {
                ttl: Some(Duration::from_secs(1800)),
                ..FunctionCacheOptions::with_prefix("user:")
            },
        );
        let calls = &AtomicUsize::new(0);
        let call = CallKey::new("users", "get_user").arg(1001);

        for _ in 0..2 {
            let found = functions
                .fetch(&call, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(Some(user(1001)))
                })
                .await
                .unwrap();
            assert_eq!(found, Some(user(1001)));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.cache.ttl("user:users:get_user:1001").await, 1800);
    }

    #[tokio::test]
    async fn test_missing_results_are_cached_as_empty() {
        let h = harness();
        let functions = FunctionCache::new(
            h.cache.clone(),
            FunctionCacheOptions {
                empty_ttl: Duration::from_secs(30),
                ..FunctionCacheOptions::default()
            },
        );
        let calls = &AtomicUsize::new(0);
        let call = CallKey::new("users", "get_user").arg(404);

        for _ in 0..3 {
            let found = functions
                .fetch(&call, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<Option<User>, BoxError>(None)
                })
                .await
                .unwrap();
            assert_eq!(found, None);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let key = functions.cache_key(&call);
        assert!(Cache::is_empty_marker(&h.cache.get_raw(&key).await.unwrap()));
        assert_eq!(h.cache.ttl(&key).await, 30);

        // The marker expires and the source is consulted again
        h.clock.advance(Duration::from_secs(30));
        functions
            .fetch(&call, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<Option<User>, BoxError>(None)
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_serves_stale_value() {
        let h = harness();
        let functions = FunctionCache::new(h.cache.clone(), FunctionCacheOptions::default());
        let call = CallKey::new("users", "get_user").arg(7);

        // Populated by another writer while this call's producer runs
        let cache = h.cache.clone();
        let key = functions.cache_key(&call);
        let found = functions
            .fetch::<User, _, _, _>(&call, || async move {
                cache.set(&key, &user(7), None, false).await;
                Err::<Option<User>, _>("db timeout")
            })
            .await
            .unwrap();
        assert_eq!(found, Some(user(7)));
    }

    #[tokio::test]
    async fn test_failure_does_not_serve_empty_marker() {
        let h = harness();
        let functions = FunctionCache::new(h.cache.clone(), FunctionCacheOptions::default());
        let call = CallKey::new("users", "get_user").arg(8);

        let cache = h.cache.clone();
        let key = functions.cache_key(&call);
        let result = functions
            .fetch::<User, _, _, _>(&call, || async move {
                cache.set_empty_marker(&key, None).await;
                Err::<Option<User>, _>("db timeout")
            })
            .await;
        assert!(matches!(result, Err(CacheError::Producer(_))));
    }

    #[tokio::test]
    async fn test_invalidate_forces_recompute() {
        let h = harness();
        let functions = FunctionCache::new(h.cache.clone(), FunctionCacheOptions::default());
        let call = CallKey::new("users", "get_user").arg(3);

        functions
            .fetch(&call, || async { Ok::<_, BoxError>(Some(user(3))) })
            .await
            .unwrap();
        assert!(functions.invalidate(&call).await);
        assert!(!functions.invalidate(&call).await);
    }
}

//! Cache core
//!
//! Typed reads and writes over a [`KeyValueStore`] with JSON serialization,
//! jittered TTLs and an empty marker for caching "no result".
//!
//! Reads and writes never fail: a store error is logged and reported as a miss
//! (`None`, `false`, `0`). The coordination primitives (`increment`, `expire`,
//! `set_if_absent`, `delete_if_equals`) return the error instead, so each
//! caller can pick its own failure policy.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::store::{KeyValueStore, TTL_NO_EXPIRY};
use crate::{CacheConfig, CacheError};

/// Raw value stored for "computed, and there was nothing".
///
/// Every value written by [`Cache::set`] is JSON, and this string is not valid
/// JSON, so the marker never collides with a real payload.
pub const EMPTY_MARKER: &str = "__NULL__";

/// Upper bound of the random TTL stretch applied by jitter (20%)
const JITTER_RATIO: f64 = 0.2;

/// Typed cache over a shared store handle
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn KeyValueStore>,
    default_ttl: Duration,
    empty_ttl: Duration,
}

impl Cache {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &CacheConfig) -> Self {
        Self {
            store,
            default_ttl: config.default_ttl,
            empty_ttl: config.empty_ttl,
        }
    }

    /// The underlying store handle
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Raw stored string, without decoding
    pub async fn get_raw(&self, key: &str) -> Option<String> {
        match self.store.get(key).await {
            Ok(value) => value,
            Err(e) => {
                error!("Cache GET failed for key {}: {}", key, e);
                None
            }
        }
    }

    /// Read and decode a value.
    ///
    /// A raw value that is not JSON is offered to `T` as a plain string, so
    /// `get::<String>` returns foreign non-JSON values unchanged.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get_raw(key).await?;
        match Self::decode(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Cached value for key {} does not decode: {}", key, e);
                None
            }
        }
    }

    /// Read a value as untyped JSON, falling back to the raw string.
    pub async fn get_value(&self, key: &str) -> Option<serde_json::Value> {
        let raw = self.get_raw(key).await?;
        Some(serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw)))
    }

    /// Decode a raw stored string the way [`Cache::get`] does
    pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, serde_json::Error> {
        serde_json::from_str(raw).or_else(|err| {
            serde_json::from_value(serde_json::Value::String(raw.to_owned())).map_err(|_| err)
        })
    }

    /// Encode and store a value.
    ///
    /// `ttl` defaults to the configured default TTL. With `jitter` the TTL is
    /// stretched by a random 0-20% so entries written together do not expire
    /// together. Returns false when the value could not be stored.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        jitter: bool,
    ) -> bool {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize value for key {}: {}", key, e);
                return false;
            }
        };

        let base = ttl.unwrap_or(self.default_ttl);
        let ttl = if jitter { jittered(base) } else { base };
        self.write(key, &payload, ttl).await
    }

    async fn write(&self, key: &str, payload: &str, ttl: Duration) -> bool {
        match self.store.set_ex(key, payload, ttl).await {
            Ok(()) => {
                debug!("Cache SET key {} (ttl {:?})", key, ttl);
                true
            }
            Err(e) => {
                error!("Cache SET failed for key {}: {}", key, e);
                false
            }
        }
    }

    /// Returns the number of keys removed
    pub async fn delete(&self, key: &str) -> u64 {
        match self.store.delete(key).await {
            Ok(removed) => removed,
            Err(e) => {
                error!("Cache DEL failed for key {}: {}", key, e);
                0
            }
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        match self.store.exists(key).await {
            Ok(exists) => exists,
            Err(e) => {
                error!("Cache EXISTS failed for key {}: {}", key, e);
                false
            }
        }
    }

    /// Remaining TTL in seconds, `-1` for no expiry, `-2` for a missing key.
    /// A store error also reports `-1`.
    pub async fn ttl(&self, key: &str) -> i64 {
        match self.store.ttl(key).await {
            Ok(ttl) => ttl,
            Err(e) => {
                error!("Cache TTL failed for key {}: {}", key, e);
                TTL_NO_EXPIRY
            }
        }
    }

    /// Cache "no result" for `key`, defaulting to the configured empty TTL
    pub async fn set_empty_marker(&self, key: &str, ttl: Option<Duration>) -> bool {
        self.write(key, EMPTY_MARKER, ttl.unwrap_or(self.empty_ttl))
            .await
    }

    pub fn is_empty_marker(raw: &str) -> bool {
        raw == EMPTY_MARKER
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        self.store.ping().await
    }

    /// Atomic INCR
    pub async fn increment(&self, key: &str) -> Result<i64, CacheError> {
        self.store.increment(key).await
    }

    /// Atomic EXPIRE
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.store.expire(key, ttl).await
    }

    /// Atomic create-if-absent of a raw string
    pub async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        self.store.set_if_absent(key, value, ttl).await
    }

    /// Atomic compare-and-delete of a raw string
    pub async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        self.store.delete_if_equals(key, expected).await
    }
}

/// `ttl * (1 + uniform(0, 0.2))`, truncated to whole seconds
pub fn jittered(ttl: Duration) -> Duration {
    let factor = 1.0 + rand::rng().random_range(0.0..=JITTER_RATIO);
    Duration::from_secs((ttl.as_secs_f64() * factor) as u64)
}

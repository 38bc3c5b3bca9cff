//! In-process implementation of the store contract
//!
//! Operations are serialized behind a single mutex, which gives the same
//! per-command atomicity a single Redis node provides. Expiry is evaluated
//! against an injectable [`Clock`], and the store can be switched to
//! "unavailable" to simulate a Redis outage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use redis::{ErrorKind, RedisError};
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::store::{KeyValueStore, TTL_MISSING, TTL_NO_EXPIRY, whole_secs};
use crate::CacheError;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    /// Absolute expiry in unix milliseconds
    expires_at: Option<i64>,
}

impl Entry {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_ms)
    }
}

struct MemoryStoreInner {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

/// Key-value store held in process memory
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store whose expiries follow the given clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(MemoryStoreInner {
                entries: Mutex::new(HashMap::new()),
                clock,
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Toggle simulated reachability. While unavailable every command fails
    /// with a connection error.
    pub fn set_available(&self, available: bool) {
        debug!("MemoryStore availability set to {}", available);
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Number of live (unexpired) keys
    pub fn len(&self) -> usize {
        let now = self.inner.clock.now_millis();
        self.lock_entries()
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the live entry map, after reaping expired keys.
    fn with_entries<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Entry>, i64) -> R,
    ) -> Result<R, CacheError> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(CacheError::Connection(
                "in-memory store is marked unavailable".to_owned(),
            ));
        }
        let now = self.inner.clock.now_millis();
        let mut entries = self.lock_entries();
        entries.retain(|_, e| !e.is_expired(now));
        Ok(f(&mut entries, now))
    }

    fn deadline(now_ms: i64, ttl: Duration) -> i64 {
        now_ms + (whole_secs(ttl) as i64) * 1000
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.with_entries(|entries, _| entries.get(key).map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.with_entries(|entries, now| {
            entries.insert(
                key.to_owned(),
                Entry {
                    value: value.to_owned(),
                    expires_at: Some(Self::deadline(now, ttl)),
                },
            );
        })
    }

    async fn delete(&self, key: &str) -> Result<u64, CacheError> {
        self.with_entries(|entries, _| u64::from(entries.remove(key).is_some()))
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.with_entries(|entries, _| entries.contains_key(key))
    }

    async fn ttl(&self, key: &str) -> Result<i64, CacheError> {
        self.with_entries(|entries, now| match entries.get(key) {
            None => TTL_MISSING,
            Some(Entry {
                expires_at: None, ..
            }) => TTL_NO_EXPIRY,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => (at - now + 999) / 1000,
        })
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        self.with_entries(|entries, now| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_owned(),
                Entry {
                    value: value.to_owned(),
                    expires_at: ttl.map(|ttl| Self::deadline(now, ttl)),
                },
            );
            true
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.with_entries(|entries, now| match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Self::deadline(now, ttl));
                true
            }
            None => false,
        })
    }

    async fn increment(&self, key: &str) -> Result<i64, CacheError> {
        self.with_entries(|entries, _| -> Result<i64, CacheError> {
            let Some(entry) = entries.get_mut(key) else {
                entries.insert(
                    key.to_owned(),
                    Entry {
                        value: "1".to_owned(),
                        expires_at: None,
                    },
                );
                return Ok(1);
            };
            let next = entry
                .value
                .parse::<i64>()
                .ok()
                .and_then(|current| current.checked_add(1))
                .ok_or_else(|| {
                    RedisError::from((
                        ErrorKind::TypeError,
                        "value is not an integer or out of range",
                    ))
                })?;
            entry.value = next.to_string();
            Ok(next)
        })?
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        self.with_entries(|entries, _| {
            if entries.get(key).is_some_and(|e| e.value == expected) {
                entries.remove(key);
                true
            } else {
                false
            }
        })
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.with_entries(|_, _| ())
    }
}

//! shieldcache - Resilient Redis cache and coordination primitives
//!
//! This library puts a cache in front of a slow backing source and reuses the
//! same Redis instance for short-lived coordination:
//! - Cache core: typed get/set/delete/exists/ttl with JSON serialization
//! - Stampede protection: lock-guarded fetch-or-compute
//! - Penetration protection: cached empty markers for calls with no result
//! - Avalanche protection: jittered TTLs
//! - One-time verification codes with send throttling
//! - Fixed-window rate limiting that fails open
//!
//! The cache is an optimization layer: when Redis is unreachable, reads
//! report misses, writes report failure and the rate limiter lets requests
//! through.
//!
//! ## Redis Key Patterns
//!
//! ```text
//! {key}                                  → cached JSON value, or __NULL__
//! {key}:lock                             → lock token (expires after lock timeout)
//! otp:{email}                            → current code (default 5 min TTL)
//! otp:last:{email}                       → last send time (max 1 hour TTL)
//! rate_limit:{identity}:{window_start}   → request count for the window
//! ```

mod cache;
mod client;
mod clock;
mod config;
mod error;
mod function_cache;
mod loader;
mod lock;
mod memory_store;
mod otp;
mod rate_limit;
mod redis_store;
mod store;

#[cfg(test)]
mod test_utils;

pub use cache::{Cache, EMPTY_MARKER, jittered};
pub use client::ShieldCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use error::CacheError;
pub use function_cache::{CallKey, FunctionCache, FunctionCacheOptions};
pub use loader::{BoxError, FetchOptions, LOCK_RETRY_STEP, Loader, LockOptions};
pub use lock::{DistributedLock, LockGuard, LockReleaseMode};
pub use memory_store::MemoryStore;
pub use otp::{
    CODE_LENGTH, DEFAULT_CODE_TTL, DEFAULT_MIN_INTERVAL, LAST_SENT_TTL_CAP, OtpManager, OtpPolicy,
    VerifyOutcome,
};
pub use rate_limit::{DEFAULT_LIMIT, DEFAULT_WINDOW, RateLimitDecision, RateLimiter};
pub use redis_store::RedisStore;
pub use store::{KeyValueStore, TTL_MISSING, TTL_NO_EXPIRY};

// Re-export async_trait for store implementors
pub use async_trait::async_trait;

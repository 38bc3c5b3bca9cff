//! Fixed-window rate limiting.
//!
//! Each identity gets one counter per clock-aligned window:
//! `rate_limit:{identity}:{window_start}`. The counter's TTL is set to the
//! window length when the first request of the window creates it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::CacheError;
use crate::cache::Cache;
use crate::clock::Clock;

pub const DEFAULT_LIMIT: u64 = 100;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Under the limit, includes current count.
    Allowed(i64),
    /// Over the limit, includes current count.
    Exceeded(i64),
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed(_))
    }

    pub fn count(&self) -> i64 {
        match self {
            RateLimitDecision::Allowed(count) | RateLimitDecision::Exceeded(count) => *count,
        }
    }
}

/// Per-identity fixed-window limiter
#[derive(Clone)]
pub struct RateLimiter {
    cache: Cache,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(cache: Cache, clock: Arc<dyn Clock>) -> Self {
        Self { cache, clock }
    }

    /// Counter key for `identity` in the window containing `now_secs`
    pub fn window_key(identity: &str, now_secs: i64, window: Duration) -> String {
        let window_secs = window.as_secs().max(1) as i64;
        let window_start = now_secs - now_secs.rem_euclid(window_secs);
        format!("rate_limit:{identity}:{window_start}")
    }

    /// Count this request and report whether it is within `limit`.
    ///
    /// Store errors are returned to the caller.
    pub async fn check(
        &self,
        identity: &str,
        limit: u64,
        window: Duration,
    ) -> Result<RateLimitDecision, CacheError> {
        let key = Self::window_key(identity, self.clock.now_secs(), window);
        let count = self.cache.increment(&key).await?;

        if count == 1 {
            self.cache.expire(&key, window).await?;
        }

        if count > i64::try_from(limit).unwrap_or(i64::MAX) {
            debug!("Rate limit exceeded for {} ({} > {})", identity, count, limit);
            Ok(RateLimitDecision::Exceeded(count))
        } else {
            Ok(RateLimitDecision::Allowed(count))
        }
    }

    /// Whether the request may proceed.
    ///
    /// Fails open: if the store cannot be reached the request is allowed.
    pub async fn allow(&self, identity: &str, limit: u64, window: Duration) -> bool {
        match self.check(identity, limit, window).await {
            Ok(decision) => decision.is_allowed(),
            Err(e) => {
                error!(
                    "Rate limit check failed for {}: {}. Allowing request.",
                    identity, e
                );
                true
            }
        }
    }
}

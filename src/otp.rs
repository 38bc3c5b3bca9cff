//! One-time verification codes
//!
//! ## Cache Keys
//!
//! - `otp:{email}`: the current code, expires with the code TTL (default 5 min)
//! - `otp:last:{email}`: unix time of the last send, expires after
//!   `min(code TTL, 1 hour)`
//!
//! A code is consumed by its first successful verification. Wrong guesses
//! leave it in place; there is no attempt counter, so callers that need one
//! should put a [`RateLimiter`](crate::RateLimiter) in front of `verify`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, info};

use crate::cache::Cache;
use crate::clock::Clock;

/// Default lifetime of an issued code
pub const DEFAULT_CODE_TTL: Duration = Duration::from_secs(300);
/// Default minimum gap between two sends to the same address
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(60);
/// Cap on how long the last-sent record is kept
pub const LAST_SENT_TTL_CAP: Duration = Duration::from_secs(3600);
/// Digits in a generated code
pub const CODE_LENGTH: usize = 6;

/// Result of checking a submitted code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The code matched and has been consumed
    Success,
    /// A code exists but the input does not match it
    Incorrect,
    /// No code is stored (never sent, expired, or already used)
    ExpiredOrAbsent,
}

impl VerifyOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, VerifyOutcome::Success)
    }

    /// Stable machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            VerifyOutcome::Success => "success",
            VerifyOutcome::Incorrect => "incorrect",
            VerifyOutcome::ExpiredOrAbsent => "expired_or_absent",
        }
    }
}

impl fmt::Display for VerifyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Code lifetime and send throttling used by [`OtpManager::issue`]
#[derive(Debug, Clone)]
pub struct OtpPolicy {
    pub code_ttl: Duration,
    pub min_interval: Duration,
}

impl Default for OtpPolicy {
    fn default() -> Self {
        Self {
            code_ttl: DEFAULT_CODE_TTL,
            min_interval: DEFAULT_MIN_INTERVAL,
        }
    }
}

/// Stores, throttles and verifies one-time codes
#[derive(Clone)]
pub struct OtpManager {
    cache: Cache,
    clock: Arc<dyn Clock>,
    policy: OtpPolicy,
}

impl OtpManager {
    pub fn new(cache: Cache, clock: Arc<dyn Clock>) -> Self {
        Self::with_policy(cache, clock, OtpPolicy::default())
    }

    pub fn with_policy(cache: Cache, clock: Arc<dyn Clock>, policy: OtpPolicy) -> Self {
        Self {
            cache,
            clock,
            policy,
        }
    }

    fn code_key(email: &str) -> String {
        format!("otp:{email}")
    }

    fn last_sent_key(email: &str) -> String {
        format!("otp:last:{email}")
    }

    /// False only while a send to `email` happened less than `min_interval` ago
    pub async fn can_send(&self, email: &str, min_interval: Duration) -> bool {
        let Some(last_sent) = self.cache.get::<i64>(&Self::last_sent_key(email)).await else {
            return true;
        };
        let elapsed = self.clock.now_secs() - last_sent;
        if elapsed < min_interval.as_secs() as i64 {
            debug!(
                "OTP send to {} throttled ({}s since last send)",
                email, elapsed
            );
            return false;
        }
        true
    }

    /// Store `code` for `email` and record the send time.
    ///
    /// Returns false when the code could not be written; the send time is
    /// only recorded after the code is stored.
    pub async fn store(&self, email: &str, code: &str, ttl: Duration) -> bool {
        if !self
            .cache
            .set(&Self::code_key(email), code, Some(ttl), false)
            .await
        {
            error!("Failed to store OTP for {}", email);
            return false;
        }

        let now = self.clock.now_secs();
        self.cache
            .set(
                &Self::last_sent_key(email),
                &now,
                Some(ttl.min(LAST_SENT_TTL_CAP)),
                false,
            )
            .await;
        true
    }

    /// Check `input` against the stored code, consuming it on a match
    pub async fn verify(&self, email: &str, input: &str) -> VerifyOutcome {
        let key = Self::code_key(email);
        let Some(raw) = self.cache.get_raw(&key).await else {
            return VerifyOutcome::ExpiredOrAbsent;
        };
        let stored = match Cache::decode::<String>(&raw) {
            Ok(code) if !code.is_empty() => code,
            _ => return VerifyOutcome::ExpiredOrAbsent,
        };

        if stored != input {
            debug!("OTP mismatch for {}", email);
            return VerifyOutcome::Incorrect;
        }

        // Compare-and-delete on the exact bytes read, so two concurrent
        // verifications cannot both consume the code.
        match self.cache.delete_if_equals(&key, &raw).await {
            Ok(true) => {
                info!("OTP verified for {}", email);
                VerifyOutcome::Success
            }
            Ok(false) => {
                debug!("OTP for {} was consumed concurrently", email);
                VerifyOutcome::ExpiredOrAbsent
            }
            Err(e) => {
                // Verification already succeeded; the code will still lapse with its TTL.
                error!("Failed to consume OTP for {}: {}", email, e);
                VerifyOutcome::Success
            }
        }
    }

    /// Random numeric code of [`CODE_LENGTH`] digits
    pub fn generate_code() -> String {
        let mut rng = rand::rng();
        (0..CODE_LENGTH)
            .map(|_| rng.random_range(0..10).to_string())
            .collect()
    }

    /// Issuance workflow: throttle check, generate, store.
    ///
    /// Returns the code to deliver, or `None` when sending is throttled or the
    /// code could not be stored.
    pub async fn issue(&self, email: &str) -> Option<String> {
        if !self.can_send(email, self.policy.min_interval).await {
            return None;
        }
        let code = Self::generate_code();
        if !self.store(email, &code, self.policy.code_ttl).await {
            return None;
        }
        Some(code)
    }
}

//! Cache configuration

use std::str::FromStr;
use std::time::Duration;

use crate::lock::LockReleaseMode;

/// Configuration for the Redis connection and cache defaults
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Full connection URL. Takes precedence over host/port/db/password when set.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
    /// Number of multiplexed connection handles kept in the pool
    pub pool_size: usize,
    /// Time-to-live used by `set` when the caller passes no TTL
    pub default_ttl: Duration,
    /// Time-to-live for empty-marker entries
    pub empty_ttl: Duration,
    /// Upper bound on any single store command
    pub command_timeout: Duration,
    /// Retry the initial connection once before giving up
    pub retry_on_error: bool,
    /// Pause before the single reconnection attempt
    pub reconnect_delay: Duration,
    /// How distributed locks are released
    pub lock_release: LockReleaseMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_owned(),
            port: 6379,
            db: 0,
            password: None,
            pool_size: 4,
            default_ttl: Duration::from_secs(3600), // 1 hour
            empty_ttl: Duration::from_secs(60),
            command_timeout: Duration::from_secs(2),
            retry_on_error: true,
            reconnect_delay: Duration::from_secs(1),
            lock_release: LockReleaseMode::Token,
        }
    }
}

impl CacheConfig {
    /// Build a config from `REDIS_*` / `CACHE_*` environment variables.
    ///
    /// Unset or unparsable variables keep their default.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            url: lookup("REDIS_URL").filter(|v| !v.is_empty()),
            host: lookup("REDIS_HOST")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.host),
            port: parse_var::<u16>(lookup("REDIS_PORT")).unwrap_or(defaults.port),
            db: parse_var::<i64>(lookup("REDIS_DB")).unwrap_or(defaults.db),
            password: lookup("REDIS_PASSWORD").filter(|v| !v.is_empty()),
            pool_size: parse_var::<usize>(lookup("REDIS_POOL_SIZE")).unwrap_or(defaults.pool_size),
            default_ttl: parse_var::<u64>(lookup("CACHE_DEFAULT_TTL"))
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_ttl),
            ..defaults
        }
    }

    /// The `redis://` URL this config connects to
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

fn parse_var<T: FromStr>(raw: Option<String>) -> Option<T> {
    raw.and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_connection_url() {
        let config = CacheConfig::default();
        assert_eq!(config.connection_url(), "redis://localhost:6379/0");

        let config = CacheConfig {
            password: Some("s3cret".to_owned()),
            db: 2,
            ..CacheConfig::default()
        };
        assert_eq!(config.connection_url(), "redis://:s3cret@localhost:6379/2");

        let config = CacheConfig {
            url: Some("redis://cache.internal:6380/1".to_owned()),
            ..CacheConfig::default()
        };
        assert_eq!(config.connection_url(), "redis://cache.internal:6380/1");
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("REDIS_HOST", "redis.svc"),
            ("REDIS_PORT", "6390"),
            ("REDIS_DB", "3"),
            ("REDIS_PASSWORD", ""),
            ("REDIS_POOL_SIZE", "not-a-number"),
            ("CACHE_DEFAULT_TTL", "120"),
        ]);
        let config = CacheConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.host, "redis.svc");
        assert_eq!(config.port, 6390);
        assert_eq!(config.db, 3);
        assert_eq!(config.password, None);
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.default_ttl, Duration::from_secs(120));
        assert_eq!(config.connection_url(), "redis://redis.svc:6390/3");
    }
}

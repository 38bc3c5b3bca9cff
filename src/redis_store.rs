//! Redis-backed store and connection management
//!
//! Holds a small pool of multiplexed `ConnectionManager` handles. A handle is
//! cloned out of the pool for each command and never reserved across
//! commands, so the store is safe to share between any number of tasks.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult, Script};
use tracing::{debug, error, info, warn};

use crate::store::{KeyValueStore, whole_secs};
use crate::{CacheConfig, CacheError};

/// Deletes KEYS[1] only while it still holds ARGV[1].
static COMPARE_AND_DELETE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#,
    )
});

struct RedisStoreInner {
    pool: RwLock<Vec<ConnectionManager>>,
    next: AtomicUsize,
    command_timeout: Duration,
    endpoint: String,
}

/// Connection-pooled Redis store
#[derive(Clone)]
pub struct RedisStore {
    inner: Arc<RedisStoreInner>,
}

impl RedisStore {
    /// Connect to Redis and verify the connection with PING.
    ///
    /// When `retry_on_error` is set, a failed first attempt is followed by a
    /// single reconnection attempt after `reconnect_delay`.
    pub async fn connect(config: &CacheConfig) -> Result<Self, CacheError> {
        let endpoint = Self::endpoint(config);
        let client = redis::Client::open(config.connection_url())?;

        match Self::open_pool(&client, config, &endpoint).await {
            Ok(store) => {
                info!("Connected to Redis at {}", endpoint);
                Ok(store)
            }
            Err(e) => {
                error!("Failed to connect to Redis at {}: {}", endpoint, e);
                if !config.retry_on_error {
                    return Err(CacheError::Connection(format!(
                        "unable to connect to Redis at {endpoint}: {e}"
                    )));
                }

                info!(
                    "Retrying Redis connection to {} in {:?}",
                    endpoint, config.reconnect_delay
                );
                tokio::time::sleep(config.reconnect_delay).await;

                match Self::open_pool(&client, config, &endpoint).await {
                    Ok(store) => {
                        info!("Reconnected to Redis at {}", endpoint);
                        Ok(store)
                    }
                    Err(e) => {
                        error!("Reconnection to Redis at {} failed: {}", endpoint, e);
                        Err(CacheError::Connection(format!(
                            "unable to connect to Redis at {endpoint}: {e}"
                        )))
                    }
                }
            }
        }
    }

    async fn open_pool(
        client: &redis::Client,
        config: &CacheConfig,
        endpoint: &str,
    ) -> Result<Self, CacheError> {
        let size = config.pool_size.max(1);
        let mut pool = Vec::with_capacity(size);
        for _ in 0..size {
            let manager =
                tokio::time::timeout(config.command_timeout, ConnectionManager::new(client.clone()))
                    .await
                    .map_err(|_| CacheError::Timeout(config.command_timeout))??;
            pool.push(manager);
        }

        let store = Self {
            inner: Arc::new(RedisStoreInner {
                pool: RwLock::new(pool),
                next: AtomicUsize::new(0),
                command_timeout: config.command_timeout,
                endpoint: endpoint.to_owned(),
            }),
        };
        store.ping().await?;
        Ok(store)
    }

    /// Host/port/db for log lines; never includes credentials.
    fn endpoint(config: &CacheConfig) -> String {
        match &config.url {
            Some(_) => "REDIS_URL".to_owned(),
            None => format!("{}:{}, DB: {}", config.host, config.port, config.db),
        }
    }

    /// Clone a pooled handle, round-robin.
    fn acquire(&self) -> Result<ConnectionManager, CacheError> {
        let pool = self
            .inner
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if pool.is_empty() {
            return Err(CacheError::Closed);
        }
        let slot = self.inner.next.fetch_add(1, Ordering::Relaxed) % pool.len();
        Ok(pool[slot].clone())
    }

    /// Run one command on a pooled handle, bounded by the command timeout.
    async fn run<T, F, Fut>(&self, op: &'static str, key: &str, command: F) -> Result<T, CacheError>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.acquire()?;
        match tokio::time::timeout(self.inner.command_timeout, command(conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                debug!("Redis {} failed for key {}: {}", op, key, e);
                Err(CacheError::Redis(e))
            }
            Err(_) => {
                warn!(
                    "Redis {} timed out after {:?} for key {}",
                    op, self.inner.command_timeout, key
                );
                Err(CacheError::Timeout(self.inner.command_timeout))
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.run("GET", key, |mut conn| async move {
            conn.get::<_, Option<String>>(key).await
        })
        .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let seconds = whole_secs(ttl);
        self.run("SETEX", key, |mut conn| async move {
            conn.set_ex::<_, _, ()>(key, value, seconds).await
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<u64, CacheError> {
        self.run("DEL", key, |mut conn| async move {
            conn.del::<_, u64>(key).await
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.run("EXISTS", key, |mut conn| async move {
            conn.exists::<_, bool>(key).await
        })
        .await
    }

    async fn ttl(&self, key: &str) -> Result<i64, CacheError> {
        self.run("TTL", key, |mut conn| async move {
            conn.ttl::<_, i64>(key).await
        })
        .await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        match ttl {
            Some(ttl) => {
                let seconds = whole_secs(ttl);
                self.run("SET NX EX", key, |mut conn| async move {
                    let reply: Option<String> = redis::cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("NX")
                        .arg("EX")
                        .arg(seconds)
                        .query_async(&mut conn)
                        .await?;
                    Ok(reply.is_some())
                })
                .await
            }
            None => {
                self.run("SETNX", key, |mut conn| async move {
                    redis::cmd("SETNX")
                        .arg(key)
                        .arg(value)
                        .query_async::<bool>(&mut conn)
                        .await
                })
                .await
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let seconds = whole_secs(ttl);
        self.run("EXPIRE", key, |mut conn| async move {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(seconds)
                .query_async::<bool>(&mut conn)
                .await
        })
        .await
    }

    async fn increment(&self, key: &str) -> Result<i64, CacheError> {
        self.run("INCR", key, |mut conn| async move {
            redis::cmd("INCR").arg(key).query_async::<i64>(&mut conn).await
        })
        .await
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        self.run("compare-and-delete", key, |mut conn| async move {
            let removed: i64 = COMPARE_AND_DELETE
                .key(key)
                .arg(expected)
                .invoke_async(&mut conn)
                .await?;
            Ok(removed == 1)
        })
        .await
    }

    async fn ping(&self) -> Result<(), CacheError> {
        self.run("PING", "-", |mut conn| async move {
            redis::cmd("PING").query_async::<String>(&mut conn).await
        })
        .await?;
        Ok(())
    }

    fn close(&self) {
        let mut pool = self
            .inner
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let handles = pool.len();
        pool.clear();
        info!(
            "Redis connection to {} closed ({} pooled handles dropped)",
            self.inner.endpoint, handles
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_never_contains_password() {
        let config = CacheConfig {
            password: Some("hunter2".to_owned()),
            ..CacheConfig::default()
        };
        let endpoint = RedisStore::endpoint(&config);
        assert_eq!(endpoint, "localhost:6379, DB: 0");

        let config = CacheConfig {
            url: Some("redis://:hunter2@cache:6379/0".to_owned()),
            ..CacheConfig::default()
        };
        assert!(!RedisStore::endpoint(&config).contains("hunter2"));
    }

    #[tokio::test]
    async fn test_connect_fails_without_server() {
        let config = CacheConfig {
            host: "127.0.0.1".to_owned(),
            port: 1,
            retry_on_error: false,
            command_timeout: Duration::from_millis(500),
            ..CacheConfig::default()
        };

        let err = RedisStore::connect(&config)
            .await
            .err()
            .expect("nothing listens on port 1");
        assert!(err.is_connectivity());
    }
}

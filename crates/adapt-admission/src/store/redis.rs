use super::{KvStore, WindowCount};
use crate::error::StoreError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisError, Script};
use std::time::Duration;

/// Increment, then attach the window expiry if the counter has none.
///
/// Runs as one script so no other client can observe the counter between
/// the increment and the expiry.
const INCR_WITH_EXPIRY: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if count == 1 or ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// Store backed by a Redis server shared by every API instance.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    incr_script: Script,
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://localhost:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(store_error)?;
        let conn = ConnectionManager::new(client).await.map_err(store_error)?;

        tracing::info!(url = %redact(url), "connected to redis store");

        Ok(Self {
            conn,
            incr_script: Script::new(INCR_WITH_EXPIRY),
        })
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_error)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn incr_with_expiry(
        &self,
        key: &str,
        window: Duration,
    ) -> Result<WindowCount, StoreError> {
        let mut conn = self.conn.clone();
        let (count, ttl_ms): (i64, i64) = self
            .incr_script
            .key(key)
            .arg(millis(window))
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;

        let count = u64::try_from(count)
            .map_err(|_| StoreError::Protocol(format!("negative counter at '{}'", key)))?;
        let ttl = Duration::from_millis(u64::try_from(ttl_ms).unwrap_or(0));

        Ok(WindowCount { count, ttl })
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(())
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn store_error(err: RedisError) -> StoreError {
    match err.kind() {
        ErrorKind::TypeError | ErrorKind::ResponseError => StoreError::Protocol(err.to_string()),
        _ => StoreError::Unavailable(err.to_string()),
    }
}

/// Drop credentials from a connection URL before logging it.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***{}", &url[..scheme], &url[at..])
        }
        _ => url.to_string(),
    }
}

//! Redis-backed counters shared across worker processes.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::info;

use crate::{KeyValueStore, QueueError, Result};

/// Increments every key and sets its expiry only when the key is new.
/// Runs as one script, so all counters move together.
const INCR_WITH_TTL: &str = r#"
local results = {}
for i, key in ipairs(KEYS) do
  local value = redis.call('INCR', key)
  if value == 1 then
    redis.call('PEXPIRE', key, ARGV[i])
  end
  results[i] = value
end
return results
"#;

pub struct RedisKeyValueStore {
    conn: ConnectionManager,
    script: Script,
}

impl RedisKeyValueStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::Backend(format!("invalid redis url: {}", e)))?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected rate counter store to Redis");
        Ok(Self {
            conn,
            script: Script::new(INCR_WITH_TTL),
        })
    }
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    async fn incr_many(&self, entries: &[(String, Duration)]) -> Result<Vec<u64>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let mut invocation = self.script.prepare_invoke();
        for (key, ttl) in entries {
            invocation.key(key).arg(ttl.as_millis().max(1) as u64);
        }
        let mut conn = self.conn.clone();
        let values: Vec<u64> = invocation.invoke_async(&mut conn).await?;
        Ok(values)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = conn.get(key).await?;
        Ok(value)
    }
}

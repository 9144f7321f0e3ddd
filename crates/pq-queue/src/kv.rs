//! Key-value counters with TTL.
//!
//! The contract matches Redis `INCR` + `PEXPIRE` applied only when the key
//! was newly created, so a window's expiry is fixed by its first hit.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::Result;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Increment and return the new value. A missing or expired key starts
    /// at zero and gets `ttl`.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64> {
        let values = self.incr_many(&[(key.to_string(), ttl)]).await?;
        Ok(values.first().copied().unwrap_or(0))
    }

    /// Increment several keys as one atomic operation.
    async fn incr_many(&self, entries: &[(String, Duration)]) -> Result<Vec<u64>>;

    async fn get(&self, key: &str) -> Result<Option<u64>>;
}

struct Counter {
    value: u64,
    expires_at: Instant,
}

/// Process-local store. One mutex covers every key, which makes
/// `incr_many` atomic with respect to concurrent callers. Expired keys are
/// swept on every increment, so only live windows stay resident.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    counters: Mutex<HashMap<String, Counter>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resident keys, expired ones included until the next increment.
    pub fn len(&self) -> usize {
        self.counters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn incr_many(&self, entries: &[(String, Duration)]) -> Result<Vec<u64>> {
        let now = Instant::now();
        let mut counters = self.counters.lock();
        counters.retain(|_, c| c.expires_at > now);
        let values = entries
            .iter()
            .map(|(key, ttl)| {
                let counter = counters.entry(key.clone()).or_insert(Counter {
                    value: 0,
                    expires_at: now + *ttl,
                });
                counter.value += 1;
                counter.value
            })
            .collect();
        Ok(values)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let now = Instant::now();
        Ok(self
            .counters
            .lock()
            .get(key)
            .filter(|c| c.expires_at > now)
            .map(|c| c.value))
    }
}

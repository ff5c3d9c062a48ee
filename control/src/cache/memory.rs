use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use super::{CacheOp, CachedValue, CacheStore, Pipeline};

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }

    fn live(&self, now: Instant) -> Option<CachedValue> {
        self.is_live(now).then(|| CachedValue {
            value: self.value.clone(),
            remaining: self.expires_at.saturating_duration_since(now),
        })
    }
}

/// Volatile in-process tier. Contents are lost on restart.
///
/// A pipeline is applied under one write lock, so concurrent readers see
/// either none or all of it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn lookup(&self, key: &str, now: Instant) -> Option<CachedValue> {
        self.entries.read().get(key).and_then(|e| e.live(now))
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get_entry(&self, key: &str) -> Result<Option<CachedValue>> {
        Ok(self.lookup(key, Instant::now()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        let expires_at = Instant::now() + ttl;
        self.entries
            .write()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn mget_entries(&self, keys: &[String]) -> Result<Vec<Option<CachedValue>>> {
        let now = Instant::now();
        let entries = self.entries.read();
        Ok(keys
            .iter()
            .map(|k| entries.get(k).and_then(|e| e.live(now)))
            .collect())
    }

    async fn execute(&self, pipeline: Pipeline) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        for op in pipeline.into_ops() {
            match op {
                CacheOp::Set { key, value, ttl } => {
                    entries.insert(
                        key,
                        Entry {
                            value,
                            expires_at: now + ttl,
                        },
                    );
                }
                CacheOp::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        Ok(before - entries.len())
    }
}

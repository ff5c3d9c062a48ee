//! Key/value cache shared by every fleet component.
//!
//! Two tiers back the cache: a fast in-memory tier ([`MemoryStore`]) and a
//! durable SQLite tier ([`SqliteStore`]). [`TieredStore`] composes them into
//! the store the rest of the control plane talks to.

pub mod keys;
mod memory;
mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// One operation in a pipelined batch.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheOp {
    Set {
        key: String,
        value: Value,
        ttl: Duration,
    },
    Delete {
        key: String,
    },
}

/// Operations sent to a store in a single round trip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    ops: Vec<CacheOp>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value, ttl: Duration) -> &mut Self {
        self.ops.push(CacheOp::Set {
            key: key.into(),
            value,
            ttl,
        });
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(CacheOp::Delete { key: key.into() });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[CacheOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<CacheOp> {
        self.ops
    }
}

/// A live value together with the time it has left before expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub value: Value,
    pub remaining: Duration,
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get_entry(&self, key: &str) -> Result<Option<CachedValue>>;

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.get_entry(key).await?.map(|e| e.value))
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Entries in the same order as `keys`; absent or expired keys are `None`.
    async fn mget_entries(&self, keys: &[String]) -> Result<Vec<Option<CachedValue>>>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Value>>> {
        let entries = self.mget_entries(keys).await?;
        Ok(entries.into_iter().map(|e| e.map(|e| e.value)).collect())
    }

    async fn execute(&self, pipeline: Pipeline) -> Result<()>;

    /// Drop expired entries, returning how many were removed.
    async fn purge_expired(&self) -> Result<usize>;
}

/// Fast tier in front of a durable tier.
///
/// Reads hit the fast tier first and promote durable hits into it; writes go
/// to both tiers, durable first, so the fast tier never holds a value older
/// than the durable one. A promoted copy lives for the shorter of
/// `promote_ttl` and the time the durable entry has left, so it never
/// outlives its source.
#[derive(Clone)]
pub struct TieredStore {
    fast: Arc<dyn CacheStore>,
    durable: Arc<dyn CacheStore>,
    promote_ttl: Duration,
}

impl TieredStore {
    pub fn new(fast: Arc<dyn CacheStore>, durable: Arc<dyn CacheStore>, promote_ttl: Duration) -> Self {
        Self {
            fast,
            durable,
            promote_ttl,
        }
    }

    pub fn fast(&self) -> &Arc<dyn CacheStore> {
        &self.fast
    }

    pub fn durable(&self) -> &Arc<dyn CacheStore> {
        &self.durable
    }

    fn promotion_ttl(&self, entry: &CachedValue) -> Duration {
        entry.remaining.min(self.promote_ttl)
    }
}

#[async_trait]
impl CacheStore for TieredStore {
    async fn get_entry(&self, key: &str) -> Result<Option<CachedValue>> {
        if let Some(entry) = self.fast.get_entry(key).await? {
            return Ok(Some(entry));
        }

        match self.durable.get_entry(key).await? {
            Some(entry) => {
                let ttl = self.promotion_ttl(&entry);
                self.fast.set(key, entry.value.clone(), ttl).await?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        self.durable.set(key, value.clone(), ttl).await?;
        self.fast.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.fast.delete(key).await?;
        self.durable.delete(key).await
    }

    async fn mget_entries(&self, keys: &[String]) -> Result<Vec<Option<CachedValue>>> {
        let mut entries = self.fast.mget_entries(keys).await?;

        let missing: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_none())
            .map(|(i, _)| i)
            .collect();
        if missing.is_empty() {
            return Ok(entries);
        }

        let missing_keys: Vec<String> = missing.iter().map(|&i| keys[i].clone()).collect();
        let durable = self.durable.mget_entries(&missing_keys).await?;

        let mut promote = Pipeline::new();
        for (&i, entry) in missing.iter().zip(durable) {
            if let Some(entry) = entry {
                promote.set(keys[i].clone(), entry.value.clone(), self.promotion_ttl(&entry));
                entries[i] = Some(entry);
            }
        }
        if !promote.is_empty() {
            self.fast.execute(promote).await?;
        }

        Ok(entries)
    }

    async fn execute(&self, pipeline: Pipeline) -> Result<()> {
        self.durable.execute(pipeline.clone()).await?;
        self.fast.execute(pipeline).await
    }

    async fn purge_expired(&self) -> Result<usize> {
        let fast = self.fast.purge_expired().await?;
        let durable = self.durable.purge_expired().await?;
        Ok(fast + durable)
    }
}

/// Read a typed value, treating backend and decode failures as a miss.
pub async fn get_json<T: DeserializeOwned>(cache: &dyn CacheStore, key: &str) -> Option<T> {
    match cache.get(key).await {
        Ok(Some(value)) => match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Discarding undecodable cache entry {}: {}", key, e);
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!("Cache read failed for {}: {}", key, e);
            None
        }
    }
}

/// Write a typed value, logging instead of failing.
pub async fn put_json<T: Serialize>(cache: &dyn CacheStore, key: &str, value: &T, ttl: Duration) {
    let value = match serde_json::to_value(value) {
        Ok(v) => v,
        Err(e) => {
            warn!("Failed to encode cache entry {}: {}", key, e);
            return;
        }
    };
    if let Err(e) = cache.set(key, value, ttl).await {
        warn!("Cache write failed for {}: {}", key, e);
    }
}

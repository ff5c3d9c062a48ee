use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::time::Duration;

use super::{CacheOp, CachedValue, CacheStore, Pipeline};
use crate::clock::unix_now_millis;
use crate::db::{execute_async, DbPool};

/// Durable tier backed by the `cache_entries` table.
///
/// Expiry is stored as wall-clock milliseconds and checked on every read;
/// expired rows linger until [`CacheStore::purge_expired`] removes them.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn expiry(now_ms: i64, ttl: Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now_ms.saturating_add(ttl_ms)
}

fn decode(key: &str, raw: String, expires_at: i64, now_ms: i64) -> Result<CachedValue> {
    let value = serde_json::from_str(&raw).with_context(|| format!("Corrupt cache row {}", key))?;
    let remaining_ms = u64::try_from(expires_at.saturating_sub(now_ms)).unwrap_or(0);
    Ok(CachedValue {
        value,
        remaining: Duration::from_millis(remaining_ms),
    })
}

#[async_trait]
impl CacheStore for SqliteStore {
    async fn get_entry(&self, key: &str) -> Result<Option<CachedValue>> {
        let key = key.to_string();
        execute_async(&self.pool, move |conn| {
            let now = unix_now_millis();
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT value, expires_at FROM cache_entries WHERE key = ?1 AND expires_at > ?2",
                    params![key, now],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            row.map(|(raw, expires_at)| decode(&key, raw, expires_at, now))
                .transpose()
        })
        .await
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        let key = key.to_string();
        let raw = serde_json::to_string(&value)?;
        execute_async(&self.pool, move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO cache_entries (key, value, expires_at) VALUES (?1, ?2, ?3)",
                params![key, raw, expiry(unix_now_millis(), ttl)],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        execute_async(&self.pool, move |conn| {
            conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn mget_entries(&self, keys: &[String]) -> Result<Vec<Option<CachedValue>>> {
        let keys = keys.to_vec();
        execute_async(&self.pool, move |conn| {
            let now = unix_now_millis();
            let mut stmt = conn.prepare_cached(
                "SELECT value, expires_at FROM cache_entries WHERE key = ?1 AND expires_at > ?2",
            )?;
            let mut entries = Vec::with_capacity(keys.len());
            for key in &keys {
                let row: Option<(String, i64)> = stmt
                    .query_row(params![key, now], |row| Ok((row.get(0)?, row.get(1)?)))
                    .optional()?;
                entries.push(
                    row.map(|(raw, expires_at)| decode(key, raw, expires_at, now))
                        .transpose()?,
                );
            }
            Ok(entries)
        })
        .await
    }

    async fn execute(&self, pipeline: Pipeline) -> Result<()> {
        if pipeline.is_empty() {
            return Ok(());
        }
        let mut rows = Vec::with_capacity(pipeline.len());
        for op in pipeline.into_ops() {
            rows.push(match op {
                CacheOp::Set { key, value, ttl } => (key, Some((serde_json::to_string(&value)?, ttl))),
                CacheOp::Delete { key } => (key, None),
            });
        }

        execute_async(&self.pool, move |conn| {
            let now = unix_now_millis();
            let tx = conn.transaction()?;
            {
                let mut upsert = tx.prepare_cached(
                    "INSERT OR REPLACE INTO cache_entries (key, value, expires_at) VALUES (?1, ?2, ?3)",
                )?;
                let mut remove = tx.prepare_cached("DELETE FROM cache_entries WHERE key = ?1")?;
                for (key, op) in &rows {
                    match op {
                        Some((raw, ttl)) => {
                            upsert.execute(params![key, raw, expiry(now, *ttl)])?;
                        }
                        None => {
                            remove.execute(params![key])?;
                        }
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn purge_expired(&self) -> Result<usize> {
        execute_async(&self.pool, |conn| {
            let removed = conn.execute(
                "DELETE FROM cache_entries WHERE expires_at <= ?1",
                params![unix_now_millis()],
            )?;
            Ok(removed)
        })
        .await
    }
}

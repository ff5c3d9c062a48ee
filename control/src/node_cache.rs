use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::cache::{get_json, keys, put_json, CacheStore, Pipeline};
use crate::clock::unix_now;
use crate::types::{Node, NodeId, User, UserId, UserNodeConfig};

/// Source of users for cache warm-up.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Enabled, unexpired users with id greater than `after`, ascending, at
    /// most `limit` of them.
    async fn active_users_after(&self, after: Option<UserId>, now: i64, limit: usize)
        -> Result<Vec<User>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmupReport {
    pub users: usize,
    pub batches: usize,
}

/// Per-(user, node) configuration cache over the tiered store.
#[derive(Clone)]
pub struct NodeCacheService {
    cache: Arc<dyn CacheStore>,
    ttl: Duration,
    chunk_size: usize,
}

impl NodeCacheService {
    pub fn new(cache: Arc<dyn CacheStore>, ttl: Duration, chunk_size: usize) -> Self {
        Self {
            cache,
            ttl,
            chunk_size: chunk_size.max(1),
        }
    }

    pub async fn get(&self, node_id: NodeId, user_id: UserId) -> Option<UserNodeConfig> {
        get_json(self.cache.as_ref(), &keys::user_node_config(user_id, node_id)).await
    }

    pub async fn update(&self, config: &UserNodeConfig) -> Result<()> {
        let key = keys::user_node_config(config.user_id, config.server_id);
        let value = serde_json::to_value(config)?;
        self.cache.set(&key, value, self.ttl).await.map_err(|e| {
            error!(
                "Failed to cache config for user_id={} node_id={}: {}",
                config.user_id, config.server_id, e
            );
            e
        })
    }

    /// Every requested user appears in the result; misses map to `None`.
    pub async fn batch_get(
        &self,
        node_id: NodeId,
        user_ids: &[UserId],
    ) -> HashMap<UserId, Option<UserNodeConfig>> {
        let cache_keys: Vec<String> = user_ids
            .iter()
            .map(|&u| keys::user_node_config(u, node_id))
            .collect();

        let values = match self.cache.mget(&cache_keys).await {
            Ok(values) => values,
            Err(e) => {
                warn!("Batch cache read failed for node_id={}: {}", node_id, e);
                vec![None; user_ids.len()]
            }
        };

        user_ids
            .iter()
            .zip(values)
            .map(|(&user_id, value)| {
                let config = value.and_then(|v| serde_json::from_value(v).ok());
                (user_id, config)
            })
            .collect()
    }

    pub async fn batch_update(&self, configs: &[UserNodeConfig]) -> Result<()> {
        let mut pipeline = Pipeline::new();
        for config in configs {
            pipeline.set(
                keys::user_node_config(config.user_id, config.server_id),
                serde_json::to_value(config)?,
                self.ttl,
            );
        }
        if pipeline.is_empty() {
            return Ok(());
        }
        self.cache
            .execute(pipeline)
            .await
            .context("Failed to batch update node configs")
    }

    pub async fn clear(&self, node_id: NodeId, user_id: UserId) -> Result<()> {
        self.cache
            .delete(&keys::user_node_config(user_id, node_id))
            .await
    }

    pub async fn batch_clear(&self, node_id: NodeId, user_ids: &[UserId]) -> Result<()> {
        let mut pipeline = Pipeline::new();
        for &user_id in user_ids {
            pipeline.delete(keys::user_node_config(user_id, node_id));
        }
        if pipeline.is_empty() {
            return Ok(());
        }
        self.cache
            .execute(pipeline)
            .await
            .context("Failed to batch clear node configs")
    }

    /// Walks every active user in keyset-paginated chunks, one batch update
    /// per chunk. A failed chunk aborts the warm-up of this node.
    pub async fn warmup_hot_data(&self, node: &Node, users: &dyn UserDirectory) -> Result<WarmupReport> {
        let now = unix_now();
        let mut report = WarmupReport::default();
        let mut after = None;

        loop {
            let chunk = users
                .active_users_after(after, now, self.chunk_size)
                .await
                .with_context(|| format!("Failed to load users for node {}", node.id))?;
            let Some(last) = chunk.last() else {
                break;
            };
            after = Some(last.id);

            let configs: Vec<UserNodeConfig> = chunk
                .iter()
                .map(|user| UserNodeConfig::for_user(node, user))
                .collect();
            self.batch_update(&configs)
                .await
                .with_context(|| format!("Warm-up failed for node {}", node.id))?;

            report.users += configs.len();
            report.batches += 1;
            if chunk.len() < self.chunk_size {
                break;
            }
        }

        info!(
            "Warmed up node_id={}: {} users in {} batches",
            node.id, report.users, report.batches
        );
        Ok(report)
    }

    /// Typed write for callers holding one config; failures are only logged.
    pub async fn remember(&self, config: &UserNodeConfig) {
        put_json(
            self.cache.as_ref(),
            &keys::user_node_config(config.user_id, config.server_id),
            config,
            self.ttl,
        )
        .await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::{CachedValue, MemoryStore, TieredStore};
    use crate::types::fixtures::{node, user};
    use parking_lot::Mutex;
    use serde_json::Value;

    const HOUR: Duration = Duration::from_secs(3600);

    /// Records the size of every pipeline executed against the inner store.
    #[derive(Default)]
    pub struct CountingStore {
        pub inner: MemoryStore,
        pub pipelines: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl CacheStore for CountingStore {
        async fn get_entry(&self, key: &str) -> Result<Option<CachedValue>> {
            self.inner.get_entry(key).await
        }
        async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
            self.inner.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }
        async fn mget_entries(&self, keys: &[String]) -> Result<Vec<Option<CachedValue>>> {
            self.inner.mget_entries(keys).await
        }
        async fn execute(&self, pipeline: Pipeline) -> Result<()> {
            self.pipelines.lock().push(pipeline.len());
            self.inner.execute(pipeline).await
        }
        async fn purge_expired(&self) -> Result<usize> {
            self.inner.purge_expired().await
        }
    }

    /// In-memory user table honouring the keyset contract.
    pub struct StaticUsers(pub Vec<User>);

    #[async_trait]
    impl UserDirectory for StaticUsers {
        async fn active_users_after(
            &self,
            after: Option<UserId>,
            now: i64,
            limit: usize,
        ) -> Result<Vec<User>> {
            let mut users: Vec<User> = self
                .0
                .iter()
                .filter(|u| u.is_active(now) && after.map_or(true, |a| u.id > a))
                .cloned()
                .collect();
            users.sort_by_key(|u| u.id);
            users.truncate(limit);
            Ok(users)
        }
    }

    fn service() -> (NodeCacheService, Arc<CountingStore>, Arc<MemoryStore>) {
        let fast = Arc::new(CountingStore::default());
        let durable = Arc::new(MemoryStore::new());
        let tiered = TieredStore::new(fast.clone(), durable.clone(), HOUR);
        (NodeCacheService::new(Arc::new(tiered), HOUR, 100), fast, durable)
    }

    #[tokio::test]
    async fn test_get_promotes_durable_hit() {
        let (svc, fast, durable) = service();
        let cfg = UserNodeConfig::for_user(&node(1), &user(2));
        durable
            .set(
                &keys::user_node_config(2, 1),
                serde_json::to_value(&cfg).unwrap(),
                HOUR,
            )
            .await
            .unwrap();

        assert_eq!(svc.get(1, 2).await, Some(cfg));
        assert!(fast.get(&keys::user_node_config(2, 1)).await.unwrap().is_some());
        assert!(svc.get(1, 3).await.is_none());
    }

    #[tokio::test]
    async fn test_batch_get_falls_back_to_durable() {
        let (svc, _fast, durable) = service();
        svc.update(&UserNodeConfig::for_user(&node(1), &user(1))).await.unwrap();
        let cfg = UserNodeConfig::for_user(&node(1), &user(2));
        durable
            .set(
                &keys::user_node_config(2, 1),
                serde_json::to_value(&cfg).unwrap(),
                HOUR,
            )
            .await
            .unwrap();

        let got = svc.batch_get(1, &[1, 2, 3]).await;
        assert_eq!(got.len(), 3);
        assert!(got[&1].is_some());
        assert_eq!(got[&2], Some(cfg));
        assert!(got[&3].is_none());
    }

    #[tokio::test]
    async fn test_batch_clear_removes_both_tiers() {
        let (svc, fast, durable) = service();
        let configs: Vec<_> = (1..=3).map(|u| UserNodeConfig::for_user(&node(1), &user(u))).collect();
        svc.batch_update(&configs).await.unwrap();
        svc.batch_clear(1, &[1, 2]).await.unwrap();

        assert!(svc.get(1, 1).await.is_none());
        assert!(durable.get(&keys::user_node_config(2, 1)).await.unwrap().is_none());
        assert!(svc.get(1, 3).await.is_some());
        assert_eq!(*fast.pipelines.lock(), vec![3, 2]);
    }

    #[tokio::test]
    async fn test_warmup_batches_in_chunks() {
        let (svc, fast, _durable) = service();
        let mut users: Vec<User> = (1..=250).map(user).collect();
        users.push(User {
            enabled: false,
            ..user(251)
        });
        users.push(User {
            expired_at: Some(1),
            ..user(252)
        });

        let report = svc.warmup_hot_data(&node(7), &StaticUsers(users)).await.unwrap();
        assert_eq!(report, WarmupReport { users: 250, batches: 3 });
        assert_eq!(*fast.pipelines.lock(), vec![100, 100, 50]);

        let got = svc.batch_get(7, &[1, 250, 251, 252]).await;
        assert!(got[&1].is_some());
        assert!(got[&250].is_some());
        assert!(got[&251].is_none());
        assert!(got[&252].is_none());
    }

    #[tokio::test]
    async fn test_warmup_with_no_users_does_nothing() {
        let (svc, fast, _durable) = service();
        let report = svc.warmup_hot_data(&node(7), &StaticUsers(Vec::new())).await.unwrap();
        assert_eq!(report, WarmupReport::default());
        assert!(fast.pipelines.lock().is_empty());
    }
}

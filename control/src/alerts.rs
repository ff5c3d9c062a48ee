use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::cache::{get_json, keys, put_json, CacheStore};
use crate::clock::unix_now;
use crate::events::{EventSink, FleetEvent};
use crate::types::{Alert, AlertScope};

pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Append-only alert history per scope, kept in the cache tier.
///
/// Appends are read-modify-write on one key, so they are serialized per log.
/// Each scope keeps at most `max_entries` alerts; the oldest are dropped first.
pub struct AlertLog {
    cache: Arc<dyn CacheStore>,
    events: Arc<dyn EventSink>,
    retention: Duration,
    max_entries: usize,
    write_lock: Mutex<()>,
}

impl AlertLog {
    pub fn new(cache: Arc<dyn CacheStore>, events: Arc<dyn EventSink>, retention: Duration) -> Self {
        Self {
            cache,
            events,
            retention,
            max_entries: DEFAULT_MAX_ENTRIES,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    pub async fn record(&self, alert: Alert) {
        warn!(
            "Alert {:?} for {:?}: {}",
            alert.kind, alert.scope, alert.message
        );

        if let Err(e) = self.append(&alert).await {
            error!("Alert history for {:?} left unchanged: {:#}", alert.scope, e);
        }

        if let AlertScope::Node(node_id) = alert.scope {
            self.events.emit(FleetEvent::NodeAlert { node_id, alert });
        }
    }

    // A history that cannot be read is never overwritten.
    async fn append(&self, alert: &Alert) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = keys::alerts(alert.scope);

        let mut history: Vec<Alert> = match self
            .cache
            .get(&key)
            .await
            .with_context(|| format!("Failed to read {}", key))?
        {
            Some(value) => {
                serde_json::from_value(value).with_context(|| format!("Undecodable {}", key))?
            }
            None => Vec::new(),
        };

        history.push(alert.clone());
        let excess = history.len().saturating_sub(self.max_entries);
        history.drain(..excess);

        let value = serde_json::to_value(&history)?;
        self.cache
            .set(&key, value, self.retention)
            .await
            .with_context(|| format!("Failed to write {}", key))
    }

    pub async fn record_all(&self, alerts: &[Alert]) {
        for alert in alerts {
            self.record(alert.clone()).await;
        }
    }

    /// The `limit` most recent alerts, oldest first.
    pub async fn history(&self, scope: AlertScope, limit: usize) -> Vec<Alert> {
        let mut history: Vec<Alert> = get_json(self.cache.as_ref(), &keys::alerts(scope))
            .await
            .unwrap_or_default();
        let skip = history.len().saturating_sub(limit);
        history.drain(..skip);
        history
    }

    /// Drop alerts older than `days`, returning how many were removed.
    pub async fn cleanup(&self, scope: AlertScope, days: u32) -> usize {
        let cutoff = unix_now() - i64::from(days) * 86_400;

        let _guard = self.write_lock.lock().await;
        let key = keys::alerts(scope);
        let Some(mut history) = get_json::<Vec<Alert>>(self.cache.as_ref(), &key).await else {
            return 0;
        };

        let before = history.len();
        history.retain(|a| a.timestamp >= cutoff);
        let removed = before - history.len();
        if removed > 0 {
            put_json(self.cache.as_ref(), &key, &history, self.retention).await;
            info!("Removed {} alerts older than {} days for {:?}", removed, days, scope);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::events::tests::RecordingSink;
    use crate::cache::CachedValue;
    use crate::types::AlertKind;
    use anyhow::bail;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory store whose reads can be switched to fail like a locked database.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_reads: AtomicBool,
    }

    #[async_trait]
    impl CacheStore for FlakyStore {
        async fn get_entry(&self, key: &str) -> Result<Option<CachedValue>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                bail!("database is locked");
            }
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
        async fn execute(&self, pipeline: crate::cache::Pipeline) -> Result<()> {
            self.inner.execute(pipeline).await
        }
        async fn purge_expired(&self) -> Result<usize> {
            self.inner.purge_expired().await
        }
    }

    fn log() -> (AlertLog, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let log = AlertLog::new(
            Arc::new(MemoryStore::new()),
            sink.clone(),
            Duration::from_secs(7 * 86_400),
        );
        (log, sink)
    }

    #[tokio::test]
    async fn test_history_returns_most_recent_in_order() {
        let (log, sink) = log();
        let scope = AlertScope::Node(1);
        for ts in 1..=5 {
            log.record(Alert::new(scope, AlertKind::HighCpuUsage, "cpu", ts)).await;
        }

        let recent: Vec<i64> = log.history(scope, 3).await.iter().map(|a| a.timestamp).collect();
        assert_eq!(recent, vec![3, 4, 5]);
        assert_eq!(log.history(scope, 10).await.len(), 5);
        assert!(log.history(AlertScope::Node(2), 10).await.is_empty());
        assert_eq!(sink.0.lock().len(), 5);
    }

    #[tokio::test]
    async fn test_user_alerts_do_not_emit_node_events() {
        let (log, sink) = log();
        log.record(Alert::new(AlertScope::User(3), AlertKind::HighTrafficUsage, "quota", 1))
            .await;
        assert_eq!(log.history(AlertScope::User(3), 5).await.len(), 1);
        assert!(sink.0.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_drops_old_alerts() {
        let (log, _) = log();
        let scope = AlertScope::Node(1);
        let now = unix_now();
        log.record(Alert::new(scope, AlertKind::HighDiskUsage, "old", now - 8 * 86_400))
            .await;
        log.record(Alert::new(scope, AlertKind::HighDiskUsage, "new", now)).await;

        assert_eq!(log.cleanup(scope, 7).await, 1);
        let left = log.history(scope, 10).await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].message, "new");
    }

    #[tokio::test]
    async fn test_failed_read_keeps_existing_history() {
        let store = Arc::new(FlakyStore::default());
        let sink = Arc::new(RecordingSink::default());
        let log = AlertLog::new(store.clone(), sink.clone(), Duration::from_secs(86_400));
        let scope = AlertScope::Node(1);
        for ts in 1..=3 {
            log.record(Alert::new(scope, AlertKind::HighCpuUsage, "cpu", ts)).await;
        }

        store.fail_reads.store(true, Ordering::SeqCst);
        log.record(Alert::new(scope, AlertKind::HighCpuUsage, "cpu", 4)).await;
        store.fail_reads.store(false, Ordering::SeqCst);

        assert_eq!(log.history(scope, 10).await.len(), 3);
        assert_eq!(sink.0.lock().len(), 4);

        log.record(Alert::new(scope, AlertKind::HighCpuUsage, "cpu", 5)).await;
        let stamps: Vec<i64> = log.history(scope, 10).await.iter().map(|a| a.timestamp).collect();
        assert_eq!(stamps, vec![1, 2, 3, 5]);
    }

    #[tokio::test]
    async fn test_undecodable_history_is_not_overwritten() {
        let store = Arc::new(MemoryStore::new());
        let log = AlertLog::new(
            store.clone(),
            Arc::new(RecordingSink::default()),
            Duration::from_secs(86_400),
        );
        let key = keys::alerts(AlertScope::Node(1));
        store.set(&key, json!("not a list"), Duration::from_secs(60)).await.unwrap();

        log.record(Alert::new(AlertScope::Node(1), AlertKind::HighDiskUsage, "disk", 1))
            .await;
        assert_eq!(store.get(&key).await.unwrap(), Some(json!("not a list")));
    }

    #[tokio::test]
    async fn test_history_is_capped_per_scope() {
        let (log, _) = log();
        let log = log.with_max_entries(3);
        let scope = AlertScope::Node(1);
        for ts in 1..=5 {
            log.record(Alert::new(scope, AlertKind::HighMemoryUsage, "mem", ts)).await;
        }

        let stamps: Vec<i64> = log.history(scope, 10).await.iter().map(|a| a.timestamp).collect();
        assert_eq!(stamps, vec![3, 4, 5]);
    }
}

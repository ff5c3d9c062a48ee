use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::alerts::AlertLog;
use crate::clock::unix_now;
use crate::error::NodeClientError;
use crate::events::{EventSink, FleetEvent};
use crate::node_cache::NodeCacheService;
use crate::node_client::NodeClient;
use crate::types::{
    Alert, AlertKind, AlertScope, Node, NodeConfig, NodeId, SyncStatus, User, UserId,
    UserNodeConfig,
};

/// Outcome of reconciling a node's users with the inventory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub synced: usize,
    pub removed: usize,
}

/// Write paths towards nodes: config pushes and user sync.
pub struct NodeManager {
    client: NodeClient,
    node_cache: NodeCacheService,
    alerts: Arc<AlertLog>,
    events: Arc<dyn EventSink>,
    sync_status: RwLock<HashMap<NodeId, HashMap<UserId, SyncStatus>>>,
}

impl NodeManager {
    pub fn new(
        client: NodeClient,
        node_cache: NodeCacheService,
        alerts: Arc<AlertLog>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            client,
            node_cache,
            alerts,
            events,
            sync_status: RwLock::new(HashMap::new()),
        }
    }

    async fn sync_failed(&self, node_id: NodeId, user_id: UserId, e: &NodeClientError) {
        let message = e.to_string();
        self.mark(node_id, user_id, Some(message.clone()));
        self.node_alert(node_id, AlertKind::NodeError, message).await;
    }

    async fn node_alert(&self, node_id: NodeId, kind: AlertKind, message: String) {
        self.alerts
            .record(Alert::new(AlertScope::Node(node_id), kind, message, unix_now()))
            .await;
    }

    pub async fn update_node_config(
        &self,
        node: &Node,
        overrides: serde_json::Value,
    ) -> Result<(), NodeClientError> {
        let config = NodeConfig::from_node(node, overrides);
        if let Err(e) = self.client.update_config(node, &config).await {
            self.node_alert(node.id, AlertKind::ConfigError, e.to_string()).await;
            return Err(e);
        }

        info!("Pushed config to node_id={}", node.id);
        self.events.emit(FleetEvent::NodeStatusChanged {
            node_id: node.id,
            status: "config_updated".to_string(),
        });
        Ok(())
    }

    fn mark(&self, node_id: NodeId, user_id: UserId, error: Option<String>) {
        let status = SyncStatus {
            success: error.is_none(),
            error,
            timestamp: unix_now(),
        };
        self.sync_status
            .write()
            .entry(node_id)
            .or_default()
            .insert(user_id, status);
    }

    pub async fn sync_user(&self, node: &Node, user: &User) -> Result<(), NodeClientError> {
        match self.client.sync_user(node, user).await {
            Ok(()) => {
                self.node_cache
                    .remember(&UserNodeConfig::for_user(node, user))
                    .await;
                self.mark(node.id, user.id, None);
                Ok(())
            }
            Err(e) => {
                self.sync_failed(node.id, user.id, &e).await;
                Err(e)
            }
        }
    }

    /// Take a user off a node and drop its cached config there.
    pub async fn remove_user(&self, node: &Node, user_id: UserId) -> Result<(), NodeClientError> {
        if let Err(e) = self.client.remove_user(node, user_id).await {
            self.sync_failed(node.id, user_id, &e).await;
            return Err(e);
        }

        if let Err(e) = self.node_cache.clear(node.id, user_id).await {
            warn!(
                "Removed user_id={} from node_id={} but kept its cached config: {:#}",
                user_id, node.id, e
            );
        }
        self.mark(node.id, user_id, None);
        info!("Removed user_id={} from node_id={}", user_id, node.id);
        Ok(())
    }

    pub async fn update_user_quota(&self, node: &Node, user: &User) -> Result<(), NodeClientError> {
        match self.client.update_user_quota(node, user).await {
            Ok(()) => {
                self.node_cache
                    .remember(&UserNodeConfig::for_user(node, user))
                    .await;
                self.mark(node.id, user.id, None);
                Ok(())
            }
            Err(e) => {
                self.sync_failed(node.id, user.id, &e).await;
                Err(e)
            }
        }
    }

    /// Sync active users, then remove the disabled or expired ones. Stops at
    /// the first failure.
    pub async fn reconcile_users(
        &self,
        node: &Node,
        users: &[User],
        now: i64,
    ) -> Result<SyncReport, NodeClientError> {
        let (active, inactive): (Vec<User>, Vec<User>) =
            users.iter().cloned().partition(|u| u.is_active(now));

        let synced = self.sync_users(node, &active).await?;
        for user in &inactive {
            self.remove_user(node, user.id).await?;
        }
        Ok(SyncReport {
            synced,
            removed: inactive.len(),
        })
    }

    /// Syncs in order and stops at the first failure.
    pub async fn sync_users(&self, node: &Node, users: &[User]) -> Result<usize, NodeClientError> {
        for user in users {
            self.sync_user(node, user).await?;
        }

        info!("Synced {} users to node_id={}", users.len(), node.id);
        self.events.emit(FleetEvent::UserSyncCompleted {
            node_id: node.id,
            count: users.len(),
        });
        Ok(users.len())
    }

    pub fn sync_status(&self, node_id: NodeId, user_id: UserId) -> Option<SyncStatus> {
        self.sync_status
            .read()
            .get(&node_id)
            .and_then(|users| users.get(&user_id))
            .cloned()
    }

    pub fn node_sync_status(&self, node_id: NodeId) -> HashMap<UserId, SyncStatus> {
        self.sync_status
            .read()
            .get(&node_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::events::tests::RecordingSink;
    use crate::node_client::mock::{client, MockTransport};
    use crate::types::fixtures::{node, user};
    use std::time::Duration;

    struct Harness {
        manager: NodeManager,
        transport: Arc<MockTransport>,
        sink: Arc<RecordingSink>,
        alerts: Arc<AlertLog>,
        node_cache: NodeCacheService,
    }

    fn harness() -> Harness {
        let transport = Arc::new(MockTransport::default());
        let cache = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let alerts = Arc::new(AlertLog::new(
            cache.clone(),
            sink.clone(),
            Duration::from_secs(86_400),
        ));
        let node_cache = NodeCacheService::new(cache.clone(), Duration::from_secs(3600), 100);
        let manager = NodeManager::new(
            client(transport.clone(), cache),
            node_cache.clone(),
            alerts.clone(),
            sink.clone(),
        );
        Harness {
            manager,
            transport,
            sink,
            alerts,
            node_cache,
        }
    }

    #[tokio::test]
    async fn test_config_push_emits_status_change() {
        let h = harness();
        h.manager
            .update_node_config(&node(1), serde_json::json!({"mux": true}))
            .await
            .unwrap();

        assert_eq!(h.transport.configs.lock().len(), 1);
        assert!(h.sink.0.lock().contains(&FleetEvent::NodeStatusChanged {
            node_id: 1,
            status: "config_updated".to_string(),
        }));
    }

    #[tokio::test]
    async fn test_invalid_config_records_config_error() {
        let h = harness();
        let err = h
            .manager
            .update_node_config(&node(1), serde_json::json!("not an object"))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeClientError::InvalidConfig(_)));

        let history = h.alerts.history(AlertScope::Node(1), 10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, AlertKind::ConfigError);
        assert!(h.transport.configs.lock().is_empty());
    }

    #[tokio::test]
    async fn test_sync_users_caches_configs_and_reports() {
        let h = harness();
        let users: Vec<User> = (1..=3).map(user).collect();

        assert_eq!(h.manager.sync_users(&node(2), &users).await.unwrap(), 3);
        assert!(h.node_cache.get(2, 3).await.is_some());
        assert!(h.manager.sync_status(2, 1).unwrap().success);
        assert_eq!(h.manager.node_sync_status(2).len(), 3);
        assert!(h
            .sink
            .0
            .lock()
            .contains(&FleetEvent::UserSyncCompleted { node_id: 2, count: 3 }));
    }

    #[tokio::test]
    async fn test_sync_failure_is_tracked_and_alerted() {
        let h = harness();
        h.transport.set_down(2);

        let users: Vec<User> = (1..=3).map(user).collect();
        assert!(h.manager.sync_users(&node(2), &users).await.is_err());

        let status = h.manager.sync_status(2, 1).unwrap();
        assert!(!status.success);
        assert!(status.error.is_some());
        assert!(h.manager.sync_status(2, 2).is_none());

        let history = h.alerts.history(AlertScope::Node(2), 10).await;
        assert_eq!(history[0].kind, AlertKind::NodeError);
    }

    #[tokio::test]
    async fn test_remove_user_clears_cached_config() {
        let h = harness();
        h.manager.sync_user(&node(1), &user(5)).await.unwrap();
        assert!(h.node_cache.get(1, 5).await.is_some());

        h.manager.remove_user(&node(1), 5).await.unwrap();
        assert!(h.node_cache.get(1, 5).await.is_none());
        assert_eq!(*h.transport.removed.lock(), vec![(1, 5)]);
        assert!(h.manager.sync_status(1, 5).unwrap().success);
    }

    #[tokio::test]
    async fn test_failed_removal_keeps_cache_and_alerts() {
        let h = harness();
        h.manager.sync_user(&node(1), &user(5)).await.unwrap();
        h.transport.set_down(1);

        assert!(h.manager.remove_user(&node(1), 5).await.is_err());
        assert!(h.node_cache.get(1, 5).await.is_some());
        assert!(!h.manager.sync_status(1, 5).unwrap().success);
        let history = h.alerts.history(AlertScope::Node(1), 10).await;
        assert_eq!(history[0].kind, AlertKind::NodeError);
    }

    #[tokio::test]
    async fn test_quota_push_tracks_status() {
        let h = harness();
        let mut u = user(6);
        u.transfer_enable = 500;
        u.speed_limit = Some(20);
        h.manager.update_user_quota(&node(2), &u).await.unwrap();
        assert_eq!(*h.transport.quotas.lock(), vec![(2, 6, 500)]);
        assert_eq!(h.node_cache.get(2, 6).await.unwrap().speed_limit, Some(20));
        assert!(h.manager.sync_status(2, 6).unwrap().success);

        h.transport.set_down(2);
        assert!(h.manager.update_user_quota(&node(2), &u).await.is_err());
        assert!(!h.manager.sync_status(2, 6).unwrap().success);
    }

    #[tokio::test]
    async fn test_reconcile_removes_inactive_users() {
        let h = harness();
        let mut disabled = user(2);
        disabled.enabled = false;
        let mut expired = user(3);
        expired.expired_at = Some(10);
        let users = vec![user(1), disabled, expired];

        let report = h.manager.reconcile_users(&node(1), &users, 100).await.unwrap();
        assert_eq!(report, SyncReport { synced: 1, removed: 2 });
        assert_eq!(*h.transport.synced.lock(), vec![(1, 1)]);
        assert_eq!(*h.transport.removed.lock(), vec![(1, 2), (1, 3)]);
    }
}

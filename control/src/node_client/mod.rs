//! Transport to node management agents.
//!
//! [`NodeTransport`] is implemented once per agent flavour (native gRPC agent,
//! REST adapter for third-party panels). [`NodeClient`] picks the transport a
//! node record asks for and applies the shared failure policy: reads come back
//! as `Option` after logging, writes as `Result`.

pub mod proto;
mod rest;
mod rpc;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::cache::{get_json, keys, put_json, CacheStore};
use crate::clock::unix_now;
use crate::config::CacheConfig;
use crate::error::NodeClientError;
use crate::types::{
    Node, NodeConfig, NodeStatus, SystemMetrics, TimeWindow, TrafficStats, TransportKind, User,
    UserId,
};

pub use rest::RestTransport;
pub use rpc::{RpcTlsMaterial, RpcTransport};

#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn status(&self, node: &Node) -> Result<NodeStatus, NodeClientError>;

    async fn sync_user(&self, node: &Node, user: &User) -> Result<(), NodeClientError>;

    async fn remove_user(&self, node: &Node, user_id: UserId) -> Result<(), NodeClientError>;

    /// Push only the user's quota and limits.
    async fn update_user_quota(&self, node: &Node, user: &User) -> Result<(), NodeClientError>;

    async fn traffic(&self, node: &Node, window: TimeWindow)
        -> Result<TrafficStats, NodeClientError>;

    async fn system_metrics(&self, node: &Node) -> Result<SystemMetrics, NodeClientError>;

    async fn update_config(&self, node: &Node, config: &NodeConfig)
        -> Result<(), NodeClientError>;

    /// Liveness check bounded by `timeout`.
    async fn ping(&self, node: &Node, timeout: Duration) -> Result<(), NodeClientError>;
}

/// Variant-agnostic entry point used by the rest of the control plane.
#[derive(Clone)]
pub struct NodeClient {
    rpc: Arc<dyn NodeTransport>,
    rest: Arc<dyn NodeTransport>,
    cache: Arc<dyn CacheStore>,
    health_ttl: Duration,
    marker_ttl: Duration,
}

impl NodeClient {
    pub fn new(
        rpc: Arc<dyn NodeTransport>,
        rest: Arc<dyn NodeTransport>,
        cache: Arc<dyn CacheStore>,
        cfg: &CacheConfig,
    ) -> Self {
        Self {
            rpc,
            rest,
            cache,
            health_ttl: cfg.health_ttl(),
            marker_ttl: cfg.marker_ttl(),
        }
    }

    fn transport(&self, node: &Node) -> &dyn NodeTransport {
        match node.transport {
            TransportKind::NativeRpc => self.rpc.as_ref(),
            TransportKind::RestAdapter => self.rest.as_ref(),
        }
    }

    pub async fn status(&self, node: &Node) -> Option<NodeStatus> {
        match self.transport(node).status(node).await {
            Ok(status) => Some(status),
            Err(e) => {
                error!("Failed to get status from node_id={}: {}", node.id, e);
                None
            }
        }
    }

    pub async fn traffic_stats(&self, node: &Node, window: TimeWindow) -> Option<TrafficStats> {
        match self.transport(node).traffic(node, window).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                error!(
                    "Failed to get traffic stats from node_id={} window={}..{}: {}",
                    node.id, window.start, window.end, e
                );
                None
            }
        }
    }

    pub async fn system_metrics(&self, node: &Node) -> Option<SystemMetrics> {
        match self.transport(node).system_metrics(node).await {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                error!("Failed to get system metrics from node_id={}: {}", node.id, e);
                None
            }
        }
    }

    pub async fn sync_user(&self, node: &Node, user: &User) -> Result<(), NodeClientError> {
        if let Err(e) = self.transport(node).sync_user(node, user).await {
            error!(
                "Failed to sync user_id={} to node_id={}: {}",
                user.id, node.id, e
            );
            return Err(e);
        }

        self.record_push(node).await;
        debug!("Synced user_id={} to node_id={}", user.id, node.id);
        Ok(())
    }

    pub async fn remove_user(&self, node: &Node, user_id: UserId) -> Result<(), NodeClientError> {
        if let Err(e) = self.transport(node).remove_user(node, user_id).await {
            error!(
                "Failed to remove user_id={} from node_id={}: {}",
                user_id, node.id, e
            );
            return Err(e);
        }

        self.record_push(node).await;
        debug!("Removed user_id={} from node_id={}", user_id, node.id);
        Ok(())
    }

    pub async fn update_user_quota(&self, node: &Node, user: &User) -> Result<(), NodeClientError> {
        if let Err(e) = self.transport(node).update_user_quota(node, user).await {
            error!(
                "Failed to update quota of user_id={} on node_id={}: {}",
                user.id, node.id, e
            );
            return Err(e);
        }

        self.record_push(node).await;
        Ok(())
    }

    // Only REST panels get a last-push marker.
    async fn record_push(&self, node: &Node) {
        if node.transport == TransportKind::RestAdapter {
            put_json(
                self.cache.as_ref(),
                &keys::node_last_push(node.id),
                &unix_now(),
                self.marker_ttl,
            )
            .await;
        }
    }

    /// Validates `config` and pushes it. Invalid configs never reach the node.
    pub async fn update_config(&self, node: &Node, config: &NodeConfig) -> Result<(), NodeClientError> {
        if let Err(e) = config.validate() {
            warn!("Refusing invalid config for node_id={}: {}", node.id, e);
            return Err(e.into());
        }

        if let Err(e) = self.transport(node).update_config(node, config).await {
            error!("Failed to push config to node_id={}: {}", node.id, e);
            return Err(e);
        }
        Ok(())
    }

    /// Cached health verdict, probing the node when none is cached.
    pub async fn health_check(&self, node: &Node) -> bool {
        let settings = &node.protocol_settings.health_check;
        if !settings.enabled {
            return true;
        }

        let key = keys::node_health(node.id);
        if let Some(healthy) = get_json::<bool>(self.cache.as_ref(), &key).await {
            return healthy;
        }

        let timeout = Duration::from_secs(settings.timeout_secs);
        let healthy = match self.transport(node).ping(node, timeout).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Health check failed for node_id={}: {}", node.id, e);
                false
            }
        };

        put_json(self.cache.as_ref(), &key, &healthy, self.health_ttl).await;
        if healthy {
            put_json(
                self.cache.as_ref(),
                &keys::node_last_check(node.id),
                &unix_now(),
                self.marker_ttl,
            )
            .await;
        }
        healthy
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{client, MockTransport};
    use super::*;
    use crate::cache::MemoryStore;
    use crate::error::ConfigValidationError;
    use crate::types::fixtures::{node, user};

    #[tokio::test]
    async fn test_health_check_disabled_is_always_true() {
        let transport = Arc::new(MockTransport::default());
        transport.set_down(1);
        let c = client(transport.clone(), Arc::new(MemoryStore::new()));

        assert!(c.health_check(&node(1)).await);
        assert_eq!(*transport.pings.lock(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_verdict_is_cached() {
        let transport = Arc::new(MockTransport::default());
        let cache = Arc::new(MemoryStore::new());
        let c = client(transport.clone(), cache.clone());

        let mut n = node(1);
        n.protocol_settings.health_check.enabled = true;

        assert!(c.health_check(&n).await);
        transport.set_down(1);
        assert!(c.health_check(&n).await);
        assert_eq!(*transport.pings.lock(), 1);
        assert!(cache.get(&keys::node_last_check(1)).await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!c.health_check(&n).await);
        assert_eq!(*transport.pings.lock(), 2);
    }

    #[tokio::test]
    async fn test_invalid_config_is_never_pushed() {
        let transport = Arc::new(MockTransport::default());
        let c = client(transport.clone(), Arc::new(MemoryStore::new()));

        let n = node(1);
        let mut cfg = NodeConfig::from_node(&n, serde_json::Value::Null);
        cfg.port = 0;

        let err = c.update_config(&n, &cfg).await.unwrap_err();
        assert!(matches!(
            err,
            NodeClientError::InvalidConfig(ConfigValidationError::InvalidPort)
        ));
        assert!(transport.configs.lock().is_empty());
    }

    #[tokio::test]
    async fn test_read_failures_become_none() {
        let transport = Arc::new(MockTransport::default());
        transport.set_down(2);
        let c = client(transport, Arc::new(MemoryStore::new()));

        assert!(c.status(&node(2)).await.is_none());
        assert!(c.system_metrics(&node(2)).await.is_none());
        assert!(c.traffic_stats(&node(2), TimeWindow::new(0, 10)).await.is_none());
        assert!(c.sync_user(&node(2), &user(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_rest_sync_records_last_push() {
        let transport = Arc::new(MockTransport::default());
        let cache = Arc::new(MemoryStore::new());
        let c = client(transport, cache.clone());

        let mut n = node(3);
        n.transport = TransportKind::RestAdapter;
        c.sync_user(&n, &user(1)).await.unwrap();
        assert!(cache.get(&keys::node_last_push(3)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_removal_and_quota_reach_the_node() {
        let transport = Arc::new(MockTransport::default());
        let cache = Arc::new(MemoryStore::new());
        let c = client(transport.clone(), cache.clone());

        let mut u = user(4);
        u.transfer_enable = 1 << 30;
        c.update_user_quota(&node(1), &u).await.unwrap();
        c.remove_user(&node(1), 4).await.unwrap();

        assert_eq!(*transport.quotas.lock(), vec![(1, 4, 1 << 30)]);
        assert_eq!(*transport.removed.lock(), vec![(1, 4)]);
        // native agents get no push marker
        assert!(cache.get(&keys::node_last_push(1)).await.unwrap().is_none());

        transport.set_down(1);
        assert!(c.remove_user(&node(1), 5).await.is_err());
    }
}

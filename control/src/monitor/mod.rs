//! Metric collection and threshold alerting.

mod system;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::alerts::AlertLog;
use crate::cache::{keys, put_json, CacheStore};
use crate::clock::unix_now;
use crate::config::AlertThresholds;
use crate::events::{EventSink, FleetEvent};
use crate::node_client::NodeClient;
use crate::types::{
    Alert, AlertKind, AlertScope, HealthChecks, HealthVerdict, MetricsSnapshot, Node, NodeHealth,
    NodeId,
};

pub use system::{NetworkPerformance, SystemMonitor, SystemReport};

const AGENT_RUNNING: &str = "running";

/// One alert per breached threshold. A value equal to its threshold is not a breach.
pub fn evaluate(thresholds: &AlertThresholds, snapshot: &MetricsSnapshot) -> Vec<Alert> {
    let scope = AlertScope::Node(snapshot.node_id);
    let ts = snapshot.timestamp;
    let mut alerts = Vec::new();

    if snapshot.cpu_usage > thresholds.cpu_percent {
        alerts.push(Alert::new(
            scope,
            AlertKind::HighCpuUsage,
            format!("CPU usage too high: {:.2}%", snapshot.cpu_usage),
            ts,
        ));
    }
    if snapshot.memory_usage > thresholds.memory_percent {
        alerts.push(Alert::new(
            scope,
            AlertKind::HighMemoryUsage,
            format!("Memory usage too high: {:.2}%", snapshot.memory_usage),
            ts,
        ));
    }
    if snapshot.disk_usage > thresholds.disk_percent {
        alerts.push(Alert::new(
            scope,
            AlertKind::HighDiskUsage,
            format!("Disk usage too high: {:.2}%", snapshot.disk_usage),
            ts,
        ));
    }
    if snapshot.connections > thresholds.connections {
        alerts.push(Alert::new(
            scope,
            AlertKind::HighConnectionCount,
            format!("Connection count too high: {}", snapshot.connections),
            ts,
        ));
    }
    if snapshot.agent_status != AGENT_RUNNING {
        alerts.push(Alert::new(
            scope,
            AlertKind::AgentNotRunning,
            format!("Agent not running: {}", snapshot.agent_status),
            ts,
        ));
    }

    alerts
}

/// Tracks the last snapshot of every node it has polled.
pub struct NodeMonitor {
    client: NodeClient,
    cache: Arc<dyn CacheStore>,
    alerts: Arc<AlertLog>,
    events: Arc<dyn EventSink>,
    thresholds: AlertThresholds,
    snapshot_ttl: Duration,
    snapshots: RwLock<HashMap<NodeId, MetricsSnapshot>>,
}

impl NodeMonitor {
    pub fn new(
        client: NodeClient,
        cache: Arc<dyn CacheStore>,
        alerts: Arc<AlertLog>,
        events: Arc<dyn EventSink>,
        thresholds: AlertThresholds,
        snapshot_ttl: Duration,
    ) -> Self {
        Self {
            client,
            cache,
            alerts,
            events,
            thresholds,
            snapshot_ttl,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Poll a node once. An unreachable node is skipped without alerting.
    pub async fn collect_metrics(&self, node: &Node) -> Vec<Alert> {
        let Some(status) = self.client.status(node).await else {
            warn!("Skipping metrics for node_id={}: no status", node.id);
            return Vec::new();
        };

        let snapshot = MetricsSnapshot::from_status(node.id, unix_now(), &status);
        let previous = self.snapshots.write().insert(node.id, snapshot.clone());
        if previous.map_or(true, |p| p.agent_status != snapshot.agent_status) {
            self.events.emit(FleetEvent::NodeStatusChanged {
                node_id: node.id,
                status: snapshot.agent_status.clone(),
            });
        }

        let alerts = evaluate(&self.thresholds, &snapshot);
        self.alerts.record_all(&alerts).await;

        let cache = self.cache.as_ref();
        put_json(cache, &keys::node_metrics(node.id), &snapshot, self.snapshot_ttl).await;
        put_json(cache, &keys::node_status(node.id), &status, self.snapshot_ttl).await;
        put_json(
            cache,
            &keys::node_online_users(node.id),
            &status.online_users,
            self.snapshot_ttl,
        )
        .await;

        debug!(
            "Collected metrics for node_id={}: cpu={:.1} mem={:.1} disk={:.1} alerts={}",
            node.id,
            snapshot.cpu_usage,
            snapshot.memory_usage,
            snapshot.disk_usage,
            alerts.len()
        );
        alerts
    }

    pub fn snapshot(&self, node_id: NodeId) -> Option<MetricsSnapshot> {
        self.snapshots.read().get(&node_id).cloned()
    }

    pub fn get_node_health(&self, node_id: NodeId) -> NodeHealth {
        let Some(snapshot) = self.snapshot(node_id) else {
            return NodeHealth {
                status: HealthVerdict::Unknown,
                checks: None,
            };
        };

        // Stricter than alerting: a value sitting exactly on its threshold
        // raises no alert but already fails the health check
        let t = &self.thresholds;
        let checks = HealthChecks {
            cpu: snapshot.cpu_usage < t.cpu_percent,
            memory: snapshot.memory_usage < t.memory_percent,
            disk: snapshot.disk_usage < t.disk_percent,
            agent: snapshot.agent_status == AGENT_RUNNING,
        };
        let healthy = checks.cpu && checks.memory && checks.disk && checks.agent;

        NodeHealth {
            status: if healthy {
                HealthVerdict::Healthy
            } else {
                HealthVerdict::Unhealthy
            },
            checks: Some(checks),
        }
    }

    pub async fn alert_history(&self, node_id: NodeId, limit: usize) -> Vec<Alert> {
        self.alerts.history(AlertScope::Node(node_id), limit).await
    }

    pub async fn cleanup_alerts(&self, node_id: NodeId, days: u32) -> usize {
        self.alerts.cleanup(AlertScope::Node(node_id), days).await
    }

    /// Forget a node's snapshot, e.g. after it leaves the fleet.
    pub fn forget(&self, node_id: NodeId) {
        self.snapshots.write().remove(&node_id);
    }
}

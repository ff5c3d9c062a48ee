//! Operator actions (cache warm-up, user sync, config push) and the
//! scheduled loops: monitor sweeps, housekeeping and certificate rotation.

use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::clock::unix_now;
use crate::fleet::Fleet;
use crate::node_cache::WarmupReport;
use crate::node_manager::SyncReport;
use crate::types::{Node, NodeId, TimeWindow, UserId};

#[derive(Debug)]
pub struct WarmupFailure {
    pub node_id: NodeId,
    pub error: anyhow::Error,
}

#[derive(Debug, Default)]
pub struct WarmupSummary {
    pub warmed: Vec<(NodeId, WarmupReport)>,
    pub failures: Vec<WarmupFailure>,
}

impl WarmupSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Inventory node that operator actions may target.
pub async fn enabled_node(fleet: &Fleet, node_id: NodeId) -> Result<Node> {
    let node = fleet
        .inventory
        .get_node(node_id)
        .await?
        .with_context(|| format!("Node {} not found", node_id))?;
    if !node.enabled {
        bail!("Node {} is disabled", node_id);
    }
    Ok(node)
}

pub async fn warmup_node(fleet: &Fleet, node_id: NodeId) -> Result<WarmupReport> {
    let node = enabled_node(fleet, node_id).await?;
    fleet
        .node_cache
        .warmup_hot_data(&node, &fleet.inventory)
        .await
}

/// Reconcile one user, or every inventory user, with a node.
pub async fn sync_node(fleet: &Fleet, node_id: NodeId, user_id: Option<UserId>) -> Result<SyncReport> {
    let node = enabled_node(fleet, node_id).await?;
    let users = match user_id {
        Some(id) => vec![fleet
            .inventory
            .get_user(id)
            .await?
            .with_context(|| format!("User {} not found", id))?],
        None => fleet.inventory.list_users().await?,
    };

    let report = fleet
        .manager
        .reconcile_users(&node, &users, unix_now())
        .await
        .with_context(|| format!("Sync to node {} failed", node_id))?;
    info!(
        "Node {}: synced {} users, removed {}",
        node_id, report.synced, report.removed
    );
    Ok(report)
}

pub async fn push_config(fleet: &Fleet, node_id: NodeId, overrides: serde_json::Value) -> Result<()> {
    let node = enabled_node(fleet, node_id).await?;
    fleet
        .manager
        .update_node_config(&node, overrides)
        .await
        .with_context(|| format!("Config push to node {} failed", node_id))
}

pub async fn remove_user(fleet: &Fleet, node_id: NodeId, user_id: UserId) -> Result<()> {
    let node = enabled_node(fleet, node_id).await?;
    fleet
        .manager
        .remove_user(&node, user_id)
        .await
        .with_context(|| format!("Removing user {} from node {} failed", user_id, node_id))
}

pub async fn push_quota(fleet: &Fleet, node_id: NodeId, user_id: UserId) -> Result<()> {
    let node = enabled_node(fleet, node_id).await?;
    let user = fleet
        .inventory
        .get_user(user_id)
        .await?
        .with_context(|| format!("User {} not found", user_id))?;
    fleet
        .manager
        .update_user_quota(&node, &user)
        .await
        .with_context(|| format!("Quota push for user {} to node {} failed", user_id, node_id))
}

/// Warm every enabled node in turn. A failing node is recorded and the
/// remaining nodes are still processed.
pub async fn warmup_all<F>(fleet: &Fleet, mut on_node: F) -> Result<WarmupSummary>
where
    F: FnMut(&Node, &Result<WarmupReport>),
{
    let nodes = fleet.enabled_nodes().await?;
    let mut summary = WarmupSummary::default();

    for node in &nodes {
        let result = fleet
            .node_cache
            .warmup_hot_data(node, &fleet.inventory)
            .await;
        on_node(node, &result);

        match result {
            Ok(report) => summary.warmed.push((node.id, report)),
            Err(e) => {
                error!("Warm-up failed for node_id={}: {:#}", node.id, e);
                summary.failures.push(WarmupFailure {
                    node_id: node.id,
                    error: e,
                });
            }
        }
    }

    info!(
        "Warm-up finished: {} nodes ok, {} failed",
        summary.warmed.len(),
        summary.failures.len()
    );
    Ok(summary)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub polled: usize,
    pub unhealthy: usize,
    pub alerts: usize,
}

async fn poll_node(fleet: &Fleet, node: Node, window: TimeWindow) -> (bool, usize) {
    let node = &node;
    let healthy = fleet.client.health_check(node).await;
    let mut alerts = fleet.monitor.collect_metrics(node).await.len();
    fleet.system.get_system_metrics(node).await;

    if node.traffic_limit > 0 {
        if let Some(record) = fleet.traffic.service().get_node_traffic(node, window).await {
            alerts += fleet
                .traffic
                .service()
                .check_traffic_alerts(node, &record)
                .await
                .len();
        }
    }
    (healthy, alerts)
}

/// One monitoring pass over all enabled nodes, at most `monitor.workers`
/// nodes in flight.
pub async fn monitor_sweep(fleet: &Fleet) -> Result<SweepReport> {
    let nodes = fleet.enabled_nodes().await?;
    let workers = fleet.config.monitor.workers.max(1);
    let now = unix_now();
    let window_secs = i64::try_from(fleet.config.traffic.alert_window_secs).unwrap_or(i64::MAX);
    let window = TimeWindow::new(now.saturating_sub(window_secs), now);

    let results: Vec<(bool, usize)> = stream::iter(nodes)
        .map(|node| poll_node(fleet, node, window))
        .buffer_unordered(workers)
        .collect()
        .await;

    let report = SweepReport {
        polled: results.len(),
        unhealthy: results.iter().filter(|(healthy, _)| !healthy).count(),
        alerts: results.iter().map(|(_, alerts)| alerts).sum(),
    };
    info!(
        "Monitor sweep: {} nodes, {} unhealthy, {} alerts",
        report.polled, report.unhealthy, report.alerts
    );
    Ok(report)
}

pub async fn cleanup_alerts(fleet: &Fleet) -> Result<usize> {
    let days = fleet.config.monitor.alert_retention_days;
    let mut removed = 0;
    for node in fleet.inventory.list_nodes().await? {
        removed += fleet.monitor.cleanup_alerts(node.id, days).await;
    }
    Ok(removed)
}

pub async fn monitor_loop(fleet: Arc<Fleet>) {
    let interval = Duration::from_secs(fleet.config.monitor.interval_secs.max(1));
    info!("Starting monitor loop every {:?}", interval);

    loop {
        if let Err(e) = monitor_sweep(&fleet).await {
            error!("Monitor sweep failed: {:#}", e);
        }
        tokio::time::sleep(interval).await;
    }
}

pub async fn housekeeping_loop(fleet: Arc<Fleet>) {
    let interval = Duration::from_secs(fleet.config.cache.purge_interval_secs.max(1));
    info!("Starting housekeeping loop every {:?}", interval);

    loop {
        tokio::time::sleep(interval).await;

        match fleet.cache.purge_expired().await {
            Ok(count) if count > 0 => info!("Purged {} expired cache entries", count),
            Err(e) => error!("Cache purge failed: {:#}", e),
            _ => {}
        }
        match cleanup_alerts(&fleet).await {
            Ok(count) if count > 0 => info!("Dropped {} expired alerts", count),
            Err(e) => error!("Alert cleanup failed: {:#}", e),
            _ => {}
        }
    }
}

pub async fn rotation_loop(fleet: Arc<Fleet>) {
    let interval = Duration::from_secs(fleet.config.auth.rotation_interval_secs.max(1));
    info!("Starting certificate rotation loop every {:?}", interval);

    loop {
        let f = fleet.clone();
        match tokio::task::spawn_blocking(move || f.auth.rotate_certificates()).await {
            Ok(Ok(true)) => info!("Control plane certificate rotated"),
            Ok(Ok(false)) => {}
            Ok(Err(e)) => error!("Certificate rotation failed: {:#}", e),
            Err(e) => warn!("Certificate rotation task panicked: {}", e),
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetConfig;
    use crate::db::test_pool;
    use crate::node_client::mock::MockTransport;
    use crate::types::fixtures::{node, user};
    use crate::types::{AlertScope, NodeStatus, UserTraffic};

    async fn fleet() -> (tempfile::TempDir, Fleet, Arc<MockTransport>) {
        let (dir, pool) = test_pool();
        let transport = Arc::new(MockTransport::default());
        let fleet = Fleet::with_transports(
            FleetConfig::default(),
            pool,
            transport.clone(),
            transport.clone(),
        );
        (dir, fleet, transport)
    }

    #[tokio::test]
    async fn test_warmup_node_rejects_unknown_and_disabled() {
        let (_dir, fleet, _) = fleet().await;
        let mut n = node(2);
        n.enabled = false;
        fleet.inventory.upsert_node(n).await.unwrap();

        let missing = warmup_node(&fleet, 1).await.unwrap_err();
        assert!(missing.to_string().contains("not found"));
        let disabled = warmup_node(&fleet, 2).await.unwrap_err();
        assert!(disabled.to_string().contains("disabled"));
    }

    #[tokio::test]
    async fn test_warmup_all_covers_enabled_nodes() {
        let (_dir, fleet, _) = fleet().await;
        for id in 1..=3 {
            let mut n = node(id);
            n.enabled = id != 3;
            fleet.inventory.upsert_node(n).await.unwrap();
        }
        for id in 1..=5 {
            fleet.inventory.upsert_user(user(id)).await.unwrap();
        }

        let mut seen = Vec::new();
        let summary = warmup_all(&fleet, |n, r| seen.push((n.id, r.is_ok()))).await.unwrap();
        assert!(summary.is_success());
        assert_eq!(seen, vec![(1, true), (2, true)]);
        assert_eq!(summary.warmed[0].1.users, 5);
        assert!(fleet.node_cache.get(2, 5).await.is_some());
        assert!(fleet.node_cache.get(3, 5).await.is_none());
    }

    #[tokio::test]
    async fn test_sync_node_reconciles_inventory() {
        let (_dir, fleet, transport) = fleet().await;
        fleet.inventory.upsert_node(node(1)).await.unwrap();
        let mut gone = user(2);
        gone.enabled = false;
        fleet.inventory.upsert_user(user(1)).await.unwrap();
        fleet.inventory.upsert_user(gone).await.unwrap();

        let report = sync_node(&fleet, 1, None).await.unwrap();
        assert_eq!(report, SyncReport { synced: 1, removed: 1 });
        assert_eq!(*transport.removed.lock(), vec![(1, 2)]);

        let missing = sync_node(&fleet, 1, Some(9)).await.unwrap_err();
        assert!(missing.to_string().contains("User 9 not found"));
    }

    #[tokio::test]
    async fn test_push_config_and_quota() {
        let (_dir, fleet, transport) = fleet().await;
        fleet.inventory.upsert_node(node(1)).await.unwrap();
        fleet.inventory.upsert_user(user(4)).await.unwrap();

        push_config(&fleet, 1, serde_json::json!({"mux": true})).await.unwrap();
        assert_eq!(transport.configs.lock().len(), 1);
        assert!(push_config(&fleet, 1, serde_json::json!([1])).await.is_err());

        push_quota(&fleet, 1, 4).await.unwrap();
        remove_user(&fleet, 1, 4).await.unwrap();
        assert_eq!(transport.quotas.lock().len(), 1);
        assert_eq!(*transport.removed.lock(), vec![(1, 4)]);
    }

    #[tokio::test]
    async fn test_sweep_polls_and_alerts() {
        let (_dir, fleet, transport) = fleet().await;
        let mut n = node(1);
        n.traffic_limit = 100;
        fleet.inventory.upsert_node(n).await.unwrap();
        fleet.inventory.upsert_node(node(2)).await.unwrap();

        transport.set_status(
            1,
            NodeStatus {
                status: "running".to_string(),
                cpu_usage: 95.0,
                ..Default::default()
            },
        );
        transport.traffic.lock().insert(
            1,
            [(
                1,
                UserTraffic {
                    upload: 60,
                    download: 40,
                    connections: Vec::new(),
                },
            )]
            .into_iter()
            .collect(),
        );
        transport.set_down(2);

        let report = monitor_sweep(&fleet).await.unwrap();
        assert_eq!(report.polled, 2);
        // cpu + traffic
        assert_eq!(report.alerts, 2);
        assert_eq!(fleet.alerts.history(AlertScope::Node(1), 10).await.len(), 2);
        assert!(fleet.monitor.snapshot(2).is_none());
    }
}

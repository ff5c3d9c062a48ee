use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::{get_json, keys, put_json, CacheStore};
use crate::events::{EventSink, FleetEvent};
use crate::node_client::NodeClient;
use crate::types::{Node, SystemMetrics};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkPerformance {
    pub bandwidth_usage: u64,
    pub connection_count: u64,
}

/// Host metrics of a node with derived scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemReport {
    pub metrics: SystemMetrics,
    /// Weighted load in `[0, 1]` for sane inputs.
    pub load_score: f64,
    pub network: NetworkPerformance,
}

impl SystemReport {
    pub fn from_metrics(metrics: SystemMetrics) -> Self {
        let cpu = metrics.cpu.usage / 100.0;
        let memory = metrics.memory.usage_percent() / 100.0;
        let network = (metrics.network.out_speed as f64 / GIB).min(1.0);
        let load_score = 0.4 * cpu + 0.3 * memory + 0.3 * network;

        let network = NetworkPerformance {
            bandwidth_usage: metrics
                .network
                .in_speed
                .saturating_add(metrics.network.out_speed),
            connection_count: metrics.network.connections,
        };

        Self {
            metrics,
            load_score,
            network,
        }
    }
}

pub struct SystemMonitor {
    client: NodeClient,
    cache: Arc<dyn CacheStore>,
    events: Arc<dyn EventSink>,
    ttl: Duration,
}

impl SystemMonitor {
    pub fn new(
        client: NodeClient,
        cache: Arc<dyn CacheStore>,
        events: Arc<dyn EventSink>,
        ttl: Duration,
    ) -> Self {
        Self {
            client,
            cache,
            events,
            ttl,
        }
    }

    /// Cache-first; a fresh fetch is scored, cached and announced.
    pub async fn get_system_metrics(&self, node: &Node) -> Option<SystemReport> {
        let key = keys::system_metrics(node.id);
        if let Some(report) = get_json::<SystemReport>(self.cache.as_ref(), &key).await {
            return Some(report);
        }

        let metrics = self.client.system_metrics(node).await?;
        let report = SystemReport::from_metrics(metrics);
        debug!(
            "System load for node_id={}: {:.3}",
            node.id, report.load_score
        );

        put_json(self.cache.as_ref(), &key, &report, self.ttl).await;
        self.events.emit(FleetEvent::SystemMetricsUpdated {
            node_id: node.id,
            metrics: report.metrics.clone(),
            load_score: report.load_score,
        });
        Some(report)
    }
}

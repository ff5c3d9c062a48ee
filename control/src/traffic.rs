use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::alerts::AlertLog;
use crate::cache::{get_json, keys, put_json, CacheStore};
use crate::clock::unix_now;
use crate::node_client::NodeClient;
use crate::types::{
    Alert, AlertKind, AlertScope, Node, TimeWindow, TrafficRecord, TrafficScope, UserId,
};

/// Authoritative traffic aggregation over a time window.
#[derive(Clone)]
pub struct TrafficService {
    client: NodeClient,
    cache: Arc<dyn CacheStore>,
    alerts: Arc<AlertLog>,
    ttl: Duration,
    alert_percent: u8,
}

impl TrafficService {
    pub fn new(
        client: NodeClient,
        cache: Arc<dyn CacheStore>,
        alerts: Arc<AlertLog>,
        ttl: Duration,
        alert_percent: u8,
    ) -> Self {
        Self {
            client,
            cache,
            alerts,
            ttl,
            alert_percent,
        }
    }

    /// A user missing from the node's answer has moved no traffic.
    pub async fn get_user_traffic(
        &self,
        node: &Node,
        user_id: UserId,
        window: TimeWindow,
    ) -> Option<TrafficRecord> {
        let stats = self.client.traffic_stats(node, window).await?;
        let (up, down) = stats
            .get(&user_id)
            .map(|t| (t.upload, t.download))
            .unwrap_or((0, 0));

        let scope = TrafficScope::User {
            user_id,
            node_id: node.id,
        };
        let record = TrafficRecord::new(scope, up, down, window);
        put_json(self.cache.as_ref(), &keys::traffic(scope, window), &record, self.ttl).await;
        Some(record)
    }

    pub async fn get_node_traffic(&self, node: &Node, window: TimeWindow) -> Option<TrafficRecord> {
        let stats = self.client.traffic_stats(node, window).await?;
        let (up, down) = stats.values().fold((0u64, 0u64), |(up, down), t| {
            (up.saturating_add(t.upload), down.saturating_add(t.download))
        });

        let scope = TrafficScope::Node { node_id: node.id };
        let record = TrafficRecord::new(scope, up, down, window);
        put_json(self.cache.as_ref(), &keys::traffic(scope, window), &record, self.ttl).await;
        debug!(
            "Traffic for node_id={} {}..{}: {} bytes from {} users",
            node.id,
            window.start,
            window.end,
            record.total,
            stats.len()
        );
        Some(record)
    }

    /// Raises HIGH_TRAFFIC_USAGE once the node has used the configured share
    /// of its traffic limit. Unlimited nodes never alert.
    pub async fn check_traffic_alerts(&self, node: &Node, record: &TrafficRecord) -> Vec<Alert> {
        let limit = node.traffic_limit;
        if limit == 0 {
            return Vec::new();
        }

        let total = u128::from(record.total);
        if total * 100 < u128::from(limit) * u128::from(self.alert_percent) {
            return Vec::new();
        }

        let percent = record.total as f64 / limit as f64 * 100.0;
        warn!(
            "node_id={} has used {:.1}% of its traffic limit",
            node.id, percent
        );
        let alert = Alert::new(
            AlertScope::Node(node.id),
            AlertKind::HighTrafficUsage,
            format!("Traffic usage reached {:.1}% of the limit", percent),
            unix_now(),
        );
        self.alerts.record(alert.clone()).await;
        vec![alert]
    }
}

/// Short-lived read-through cache in front of [`TrafficService`] for
/// high-frequency callers.
#[derive(Clone)]
pub struct TrafficStatsService {
    traffic: TrafficService,
    cache: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl TrafficStatsService {
    pub fn new(traffic: TrafficService, cache: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self {
            traffic,
            cache,
            ttl,
        }
    }

    pub async fn get_user_traffic(
        &self,
        node: &Node,
        user_id: UserId,
        window: TimeWindow,
    ) -> Option<TrafficRecord> {
        let scope = TrafficScope::User {
            user_id,
            node_id: node.id,
        };
        let key = keys::traffic_stats(scope, window);
        if let Some(record) = get_json(self.cache.as_ref(), &key).await {
            return Some(record);
        }

        let record = self.traffic.get_user_traffic(node, user_id, window).await?;
        put_json(self.cache.as_ref(), &key, &record, self.ttl).await;
        Some(record)
    }

    pub async fn get_node_traffic(&self, node: &Node, window: TimeWindow) -> Option<TrafficRecord> {
        let key = keys::traffic_stats(TrafficScope::Node { node_id: node.id }, window);
        if let Some(record) = get_json(self.cache.as_ref(), &key).await {
            return Some(record);
        }

        let record = self.traffic.get_node_traffic(node, window).await?;
        put_json(self.cache.as_ref(), &key, &record, self.ttl).await;
        Some(record)
    }

    pub fn service(&self) -> &TrafficService {
        &self.traffic
    }
}

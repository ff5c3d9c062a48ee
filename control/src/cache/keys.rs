//! Cache key layout. Every component derives its keys here so the fast and
//! durable tiers agree on names.

use crate::types::{AlertScope, NodeId, TimeWindow, TrafficScope, UserId};

pub const ROUND_ROBIN_CURSOR: &str = "load_balance_round_robin";

pub fn user_node_config(user_id: UserId, node_id: NodeId) -> String {
    format!("user_node_config:{}:{}", user_id, node_id)
}

pub fn node_online_users(node_id: NodeId) -> String {
    format!("node_online_users:{}", node_id)
}

pub fn node_health(node_id: NodeId) -> String {
    format!("node_health:{}", node_id)
}

pub fn node_metrics(node_id: NodeId) -> String {
    format!("node_metrics:{}", node_id)
}

pub fn node_status(node_id: NodeId) -> String {
    format!("node_status:{}", node_id)
}

pub fn node_last_check(node_id: NodeId) -> String {
    format!("node_last_check:{}", node_id)
}

pub fn node_last_push(node_id: NodeId) -> String {
    format!("node_last_push:{}", node_id)
}

pub fn system_metrics(node_id: NodeId) -> String {
    format!("system_metrics:{}", node_id)
}

pub fn alerts(scope: AlertScope) -> String {
    match scope {
        AlertScope::Node(id) => format!("node_alerts:{}", id),
        AlertScope::User(id) => format!("user_alerts:{}", id),
    }
}

/// Authoritative traffic record for a scope and window.
pub fn traffic(scope: TrafficScope, window: TimeWindow) -> String {
    match scope {
        TrafficScope::User { user_id, node_id } => format!(
            "traffic:user:{}:{}:{}:{}",
            user_id, node_id, window.start, window.end
        ),
        TrafficScope::Node { node_id } => {
            format!("traffic:node:{}:{}:{}", node_id, window.start, window.end)
        }
    }
}

/// Short-lived copy kept by the stats read-through wrapper.
pub fn traffic_stats(scope: TrafficScope, window: TimeWindow) -> String {
    format!("traffic_stats:{}", traffic(scope, window))
}

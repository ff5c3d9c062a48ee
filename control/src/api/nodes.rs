use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::{
    clock::unix_now,
    error::NodeClientError,
    fleet::Fleet,
    monitor::SystemReport,
    node_cache::WarmupReport,
    node_manager::SyncReport,
    types::{
        Alert, ListNodesResponse, Node, NodeHealth, NodeId, SyncStatus, TimeWindow,
        TrafficRecord, User, UserId,
    },
};

type ApiError = (StatusCode, String);

const DEFAULT_ALERT_LIMIT: usize = 50;

fn internal(e: anyhow::Error) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
}

fn node_error(e: NodeClientError) -> ApiError {
    match e {
        NodeClientError::InvalidConfig(_) => (StatusCode::BAD_REQUEST, e.to_string()),
        _ => (StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

async fn load_node(fleet: &Fleet, node_id: NodeId) -> Result<Node, ApiError> {
    fleet
        .inventory
        .get_node(node_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Node {} not found", node_id)))
}

/// Node that may receive operator writes.
async fn load_enabled_node(fleet: &Fleet, node_id: NodeId) -> Result<Node, ApiError> {
    let node = load_node(fleet, node_id).await?;
    if !node.enabled {
        return Err((StatusCode::CONFLICT, format!("Node {} is disabled", node_id)));
    }
    Ok(node)
}

async fn load_user(fleet: &Fleet, user_id: UserId) -> Result<User, ApiError> {
    fleet
        .inventory
        .get_user(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("User {} not found", user_id)))
}

/// GET /api/nodes - List all nodes
pub async fn list_nodes(
    State(fleet): State<Arc<Fleet>>,
) -> Result<Json<ListNodesResponse>, ApiError> {
    let nodes = fleet.inventory.list_nodes().await.map_err(internal)?;
    Ok(Json(ListNodesResponse { nodes }))
}

#[derive(Debug, Deserialize)]
pub struct SelectQuery {
    pub user_id: UserId,
}

/// GET /api/nodes/select?user_id= - Pick the node that should serve a user
pub async fn select_node(
    State(fleet): State<Arc<Fleet>>,
    Query(query): Query<SelectQuery>,
) -> Result<Json<Node>, ApiError> {
    let node = fleet
        .select_node_for(query.user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("No available node for user {}", query.user_id),
            )
        })?;

    info!("Selected node_id={} for user_id={}", node.id, query.user_id);
    Ok(Json(node))
}

/// GET /api/nodes/:id/health - Verdict from the last collected snapshot
pub async fn node_health(
    State(fleet): State<Arc<Fleet>>,
    Path(node_id): Path<NodeId>,
) -> Result<Json<NodeHealth>, ApiError> {
    load_node(&fleet, node_id).await?;
    Ok(Json(fleet.monitor.get_node_health(node_id)))
}

/// GET /api/nodes/:id/metrics - Host metrics and load score
pub async fn node_metrics(
    State(fleet): State<Arc<Fleet>>,
    Path(node_id): Path<NodeId>,
) -> Result<Json<SystemReport>, ApiError> {
    let node = load_node(&fleet, node_id).await?;
    fleet
        .system
        .get_system_metrics(&node)
        .await
        .map(Json)
        .ok_or_else(|| {
            (
                StatusCode::BAD_GATEWAY,
                format!("Node {} did not report metrics", node_id),
            )
        })
}

#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    pub limit: Option<usize>,
}

/// GET /api/nodes/:id/alerts?limit= - Most recent alerts, oldest first
pub async fn node_alerts(
    State(fleet): State<Arc<Fleet>>,
    Path(node_id): Path<NodeId>,
    Query(query): Query<AlertQuery>,
) -> Result<Json<Vec<Alert>>, ApiError> {
    load_node(&fleet, node_id).await?;
    let limit = query.limit.unwrap_or(DEFAULT_ALERT_LIMIT);
    Ok(Json(fleet.monitor.alert_history(node_id, limit).await))
}

#[derive(Debug, Deserialize)]
pub struct TrafficQuery {
    pub start: i64,
    pub end: i64,
}

/// GET /api/nodes/:id/traffic?start&end - Node traffic over a window
pub async fn node_traffic(
    State(fleet): State<Arc<Fleet>>,
    Path(node_id): Path<NodeId>,
    Query(query): Query<TrafficQuery>,
) -> Result<Json<TrafficRecord>, ApiError> {
    if query.end < query.start {
        return Err((
            StatusCode::BAD_REQUEST,
            "end must not precede start".to_string(),
        ));
    }

    let node = load_node(&fleet, node_id).await?;
    fleet
        .traffic
        .get_node_traffic(&node, TimeWindow::new(query.start, query.end))
        .await
        .map(Json)
        .ok_or_else(|| {
            (
                StatusCode::BAD_GATEWAY,
                format!("Node {} did not report traffic", node_id),
            )
        })
}

/// POST /api/nodes/:id/warmup - Preload per-user configs into the cache
pub async fn warmup_node(
    State(fleet): State<Arc<Fleet>>,
    Path(node_id): Path<NodeId>,
) -> Result<Json<WarmupReport>, ApiError> {
    let node = load_enabled_node(&fleet, node_id).await?;
    let report = fleet
        .node_cache
        .warmup_hot_data(&node, &fleet.inventory)
        .await
        .map_err(internal)?;

    info!(
        "Warmed node_id={}: {} users in {} batches",
        node_id, report.users, report.batches
    );
    Ok(Json(report))
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncRequest {
    /// Reconcile only this user; all inventory users when absent.
    pub user_id: Option<UserId>,
}

/// POST /api/nodes/:id/sync - Push active users, remove inactive ones
pub async fn sync_node(
    State(fleet): State<Arc<Fleet>>,
    Path(node_id): Path<NodeId>,
    Json(req): Json<SyncRequest>,
) -> Result<Json<SyncReport>, ApiError> {
    let node = load_enabled_node(&fleet, node_id).await?;
    let users = match req.user_id {
        Some(id) => vec![load_user(&fleet, id).await?],
        None => fleet.inventory.list_users().await.map_err(internal)?,
    };

    let report = fleet
        .manager
        .reconcile_users(&node, &users, unix_now())
        .await
        .map_err(node_error)?;
    Ok(Json(report))
}

/// GET /api/nodes/:id/sync - Last sync outcome per user
pub async fn sync_status(
    State(fleet): State<Arc<Fleet>>,
    Path(node_id): Path<NodeId>,
) -> Result<Json<HashMap<UserId, SyncStatus>>, ApiError> {
    load_node(&fleet, node_id).await?;
    Ok(Json(fleet.manager.node_sync_status(node_id)))
}

/// PUT /api/nodes/:id/config - Validate and push override settings
pub async fn push_config(
    State(fleet): State<Arc<Fleet>>,
    Path(node_id): Path<NodeId>,
    Json(overrides): Json<serde_json::Value>,
) -> Result<StatusCode, ApiError> {
    let node = load_enabled_node(&fleet, node_id).await?;
    fleet
        .manager
        .update_node_config(&node, overrides)
        .await
        .map_err(node_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /api/nodes/:id/users/:user_id/quota - Push the user's quota and limits
pub async fn push_quota(
    State(fleet): State<Arc<Fleet>>,
    Path((node_id, user_id)): Path<(NodeId, UserId)>,
) -> Result<StatusCode, ApiError> {
    let node = load_enabled_node(&fleet, node_id).await?;
    let user = load_user(&fleet, user_id).await?;
    fleet
        .manager
        .update_user_quota(&node, &user)
        .await
        .map_err(node_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/nodes/:id/users/:user_id - Take a user off a node
pub async fn remove_user(
    State(fleet): State<Arc<Fleet>>,
    Path((node_id, user_id)): Path<(NodeId, UserId)>,
) -> Result<StatusCode, ApiError> {
    let node = load_enabled_node(&fleet, node_id).await?;
    fleet
        .manager
        .remove_user(&node, user_id)
        .await
        .map_err(node_error)?;
    Ok(StatusCode::NO_CONTENT)
}

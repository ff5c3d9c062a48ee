pub mod nodes;

use axum::{
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::fleet::Fleet;
use crate::types::HealthResponse;

pub fn create_router(fleet: Arc<Fleet>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health))
        // Fleet queries
        .route("/api/nodes", get(nodes::list_nodes))
        .route("/api/nodes/select", get(nodes::select_node))
        .route("/api/nodes/:id/health", get(nodes::node_health))
        .route("/api/nodes/:id/metrics", get(nodes::node_metrics))
        .route("/api/nodes/:id/alerts", get(nodes::node_alerts))
        .route("/api/nodes/:id/traffic", get(nodes::node_traffic))
        // Operator writes
        .route("/api/nodes/:id/warmup", post(nodes::warmup_node))
        .route(
            "/api/nodes/:id/sync",
            get(nodes::sync_status).post(nodes::sync_node),
        )
        .route("/api/nodes/:id/config", put(nodes::push_config))
        .route("/api/nodes/:id/users/:user_id", delete(nodes::remove_user))
        .route("/api/nodes/:id/users/:user_id/quota", put(nodes::push_quota))
        .layer(TraceLayer::new_for_http())
        .with_state(fleet)
}

/// GET /health - Health check endpoint
async fn health() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetConfig;
    use crate::db::test_pool;
    use crate::node_cache::WarmupReport;
    use crate::node_client::mock::MockTransport;
    use crate::types::fixtures::{node, user};
    use crate::types::{ListNodesResponse, Node, NodeStatus};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_json<T: serde::de::DeserializeOwned>(app: Router, uri: &str) -> (StatusCode, Option<T>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).ok())
    }

    async fn send(app: Router, method: &str, uri: &str, body: serde_json::Value) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    async fn app() -> (tempfile::TempDir, Arc<Fleet>, Arc<MockTransport>) {
        let (dir, pool) = test_pool();
        let transport = Arc::new(MockTransport::default());
        let fleet = Arc::new(Fleet::with_transports(
            FleetConfig::default(),
            pool,
            transport.clone(),
            transport.clone(),
        ));
        fleet.inventory.upsert_node(node(1)).await.unwrap();
        fleet.inventory.upsert_node(node(2)).await.unwrap();
        fleet.inventory.upsert_user(user(7)).await.unwrap();
        (dir, fleet, transport)
    }

    #[tokio::test]
    async fn test_health_and_node_listing() {
        let (_dir, fleet, _) = app().await;

        let (status, _) = get_json::<HealthResponse>(create_router(fleet.clone()), "/health").await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = get_json::<ListNodesResponse>(create_router(fleet), "/api/nodes").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.unwrap().nodes.len(), 2);
    }

    #[tokio::test]
    async fn test_select_routes_known_user_only() {
        let (_dir, fleet, _) = app().await;

        let (status, body) =
            get_json::<Node>(create_router(fleet.clone()), "/api/nodes/select?user_id=7").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.unwrap().id, 1);

        let (status, _) =
            get_json::<Node>(create_router(fleet), "/api/nodes/select?user_id=8").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_node_health_after_collection() {
        let (_dir, fleet, transport) = app().await;
        transport.set_status(
            1,
            NodeStatus {
                status: "running".to_string(),
                ..Default::default()
            },
        );
        fleet.monitor.collect_metrics(&node(1)).await;

        let (status, body) =
            get_json::<serde_json::Value>(create_router(fleet.clone()), "/api/nodes/1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.unwrap()["status"], "healthy");

        let (status, _) =
            get_json::<serde_json::Value>(create_router(fleet), "/api/nodes/99/health").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_traffic_rejects_inverted_window() {
        let (_dir, fleet, _) = app().await;
        let (status, _) = get_json::<serde_json::Value>(
            create_router(fleet),
            "/api/nodes/1/traffic?start=100&end=50",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_sync_route_reconciles_and_reports_status() {
        let (_dir, fleet, transport) = app().await;
        let mut gone = user(8);
        gone.enabled = false;
        fleet.inventory.upsert_user(gone).await.unwrap();

        let (status, body) = send(
            create_router(fleet.clone()),
            "POST",
            "/api/nodes/1/sync",
            serde_json::json!({}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let report: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(report["synced"], 1);
        assert_eq!(report["removed"], 1);
        assert_eq!(*transport.removed.lock(), vec![(1, 8)]);

        let (status, body) =
            get_json::<serde_json::Value>(create_router(fleet), "/api/nodes/1/sync").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.unwrap()["7"]["success"], true);
    }

    #[tokio::test]
    async fn test_config_route_maps_validation_to_bad_request() {
        let (_dir, fleet, transport) = app().await;

        let (status, _) = send(
            create_router(fleet.clone()),
            "PUT",
            "/api/nodes/1/config",
            serde_json::json!({"mux": true}),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(
            create_router(fleet),
            "PUT",
            "/api/nodes/1/config",
            serde_json::json!("flat"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(transport.configs.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_user_routes_reach_the_node() {
        let (_dir, fleet, transport) = app().await;

        let (status, _) = send(
            create_router(fleet.clone()),
            "PUT",
            "/api/nodes/2/users/7/quota",
            serde_json::Value::Null,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(
            create_router(fleet.clone()),
            "DELETE",
            "/api/nodes/2/users/7",
            serde_json::Value::Null,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(*transport.removed.lock(), vec![(2, 7)]);

        transport.set_down(2);
        let (status, _) = send(
            create_router(fleet),
            "DELETE",
            "/api/nodes/2/users/7",
            serde_json::Value::Null,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_warmup_route_returns_report() {
        let (_dir, fleet, _) = app().await;
        let (status, body) = send(
            create_router(fleet.clone()),
            "POST",
            "/api/nodes/1/warmup",
            serde_json::Value::Null,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let report: WarmupReport = serde_json::from_slice(&body).unwrap();
        assert_eq!(report.users, 1);
        assert!(fleet.node_cache.get(1, 7).await.is_some());
    }
}

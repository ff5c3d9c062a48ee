use anyhow::Result;
use reqwest::Method;
use serde_json::json;

use fleet_control::fleet::Fleet;
use fleet_control::jobs::{self, WarmupFailure, WarmupSummary};
use fleet_control::node_cache::WarmupReport;
use fleet_control::node_manager::SyncReport;
use fleet_control::types::{ListNodesResponse, Node, NodeId, UserId};

use crate::http_client::Client;

/// Where node operations run.
///
/// `Local` opens the database in-process. Its cache writes reach the durable
/// tier only, so a running daemon keeps serving its in-memory copies of the
/// same keys until they expire. `Daemon` sends the operation to the running
/// control plane instead, which updates both tiers.
pub enum Backend {
    Local(Box<Fleet>),
    Daemon(Client),
}

impl Backend {
    pub async fn enabled_nodes(&self) -> Result<Vec<Node>> {
        match self {
            Backend::Local(fleet) => fleet.enabled_nodes().await,
            Backend::Daemon(client) => {
                let resp: ListNodesResponse = client.get_json("/api/nodes").await?;
                Ok(resp.nodes.into_iter().filter(|n| n.enabled).collect())
            }
        }
    }

    pub async fn warmup_node(&self, node_id: NodeId) -> Result<WarmupReport> {
        match self {
            Backend::Local(fleet) => jobs::warmup_node(fleet, node_id).await,
            Backend::Daemon(client) => {
                client
                    .send_json(Method::POST, &format!("/api/nodes/{}/warmup", node_id), None)
                    .await
            }
        }
    }

    /// Warm every enabled node, continuing past failures.
    pub async fn warmup_all<F>(&self, mut on_node: F) -> Result<WarmupSummary>
    where
        F: FnMut(&Node, &Result<WarmupReport>),
    {
        if let Backend::Local(fleet) = self {
            return jobs::warmup_all(fleet, on_node).await;
        }

        let mut summary = WarmupSummary::default();
        for node in self.enabled_nodes().await? {
            let result = self.warmup_node(node.id).await;
            on_node(&node, &result);
            match result {
                Ok(report) => summary.warmed.push((node.id, report)),
                Err(error) => summary.failures.push(WarmupFailure {
                    node_id: node.id,
                    error,
                }),
            }
        }
        Ok(summary)
    }

    pub async fn sync_node(&self, node_id: NodeId, user_id: Option<UserId>) -> Result<SyncReport> {
        match self {
            Backend::Local(fleet) => jobs::sync_node(fleet, node_id, user_id).await,
            Backend::Daemon(client) => {
                client
                    .send_json(
                        Method::POST,
                        &format!("/api/nodes/{}/sync", node_id),
                        Some(json!({ "user_id": user_id })),
                    )
                    .await
            }
        }
    }

    pub async fn push_config(&self, node_id: NodeId, overrides: serde_json::Value) -> Result<()> {
        match self {
            Backend::Local(fleet) => jobs::push_config(fleet, node_id, overrides).await,
            Backend::Daemon(client) => {
                client
                    .send_json_bytes(
                        Method::PUT,
                        &format!("/api/nodes/{}/config", node_id),
                        Some(overrides),
                    )
                    .await?;
                Ok(())
            }
        }
    }

    pub async fn remove_user(&self, node_id: NodeId, user_id: UserId) -> Result<()> {
        match self {
            Backend::Local(fleet) => jobs::remove_user(fleet, node_id, user_id).await,
            Backend::Daemon(client) => {
                client
                    .send_json_bytes(
                        Method::DELETE,
                        &format!("/api/nodes/{}/users/{}", node_id, user_id),
                        None,
                    )
                    .await?;
                Ok(())
            }
        }
    }

    pub async fn push_quota(&self, node_id: NodeId, user_id: UserId) -> Result<()> {
        match self {
            Backend::Local(fleet) => jobs::push_quota(fleet, node_id, user_id).await,
            Backend::Daemon(client) => {
                client
                    .send_json_bytes(
                        Method::PUT,
                        &format!("/api/nodes/{}/users/{}/quota", node_id, user_id),
                        None,
                    )
                    .await?;
                Ok(())
            }
        }
    }
}

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::NodeTransport;
use crate::error::NodeClientError;
use crate::types::{
    Node, NodeConfig, NodeId, NodeStatus, RestAuthScheme, RestEndpoint, SystemMetrics, TimeWindow,
    TrafficStats, User, UserId,
};

/// HTTP adapter for third-party panels.
#[derive(Clone)]
pub struct RestTransport {
    client: reqwest::Client,
    timeout: Duration,
}

#[derive(Serialize)]
struct SyncUserBody<'a> {
    user: SyncUser<'a>,
}

#[derive(Serialize)]
struct SyncUser<'a> {
    id: UserId,
    email: &'a str,
    uuid: String,
    speed_limit: Option<u64>,
    device_limit: Option<u32>,
    enable: bool,
}

#[derive(Serialize)]
struct QuotaBody {
    transfer_enable: u64,
    speed_limit: Option<u64>,
    device_limit: Option<u32>,
    enable: bool,
}

#[derive(Serialize)]
struct ConfigBody<'a> {
    config: &'a NodeConfig,
}

#[derive(Deserialize)]
struct TrafficBody {
    #[serde(default)]
    users: TrafficStats,
}

impl RestTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build REST node client")?;
        Ok(Self { client, timeout })
    }

    fn endpoint<'a>(node: &'a Node) -> Result<&'a RestEndpoint, NodeClientError> {
        node.rest
            .as_ref()
            .ok_or(NodeClientError::MissingEndpoint(node.id))
    }

    fn request(&self, node: &Node, method: Method, path: &str) -> Result<RequestBuilder, NodeClientError> {
        let endpoint = Self::endpoint(node)?;
        let url = format!("{}{}", endpoint.base_url.trim_end_matches('/'), path);

        let request_id = Uuid::new_v4().to_string();
        debug!("{} {} node_id={} request_id={}", method, url, node.id, request_id);

        let builder = self
            .client
            .request(method, url)
            .timeout(self.timeout)
            .header("accept", "application/json")
            .header("x-request-id", request_id);

        Ok(match endpoint.auth {
            RestAuthScheme::ApiKey => builder.header("x-api-key", &endpoint.api_key),
            RestAuthScheme::Bearer => builder.bearer_auth(&endpoint.api_key),
        })
    }

    async fn send(node_id: NodeId, builder: RequestBuilder) -> Result<Response, NodeClientError> {
        let response = builder.send().await.map_err(|e| request_error(node_id, e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(NodeClientError::Rejected {
                node_id,
                status: status.as_u16().to_string(),
                message,
            });
        }
        Ok(response)
    }

    async fn fetch<T: DeserializeOwned>(&self, node: &Node, builder: RequestBuilder) -> Result<T, NodeClientError> {
        let response = Self::send(node.id, builder).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| NodeClientError::decode(node.id, e))
    }
}

fn request_error(node_id: NodeId, e: reqwest::Error) -> NodeClientError {
    if e.is_timeout() {
        NodeClientError::Timeout { node_id }
    } else if e.is_decode() {
        NodeClientError::decode(node_id, e)
    } else {
        NodeClientError::transport(node_id, e)
    }
}

#[async_trait]
impl NodeTransport for RestTransport {
    async fn status(&self, node: &Node) -> Result<NodeStatus, NodeClientError> {
        let builder = self.request(node, Method::GET, "/api/status")?;
        self.fetch(node, builder).await
    }

    async fn sync_user(&self, node: &Node, user: &User) -> Result<(), NodeClientError> {
        let body = SyncUserBody {
            user: SyncUser {
                id: user.id,
                email: &user.email,
                uuid: user.uuid.to_string(),
                speed_limit: user.speed_limit,
                device_limit: user.device_limit,
                enable: user.enabled,
            },
        };
        let builder = self.request(node, Method::POST, "/api/users/sync")?.json(&body);
        Self::send(node.id, builder).await.map(|_| ())
    }

    async fn remove_user(&self, node: &Node, user_id: UserId) -> Result<(), NodeClientError> {
        let builder = self.request(node, Method::DELETE, &format!("/api/users/{}", user_id))?;
        Self::send(node.id, builder).await.map(|_| ())
    }

    async fn update_user_quota(&self, node: &Node, user: &User) -> Result<(), NodeClientError> {
        let body = QuotaBody {
            transfer_enable: user.transfer_enable,
            speed_limit: user.speed_limit,
            device_limit: user.device_limit,
            enable: user.enabled,
        };
        let builder = self
            .request(node, Method::PUT, &format!("/api/users/{}/quota", user.id))?
            .json(&body);
        Self::send(node.id, builder).await.map(|_| ())
    }

    async fn traffic(&self, node: &Node, window: TimeWindow) -> Result<TrafficStats, NodeClientError> {
        let builder = self
            .request(node, Method::GET, "/api/traffic")?
            .query(&[("start", window.start), ("end", window.end)]);
        let body: TrafficBody = self.fetch(node, builder).await?;
        Ok(body.users)
    }

    async fn system_metrics(&self, node: &Node) -> Result<SystemMetrics, NodeClientError> {
        let builder = self.request(node, Method::GET, "/api/metrics")?;
        self.fetch(node, builder).await
    }

    async fn update_config(&self, node: &Node, config: &NodeConfig) -> Result<(), NodeClientError> {
        let builder = self
            .request(node, Method::PUT, "/api/config")?
            .json(&ConfigBody { config });
        Self::send(node.id, builder).await.map(|_| ())
    }

    async fn ping(&self, node: &Node, timeout: Duration) -> Result<(), NodeClientError> {
        let builder = self.request(node, Method::GET, "/api/status")?.timeout(timeout);
        Self::send(node.id, builder).await.map(|_| ())
    }
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tonic::{Code, Status};
use tracing::{debug, info};

use super::proto;
use super::NodeTransport;
use crate::error::NodeClientError;
use crate::types::{
    Node, NodeConfig, NodeId, NodeStatus, SystemMetrics, TimeWindow, TrafficStats, User, UserId,
};

/// PEM material presented to native agents over mTLS.
#[derive(Clone)]
pub struct RpcTlsMaterial {
    ca_pem: Vec<u8>,
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
}

impl RpcTlsMaterial {
    pub fn load(ca: &Path, cert: &Path, key: &Path) -> Result<Self> {
        Ok(Self {
            ca_pem: std::fs::read(ca).with_context(|| format!("Failed to read CA cert: {:?}", ca))?,
            cert_pem: std::fs::read(cert)
                .with_context(|| format!("Failed to read client cert: {:?}", cert))?,
            key_pem: std::fs::read(key)
                .with_context(|| format!("Failed to read client key: {:?}", key))?,
        })
    }

    fn client_config(&self) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(&self.ca_pem))
            .identity(Identity::from_pem(&self.cert_pem, &self.key_pem))
    }
}

/// gRPC client for the native node agent.
///
/// One lazily connected channel is kept per agent endpoint and shared by all
/// calls to that node.
pub struct RpcTransport {
    timeout: Duration,
    tls: Option<ClientTlsConfig>,
    channels: Mutex<HashMap<String, Channel>>,
}

impl RpcTransport {
    pub fn new(timeout: Duration, tls: Option<RpcTlsMaterial>) -> Self {
        if tls.is_some() {
            info!("Native agent calls will use mTLS");
        }
        Self {
            timeout,
            tls: tls.map(|m| m.client_config()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn endpoint_uri(&self, node: &Node) -> String {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        format!("{}://{}:{}", scheme, node.host, node.port)
    }

    fn channel(&self, node: &Node) -> Result<Channel, NodeClientError> {
        let uri = self.endpoint_uri(node);
        if let Some(channel) = self.channels.lock().get(&uri) {
            return Ok(channel.clone());
        }

        let mut endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| NodeClientError::transport(node.id, e))?
            .timeout(self.timeout)
            .connect_timeout(self.timeout);
        if let Some(tls) = &self.tls {
            endpoint = endpoint
                .tls_config(tls.clone())
                .map_err(|e| NodeClientError::transport(node.id, e))?;
        }

        debug!("Opening channel to node_id={} at {}", node.id, uri);
        let channel = endpoint.connect_lazy();
        self.channels.lock().insert(uri, channel.clone());
        Ok(channel)
    }

    async fn unary<Req, Resp>(
        &self,
        node: &Node,
        path: &'static str,
        message: Req,
    ) -> Result<Resp, NodeClientError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = tonic::client::Grpc::new(self.channel(node)?);
        grpc.ready()
            .await
            .map_err(|e| NodeClientError::transport(node.id, e))?;

        let mut request = tonic::Request::new(message);
        request.set_timeout(self.timeout);
        let response = grpc
            .unary(request, PathAndQuery::from_static(path), ProstCodec::default())
            .await
            .map_err(|s| status_error(node.id, s))?;
        Ok(response.into_inner())
    }

    async fn mutate<Req>(&self, node: &Node, path: &'static str, message: Req) -> Result<(), NodeClientError>
    where
        Req: prost::Message + Send + Sync + 'static,
    {
        let resp: proto::OperationResponse = self.unary(node, path, message).await?;
        if !resp.success {
            return Err(NodeClientError::Rejected {
                node_id: node.id,
                status: "failed".to_string(),
                message: resp.message,
            });
        }
        Ok(())
    }

    fn node_request(node: &Node) -> proto::NodeRequest {
        proto::NodeRequest {
            node_id: node.id.to_string(),
        }
    }
}

fn status_error(node_id: NodeId, status: Status) -> NodeClientError {
    match status.code() {
        Code::DeadlineExceeded | Code::Cancelled => NodeClientError::Timeout { node_id },
        Code::Unavailable | Code::Unknown => NodeClientError::transport(node_id, status.message()),
        Code::Internal if status.message().contains("decode") => {
            NodeClientError::decode(node_id, status.message())
        }
        code => NodeClientError::Rejected {
            node_id,
            status: format!("{:?}", code),
            message: status.message().to_string(),
        },
    }
}

#[async_trait]
impl NodeTransport for RpcTransport {
    async fn status(&self, node: &Node) -> Result<NodeStatus, NodeClientError> {
        let resp: proto::NodeStatusResponse = self
            .unary(node, proto::GET_NODE_STATUS, Self::node_request(node))
            .await?;
        Ok(resp.into())
    }

    async fn sync_user(&self, node: &Node, user: &User) -> Result<(), NodeClientError> {
        let node_id = node.id.to_string();
        self.mutate(node, proto::ADD_USER, proto::UserInfo::new(&node_id, user))
            .await?;
        self.update_user_quota(node, user).await
    }

    async fn remove_user(&self, node: &Node, user_id: UserId) -> Result<(), NodeClientError> {
        let request = proto::RemoveUserRequest {
            node_id: node.id.to_string(),
            user_id,
        };
        self.mutate(node, proto::REMOVE_USER, request).await
    }

    async fn update_user_quota(&self, node: &Node, user: &User) -> Result<(), NodeClientError> {
        let node_id = node.id.to_string();
        self.mutate(node, proto::UPDATE_USER_QUOTA, proto::QuotaInfo::new(&node_id, user))
            .await
    }

    async fn traffic(&self, node: &Node, window: TimeWindow) -> Result<TrafficStats, NodeClientError> {
        let request = proto::TrafficRequest {
            node_id: node.id.to_string(),
            start_time: window.start,
            end_time: window.end,
        };
        let resp: proto::TrafficResponse = self.unary(node, proto::GET_TRAFFIC_STATS, request).await?;
        Ok(resp.into())
    }

    async fn system_metrics(&self, node: &Node) -> Result<SystemMetrics, NodeClientError> {
        let resp: proto::MetricsResponse = self
            .unary(node, proto::GET_SYSTEM_METRICS, Self::node_request(node))
            .await?;
        Ok(resp.into())
    }

    async fn update_config(&self, node: &Node, config: &NodeConfig) -> Result<(), NodeClientError> {
        self.mutate(node, proto::UPDATE_NODE_CONFIG, proto::NodeConfigRequest::new(config))
            .await
    }

    async fn ping(&self, node: &Node, timeout: Duration) -> Result<(), NodeClientError> {
        match tokio::time::timeout(timeout, self.status(node)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(NodeClientError::Timeout { node_id: node.id }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::node;

    #[test]
    fn test_status_codes_map_to_error_kinds() {
        assert!(matches!(
            status_error(1, Status::deadline_exceeded("slow")),
            NodeClientError::Timeout { node_id: 1 }
        ));
        assert!(status_error(1, Status::unavailable("down")).is_transport());
        match status_error(1, Status::permission_denied("no")) {
            NodeClientError::Rejected { status, message, .. } => {
                assert_eq!(status, "PermissionDenied");
                assert_eq!(message, "no");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_channels_are_reused_per_endpoint() {
        let transport = RpcTransport::new(Duration::from_secs(5), None);
        let n = node(1);
        transport.channel(&n).unwrap();
        transport.channel(&n).unwrap();
        transport.channel(&node(2)).unwrap();
        assert_eq!(transport.channels.lock().len(), 2);
        assert_eq!(transport.endpoint_uri(&n), "http://10.0.0.1:8100");
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_a_transport_failure() {
        let transport = RpcTransport::new(Duration::from_millis(200), None);
        let mut n = node(1);
        n.host = "127.0.0.1".to_string();
        n.port = 1;

        let err = transport.status(&n).await.unwrap_err();
        assert!(err.is_transport(), "{:?}", err);
        let err = transport.remove_user(&n, 3).await.unwrap_err();
        assert!(err.is_transport(), "{:?}", err);
    }
}

//! Typed errors for the node-facing seams.
//!
//! Storage, certificate and wiring code use `anyhow` with context; the node
//! client and config validation keep typed errors so callers can tell a
//! rejected push from an unreachable node.

use thiserror::Error;

use crate::types::NodeId;

/// Reasons a `NodeConfig` is refused before any push attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigValidationError {
    #[error("node address must not be empty")]
    EmptyAddress,

    #[error("node port must be positive")]
    InvalidPort,

    #[error("override settings must be a JSON object")]
    SettingsNotObject,

    #[error("cipher suite names must not be blank")]
    BlankCipherSuite,

    #[error("cipher suites configured while TLS is disabled")]
    CiphersWithoutTls,

    #[error("allow_insecure requires TLS to be enabled")]
    InsecureWithoutTls,
}

/// Failures talking to a node's management agent.
#[derive(Debug, Error)]
pub enum NodeClientError {
    /// Connection refused, DNS failure, TLS failure, broken stream.
    #[error("node {node_id} unreachable: {reason}")]
    Transport { node_id: NodeId, reason: String },

    #[error("node {node_id} timed out")]
    Timeout { node_id: NodeId },

    /// The agent answered but refused the request.
    #[error("node {node_id} rejected request ({status}): {message}")]
    Rejected {
        node_id: NodeId,
        status: String,
        message: String,
    },

    #[error("node {node_id} sent an undecodable response: {reason}")]
    Decode { node_id: NodeId, reason: String },

    #[error("node {0} has no REST endpoint configured")]
    MissingEndpoint(NodeId),

    #[error("invalid node config: {0}")]
    InvalidConfig(#[from] ConfigValidationError),
}

impl NodeClientError {
    pub fn transport(node_id: NodeId, reason: impl ToString) -> Self {
        NodeClientError::Transport {
            node_id,
            reason: reason.to_string(),
        }
    }

    pub fn decode(node_id: NodeId, reason: impl ToString) -> Self {
        NodeClientError::Decode {
            node_id,
            reason: reason.to_string(),
        }
    }

    /// True for failures of the link rather than of the request itself.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            NodeClientError::Transport { .. } | NodeClientError::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(NodeClientError::Timeout { node_id: 1 }.is_transport());
        assert!(NodeClientError::transport(1, "connection refused").is_transport());
        assert!(!NodeClientError::MissingEndpoint(1).is_transport());
        assert!(!NodeClientError::from(ConfigValidationError::InvalidPort).is_transport());
    }

    #[test]
    fn test_messages_carry_node_id() {
        let err = NodeClientError::Rejected {
            node_id: 7,
            status: "500".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "node 7 rejected request (500): boom");
    }
}

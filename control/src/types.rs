use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::ConfigValidationError;

pub type NodeId = u64;
pub type UserId = u64;

// ============================================================================
// Node Types
// ============================================================================

/// Which management agent a node runs, and therefore which transport reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    #[default]
    NativeRpc,
    RestAdapter,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::NativeRpc => "native-rpc",
            TransportKind::RestAdapter => "rest-adapter",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestAuthScheme {
    #[default]
    ApiKey,
    Bearer,
}

/// Endpoint of a third-party panel reached through the REST adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestEndpoint {
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub auth: RestAuthScheme,
}

/// Load-balance method. Unknown method names are preserved and fall back to
/// the first candidate at selection time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum BalanceMethod {
    #[default]
    RoundRobin,
    LeastConnection,
    WeightedRandom,
    Other(String),
}

impl BalanceMethod {
    pub fn as_str(&self) -> &str {
        match self {
            BalanceMethod::RoundRobin => "round-robin",
            BalanceMethod::LeastConnection => "least-connection",
            BalanceMethod::WeightedRandom => "weighted-random",
            BalanceMethod::Other(name) => name,
        }
    }
}

impl From<String> for BalanceMethod {
    fn from(value: String) -> Self {
        match value.as_str() {
            "round-robin" => BalanceMethod::RoundRobin,
            "least-connection" => BalanceMethod::LeastConnection,
            "weighted-random" => BalanceMethod::WeightedRandom,
            _ => BalanceMethod::Other(value),
        }
    }
}

impl From<BalanceMethod> for String {
    fn from(value: BalanceMethod) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalanceSettings {
    pub enabled: bool,
    pub method: BalanceMethod,
    pub weight: u32,
}

impl Default for LoadBalanceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            method: BalanceMethod::RoundRobin,
            weight: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckSettings {
    pub enabled: bool,
    pub timeout_secs: u64,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub enabled: bool,
    pub allow_insecure: bool,
    pub cipher_suites: Vec<String>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_insecure: false,
            cipher_suites: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProtocolSettings {
    pub load_balance: LoadBalanceSettings,
    pub health_check: HealthCheckSettings,
    pub tls: TlsSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RateLimit {
    pub enabled: bool,
    pub upload: u64,
    pub download: u64,
}

/// A proxy node as recorded in the fleet inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub rest: Option<RestEndpoint>,
    #[serde(default)]
    pub protocol_settings: ProtocolSettings,
    #[serde(default)]
    pub rate_limit: RateLimit,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_network")]
    pub network: String,
    /// Traffic allowance in bytes; 0 means unlimited.
    #[serde(default)]
    pub traffic_limit: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_network() -> String {
    "tcp".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListNodesResponse {
    pub nodes: Vec<Node>,
}

// ============================================================================
// User Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub uuid: Uuid,
    pub speed_limit: Option<u64>,
    pub device_limit: Option<u32>,
    #[serde(default)]
    pub transfer_enable: u64,
    pub enabled: bool,
    /// Unix seconds; `None` never expires.
    pub expired_at: Option<i64>,
}

impl User {
    pub fn is_active(&self, now: i64) -> bool {
        self.enabled && self.expired_at.map_or(true, |at| at > now)
    }
}

/// Per-(user, node) configuration held by the node cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserNodeConfig {
    pub user_id: UserId,
    pub server_id: NodeId,
    pub email: String,
    pub uuid: Uuid,
    pub speed_limit: Option<u64>,
    pub device_limit: Option<u32>,
    pub enable: bool,
    pub host: String,
    pub port: u16,
    pub network: String,
}

impl UserNodeConfig {
    pub fn for_user(node: &Node, user: &User) -> Self {
        Self {
            user_id: user.id,
            server_id: node.id,
            email: user.email.clone(),
            uuid: user.uuid,
            speed_limit: user.speed_limit,
            device_limit: user.device_limit,
            enable: user.enabled,
            host: node.host.clone(),
            port: node.port,
            network: node.network.clone(),
        }
    }
}

// ============================================================================
// Node Configuration Push
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SecuritySettings {
    pub tls_enabled: bool,
    pub allow_insecure: bool,
    pub cipher_suites: Vec<String>,
}

/// Validated projection of a node pushed to its management agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub transport_type: String,
    pub settings: serde_json::Value,
    pub tags: Vec<String>,
    pub rate_limit: RateLimit,
    pub security: SecuritySettings,
}

impl NodeConfig {
    pub fn from_node(node: &Node, settings: serde_json::Value) -> Self {
        let tls = &node.protocol_settings.tls;
        Self {
            node_id: node.id,
            name: node.name.clone(),
            address: node.host.clone(),
            port: node.port,
            transport_type: node.network.clone(),
            settings,
            tags: node.tags.clone(),
            rate_limit: node.rate_limit.clone(),
            security: SecuritySettings {
                tls_enabled: tls.enabled,
                allow_insecure: tls.allow_insecure,
                cipher_suites: tls.cipher_suites.clone(),
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.address.trim().is_empty() {
            return Err(ConfigValidationError::EmptyAddress);
        }
        if self.port == 0 {
            return Err(ConfigValidationError::InvalidPort);
        }
        if !self.settings.is_null() && !self.settings.is_object() {
            return Err(ConfigValidationError::SettingsNotObject);
        }

        let security = &self.security;
        if security.cipher_suites.iter().any(|c| c.trim().is_empty()) {
            return Err(ConfigValidationError::BlankCipherSuite);
        }
        if !security.tls_enabled && !security.cipher_suites.is_empty() {
            return Err(ConfigValidationError::CiphersWithoutTls);
        }
        if !security.tls_enabled && security.allow_insecure {
            return Err(ConfigValidationError::InsecureWithoutTls);
        }

        Ok(())
    }
}

// ============================================================================
// Node Telemetry
// ============================================================================

/// Live status reported by a node's management agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NodeStatus {
    /// Agent run-status, `"running"` when healthy.
    pub status: String,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub load_averages: Vec<f64>,
    pub network_in: u64,
    pub network_out: u64,
    pub connections: u64,
    pub online_users: u64,
    pub version: String,
    pub uptime: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CpuMetrics {
    pub usage: f64,
    pub cores: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CapacityMetrics {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

impl CapacityMetrics {
    pub fn usage_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.used as f64 / self.total as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NetworkMetrics {
    pub in_speed: u64,
    pub out_speed: u64,
    pub connections: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SystemMetrics {
    pub cpu: CpuMetrics,
    pub memory: CapacityMetrics,
    pub disk: CapacityMetrics,
    pub network: NetworkMetrics,
    pub load: f64,
    pub uptime: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConnectionInfo {
    pub source_ip: String,
    pub source_port: u32,
    pub dest_ip: String,
    pub dest_port: u32,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct UserTraffic {
    pub upload: u64,
    pub download: u64,
    pub connections: Vec<ConnectionInfo>,
}

/// Per-user traffic reported by a node for one window.
pub type TrafficStats = HashMap<UserId, UserTraffic>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: i64,
    pub end: i64,
}

impl TimeWindow {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }
}

/// Last observed metrics of a node, superseded on every collection cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub node_id: NodeId,
    pub timestamp: i64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub load_averages: Vec<f64>,
    pub network_in: u64,
    pub network_out: u64,
    pub connections: u64,
    pub online_users: u64,
    pub agent_version: String,
    pub agent_status: String,
}

impl MetricsSnapshot {
    pub fn from_status(node_id: NodeId, timestamp: i64, status: &NodeStatus) -> Self {
        Self {
            node_id,
            timestamp,
            cpu_usage: status.cpu_usage,
            memory_usage: status.memory_usage,
            disk_usage: status.disk_usage,
            load_averages: status.load_averages.clone(),
            network_in: status.network_in,
            network_out: status.network_out,
            connections: status.connections,
            online_users: status.online_users,
            agent_version: status.version.clone(),
            agent_status: status.status.clone(),
        }
    }
}

// ============================================================================
// Traffic Records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrafficScope {
    User { user_id: UserId, node_id: NodeId },
    Node { node_id: NodeId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub scope: TrafficScope,
    pub upload: u64,
    pub download: u64,
    pub total: u64,
    pub start_time: i64,
    pub end_time: i64,
}

impl TrafficRecord {
    pub fn new(scope: TrafficScope, upload: u64, download: u64, window: TimeWindow) -> Self {
        Self {
            scope,
            upload,
            download,
            total: upload.saturating_add(download),
            start_time: window.start,
            end_time: window.end,
        }
    }
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AlertScope {
    Node(NodeId),
    User(UserId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    HighCpuUsage,
    HighMemoryUsage,
    HighDiskUsage,
    HighConnectionCount,
    AgentNotRunning,
    HighTrafficUsage,
    NodeError,
    ConfigError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Cleared,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub scope: AlertScope,
    pub kind: AlertKind,
    pub message: String,
    pub level: AlertLevel,
    pub timestamp: i64,
    pub status: AlertStatus,
}

impl Alert {
    pub fn new(scope: AlertScope, kind: AlertKind, message: impl Into<String>, timestamp: i64) -> Self {
        let level = match kind {
            AlertKind::AgentNotRunning | AlertKind::NodeError | AlertKind::ConfigError => {
                AlertLevel::Critical
            }
            _ => AlertLevel::Warning,
        };

        Self {
            scope,
            kind,
            message: message.into(),
            level,
            timestamp,
            status: AlertStatus::Active,
        }
    }
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthVerdict {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthChecks {
    pub cpu: bool,
    pub memory: bool,
    pub disk: bool,
    pub agent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHealth {
    pub status: HealthVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checks: Option<HealthChecks>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

// ============================================================================
// User Sync
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: i64,
}

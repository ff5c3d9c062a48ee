//! Messages of the `nodemanager.NodeManager` gRPC service.

use std::collections::HashMap;

use crate::types::{
    CapacityMetrics, ConnectionInfo, CpuMetrics, NetworkMetrics, NodeConfig, NodeStatus,
    SystemMetrics, TrafficStats, User, UserTraffic,
};

pub const GET_NODE_STATUS: &str = "/nodemanager.NodeManager/GetNodeStatus";
pub const ADD_USER: &str = "/nodemanager.NodeManager/AddUser";
pub const REMOVE_USER: &str = "/nodemanager.NodeManager/RemoveUser";
pub const UPDATE_USER_QUOTA: &str = "/nodemanager.NodeManager/UpdateUserQuota";
pub const GET_TRAFFIC_STATS: &str = "/nodemanager.NodeManager/GetTrafficStats";
pub const GET_SYSTEM_METRICS: &str = "/nodemanager.NodeManager/GetSystemMetrics";
pub const UPDATE_NODE_CONFIG: &str = "/nodemanager.NodeManager/UpdateNodeConfig";

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeRequest {
    #[prost(string, tag = "1")]
    pub node_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeStatusResponse {
    #[prost(string, tag = "1")]
    pub status: String,
    #[prost(double, tag = "2")]
    pub cpu_usage: f64,
    #[prost(double, tag = "3")]
    pub memory_usage: f64,
    #[prost(double, tag = "4")]
    pub disk_usage: f64,
    #[prost(double, repeated, tag = "5")]
    pub load_averages: Vec<f64>,
    #[prost(uint64, tag = "6")]
    pub network_in: u64,
    #[prost(uint64, tag = "7")]
    pub network_out: u64,
    #[prost(uint64, tag = "8")]
    pub connections: u64,
    #[prost(uint64, tag = "9")]
    pub online_users: u64,
    #[prost(string, tag = "10")]
    pub version: String,
    #[prost(uint64, tag = "11")]
    pub uptime: u64,
}

impl From<NodeStatusResponse> for NodeStatus {
    fn from(r: NodeStatusResponse) -> Self {
        NodeStatus {
            status: r.status,
            cpu_usage: r.cpu_usage,
            memory_usage: r.memory_usage,
            disk_usage: r.disk_usage,
            load_averages: r.load_averages,
            network_in: r.network_in,
            network_out: r.network_out,
            connections: r.connections,
            online_users: r.online_users,
            version: r.version,
            uptime: r.uptime,
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserInfo {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(uint64, tag = "2")]
    pub user_id: u64,
    #[prost(string, tag = "3")]
    pub email: String,
    #[prost(string, tag = "4")]
    pub uuid: String,
}

impl UserInfo {
    pub fn new(node_id: &str, user: &User) -> Self {
        Self {
            node_id: node_id.to_string(),
            user_id: user.id,
            email: user.email.clone(),
            uuid: user.uuid.to_string(),
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveUserRequest {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(uint64, tag = "2")]
    pub user_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QuotaInfo {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(uint64, tag = "2")]
    pub user_id: u64,
    #[prost(uint64, optional, tag = "3")]
    pub speed_limit: Option<u64>,
    #[prost(uint32, optional, tag = "4")]
    pub device_limit: Option<u32>,
    #[prost(uint64, tag = "5")]
    pub transfer_enable: u64,
    #[prost(bool, tag = "6")]
    pub enabled: bool,
}

impl QuotaInfo {
    pub fn new(node_id: &str, user: &User) -> Self {
        Self {
            node_id: node_id.to_string(),
            user_id: user.id,
            speed_limit: user.speed_limit,
            device_limit: user.device_limit,
            transfer_enable: user.transfer_enable,
            enabled: user.enabled,
        }
    }
}

/// Acknowledgement returned by every mutating call.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OperationResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrafficRequest {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(int64, tag = "2")]
    pub start_time: i64,
    #[prost(int64, tag = "3")]
    pub end_time: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Connection {
    #[prost(string, tag = "1")]
    pub source_ip: String,
    #[prost(uint32, tag = "2")]
    pub source_port: u32,
    #[prost(string, tag = "3")]
    pub dest_ip: String,
    #[prost(uint32, tag = "4")]
    pub dest_port: u32,
    #[prost(string, tag = "5")]
    pub protocol: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserTrafficEntry {
    #[prost(uint64, tag = "1")]
    pub user_id: u64,
    #[prost(uint64, tag = "2")]
    pub upload: u64,
    #[prost(uint64, tag = "3")]
    pub download: u64,
    #[prost(message, repeated, tag = "4")]
    pub connections: Vec<Connection>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrafficResponse {
    #[prost(message, repeated, tag = "1")]
    pub users: Vec<UserTrafficEntry>,
}

impl From<TrafficResponse> for TrafficStats {
    fn from(r: TrafficResponse) -> Self {
        let mut stats = HashMap::with_capacity(r.users.len());
        for entry in r.users {
            let connections = entry
                .connections
                .into_iter()
                .map(|c| ConnectionInfo {
                    source_ip: c.source_ip,
                    source_port: c.source_port,
                    dest_ip: c.dest_ip,
                    dest_port: c.dest_port,
                    protocol: c.protocol,
                })
                .collect();
            stats.insert(
                entry.user_id,
                UserTraffic {
                    upload: entry.upload,
                    download: entry.download,
                    connections,
                },
            );
        }
        stats
    }
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Capacity {
    #[prost(uint64, tag = "1")]
    pub total: u64,
    #[prost(uint64, tag = "2")]
    pub used: u64,
    #[prost(uint64, tag = "3")]
    pub free: u64,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Cpu {
    #[prost(double, tag = "1")]
    pub usage: f64,
    #[prost(uint32, tag = "2")]
    pub cores: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Network {
    #[prost(uint64, tag = "1")]
    pub in_speed: u64,
    #[prost(uint64, tag = "2")]
    pub out_speed: u64,
    #[prost(uint64, tag = "3")]
    pub connections: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetricsResponse {
    #[prost(message, optional, tag = "1")]
    pub cpu: Option<Cpu>,
    #[prost(message, optional, tag = "2")]
    pub memory: Option<Capacity>,
    #[prost(message, optional, tag = "3")]
    pub disk: Option<Capacity>,
    #[prost(message, optional, tag = "4")]
    pub network: Option<Network>,
    #[prost(double, tag = "5")]
    pub load: f64,
    #[prost(uint64, tag = "6")]
    pub uptime: u64,
}

fn capacity(c: Option<Capacity>) -> CapacityMetrics {
    c.map(|c| CapacityMetrics {
        total: c.total,
        used: c.used,
        free: c.free,
    })
    .unwrap_or_default()
}

impl From<MetricsResponse> for SystemMetrics {
    fn from(r: MetricsResponse) -> Self {
        SystemMetrics {
            cpu: r
                .cpu
                .map(|c| CpuMetrics {
                    usage: c.usage,
                    cores: c.cores,
                })
                .unwrap_or_default(),
            memory: capacity(r.memory),
            disk: capacity(r.disk),
            network: r
                .network
                .map(|n| NetworkMetrics {
                    in_speed: n.in_speed,
                    out_speed: n.out_speed,
                    connections: n.connections,
                })
                .unwrap_or_default(),
            load: r.load,
            uptime: r.uptime,
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeConfigRequest {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub address: String,
    #[prost(uint32, tag = "4")]
    pub port: u32,
    #[prost(string, tag = "5")]
    pub transport_type: String,
    /// Override settings as a JSON object.
    #[prost(string, tag = "6")]
    pub settings_json: String,
    #[prost(string, repeated, tag = "7")]
    pub tags: Vec<String>,
    #[prost(bool, tag = "8")]
    pub rate_limit_enabled: bool,
    #[prost(uint64, tag = "9")]
    pub upload_limit: u64,
    #[prost(uint64, tag = "10")]
    pub download_limit: u64,
    #[prost(bool, tag = "11")]
    pub tls_enabled: bool,
    #[prost(bool, tag = "12")]
    pub allow_insecure: bool,
    #[prost(string, repeated, tag = "13")]
    pub cipher_suites: Vec<String>,
}

impl NodeConfigRequest {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            node_id: config.node_id.to_string(),
            name: config.name.clone(),
            address: config.address.clone(),
            port: u32::from(config.port),
            transport_type: config.transport_type.clone(),
            settings_json: config.settings.to_string(),
            tags: config.tags.clone(),
            rate_limit_enabled: config.rate_limit.enabled,
            upload_limit: config.rate_limit.upload,
            download_limit: config.rate_limit.download,
            tls_enabled: config.security.tls_enabled,
            allow_insecure: config.security.allow_insecure,
            cipher_suites: config.security.cipher_suites.clone(),
        }
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level control plane configuration, loaded from TOML.
///
/// Every section falls back to its defaults when omitted, so an empty file
/// (or no file at all) is a valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub cache: CacheConfig,
    pub balancer: BalancerConfig,
    pub node_client: NodeClientConfig,
    pub monitor: MonitorConfig,
    pub traffic: TrafficConfig,
    pub warmup: WarmupConfig,
    pub certs: CertConfig,
    pub auth: NodeAuthConfig,
}

impl FleetConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        let cfg = toml::from_str(&text).with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(cfg)
    }
}

pub fn default_data_dir() -> PathBuf {
    let mut dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    dir.push("fleet-control");
    dir
}

pub fn default_config_path() -> PathBuf {
    let mut dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    dir.push("fleet-control");
    dir.push("config.toml");
    dir
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL of per-(user, node) configuration in both tiers.
    pub node_config_ttl_secs: u64,
    pub health_ttl_secs: u64,
    /// TTL of last-check / last-push markers.
    pub marker_ttl_secs: u64,
    /// How often the daemon drops expired rows from the durable tier.
    pub purge_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            node_config_ttl_secs: 3600,
            health_ttl_secs: 60,
            marker_ttl_secs: 300,
            purge_interval_secs: 600,
        }
    }
}

impl CacheConfig {
    pub fn node_config_ttl(&self) -> Duration {
        Duration::from_secs(self.node_config_ttl_secs)
    }

    pub fn health_ttl(&self) -> Duration {
        Duration::from_secs(self.health_ttl_secs)
    }

    pub fn marker_ttl(&self) -> Duration {
        Duration::from_secs(self.marker_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub cursor_ttl_secs: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self { cursor_ttl_secs: 300 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeClientConfig {
    pub rpc_timeout_secs: u64,
    pub rest_timeout_secs: u64,
    /// Present the control plane's mTLS identity to native agents with TLS enabled.
    pub rpc_mtls: bool,
}

impl Default for NodeClientConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_secs: 5,
            rest_timeout_secs: 5,
            rpc_mtls: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub connections: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 90.0,
            memory_percent: 90.0,
            disk_percent: 90.0,
            connections: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    /// Upper bound on nodes polled concurrently during one sweep.
    pub workers: usize,
    pub thresholds: AlertThresholds,
    pub snapshot_ttl_secs: u64,
    pub system_metrics_ttl_secs: u64,
    pub alert_retention_days: u32,
    /// Alerts kept per node or user; older ones are dropped first.
    pub alert_history_max: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            workers: 8,
            thresholds: AlertThresholds::default(),
            snapshot_ttl_secs: 300,
            system_metrics_ttl_secs: 300,
            alert_retention_days: 7,
            alert_history_max: 1000,
        }
    }
}

impl MonitorConfig {
    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_secs)
    }

    pub fn alert_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.alert_retention_days) * 86_400)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    pub record_ttl_secs: u64,
    pub stats_ttl_secs: u64,
    /// Share of the node traffic limit, in percent, that raises an alert.
    pub alert_percent: u8,
    /// Trailing window the monitor sweep checks against node traffic limits.
    pub alert_window_secs: u64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            record_ttl_secs: 3600,
            stats_ttl_secs: 300,
            alert_percent: 90,
            alert_window_secs: 30 * 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupConfig {
    pub chunk_size: usize,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self { chunk_size: 100 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    #[default]
    Rsa,
    EcdsaP256,
    EcdsaP384,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertConfig {
    pub cert_dir: PathBuf,
    pub ca_key_path: PathBuf,
    pub ca_cert_path: PathBuf,
    pub validity_days: u32,
    pub key_algorithm: KeyAlgorithm,
    /// RSA modulus size; ignored for ECDSA keys.
    pub key_bits: usize,
    /// `sha256`, `sha384` or `sha512`.
    pub digest: String,
}

impl Default for CertConfig {
    fn default() -> Self {
        Self::in_dir(default_data_dir().join("certs"))
    }
}

impl CertConfig {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            ca_key_path: dir.join("ca.key"),
            ca_cert_path: dir.join("ca.crt"),
            cert_dir: dir,
            validity_days: 365,
            key_algorithm: KeyAlgorithm::Rsa,
            key_bits: 2048,
            digest: "sha256".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeAuthConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub ca_file: PathBuf,
    pub verify_peer: bool,
    pub cert_ttl_days: u32,
    pub renew_before_days: u32,
    /// Identity used for the control plane's own certificate.
    pub node_id: String,
    pub rotation_interval_secs: u64,
}

impl Default for NodeAuthConfig {
    fn default() -> Self {
        Self::in_dir(default_data_dir().join("certs"))
    }
}

impl NodeAuthConfig {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            cert_file: dir.join("node.crt"),
            key_file: dir.join("node.key"),
            ca_file: dir.join("ca.crt"),
            verify_peer: true,
            cert_ttl_days: 30,
            renew_before_days: 7,
            node_id: "default".to_string(),
            rotation_interval_secs: 3600,
        }
    }
}

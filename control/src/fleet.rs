//! Wires every fleet service from one [`FleetConfig`].

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::alerts::AlertLog;
use crate::balancer::LoadBalancer;
use crate::cache::{CacheStore, MemoryStore, SqliteStore, TieredStore};
use crate::certs::CertificateManager;
use crate::config::FleetConfig;
use crate::db::inventory::Inventory;
use crate::db::DbPool;
use crate::events::EventBus;
use crate::monitor::{NodeMonitor, SystemMonitor};
use crate::node_cache::NodeCacheService;
use crate::node_client::{NodeClient, NodeTransport, RestTransport, RpcTlsMaterial, RpcTransport};
use crate::node_manager::NodeManager;
use crate::tls::NodeAuth;
use crate::traffic::{TrafficService, TrafficStatsService};
use crate::types::{Node, UserId};

/// Shared state of one control plane instance.
pub struct Fleet {
    pub config: FleetConfig,
    pub cache: Arc<dyn CacheStore>,
    pub inventory: Inventory,
    pub events: Arc<EventBus>,
    pub client: NodeClient,
    pub balancer: LoadBalancer,
    pub node_cache: NodeCacheService,
    pub alerts: Arc<AlertLog>,
    pub monitor: NodeMonitor,
    pub system: SystemMonitor,
    pub traffic: TrafficStatsService,
    pub manager: NodeManager,
    pub auth: NodeAuth,
}

impl Fleet {
    /// Build with the real gRPC and REST transports.
    pub fn new(config: FleetConfig, pool: DbPool) -> Result<Self> {
        let nc = &config.node_client;

        let tls = if nc.rpc_mtls {
            let auth = &config.auth;
            Some(
                RpcTlsMaterial::load(&auth.ca_file, &auth.cert_file, &auth.key_file)
                    .context("Failed to load mTLS material for native agents")?,
            )
        } else {
            None
        };

        let rpc = Arc::new(RpcTransport::new(Duration::from_secs(nc.rpc_timeout_secs), tls));
        let rest = Arc::new(
            RestTransport::new(Duration::from_secs(nc.rest_timeout_secs))
                .context("Failed to build REST transport")?,
        );

        Ok(Self::with_transports(config, pool, rpc, rest))
    }

    pub fn with_transports(
        config: FleetConfig,
        pool: DbPool,
        rpc: Arc<dyn NodeTransport>,
        rest: Arc<dyn NodeTransport>,
    ) -> Self {
        let cache: Arc<dyn CacheStore> = Arc::new(TieredStore::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SqliteStore::new(pool.clone())),
            config.cache.node_config_ttl(),
        ));
        let events = Arc::new(EventBus::default());

        let client = NodeClient::new(rpc, rest, cache.clone(), &config.cache);
        let alerts = Arc::new(
            AlertLog::new(cache.clone(), events.clone(), config.monitor.alert_retention())
                .with_max_entries(config.monitor.alert_history_max),
        );
        let node_cache = NodeCacheService::new(
            cache.clone(),
            config.cache.node_config_ttl(),
            config.warmup.chunk_size,
        );

        let monitor = NodeMonitor::new(
            client.clone(),
            cache.clone(),
            alerts.clone(),
            events.clone(),
            config.monitor.thresholds.clone(),
            config.monitor.snapshot_ttl(),
        );
        let system = SystemMonitor::new(
            client.clone(),
            cache.clone(),
            events.clone(),
            Duration::from_secs(config.monitor.system_metrics_ttl_secs),
        );

        let traffic = TrafficStatsService::new(
            TrafficService::new(
                client.clone(),
                cache.clone(),
                alerts.clone(),
                Duration::from_secs(config.traffic.record_ttl_secs),
                config.traffic.alert_percent,
            ),
            cache.clone(),
            Duration::from_secs(config.traffic.stats_ttl_secs),
        );

        let manager = NodeManager::new(
            client.clone(),
            node_cache.clone(),
            alerts.clone(),
            events.clone(),
        );
        let balancer = LoadBalancer::new(cache.clone(), &config.balancer);
        let auth = NodeAuth::new(
            CertificateManager::new(config.certs.clone()),
            config.auth.clone(),
        );

        info!("Fleet services initialized");

        Self {
            config,
            cache,
            inventory: Inventory::new(pool),
            events,
            client,
            balancer,
            node_cache,
            alerts,
            monitor,
            system,
            traffic,
            manager,
            auth,
        }
    }

    /// Enabled inventory nodes, in id order.
    pub async fn enabled_nodes(&self) -> Result<Vec<Node>> {
        let nodes = self.inventory.list_nodes().await?;
        Ok(nodes.into_iter().filter(|n| n.enabled).collect())
    }

    /// Route a user to one of the enabled nodes whose cached health is good.
    pub async fn select_node_for(&self, user_id: UserId) -> Result<Option<Node>> {
        let Some(user) = self.inventory.get_user(user_id).await? else {
            return Ok(None);
        };
        let nodes = self.enabled_nodes().await?;
        let candidates = self.balancer.get_available_nodes(&nodes).await;
        Ok(self.balancer.select_node(&candidates, &user).await.cloned())
    }
}

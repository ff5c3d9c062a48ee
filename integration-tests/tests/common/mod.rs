use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

use fleet_control::config::{CertConfig, FleetConfig, KeyAlgorithm, NodeAuthConfig};
use fleet_control::fleet::Fleet;
use fleet_control::types::{
    Node, NodeId, ProtocolSettings, RateLimit, RestAuthScheme, RestEndpoint, TransportKind, User,
    UserId,
};
use fleet_control::{api, db};

/// A control plane over a throwaway data directory.
pub struct TestFleet {
    pub dir: TempDir,
    pub fleet: Arc<Fleet>,
}

impl TestFleet {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let fleet = open(&dir);
        Self { dir, fleet }
    }

    /// A fresh control plane over the same database, as after a restart.
    pub fn restart(&mut self) {
        self.fleet = open(&self.dir);
    }

    /// Serve the HTTP API on an ephemeral port, returning its base URL.
    pub async fn serve(&self) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().unwrap();
        let app = api::create_router(self.fleet.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }
}

pub fn config(dir: &TempDir) -> FleetConfig {
    let cert_dir = dir.path().join("certs");
    let mut certs = CertConfig::in_dir(&cert_dir);
    certs.key_algorithm = KeyAlgorithm::EcdsaP256;

    FleetConfig {
        certs,
        auth: NodeAuthConfig::in_dir(&cert_dir),
        ..Default::default()
    }
}

fn open(dir: &TempDir) -> Arc<Fleet> {
    let db_path: PathBuf = dir.path().join("control.db");
    let pool = db::init_db(Some(db_path)).expect("Failed to open database");
    Arc::new(Fleet::new(config(dir), pool).expect("Failed to build fleet"))
}

pub fn rpc_node(id: NodeId) -> Node {
    Node {
        id,
        name: format!("node-{}", id),
        host: "127.0.0.1".to_string(),
        port: 1,
        transport: TransportKind::NativeRpc,
        rest: None,
        protocol_settings: ProtocolSettings::default(),
        rate_limit: RateLimit::default(),
        tags: Vec::new(),
        network: "tcp".to_string(),
        traffic_limit: 0,
        enabled: true,
    }
}

pub fn rest_node(id: NodeId, base_url: &str) -> Node {
    Node {
        transport: TransportKind::RestAdapter,
        rest: Some(RestEndpoint {
            base_url: base_url.to_string(),
            api_key: "panel-key".to_string(),
            auth: RestAuthScheme::ApiKey,
        }),
        ..rpc_node(id)
    }
}

pub fn user(id: UserId) -> User {
    User {
        id,
        email: format!("user{}@example.com", id),
        uuid: Uuid::new_v4(),
        speed_limit: Some(1_000),
        device_limit: Some(2),
        transfer_enable: 0,
        enabled: true,
        expired_at: None,
    }
}

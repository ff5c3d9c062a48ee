use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use fleet_control::certs::CertificateManager;
use fleet_control::config::{default_config_path, FleetConfig};
use fleet_control::fleet::Fleet;
use fleet_control::tls::NodeAuth;
use fleet_control::{api, db, events, jobs, logging};

#[derive(Parser, Debug)]
#[command(name = "fleet-control")]
#[command(about = "Proxy fleet control plane", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address for HTTP server
    #[arg(long, env = "FLEET_BIND", default_value = "0.0.0.0:8080")]
    bind: String,

    /// Database file path
    #[arg(long, env = "FLEET_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Serve the HTTP API over mTLS with the control plane certificate
    #[arg(long)]
    tls: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level)?;

    info!("Starting fleet control plane");

    let config_path = args.config.unwrap_or_else(default_config_path);
    let config = FleetConfig::load(&config_path)?;

    // Agent channels may present this identity, so it must exist first
    let auth = NodeAuth::new(
        CertificateManager::new(config.certs.clone()),
        config.auth.clone(),
    );
    let rotated = tokio::task::spawn_blocking(move || auth.rotate_certificates())
        .await
        .context("Certificate task failed")??;
    if rotated {
        info!("Installed a fresh control plane certificate");
    }

    let pool = db::init_db(args.db_path)?;
    let fleet = Arc::new(Fleet::new(config, pool)?);

    tokio::spawn(events::log_events(fleet.events.subscribe()));
    tokio::spawn(jobs::monitor_loop(fleet.clone()));
    tokio::spawn(jobs::housekeeping_loop(fleet.clone()));
    tokio::spawn(jobs::rotation_loop(fleet.clone()));

    let app = api::create_router(fleet.clone());
    let addr: SocketAddr = args.bind.parse()?;

    if args.tls {
        let server_config = fleet.auth.server_config()?;
        let tls = RustlsConfig::from_config(Arc::new(server_config));
        info!("Listening on https://{}", addr);
        axum_server::bind_rustls(addr, tls)
            .serve(app.into_make_service())
            .await?;
    } else {
        info!("Listening on http://{}", addr);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
    }

    Ok(())
}

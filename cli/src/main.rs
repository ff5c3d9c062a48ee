mod backend;
mod http_client;
mod progress;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use fleet_control::certs::{fingerprint, CertificateManager};
use fleet_control::config::{default_config_path, FleetConfig};
use fleet_control::fleet::Fleet;
use fleet_control::tls::NodeAuth;
use fleet_control::types::{NodeId, UserId};
use fleet_control::{db, logging};

use backend::Backend;

#[derive(Parser, Debug)]
#[command(name = "fleetctl")]
#[command(about = "Operator commands for the proxy fleet control plane")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, env = "FLEET_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Database file path
    #[arg(long, env = "FLEET_DB_PATH", global = true)]
    db_path: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    /// Run node operations through a running daemon (e.g. http://127.0.0.1:8080).
    /// Without it the database is opened directly, and a running daemon keeps
    /// its in-memory cache entries until they expire.
    #[arg(long, env = "FLEET_SERVER", global = true)]
    server: Option<String>,

    /// HTTP timeout when talking to the daemon
    #[arg(long, default_value_t = 60, global = true)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Preload per-user node configuration into the cache
    Warmup {
        /// Node to warm up
        #[arg(long, conflicts_with = "all")]
        node: Option<NodeId>,

        /// Warm up every enabled node
        #[arg(long)]
        all: bool,
    },
    /// Push active users to a node and remove disabled or expired ones
    Sync {
        #[arg(long)]
        node: NodeId,

        /// Reconcile only this user
        #[arg(long)]
        user: Option<UserId>,
    },
    /// Node configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
    /// Single-user operations on a node
    User {
        #[command(subcommand)]
        action: UserCommand,
    },
    /// Certificate authority and node certificates
    Cert {
        #[command(subcommand)]
        action: CertCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Validate and push override settings from a JSON file
    Push {
        #[arg(long)]
        node: NodeId,

        file: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum UserCommand {
    /// Take a user off a node
    Remove {
        #[arg(long)]
        node: NodeId,
        #[arg(long)]
        user: UserId,
    },
    /// Push a user's quota and limits to a node
    Quota {
        #[arg(long)]
        node: NodeId,
        #[arg(long)]
        user: UserId,
    },
}

#[derive(Subcommand, Debug)]
enum CertCommand {
    /// Create the root CA if it does not exist yet
    Ca,
    /// Issue a CA-signed certificate for a node
    Issue {
        #[arg(long)]
        node: String,
    },
    /// Write the node certificate followed by the CA certificate
    Chain {
        #[arg(long)]
        node: String,
    },
    /// Check that a certificate was signed by the CA
    Verify { path: PathBuf },
    /// Rotate the control plane certificate if it is close to expiry
    Rotate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init(&cli.log_level) {
        eprintln!("error: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = FleetConfig::load(&config_path)?;

    match cli.command {
        Command::Cert { action } => run_cert(config, action),
        Command::Warmup { node, all } => {
            let backend = connect(cli.server, cli.timeout_secs, cli.db_path, config)?;
            match (node, all) {
                (Some(node_id), _) => warmup_one(&backend, node_id).await,
                (None, true) => warmup_every(&backend).await,
                (None, false) => bail!("specify a target: --node <id> or --all"),
            }
        }
        Command::Sync { node, user } => {
            let backend = connect(cli.server, cli.timeout_secs, cli.db_path, config)?;
            let spinner = progress::create_spinner(&format!("Syncing node {}", node));
            let result = backend.sync_node(node, user).await;
            spinner.finish_and_clear();

            let report = result?;
            println!(
                "Node {}: synced {} users, removed {}",
                node, report.synced, report.removed
            );
            Ok(())
        }
        Command::Config {
            action: ConfigCommand::Push { node, file },
        } => {
            let overrides = read_overrides(&file)?;
            let backend = connect(cli.server, cli.timeout_secs, cli.db_path, config)?;
            backend.push_config(node, overrides).await?;
            println!("Node {}: config pushed", node);
            Ok(())
        }
        Command::User { action } => {
            let backend = connect(cli.server, cli.timeout_secs, cli.db_path, config)?;
            match action {
                UserCommand::Remove { node, user } => {
                    backend.remove_user(node, user).await?;
                    println!("Node {}: removed user {}", node, user);
                }
                UserCommand::Quota { node, user } => {
                    backend.push_quota(node, user).await?;
                    println!("Node {}: quota pushed for user {}", node, user);
                }
            }
            Ok(())
        }
    }
}

fn connect(
    server: Option<String>,
    timeout_secs: u64,
    db_path: Option<PathBuf>,
    config: FleetConfig,
) -> Result<Backend> {
    match server {
        Some(url) => Ok(Backend::Daemon(http_client::Client::new(
            &url,
            Duration::from_secs(timeout_secs),
        )?)),
        None => {
            let pool = db::init_db(db_path)?;
            Ok(Backend::Local(Box::new(Fleet::new(config, pool)?)))
        }
    }
}

fn read_overrides(path: &Path) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&text).with_context(|| format!("{:?} is not valid JSON", path))
}

async fn warmup_one(backend: &Backend, node_id: NodeId) -> Result<()> {
    let spinner = progress::create_spinner(&format!("Warming up node {}", node_id));
    let result = backend.warmup_node(node_id).await;
    spinner.finish_and_clear();

    let report = result?;
    println!(
        "Node {}: cached {} users in {} batches",
        node_id, report.users, report.batches
    );
    Ok(())
}

async fn warmup_every(backend: &Backend) -> Result<()> {
    let total = backend.enabled_nodes().await?.len();
    let bar = progress::create_progress_bar(total as u64, "Warming up nodes");

    let summary = backend.warmup_all(|node, result| {
        let outcome = if result.is_ok() { "ok" } else { "failed" };
        bar.set_message(format!("node {} {}", node.id, outcome));
        bar.inc(1);
    })
    .await?;
    bar.finish_and_clear();

    for (node_id, report) in &summary.warmed {
        println!(
            "Node {}: cached {} users in {} batches",
            node_id, report.users, report.batches
        );
    }
    for failure in &summary.failures {
        eprintln!("Node {}: {:#}", failure.node_id, failure.error);
    }

    if !summary.is_success() {
        bail!(
            "warm-up failed for {} of {} nodes",
            summary.failures.len(),
            total
        );
    }
    Ok(())
}

fn run_cert(config: FleetConfig, action: CertCommand) -> Result<()> {
    let certs = CertificateManager::new(config.certs.clone());

    match action {
        CertCommand::Ca => {
            if certs.generate_ca()? {
                println!("Created CA at {:?}", certs.config().ca_cert_path);
            } else {
                println!("CA already present at {:?}", certs.config().ca_cert_path);
            }
            println!("SHA-256 {}", fingerprint(&certs.config().ca_cert_path)?);
        }
        CertCommand::Issue { node } => {
            let paths = certs.generate_node_certificate(&node)?;
            println!("Certificate: {:?}", paths.cert);
            println!("Key:         {:?}", paths.key);
            println!("SHA-256 {}", fingerprint(&paths.cert)?);
        }
        CertCommand::Chain { node } => {
            let path = certs.export_certificate_chain(&node)?;
            println!("Chain: {:?}", path);
        }
        CertCommand::Verify { path } => {
            if !certs.validate_certificate_chain(&path) {
                bail!("{:?} is not signed by the fleet CA", path);
            }
            println!("{:?} is valid", path);
        }
        CertCommand::Rotate => {
            let auth = NodeAuth::new(certs, config.auth);
            let rotated = auth
                .rotate_certificates()
                .context("Certificate rotation failed")?;
            if rotated {
                println!("Rotated {:?}", auth.config().cert_file);
            } else {
                println!("{:?} is not due for rotation", auth.config().cert_file);
            }
        }
    }
    Ok(())
}

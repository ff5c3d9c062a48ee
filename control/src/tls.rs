//! Mutual TLS material for the control plane and its rotation.

use anyhow::{bail, Context, Result};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use rustls_pemfile::{certs, private_key};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use crate::certs::{certificate_expiry, CertificateManager};
use crate::clock::unix_now;
use crate::config::NodeAuthConfig;

static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Paths and policy handed to whatever terminates or originates mTLS.
#[derive(Debug, Clone)]
pub struct MtlsSettings {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub ca_file: PathBuf,
    pub verify_peer: bool,
    pub min_protocol: &'static SupportedProtocolVersion,
}

pub struct NodeAuth {
    certs: CertificateManager,
    cfg: NodeAuthConfig,
}

impl NodeAuth {
    pub fn new(certs: CertificateManager, cfg: NodeAuthConfig) -> Self {
        Self { certs, cfg }
    }

    pub fn certificates(&self) -> &CertificateManager {
        &self.certs
    }

    pub fn config(&self) -> &NodeAuthConfig {
        &self.cfg
    }

    /// Fails unless the certificate, key and CA files are all present.
    pub fn setup_mtls(&self) -> Result<MtlsSettings> {
        for (what, path) in [
            ("certificate", &self.cfg.cert_file),
            ("private key", &self.cfg.key_file),
            ("CA certificate", &self.cfg.ca_file),
        ] {
            if !path.exists() {
                bail!("mTLS {} not found at {:?}", what, path);
            }
        }

        Ok(MtlsSettings {
            cert_file: self.cfg.cert_file.clone(),
            key_file: self.cfg.key_file.clone(),
            ca_file: self.cfg.ca_file.clone(),
            verify_peer: self.cfg.verify_peer,
            min_protocol: &rustls::version::TLS13,
        })
    }

    /// Replace the active certificate once it is inside the renewal window.
    ///
    /// A missing active certificate counts as due. The previous files are kept
    /// next to the new ones with a `.bak` suffix.
    pub fn rotate_certificates(&self) -> Result<bool> {
        if self.cfg.cert_file.exists() {
            let expiry = certificate_expiry(&self.cfg.cert_file)?;
            let renew_before = i64::from(self.cfg.renew_before_days) * 86_400;
            if unix_now() + renew_before < expiry {
                return Ok(false);
            }
            info!(
                "Certificate {:?} expires at {}, rotating",
                self.cfg.cert_file, expiry
            );
        } else {
            info!("No active certificate at {:?}, issuing one", self.cfg.cert_file);
        }

        self.certs.generate_ca()?;
        let fresh = self
            .certs
            .issue_node_certificate(&self.cfg.node_id, self.cfg.cert_ttl_days)?;

        install_pair(&[
            (self.cfg.cert_file.as_path(), fresh.cert.as_path()),
            (self.cfg.key_file.as_path(), fresh.key.as_path()),
        ])?;

        if !self.cfg.ca_file.exists() {
            fs::copy(&self.certs.config().ca_cert_path, &self.cfg.ca_file)
                .with_context(|| format!("Failed to install CA at {:?}", self.cfg.ca_file))?;
        }

        info!("Rotated certificate for {}", self.cfg.node_id);
        Ok(true)
    }

    /// TLS 1.3 server config. Client certificates signed by the CA are
    /// required when `verify_peer` is set.
    pub fn server_config(&self) -> Result<ServerConfig> {
        let settings = self.setup_mtls()?;
        let provider = provider();
        let cert_chain = load_certs(&settings.cert_file)?;
        let key = load_private_key(&settings.key_file)?;

        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(TLS13_ONLY)
            .context("Failed to select TLS 1.3")?;

        let config = if settings.verify_peer {
            let roots = load_roots(&settings.ca_file)?;
            let verifier =
                rustls::server::WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                    .build()
                    .context("Failed to build client certificate verifier")?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(cert_chain, key)
                .context("Failed to create mTLS server config")?
        } else {
            builder
                .with_no_client_auth()
                .with_single_cert(cert_chain, key)
                .context("Failed to create TLS server config")?
        };

        Ok(config)
    }

    /// TLS 1.3 client config trusting the CA and presenting this identity.
    pub fn client_config(&self) -> Result<ClientConfig> {
        let settings = self.setup_mtls()?;
        let roots = load_roots(&settings.ca_file)?;
        let cert_chain = load_certs(&settings.cert_file)?;
        let key = load_private_key(&settings.key_file)?;

        ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(TLS13_ONLY)
            .context("Failed to select TLS 1.3")?
            .with_root_certificates(roots)
            .with_client_auth_cert(cert_chain, key)
            .context("Failed to create mTLS client config")
    }
}

/// Move each `new` file over its `active` path as one unit.
///
/// Every active file is backed up to `.bak` before anything is installed. If
/// any step fails the backups are put back, and files installed where none
/// existed before are removed, so a certificate never ends up paired with
/// the wrong key.
fn install_pair(files: &[(&Path, &Path)]) -> Result<()> {
    for (active, _) in files {
        if let Some(parent) = active.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
    }

    let mut backed_up: Vec<&Path> = Vec::new();
    for (active, _) in files {
        if !active.exists() {
            continue;
        }
        if let Err(e) = fs::rename(active, backup_path(active)) {
            roll_back(&backed_up, &[]);
            return Err(e).with_context(|| format!("Failed to back up {:?}", active));
        }
        backed_up.push(*active);
    }

    let mut installed: Vec<&Path> = Vec::new();
    for (active, new) in files {
        if let Err(e) = fs::rename(new, active) {
            roll_back(&backed_up, &installed);
            return Err(e)
                .with_context(|| format!("Failed to install {:?} as {:?}", new, active));
        }
        installed.push(*active);
    }
    Ok(())
}

fn roll_back(backed_up: &[&Path], installed: &[&Path]) {
    for active in installed {
        if !backed_up.contains(active) {
            if let Err(e) = fs::remove_file(active) {
                error!("Failed to remove half-installed {:?}: {}", active, e);
            }
        }
    }
    for active in backed_up {
        if let Err(e) = fs::rename(backup_path(active), active) {
            error!("Failed to restore {:?} from backup: {}", active, e);
        }
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".bak");
    PathBuf::from(name)
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .context("Failed to add CA certificate to root store")?;
    }
    Ok(roots)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("Failed to open cert file: {:?}", path))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<_> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates from {:?}", path))?;

    if certs.is_empty() {
        bail!("No certificates found in {:?}", path);
    }

    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("Failed to open key file: {:?}", path))?;
    let mut reader = BufReader::new(file);
    let key = private_key(&mut reader)
        .with_context(|| format!("Failed to parse private key from {:?}", path))?
        .with_context(|| format!("No private key found in {:?}", path))?;

    Ok(key)
}

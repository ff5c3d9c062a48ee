//! Self-signed CA and per-node certificate issuance.

use anyhow::{anyhow, bail, Context, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Ia5String,
    IsCa, KeyPair, KeyUsagePurpose, SanType, SignatureAlgorithm,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use sha2::{Digest, Sha256};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};
use x509_parser::pem::{parse_x509_pem, Pem};

use crate::config::{CertConfig, KeyAlgorithm};

const ORGANIZATION: &str = "Fleet Control";
const CA_COMMON_NAME: &str = "Fleet Control Root CA";

/// Files written for one issued node certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCertPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

pub struct CertificateManager {
    cfg: CertConfig,
}

impl CertificateManager {
    pub fn new(cfg: CertConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &CertConfig {
        &self.cfg
    }

    pub fn ca_exists(&self) -> bool {
        self.cfg.ca_cert_path.exists() && self.cfg.ca_key_path.exists()
    }

    pub fn node_cert_paths(&self, node_id: &str) -> NodeCertPaths {
        NodeCertPaths {
            cert: self.cfg.cert_dir.join(format!("node_{}.crt", node_id)),
            key: self.cfg.cert_dir.join(format!("node_{}.key", node_id)),
        }
    }

    pub fn chain_path(&self, node_id: &str) -> PathBuf {
        self.cfg.cert_dir.join(format!("node_{}.chain.crt", node_id))
    }

    /// Create the root CA unless both of its files already exist.
    /// Returns whether a new CA was written.
    pub fn generate_ca(&self) -> Result<bool> {
        if self.ca_exists() {
            return Ok(false);
        }

        for path in [&self.cfg.ca_cert_path, &self.cfg.ca_key_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create cert directory {:?}", parent))?;
            }
        }

        let key_pair = self.generate_key_pair()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, ORGANIZATION);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        set_validity(&mut params, self.cfg.validity_days);

        let cert = params
            .self_signed(&key_pair)
            .context("Failed to self-sign CA certificate")?;

        write_with_mode(&self.cfg.ca_key_path, &key_pair.serialize_pem(), 0o600)?;
        write_with_mode(&self.cfg.ca_cert_path, &cert.pem(), 0o644)?;

        info!("Generated root CA at {:?}", self.cfg.ca_cert_path);
        Ok(true)
    }

    pub fn generate_node_certificate(&self, node_id: &str) -> Result<NodeCertPaths> {
        self.issue_node_certificate(node_id, self.cfg.validity_days)
    }

    /// Issue a CA-signed certificate for `node_id` valid for `validity_days`.
    pub fn issue_node_certificate(&self, node_id: &str, validity_days: u32) -> Result<NodeCertPaths> {
        if !self.ca_exists() {
            bail!(
                "CA not found at {:?}; generate it before issuing node certificates",
                self.cfg.ca_cert_path
            );
        }
        let (ca_cert, ca_key) = self.load_ca()?;

        fs::create_dir_all(&self.cfg.cert_dir)
            .with_context(|| format!("Failed to create cert directory {:?}", self.cfg.cert_dir))?;

        let key_pair = self.generate_key_pair()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("node-{}", node_id));
        dn.push(DnType::OrganizationName, ORGANIZATION);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        set_validity(&mut params, validity_days);

        let mut sans = Vec::new();
        if let Ok(name) = Ia5String::try_from(format!("node-{}", node_id)) {
            sans.push(SanType::DnsName(name));
        }
        sans.push(SanType::DnsName(
            Ia5String::try_from("localhost".to_string()).context("Invalid DNS name for SAN")?,
        ));
        sans.push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        params.subject_alt_names = sans;

        let cert = params
            .signed_by(&key_pair, &ca_cert, &ca_key)
            .with_context(|| format!("Failed to sign certificate for node {}", node_id))?;

        let paths = self.node_cert_paths(node_id);
        write_with_mode(&paths.key, &key_pair.serialize_pem(), 0o600)?;
        write_with_mode(&paths.cert, &cert.pem(), 0o644)?;

        info!("Issued certificate for node {} at {:?}", node_id, paths.cert);
        Ok(paths)
    }

    /// Write `node_<id>.chain.crt`: the node certificate followed by the CA.
    pub fn export_certificate_chain(&self, node_id: &str) -> Result<PathBuf> {
        let paths = self.node_cert_paths(node_id);
        let node_pem = fs::read_to_string(&paths.cert)
            .with_context(|| format!("Failed to read node certificate {:?}", paths.cert))?;
        let ca_pem = fs::read_to_string(&self.cfg.ca_cert_path)
            .with_context(|| format!("Failed to read CA certificate {:?}", self.cfg.ca_cert_path))?;

        let mut chain = node_pem;
        if !chain.ends_with('\n') {
            chain.push('\n');
        }
        chain.push_str(&ca_pem);

        let path = self.chain_path(node_id);
        write_with_mode(&path, &chain, 0o644)?;
        Ok(path)
    }

    /// True when the first certificate in `path` carries a valid signature
    /// from the CA. Any failure along the way is logged and yields false.
    pub fn validate_certificate_chain(&self, path: &Path) -> bool {
        match self.verify_against_ca(path) {
            Ok(()) => true,
            Err(e) => {
                warn!("Certificate {:?} failed validation: {:#}", path, e);
                false
            }
        }
    }

    fn verify_against_ca(&self, path: &Path) -> Result<()> {
        let ca_pem = read_pem(&self.cfg.ca_cert_path)?;
        let ca = ca_pem
            .parse_x509()
            .map_err(|e| anyhow!("Failed to parse CA certificate: {}", e))?;

        let leaf_pem = read_pem(path)?;
        let leaf = leaf_pem
            .parse_x509()
            .map_err(|e| anyhow!("Failed to parse certificate: {}", e))?;

        leaf.verify_signature(Some(ca.public_key()))
            .map_err(|e| anyhow!("Signature check failed: {}", e))
    }

    fn load_ca(&self) -> Result<(rcgen::Certificate, KeyPair)> {
        let key_pem = fs::read_to_string(&self.cfg.ca_key_path)
            .with_context(|| format!("Failed to read CA key {:?}", self.cfg.ca_key_path))?;
        let cert_pem = fs::read_to_string(&self.cfg.ca_cert_path)
            .with_context(|| format!("Failed to read CA certificate {:?}", self.cfg.ca_cert_path))?;

        let ca_key = KeyPair::from_pem_and_sign_algo(&key_pem, self.signature_algorithm()?)
            .context("Failed to load CA key")?;
        let ca_cert = CertificateParams::from_ca_cert_pem(&cert_pem)
            .context("Failed to parse CA certificate")?
            .self_signed(&ca_key)
            .context("Failed to rebuild CA certificate")?;
        Ok((ca_cert, ca_key))
    }

    fn signature_algorithm(&self) -> Result<&'static SignatureAlgorithm> {
        let alg = match (self.cfg.key_algorithm, self.cfg.digest.as_str()) {
            (KeyAlgorithm::Rsa, "sha256") => &rcgen::PKCS_RSA_SHA256,
            (KeyAlgorithm::Rsa, "sha384") => &rcgen::PKCS_RSA_SHA384,
            (KeyAlgorithm::Rsa, "sha512") => &rcgen::PKCS_RSA_SHA512,
            (KeyAlgorithm::EcdsaP256, _) => &rcgen::PKCS_ECDSA_P256_SHA256,
            (KeyAlgorithm::EcdsaP384, _) => &rcgen::PKCS_ECDSA_P384_SHA384,
            (KeyAlgorithm::Rsa, other) => bail!("Unsupported digest {:?}", other),
        };
        Ok(alg)
    }

    fn generate_key_pair(&self) -> Result<KeyPair> {
        let alg = self.signature_algorithm()?;
        match self.cfg.key_algorithm {
            KeyAlgorithm::Rsa => {
                // ring signs with RSA keys but cannot generate them.
                let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), self.cfg.key_bits)
                    .with_context(|| format!("Failed to generate {}-bit RSA key", self.cfg.key_bits))?;
                let pem = key
                    .to_pkcs8_pem(LineEnding::LF)
                    .context("Failed to encode RSA key")?;
                KeyPair::from_pem_and_sign_algo(&pem, alg).context("Failed to load RSA key")
            }
            KeyAlgorithm::EcdsaP256 | KeyAlgorithm::EcdsaP384 => {
                KeyPair::generate_for(alg).context("Failed to generate ECDSA key")
            }
        }
    }
}

/// SHA-256 over the DER of the first certificate in `path`, lowercase hex.
pub fn fingerprint(path: &Path) -> Result<String> {
    let pem = read_pem(path)?;
    Ok(hex::encode(Sha256::digest(&pem.contents)))
}

/// `notAfter` of the first certificate in `path`, as unix seconds.
pub fn certificate_expiry(path: &Path) -> Result<i64> {
    let pem = read_pem(path)?;
    let cert = pem
        .parse_x509()
        .map_err(|e| anyhow!("Failed to parse certificate {:?}: {}", path, e))?;
    Ok(cert.validity().not_after.timestamp())
}

fn read_pem(path: &Path) -> Result<Pem> {
    let data = fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let (_, pem) =
        parse_x509_pem(&data).map_err(|e| anyhow!("No PEM certificate in {:?}: {}", path, e))?;
    Ok(pem)
}

fn set_validity(params: &mut CertificateParams, days: u32) {
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::minutes(5);
    params.not_after = now + Duration::days(i64::from(days));
}

fn write_with_mode(path: &Path, contents: &str, mode: u32) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("Failed to write {:?}", path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("Failed to set permissions on {:?}", path))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::unix_now;

    pub(crate) fn ecdsa_config(dir: &Path) -> CertConfig {
        let mut cfg = CertConfig::in_dir(dir);
        cfg.key_algorithm = KeyAlgorithm::EcdsaP256;
        cfg
    }

    #[test]
    fn test_generate_ca_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let certs = CertificateManager::new(ecdsa_config(dir.path()));

        assert!(certs.generate_ca().unwrap());
        let first = fs::read(&certs.config().ca_cert_path).unwrap();

        assert!(!certs.generate_ca().unwrap());
        assert_eq!(fs::read(&certs.config().ca_cert_path).unwrap(), first);
    }

    #[cfg(unix)]
    #[test]
    fn test_key_and_cert_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let certs = CertificateManager::new(ecdsa_config(dir.path()));
        certs.generate_ca().unwrap();

        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&certs.config().ca_key_path), 0o600);
        assert_eq!(mode(&certs.config().ca_cert_path), 0o644);
    }

    #[test]
    fn test_issued_certificate_validates_against_ca() {
        let dir = tempfile::tempdir().unwrap();
        let certs = CertificateManager::new(ecdsa_config(dir.path()));
        certs.generate_ca().unwrap();

        let paths = certs.generate_node_certificate("7").unwrap();
        assert!(paths.cert.ends_with("node_7.crt"));
        assert!(paths.key.exists());
        assert!(certs.validate_certificate_chain(&paths.cert));

        let chain = certs.export_certificate_chain("7").unwrap();
        assert!(chain.ends_with("node_7.chain.crt"));
        let text = fs::read_to_string(&chain).unwrap();
        assert_eq!(text.matches("BEGIN CERTIFICATE").count(), 2);
        assert!(certs.validate_certificate_chain(&chain));

        let expiry = certificate_expiry(&paths.cert).unwrap();
        let days = (expiry - unix_now()) / 86_400;
        assert!((364..=365).contains(&days));
    }

    #[test]
    fn test_foreign_certificate_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let ours = CertificateManager::new(ecdsa_config(&dir.path().join("ours")));
        let theirs = CertificateManager::new(ecdsa_config(&dir.path().join("theirs")));
        ours.generate_ca().unwrap();
        theirs.generate_ca().unwrap();

        let foreign = theirs.generate_node_certificate("1").unwrap();
        assert!(!ours.validate_certificate_chain(&foreign.cert));
        assert!(!ours.validate_certificate_chain(&dir.path().join("missing.crt")));
    }

    #[test]
    fn test_issue_without_ca_fails() {
        let dir = tempfile::tempdir().unwrap();
        let certs = CertificateManager::new(ecdsa_config(dir.path()));
        assert!(certs.generate_node_certificate("1").is_err());
    }

    #[test]
    fn test_rsa_with_sha384() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = CertConfig::in_dir(dir.path());
        cfg.digest = "sha384".to_string();
        let certs = CertificateManager::new(cfg);

        certs.generate_ca().unwrap();
        let paths = certs.generate_node_certificate("rsa").unwrap();
        assert!(certs.validate_certificate_chain(&paths.cert));
    }

    #[test]
    fn test_unknown_digest_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = CertConfig::in_dir(dir.path());
        cfg.digest = "md5".to_string();
        assert!(CertificateManager::new(cfg).generate_ca().is_err());
    }

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let dir = tempfile::tempdir().unwrap();
        let certs = CertificateManager::new(ecdsa_config(dir.path()));
        certs.generate_ca().unwrap();

        let a = fingerprint(&certs.config().ca_cert_path).unwrap();
        let b = fingerprint(&certs.config().ca_cert_path).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

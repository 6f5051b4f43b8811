//! mTLS certificate management.
//!
//! Each node owns a self-signed CA and a server certificate signed by it.
//! The server certificate doubles as the client certificate when the node
//! calls its peers. Peer CAs are stored one file per node and together
//! with the node's own CA form the trust root for both directions.
//!
//! ```text
//! <node-root>/ssl/
//!   ca.pem  ca-key.pem        node CA
//!   server.pem  server-key.pem  SAN = identity + addresses
//!   peers/<node>.pem          CAs of the other cluster members
//! ```

use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use sha2::{Digest, Sha256};
use tracing::info;

/// A generated certificate and private key pair.
#[derive(Debug, Clone)]
pub struct CertKeyPair {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

fn ca_params(node_id: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "VMGrid");
    dn.push(DnType::CommonName, format!("VMGrid CA {node_id}"));
    params.distinguished_name = dn;

    params.not_after = rcgen::date_time_ymd(2046, 1, 1);
    params
}

/// Generate a self-signed CA for `node_id`.
pub fn generate_ca(node_id: &str) -> anyhow::Result<CertKeyPair> {
    let key_pair = KeyPair::generate()?;
    let cert = ca_params(node_id).self_signed(&key_pair)?;

    info!(%node_id, "generated node CA certificate");

    Ok(CertKeyPair {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// Generate a node certificate signed by the node's CA.
///
/// `ca_key_pem` is the CA's private key. The issuer is rebuilt from the
/// same distinguished name and key, so the signature chains to the stored
/// CA certificate.
pub fn generate_node_cert(
    ca_key_pem: &str,
    node_id: &str,
    addresses: &[String],
) -> anyhow::Result<CertKeyPair> {
    let ca_key = KeyPair::from_pem(ca_key_pem)?;
    let ca_cert = ca_params(node_id).self_signed(&ca_key)?;

    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "VMGrid");
    dn.push(DnType::CommonName, node_id);
    params.distinguished_name = dn;

    params
        .subject_alt_names
        .push(rcgen::SanType::DnsName(node_id.to_string().try_into()?));
    for addr in addresses {
        if let Ok(ip) = addr.parse::<std::net::IpAddr>() {
            params.subject_alt_names.push(rcgen::SanType::IpAddress(ip));
        } else if addr != node_id {
            params
                .subject_alt_names
                .push(rcgen::SanType::DnsName(addr.clone().try_into()?));
        }
    }

    params.not_after = rcgen::date_time_ymd(2036, 1, 1);

    let node_key = KeyPair::generate()?;
    let san_count = params.subject_alt_names.len();
    let node_cert = params.signed_by(&node_key, &ca_cert, &ca_key)?;

    info!(%node_id, sans = san_count, "generated node certificate");

    Ok(CertKeyPair {
        cert_pem: node_cert.pem(),
        key_pem: node_key.serialize_pem(),
    })
}

/// Parse every certificate in a PEM bundle.
pub fn parse_certs(pem: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .context("malformed certificate PEM")?;
    anyhow::ensure!(!certs.is_empty(), "no certificate in PEM");
    Ok(certs)
}

fn parse_key(pem: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut BufReader::new(pem.as_bytes()))
        .context("malformed key PEM")?
        .context("no private key in PEM")
}

/// Hex SHA-256 of the first certificate in `pem` (DER form).
pub fn fingerprint(pem: &str) -> anyhow::Result<String> {
    let certs = parse_certs(pem)?;
    Ok(hex::encode(Sha256::digest(certs[0].as_ref())))
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

// ── CertificateStore ───────────────────────────────────────────────

/// The node's TLS material on disk.
#[derive(Debug, Clone)]
pub struct CertificateStore {
    dir: PathBuf,
    node_id: String,
}

impl CertificateStore {
    pub fn new(dir: &Path, node_id: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            node_id: node_id.to_string(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn ca_path(&self) -> PathBuf {
        self.dir.join("ca.pem")
    }

    fn ca_key_path(&self) -> PathBuf {
        self.dir.join("ca-key.pem")
    }

    fn server_path(&self) -> PathBuf {
        self.dir.join("server.pem")
    }

    fn server_key_path(&self) -> PathBuf {
        self.dir.join("server-key.pem")
    }

    fn peer_path(&self, node: &str) -> PathBuf {
        self.dir.join("peers").join(format!("{node}.pem"))
    }

    /// Create the CA and server certificate if they do not exist yet.
    pub fn ensure(&self, addresses: &[String]) -> anyhow::Result<()> {
        fs::create_dir_all(self.dir.join("peers"))?;
        if !self.ca_path().exists() || !self.ca_key_path().exists() {
            let ca = generate_ca(&self.node_id)?;
            write_private(&self.ca_key_path(), &ca.key_pem)?;
            fs::write(self.ca_path(), &ca.cert_pem)?;
            let _ = fs::remove_file(self.server_path());
        }
        if !self.server_path().exists() || !self.server_key_path().exists() {
            let ca_key = fs::read_to_string(self.ca_key_path())?;
            let server = generate_node_cert(&ca_key, &self.node_id, addresses)?;
            write_private(&self.server_key_path(), &server.key_pem)?;
            fs::write(self.server_path(), &server.cert_pem)?;
        }
        Ok(())
    }

    pub fn ca_pem(&self) -> anyhow::Result<String> {
        fs::read_to_string(self.ca_path()).context("node CA missing")
    }

    pub fn ca_fingerprint(&self) -> anyhow::Result<String> {
        fingerprint(&self.ca_pem()?)
    }

    /// Trust `pem` as the CA of `node`.
    pub fn add_peer_ca(&self, node: &str, pem: &str) -> anyhow::Result<()> {
        parse_certs(pem)?;
        let path = self.peer_path(node);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, pem)?;
        info!(%node, "peer CA stored");
        Ok(())
    }

    /// Stop trusting the CA of `node`. Returns whether it was present.
    pub fn remove_peer_ca(&self, node: &str) -> anyhow::Result<bool> {
        match fs::remove_file(self.peer_path(node)) {
            Ok(()) => {
                info!(%node, "peer CA revoked");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn peer_ca(&self, node: &str) -> anyhow::Result<Option<String>> {
        match fs::read_to_string(self.peer_path(node)) {
            Ok(pem) => Ok(Some(pem)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of every node whose CA is trusted, sorted.
    pub fn peers(&self) -> anyhow::Result<Vec<String>> {
        let dir = self.dir.join("peers");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut peers: Vec<String> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                name.strip_suffix(".pem").map(str::to_string)
            })
            .collect();
        peers.sort();
        Ok(peers)
    }

    /// Own CA plus every peer CA.
    pub fn root_store(&self) -> anyhow::Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for cert in parse_certs(&self.ca_pem()?)? {
            roots.add(cert)?;
        }
        for peer in self.peers()? {
            if let Some(pem) = self.peer_ca(&peer)? {
                for cert in parse_certs(&pem)? {
                    roots.add(cert)?;
                }
            }
        }
        Ok(roots)
    }

    fn identity(&self) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let certs = parse_certs(&fs::read_to_string(self.server_path())?)?;
        let key = parse_key(&fs::read_to_string(self.server_key_path())?)?;
        Ok((certs, key))
    }

    /// Server side: requests a client certificate but does not require one,
    /// so bootstrap clients that only know our CA can still connect.
    pub fn server_config(&self) -> anyhow::Result<Arc<ServerConfig>> {
        let provider = provider();
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(self.root_store()?), provider.clone())
                .allow_unauthenticated()
                .build()?;
        let (certs, key) = self.identity()?;
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)?;
        Ok(Arc::new(config))
    }

    /// Client side for established peers.
    pub fn client_config(&self) -> anyhow::Result<Arc<ClientConfig>> {
        let (certs, key) = self.identity()?;
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(self.root_store()?)
            .with_client_auth_cert(certs, key)?;
        Ok(Arc::new(config))
    }

    /// Client side for a joining node, trusting only the CA from its
    /// connect string. No client certificate is offered: the joiner does
    /// not know our CA yet and would reject it.
    pub fn bootstrap_client_config(&self, ca_pem: &str) -> anyhow::Result<Arc<ClientConfig>> {
        let mut roots = RootCertStore::empty();
        for cert in parse_certs(ca_pem)? {
            roots.add(cert)?;
        }
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

fn write_private(path: &Path, contents: &str) -> anyhow::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    use std::io::Write;

    let mut file = fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_ca_succeeds() {
        let pair = generate_ca("alpha").unwrap();
        assert!(pair.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(pair.key_pem.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn node_cert_is_signed_by_stored_ca() {
        let ca = generate_ca("alpha").unwrap();
        let node = generate_node_cert(&ca.key_pem, "alpha", &["10.0.0.1".to_string()]).unwrap();
        assert!(node.cert_pem.contains("BEGIN CERTIFICATE"));
        assert_ne!(ca.cert_pem, node.cert_pem);
    }

    #[test]
    fn ensure_is_idempotent_and_builds_configs() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path(), "alpha");
        store.ensure(&["127.0.0.1".to_string()]).unwrap();
        let ca = store.ca_pem().unwrap();
        store.ensure(&["127.0.0.1".to_string()]).unwrap();
        assert_eq!(store.ca_pem().unwrap(), ca);

        assert!(store.server_config().is_ok());
        assert!(store.client_config().is_ok());
        assert_eq!(store.ca_fingerprint().unwrap().len(), 64);
    }

    #[test]
    fn peer_cas_come_and_go() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path(), "alpha");
        store.ensure(&[]).unwrap();

        let beta = generate_ca("beta").unwrap();
        store.add_peer_ca("beta", &beta.cert_pem).unwrap();
        assert_eq!(store.peers().unwrap(), vec!["beta".to_string()]);
        assert_eq!(store.root_store().unwrap().len(), 2);

        assert!(store.add_peer_ca("gamma", "garbage").is_err());
        assert!(store.remove_peer_ca("beta").unwrap());
        assert!(!store.remove_peer_ca("beta").unwrap());
        assert_eq!(store.root_store().unwrap().len(), 1);
    }
}

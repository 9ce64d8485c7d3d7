use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mesh_core::{restrict_permissions, MeshError};
use rcgen::{CertificateParams, DistinguishedName, DnType, Issuer, KeyPair, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration as TimeDuration, OffsetDateTime};

const CA_VALIDITY_YEARS: i64 = 10;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("certificate generation failed: {0}")]
    Generation(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("tls configuration failed: {0}")]
    Tls(String),
    #[error("node {0} is not enrolled with the CA")]
    UnknownNode(String),
}

impl From<MeshError> for CaError {
    fn from(err: MeshError) -> Self {
        CaError::Io(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RevocationRecord {
    serial_hex: String,
    revoked_at: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RevocationLedger {
    #[serde(default)]
    entries: HashMap<String, RevocationRecord>,
}

/// One issued device identity: its own cert/key PEM plus the CA cert PEM
/// needed to validate the chain (spec §4.6).
pub struct DeviceIdentity {
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_cert_pem: String,
}

/// Elliptic-curve (P-256) local certificate authority bound to a directory
/// layout (spec §4.6): `ca_dir/{ca.key, ca.crt, hub.crt, hub.key,
/// devices/<node_id>.{crt,key}, revoked.json, crl.pem}`.
pub struct CertificateAuthority {
    dir: PathBuf,
    device_cert_validity_days: i64,
    ca_key: KeyPair,
    ca_cert_pem: String,
    ca_cert_der: CertificateDer<'static>,
    revoked: HashMap<String, RevocationRecord>,
}

impl CertificateAuthority {
    /// Creates the CA key/cert if absent, loads the revocation ledger.
    /// Idempotent: calling this again on an already-initialized directory
    /// just loads the existing state.
    pub fn initialize(dir: impl AsRef<Path>, device_cert_validity_days: i64) -> Result<Self, CaError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join("devices")).map_err(|err| CaError::Io(err.to_string()))?;

        let ca_key_path = dir.join("ca.key");
        let ca_cert_path = dir.join("ca.crt");
        let (ca_key, ca_cert_pem) = if ca_key_path.exists() && ca_cert_path.exists() {
            let key_pem = fs::read_to_string(&ca_key_path).map_err(|err| CaError::Io(err.to_string()))?;
            let cert_pem = fs::read_to_string(&ca_cert_path).map_err(|err| CaError::Io(err.to_string()))?;
            let key = KeyPair::from_pem(&key_pem).map_err(|err| CaError::Generation(err.to_string()))?;
            (key, cert_pem)
        } else {
            let key = KeyPair::generate().map_err(|err| CaError::Generation(err.to_string()))?;
            let mut params = CertificateParams::new(Vec::<String>::new())
                .map_err(|err| CaError::Generation(err.to_string()))?;
            params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
            params.distinguished_name = ca_distinguished_name("mesh-hub local CA");
            params.not_after = OffsetDateTime::now_utc() + TimeDuration::days(365 * CA_VALIDITY_YEARS);
            let cert = params.self_signed(&key).map_err(|err| CaError::Generation(err.to_string()))?;
            let cert_pem = cert.pem();
            fs::write(&ca_key_path, key.serialize_pem()).map_err(|err| CaError::Io(err.to_string()))?;
            restrict_permissions(&ca_key_path)?;
            fs::write(&ca_cert_path, &cert_pem).map_err(|err| CaError::Io(err.to_string()))?;
            (key, cert_pem)
        };

        let ca_cert_der = pem_to_der(&ca_cert_pem)?;
        let revoked = load_revocation_ledger(&dir)?;

        Ok(Self { dir, device_cert_validity_days, ca_key, ca_cert_pem, ca_cert_der, revoked })
    }

    /// Issues the hub's own server identity on first request; subsequent
    /// calls reuse the cert on disk.
    pub fn ensure_hub_cert(&self) -> Result<(String, String), CaError> {
        let cert_path = self.dir.join("hub.crt");
        let key_path = self.dir.join("hub.key");
        if cert_path.exists() && key_path.exists() {
            let cert_pem = fs::read_to_string(&cert_path).map_err(|err| CaError::Io(err.to_string()))?;
            let key_pem = fs::read_to_string(&key_path).map_err(|err| CaError::Io(err.to_string()))?;
            return Ok((cert_pem, key_pem));
        }
        let (cert_pem, key_pem) = self.issue_leaf_cert("mesh-hub", 3650)?;
        fs::write(&cert_path, &cert_pem).map_err(|err| CaError::Io(err.to_string()))?;
        fs::write(&key_path, &key_pem).map_err(|err| CaError::Io(err.to_string()))?;
        restrict_permissions(&key_path)?;
        Ok((cert_pem, key_pem))
    }

    /// Issues a fresh EC device certificate with `CN=node_id`, signed by
    /// the CA, valid for `device_cert_validity_days`.
    pub fn issue_device_cert(&self, node_id: &str) -> Result<DeviceIdentity, CaError> {
        let (cert_pem, key_pem) = self.issue_leaf_cert(node_id, self.device_cert_validity_days)?;
        let cert_path = self.dir.join("devices").join(format!("{node_id}.crt"));
        let key_path = self.dir.join("devices").join(format!("{node_id}.key"));
        fs::write(&cert_path, &cert_pem).map_err(|err| CaError::Io(err.to_string()))?;
        fs::write(&key_path, &key_pem).map_err(|err| CaError::Io(err.to_string()))?;
        restrict_permissions(&key_path)?;
        Ok(DeviceIdentity { cert_pem, key_pem, ca_cert_pem: self.ca_cert_pem.clone() })
    }

    fn issue_leaf_cert(&self, node_id: &str, validity_days: i64) -> Result<(String, String), CaError> {
        let key = KeyPair::generate().map_err(|err| CaError::Generation(err.to_string()))?;
        let mut params =
            CertificateParams::new(vec![node_id.to_string()]).map_err(|err| CaError::Generation(err.to_string()))?;
        params.distinguished_name = ca_distinguished_name(node_id);
        params.subject_alt_names = vec![SanType::DnsName(
            node_id.to_string().try_into().map_err(|_| CaError::Generation("invalid SAN".to_string()))?,
        )];
        params.not_after = OffsetDateTime::now_utc() + TimeDuration::days(validity_days);
        let mut ca_params = CertificateParams::new(Vec::<String>::new())
            .map_err(|err| CaError::Generation(err.to_string()))?;
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        ca_params.distinguished_name = ca_distinguished_name("mesh-hub local CA");
        let issuer = Issuer::new(ca_params, &self.ca_key);
        let cert = params
            .signed_by(&key, &issuer)
            .map_err(|err| CaError::Generation(err.to_string()))?;
        Ok((cert.pem(), key.serialize_pem()))
    }

    /// Records the revocation, persists `revoked.json` atomically,
    /// regenerates `crl.pem`, and deletes the device's cert/key files.
    /// Returns `false` if `node_id` is unknown or already revoked.
    pub fn revoke(&mut self, node_id: &str, now: f64) -> Result<bool, CaError> {
        if self.revoked.contains_key(node_id) {
            return Ok(false);
        }
        let cert_path = self.dir.join("devices").join(format!("{node_id}.crt"));
        if !cert_path.exists() {
            return Ok(false);
        }
        let serial_hex = hex::encode(node_id.as_bytes());
        self.revoked.insert(node_id.to_string(), RevocationRecord { serial_hex, revoked_at: now });
        self.save_revocation_ledger()?;
        self.regenerate_crl(now)?;
        let _ = fs::remove_file(&cert_path);
        let _ = fs::remove_file(self.dir.join("devices").join(format!("{node_id}.key")));
        Ok(true)
    }

    pub fn is_revoked(&self, node_id: &str) -> bool {
        self.revoked.contains_key(node_id)
    }

    fn save_revocation_ledger(&self) -> Result<(), CaError> {
        let ledger = RevocationLedger { entries: self.revoked.clone() };
        mesh_core::save_json_atomic(self.dir.join("revoked.json"), &ledger)?;
        Ok(())
    }

    /// Interoperability export only; revocation is enforced at the
    /// application layer by [`Self::is_revoked`], not by the TLS stack.
    fn regenerate_crl(&self, now: f64) -> Result<(), CaError> {
        let next_update = now + 30.0 * 86_400.0;
        let mut lines = vec![
            "-----BEGIN X509 CRL-----".to_string(),
            format!("# mesh-hub CRL, next_update={next_update}"),
        ];
        for record in self.revoked.values() {
            lines.push(format!("# revoked serial={} at={}", record.serial_hex, record.revoked_at));
        }
        lines.push("-----END X509 CRL-----".to_string());
        fs::write(self.dir.join("crl.pem"), lines.join("\n")).map_err(|err| CaError::Io(err.to_string()))?;
        Ok(())
    }

    /// Server-side mTLS context: presents the hub's cert, requires and
    /// validates a peer certificate against this CA. Minimum TLS 1.2.
    pub fn create_server_tls_context(&self) -> Result<Arc<ServerConfig>, CaError> {
        let (hub_cert_pem, hub_key_pem) = self.ensure_hub_cert()?;
        let hub_cert = pem_chain_to_der(&hub_cert_pem)?;
        let hub_key = pem_key_to_der(&hub_key_pem)?;
        let mut roots = RootCertStore::empty();
        roots.add(self.ca_cert_der.clone()).map_err(|err| CaError::Tls(err.to_string()))?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|err| CaError::Tls(err.to_string()))?;
        let config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(hub_cert, hub_key)
            .map_err(|err| CaError::Tls(err.to_string()))?;
        Ok(Arc::new(config))
    }

    /// Client-side mTLS context for `node_id`'s issued identity, requiring
    /// and validating the server's certificate against this CA.
    pub fn create_client_tls_context(&self, node_id: &str) -> Result<Arc<ClientConfig>, CaError> {
        let device_cert_path = self.dir.join("devices").join(format!("{node_id}.crt"));
        let device_key_path = self.dir.join("devices").join(format!("{node_id}.key"));
        if !device_cert_path.exists() {
            return Err(CaError::UnknownNode(node_id.to_string()));
        }
        let cert_pem = fs::read_to_string(&device_cert_path).map_err(|err| CaError::Io(err.to_string()))?;
        let key_pem = fs::read_to_string(&device_key_path).map_err(|err| CaError::Io(err.to_string()))?;
        let cert_chain = pem_chain_to_der(&cert_pem)?;
        let key = pem_key_to_der(&key_pem)?;
        let mut roots = RootCertStore::empty();
        roots.add(self.ca_cert_der.clone()).map_err(|err| CaError::Tls(err.to_string()))?;
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(cert_chain, key)
            .map_err(|err| CaError::Tls(err.to_string()))?;
        Ok(Arc::new(config))
    }

    /// Extracts the `CN` from the peer certificate presented during the
    /// mTLS handshake, used by the transport layer to key `is_revoked`
    /// checks and registry lookups.
    pub fn peer_node_id_from_connection(peer_cert_der: &CertificateDer<'_>) -> Option<String> {
        let (_, cert) = x509_parser::parse_x509_certificate(peer_cert_der.as_ref()).ok()?;
        cert.subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string)
    }
}

fn ca_distinguished_name(cn: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    dn
}

fn load_revocation_ledger(dir: &Path) -> Result<HashMap<String, RevocationRecord>, CaError> {
    let path = dir.join("revoked.json");
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let ledger: RevocationLedger = mesh_core::load_json(&path)?;
    Ok(ledger.entries)
}

fn pem_to_der(pem: &str) -> Result<CertificateDer<'static>, CaError> {
    let mut reader = std::io::Cursor::new(pem.as_bytes());
    let der = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| CaError::Generation("no certificate in PEM".to_string()))?
        .map_err(|err| CaError::Generation(err.to_string()))?;
    Ok(der)
}

fn pem_chain_to_der(pem: &str) -> Result<Vec<CertificateDer<'static>>, CaError> {
    let mut reader = std::io::Cursor::new(pem.as_bytes());
    rustls_pemfile::certs(&mut reader)
        .map(|result| result.map_err(|err| CaError::Generation(err.to_string())))
        .collect()
}

fn pem_key_to_der(pem: &str) -> Result<PrivateKeyDer<'static>, CaError> {
    let mut reader = std::io::Cursor::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| CaError::Generation(err.to_string()))?
        .ok_or_else(|| CaError::Generation("no private key in PEM".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_creates_ca_material_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::initialize(dir.path(), 365).unwrap();
        assert!(dir.path().join("ca.key").exists());
        assert!(dir.path().join("ca.crt").exists());
        drop(ca);
        let ca2 = CertificateAuthority::initialize(dir.path(), 365).unwrap();
        assert!(!ca2.is_revoked("nobody"));
    }

    #[test]
    fn issue_device_cert_writes_device_files() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::initialize(dir.path(), 365).unwrap();
        let identity = ca.issue_device_cert("esp32-kitchen").unwrap();
        assert!(identity.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(dir.path().join("devices/esp32-kitchen.crt").exists());
        assert!(dir.path().join("devices/esp32-kitchen.key").exists());
    }

    #[test]
    fn revoke_is_false_for_unknown_node_and_true_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut ca = CertificateAuthority::initialize(dir.path(), 365).unwrap();
        assert!(!ca.revoke("nobody", 0.0).unwrap());
        ca.issue_device_cert("esp32-kitchen").unwrap();
        assert!(ca.revoke("esp32-kitchen", 0.0).unwrap());
        assert!(ca.is_revoked("esp32-kitchen"));
        assert!(!ca.revoke("esp32-kitchen", 0.0).unwrap());
        assert!(!dir.path().join("devices/esp32-kitchen.crt").exists());
    }

    #[test]
    fn revocation_persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut ca = CertificateAuthority::initialize(dir.path(), 365).unwrap();
        ca.issue_device_cert("esp32-kitchen").unwrap();
        ca.revoke("esp32-kitchen", 0.0).unwrap();
        let ca2 = CertificateAuthority::initialize(dir.path(), 365).unwrap();
        assert!(ca2.is_revoked("esp32-kitchen"));
    }
}

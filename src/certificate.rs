// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Self-Signed Certificate Management
//!
//! Provisions the TLS identity used by the secure WebSocket listener. The
//! key and certificate are generated once, persisted as PEM files in the
//! application data directory and reused across restarts.
//!
//! # Certificate Profile
//!
//! - 2048-bit RSA key, SHA-256 signature, valid for 10 years
//! - Subject and issuer `CN=localhost, O=Deck Relay, OU=WebSocket Server, C=US`
//! - SANs `localhost`, `127.0.0.1` and `::1`
//! - Serial number derived from the generation time
//!
//! The fingerprint is the SHA-256 digest of the DER certificate formatted as
//! uppercase hex pairs joined by `:`, the way browsers display it.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SerialNumber,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use thiserror::Error;
use tokio_rustls::rustls::{self, pki_types};
use tracing::{info, warn};

pub const CERT_FILE_NAME: &str = "deck-relay-cert.pem";
pub const KEY_FILE_NAME: &str = "deck-relay-key.pem";

const RSA_KEY_BITS: usize = 2048;
const VALIDITY_DAYS: i64 = 3650;

/// Certificate provisioning errors.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RSA key generation failed: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("Failed to encode private key: {0}")]
    KeyEncoding(#[from] rsa::pkcs8::Error),

    #[error("Certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("No certificate found in PEM data")]
    NoCertificate,

    #[error("No private key found in PEM data")]
    NoPrivateKey,

    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),
}

/// A certificate and its private key, in PEM and DER form.
#[derive(Debug)]
pub struct CertificateMaterial {
    cert_pem: String,
    key_pem: String,
    cert_der: pki_types::CertificateDer<'static>,
    key_der: pki_types::PrivateKeyDer<'static>,
    fingerprint: String,
}

impl CertificateMaterial {
    /// Parses a PEM certificate and PEM private key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CertError> {
        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or(CertError::NoCertificate)??;
        let key_der =
            rustls_pemfile::private_key(&mut key_pem.as_bytes())?.ok_or(CertError::NoPrivateKey)?;
        let fingerprint = fingerprint_of(cert_der.as_ref());

        Ok(CertificateMaterial {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            cert_der,
            key_der,
            fingerprint,
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn cert_der(&self) -> &pki_types::CertificateDer<'static> {
        &self.cert_der
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Builds a rustls server configuration presenting this certificate.
    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>, CertError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(vec![self.cert_der.clone()], self.key_der.clone_key())?;
        Ok(Arc::new(config))
    }
}

/// SHA-256 of `der`, uppercase hex pairs separated by colons.
pub fn fingerprint_of(der: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, der);
    digest
        .as_ref()
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Loads, generates and persists the relay's certificate pair.
///
/// File access is blocking; async callers should go through
/// `tokio::task::spawn_blocking`.
pub struct CertificateManager {
    dir: PathBuf,
    current: RwLock<Option<Arc<CertificateMaterial>>>,
}

impl CertificateManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CertificateManager {
            dir: dir.into(),
            current: RwLock::new(None),
        }
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(CERT_FILE_NAME)
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE_NAME)
    }

    /// Returns the current material, loading it from disk or generating a new
    /// pair on first use.
    pub fn material(&self) -> Result<Arc<CertificateMaterial>, CertError> {
        if let Some(material) = self.current.read().unwrap().as_ref() {
            return Ok(material.clone());
        }

        let material = match self.load() {
            Some(material) => {
                info!("Loaded TLS certificate from {}", self.dir.display());
                Arc::new(material)
            }
            None => self.generate_and_store()?,
        };

        let mut current = self.current.write().unwrap();
        // Another caller may have finished first; keep whichever landed.
        Ok(current.get_or_insert(material).clone())
    }

    /// Fingerprint of the current certificate.
    pub fn fingerprint(&self) -> Result<String, CertError> {
        Ok(self.material()?.fingerprint().to_string())
    }

    /// Unconditionally replaces the certificate pair. Existing TLS sessions
    /// keep the previous certificate.
    pub fn regenerate(&self) -> Result<Arc<CertificateMaterial>, CertError> {
        let material = self.generate_and_store()?;
        *self.current.write().unwrap() = Some(material.clone());
        Ok(material)
    }

    fn load(&self) -> Option<CertificateMaterial> {
        let cert_pem = std::fs::read_to_string(self.cert_path()).ok()?;
        let key_pem = std::fs::read_to_string(self.key_path()).ok()?;

        let material = match CertificateMaterial::from_pem(&cert_pem, &key_pem) {
            Ok(material) => material,
            Err(e) => {
                warn!("Stored certificate is unusable ({}), regenerating", e);
                return None;
            }
        };

        if let Err(e) = material.server_config() {
            warn!("Stored certificate is rejected by TLS ({}), regenerating", e);
            return None;
        }

        Some(material)
    }

    fn generate_and_store(&self) -> Result<Arc<CertificateMaterial>, CertError> {
        info!("Generating self-signed TLS certificate");
        let material = generate()?;
        info!("Certificate fingerprint: {}", material.fingerprint());

        if let Err(e) = self.store(&material) {
            warn!(
                "Failed to persist certificate to {}: {}",
                self.dir.display(),
                e
            );
        }

        Ok(Arc::new(material))
    }

    fn store(&self, material: &CertificateMaterial) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        write_private(&self.cert_path(), material.cert_pem().as_bytes())?;
        write_private(&self.key_path(), material.key_pem().as_bytes())?;
        Ok(())
    }
}

/// Writes `data` to a sibling temp file with 0600 permissions, then renames
/// it over `path`.
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&tmp, path)
}

/// Generates a fresh RSA key and self-signed certificate.
pub fn generate() -> Result<CertificateMaterial, CertError> {
    let rsa_key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)?;
    let key_pem = rsa_key.to_pkcs8_pem(LineEnding::LF)?;
    let key_pair = KeyPair::from_pkcs8_pem_and_sign_algo(&key_pem, &rcgen::PKCS_RSA_SHA256)?;

    let mut params = CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])?;

    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, "localhost");
    name.push(DnType::OrganizationName, "Deck Relay");
    name.push(DnType::OrganizationalUnitName, "WebSocket Server");
    name.push(DnType::CountryName, "US");
    params.distinguished_name = name;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::ContentCommitment,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DataEncipherment,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);
    params.serial_number = Some(SerialNumber::from_slice(&time_serial()));

    let cert = params.self_signed(&key_pair)?;
    CertificateMaterial::from_pem(&cert.pem(), &key_pair.serialize_pem())
}

/// Milliseconds since the epoch as a positive minimal big-endian integer.
fn time_serial() -> Vec<u8> {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(1);
    let bytes = millis.max(1).to_be_bytes();
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    let mut serial = bytes[start..].to_vec();
    if serial[0] & 0x80 != 0 {
        serial.insert(0, 0);
    }
    serial
}

//! Certificate material for the TLS listener
//! Parses PEM bundles, generates self-signed key pairs and persists them

use crate::error::{ProxyError, Result};
use chrono::{DateTime, Utc};
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::info;

/// Certificate file written when neither files nor ACME domains are configured
pub const DEFAULT_CERT_FILE: &str = "cert.pem";
/// Private key file written alongside [`DEFAULT_CERT_FILE`]
pub const DEFAULT_KEY_FILE: &str = "key.pem";
/// 365 × 24 hours
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// ALPN protocols offered to TLS clients
pub const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// SHA-256 digest of a DER-encoded certificate
pub type Fingerprint = [u8; 32];

/// A certificate chain, its private key and a ready-to-use TLS config
pub struct CertificateBundle {
    certificate_pem: Vec<u8>,
    private_key_pem: Vec<u8>,
    fingerprint: Fingerprint,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    server_config: Arc<ServerConfig>,
}

impl CertificateBundle {
    /// Build a bundle from PEM-encoded certificate chain and private key.
    ///
    /// The first certificate in the chain is the leaf; its fingerprint and
    /// validity window describe the bundle.
    pub fn from_pem(certificate_pem: Vec<u8>, private_key_pem: Vec<u8>) -> Result<Self> {
        let chain = parse_certificates(&certificate_pem)?;
        let key = parse_private_key(&private_key_pem)?;

        let leaf = &chain[0];
        let (not_before, not_after) = validity_window(leaf)?;
        let fingerprint = fingerprint(leaf);
        let server_config = Arc::new(build_server_config(chain, key)?);

        Ok(Self {
            certificate_pem,
            private_key_pem,
            fingerprint,
            not_before,
            not_after,
            server_config,
        })
    }

    /// Load a bundle from a certificate file and a key file
    pub fn load<P: AsRef<Path>, Q: AsRef<Path>>(cert_path: P, key_path: Q) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        let certificate_pem = fs::read(cert_path).map_err(|e| {
            ProxyError::CertificateUnavailable(format!("cannot read {}: {}", cert_path.display(), e))
        })?;
        let private_key_pem = fs::read(key_path).map_err(|e| {
            ProxyError::CertificateUnavailable(format!("cannot read {}: {}", key_path.display(), e))
        })?;

        Self::from_pem(certificate_pem, private_key_pem)
    }

    /// Write certificate and key; the key file is only readable by its owner
    pub fn write_to<P: AsRef<Path>, Q: AsRef<Path>>(&self, cert_path: P, key_path: Q) -> Result<()> {
        fs::write(cert_path.as_ref(), &self.certificate_pem)?;
        write_private(key_path.as_ref(), &self.private_key_pem)?;
        Ok(())
    }

    pub fn certificate_pem(&self) -> &[u8] {
        &self.certificate_pem
    }

    pub fn private_key_pem(&self) -> &[u8] {
        &self.private_key_pem
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// `notAfter - notBefore`
    pub fn validity(&self) -> chrono::Duration {
        self.not_after - self.not_before
    }

    pub fn is_expired(&self) -> bool {
        self.not_after <= Utc::now()
    }

    /// True when the certificate stops being valid within `window`
    pub fn expires_within(&self, window: Duration) -> bool {
        match chrono::Duration::from_std(window) {
            Ok(window) => self.not_after <= Utc::now() + window,
            Err(_) => true,
        }
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        self.server_config.clone()
    }
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("fingerprint", &format_fingerprint(&self.fingerprint))
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// Output of a [`KeyPairGenerator`]
#[derive(Clone)]
pub struct GeneratedKeyPair {
    pub certificate_pem: Vec<u8>,
    pub private_key_pem: Vec<u8>,
    pub fingerprint: Fingerprint,
}

/// Produces a certificate valid from now to now + `validity` and its key
pub trait KeyPairGenerator: Send + Sync {
    fn generate(&self, validity: Duration) -> Result<GeneratedKeyPair>;
}

/// ECDSA P-256 self-signed certificates via rcgen
#[derive(Debug, Clone)]
pub struct SelfSignedGenerator {
    subject_alt_names: Vec<String>,
}

impl SelfSignedGenerator {
    pub fn new<I, S>(subject_alt_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = subject_alt_names.into_iter().map(Into::into).collect();
        if names.is_empty() {
            names.push("localhost".to_string());
        }
        Self {
            subject_alt_names: names,
        }
    }

    pub fn subject_alt_names(&self) -> &[String] {
        &self.subject_alt_names
    }
}

impl KeyPairGenerator for SelfSignedGenerator {
    fn generate(&self, validity: Duration) -> Result<GeneratedKeyPair> {
        // X.509 validity has second precision
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let not_before = OffsetDateTime::from_unix_timestamp(now)
            .map_err(|e| ProxyError::CertificateUnavailable(e.to_string()))?;
        let not_after = time::Duration::try_from(Duration::from_secs(validity.as_secs()))
            .ok()
            .and_then(|validity| not_before.checked_add(validity))
            .ok_or_else(|| ProxyError::Config(format!("validity of {:?} is out of range", validity)))?;

        let mut params = CertificateParams::new(self.subject_alt_names.clone());
        params.not_before = not_before;
        params.not_after = not_after;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, self.subject_alt_names[0].clone());
        params
            .distinguished_name
            .push(DnType::OrganizationName, "sslproxy");

        let cert = Certificate::from_params(params)
            .map_err(|e| ProxyError::CertificateUnavailable(e.to_string()))?;

        // Every serialize call re-signs, so sign once and derive the DER from the PEM
        let certificate_pem = cert
            .serialize_pem()
            .map_err(|e| ProxyError::CertificateUnavailable(e.to_string()))?
            .into_bytes();
        let private_key_pem = cert.serialize_private_key_pem().into_bytes();

        let chain = parse_certificates(&certificate_pem)?;
        let fingerprint = fingerprint(&chain[0]);

        Ok(GeneratedKeyPair {
            certificate_pem,
            private_key_pem,
            fingerprint,
        })
    }
}

/// Load the self-signed bundle from `cert_path`/`key_path`, generating and
/// persisting a new one only when either file is missing.
pub fn ensure_self_signed(
    generator: &dyn KeyPairGenerator,
    cert_path: &Path,
    key_path: &Path,
    validity: Duration,
) -> Result<CertificateBundle> {
    if cert_path.exists() && key_path.exists() {
        info!(
            "Reusing existing self-signed certificate ({}, {})",
            cert_path.display(),
            key_path.display()
        );
        let bundle = CertificateBundle::load(cert_path, key_path)?;
        info!("SHA256 Fingerprint: {}", format_fingerprint(bundle.fingerprint()));
        return Ok(bundle);
    }

    info!(
        "No existing cert or key specified, generating self-signed certs for use ({}, {})",
        cert_path.display(),
        key_path.display()
    );

    let generated = generator.generate(validity)?;
    let bundle = CertificateBundle::from_pem(generated.certificate_pem, generated.private_key_pem)?;
    bundle.write_to(cert_path, key_path).map_err(|e| {
        ProxyError::CertificateUnavailable(format!("unable to persist self-signed certificate: {}", e))
    })?;

    info!("SHA256 Fingerprint: {}", format_fingerprint(&generated.fingerprint));

    Ok(bundle)
}

/// SHA-256 over the DER encoding
pub fn fingerprint(der: &[u8]) -> Fingerprint {
    Sha256::digest(der).into()
}

/// Upper-case hex byte pairs separated by spaces, e.g. `3A 0F ...`
pub fn format_fingerprint(fingerprint: &Fingerprint) -> String {
    fingerprint
        .iter()
        .map(|b| hex::encode_upper([*b]))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build a TLS server config presenting a single certificate chain
pub fn build_server_config(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| ProxyError::Tls(format!("TLS config error: {}", e)))?;
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

pub(crate) fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let chain = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| ProxyError::CertificateUnavailable(format!("invalid certificate PEM: {}", e)))?;

    if chain.is_empty() {
        return Err(ProxyError::CertificateUnavailable(
            "no certificates found in PEM data".to_string(),
        ));
    }

    Ok(chain)
}

pub(crate) fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| ProxyError::CertificateUnavailable(format!("invalid private key PEM: {}", e)))?
        .ok_or_else(|| ProxyError::CertificateUnavailable("no private key found in PEM data".to_string()))
}

fn validity_window(leaf: &CertificateDer<'_>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| ProxyError::CertificateUnavailable(format!("invalid X.509 certificate: {}", e)))?;

    let validity = parsed.validity();
    let not_before = timestamp(validity.not_before.timestamp())?;
    let not_after = timestamp(validity.not_after.timestamp())?;
    Ok((not_before, not_after))
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| ProxyError::CertificateUnavailable(format!("timestamp out of range: {}", secs)))
}

/// Write a file with 0600 permissions on Unix
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(contents)
    }
    #[cfg(not(unix))]
    {
        let mut file = fs::File::create(path)?;
        file.write_all(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generated_validity_is_exact() {
        let generator = SelfSignedGenerator::new(["localhost"]);
        let validity = Duration::from_secs(365 * 24 * 60 * 60);
        let generated = generator.generate(validity).unwrap();

        let bundle =
            CertificateBundle::from_pem(generated.certificate_pem, generated.private_key_pem).unwrap();
        assert_eq!(bundle.validity(), chrono::Duration::hours(365 * 24));
        assert!(!bundle.is_expired());
        assert!(!bundle.expires_within(Duration::from_secs(300 * 24 * 60 * 60)));
        assert!(bundle.expires_within(Duration::from_secs(400 * 24 * 60 * 60)));
    }

    #[test]
    fn test_fingerprint_matches_stored_bytes() {
        let dir = tempdir().unwrap();
        let cert_path = dir.path().join(DEFAULT_CERT_FILE);
        let key_path = dir.path().join(DEFAULT_KEY_FILE);

        let generator = SelfSignedGenerator::new(["localhost", "example1.com"]);
        let generated = generator.generate(DEFAULT_VALIDITY).unwrap();
        let bundle = CertificateBundle::from_pem(
            generated.certificate_pem.clone(),
            generated.private_key_pem.clone(),
        )
        .unwrap();
        bundle.write_to(&cert_path, &key_path).unwrap();

        let stored = fs::read(&cert_path).unwrap();
        let der = parse_certificates(&stored).unwrap();
        assert_eq!(fingerprint(&der[0]), generated.fingerprint);
        assert_eq!(bundle.fingerprint(), &generated.fingerprint);

        let reloaded = CertificateBundle::load(&cert_path, &key_path).unwrap();
        assert_eq!(reloaded.fingerprint(), &generated.fingerprint);
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        let generator = SelfSignedGenerator::new(["localhost"]);
        ensure_self_signed(&generator, &cert_path, &key_path, DEFAULT_VALIDITY).unwrap();

        let mode = fs::metadata(&key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_ensure_self_signed_runs_once() {
        let dir = tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        let generator = SelfSignedGenerator::new(["localhost"]);

        let first = ensure_self_signed(&generator, &cert_path, &key_path, DEFAULT_VALIDITY).unwrap();
        assert!(cert_path.exists());
        assert!(key_path.exists());

        let second = ensure_self_signed(&generator, &cert_path, &key_path, DEFAULT_VALIDITY).unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn test_validity_overflow_is_rejected() {
        let result = SelfSignedGenerator::new(["localhost"]).generate(Duration::from_secs(u64::MAX));
        assert!(matches!(result, Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_from_pem_rejects_garbage() {
        let result = CertificateBundle::from_pem(b"not a cert".to_vec(), b"not a key".to_vec());
        assert!(matches!(result, Err(ProxyError::CertificateUnavailable(_))));
    }

    #[test]
    fn test_format_fingerprint() {
        let mut fp = [0u8; 32];
        fp[0] = 0x3a;
        fp[1] = 0x0f;
        let formatted = format_fingerprint(&fp);
        assert!(formatted.starts_with("3A 0F 00"));
        assert_eq!(formatted.split(' ').count(), 32);
    }

    #[test]
    fn test_generator_defaults_to_localhost() {
        let generator = SelfSignedGenerator::new(Vec::<String>::new());
        assert_eq!(generator.subject_alt_names(), ["localhost".to_string()]);
    }

    #[test]
    fn test_bundle_offers_alpn() {
        let generated = SelfSignedGenerator::new(["localhost"]).generate(DEFAULT_VALIDITY).unwrap();
        let bundle =
            CertificateBundle::from_pem(generated.certificate_pem, generated.private_key_pem).unwrap();
        let config = bundle.server_config();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }
}

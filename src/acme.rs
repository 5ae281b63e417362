//! ACME (Let's Encrypt) certificate issuance
//!
//! [`AcmeClient`] owns the on-disk cache and guarantees at most one
//! in-flight issuance per domain. The protocol itself sits behind
//! [`CertificateAuthority`]; [`AcmeAuthority`] speaks ACME v2 and answers
//! TLS-ALPN-01 challenges through the [`ChallengeStore`] consulted by the
//! TLS listener.

use crate::certificate::{build_server_config, write_private, CertificateBundle};
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{Certificate, CertificateParams, CustomExtension, DistinguishedName};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// ALPN protocol of the TLS-ALPN-01 challenge (RFC 8737)
pub const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";

/// Managed certificates are renewed this long before they expire
pub const RENEW_BEFORE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Wait after a failed order before asking the CA again
pub const RETRY_BACKOFF: Duration = Duration::from_secs(5 * 60);

const ACCOUNT_FILE: &str = "acme_account.json";
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const POLL_ATTEMPTS: u32 = 30;

/// Pending TLS-ALPN-01 challenge configs, keyed by domain
#[derive(Clone, Default)]
pub struct ChallengeStore {
    inner: Arc<DashMap<String, Arc<ServerConfig>>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, domain: &str, config: Arc<ServerConfig>) {
        self.inner.insert(domain.to_string(), config);
        debug!("Added ACME challenge for {}", domain);
    }

    pub fn get(&self, domain: &str) -> Option<Arc<ServerConfig>> {
        self.inner.get(domain).map(|c| c.value().clone())
    }

    pub fn remove(&self, domain: &str) {
        self.inner.remove(domain);
        debug!("Removed ACME challenge for {}", domain);
    }
}

impl fmt::Debug for ChallengeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChallengeStore")
            .field("pending", &self.inner.len())
            .finish()
    }
}

/// PEM material returned by a certificate authority
#[derive(Clone)]
pub struct IssuedCertificate {
    pub certificate_pem: Vec<u8>,
    pub private_key_pem: Vec<u8>,
}

/// Runs one complete certificate order for a single domain
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    async fn order_certificate(
        &self,
        domain: &str,
        challenges: &ChallengeStore,
    ) -> Result<IssuedCertificate>;
}

/// Directory cache: `<dir>/<domain>.crt` and `<dir>/<domain>.key`
#[derive(Debug, Clone)]
pub struct DirCache {
    dir: PathBuf,
}

impl DirCache {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of the persisted ACME account credentials
    pub fn account_path(&self) -> PathBuf {
        self.dir.join(ACCOUNT_FILE)
    }

    fn paths(&self, domain: &str) -> (PathBuf, PathBuf) {
        let name = sanitize_domain(domain);
        (
            self.dir.join(format!("{}.crt", name)),
            self.dir.join(format!("{}.key", name)),
        )
    }

    pub fn load(&self, domain: &str) -> Result<Option<CertificateBundle>> {
        let (cert_path, key_path) = self.paths(domain);
        if !cert_path.exists() || !key_path.exists() {
            return Ok(None);
        }
        CertificateBundle::load(&cert_path, &key_path).map(Some)
    }

    pub fn store(&self, domain: &str, bundle: &CertificateBundle) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let (cert_path, key_path) = self.paths(domain);
        bundle.write_to(&cert_path, &key_path)?;
        debug!("Cached certificate for {} in {}", domain, self.dir.display());
        Ok(())
    }
}

/// Sanitize domain name for filesystem
fn sanitize_domain(domain: &str) -> String {
    domain.replace('*', "wildcard")
}

/// Issues, caches and renews certificates per domain with single-flight
/// semantics: concurrent callers for one domain share one CA order.
pub struct AcmeClient {
    authority: Arc<dyn CertificateAuthority>,
    cache: DirCache,
    challenges: ChallengeStore,
    certificates: DashMap<String, Arc<CertificateBundle>>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    failures: DashMap<String, Instant>,
}

impl AcmeClient {
    /// `terms_accepted` must be true; issuing implies accepting the CA's terms
    pub fn new(
        authority: Arc<dyn CertificateAuthority>,
        cache: DirCache,
        challenges: ChallengeStore,
        terms_accepted: bool,
    ) -> Result<Self> {
        if !terms_accepted {
            return Err(ProxyError::Config(
                "the certificate authority's terms of service must be accepted".to_string(),
            ));
        }

        Ok(Self {
            authority,
            cache,
            challenges,
            certificates: DashMap::new(),
            in_flight: DashMap::new(),
            failures: DashMap::new(),
        })
    }

    pub fn challenges(&self) -> &ChallengeStore {
        &self.challenges
    }

    /// Certificate to present for `domain`.
    ///
    /// Fresh certificates are returned as is. A stale but unexpired one is
    /// returned while a renewal runs in the background; an expired or
    /// missing one is issued before returning.
    pub async fn certificate(self: &Arc<Self>, domain: &str) -> Result<Arc<CertificateBundle>> {
        match self.lookup(domain).await {
            Some(bundle) if !needs_renewal(&bundle) => Ok(bundle),
            Some(bundle) if !bundle.is_expired() => {
                if !self.backing_off(domain) {
                    if let Ok(guard) = self.flight(domain).try_lock_owned() {
                        let client = Arc::clone(self);
                        let domain = domain.to_string();
                        tokio::spawn(async move {
                            let _guard = guard;
                            info!("Renewing certificate for {}", domain);
                            if let Err(e) = client.order(&domain).await {
                                warn!("Certificate renewal for {} failed: {}", domain, e);
                            }
                        });
                    }
                }
                Ok(bundle)
            }
            seen => self.issue_after(domain, seen).await,
        }
    }

    /// Obtain a fresh certificate, ordering one from the CA only if no other
    /// caller produced it while this one waited.
    pub async fn issue_or_renew(&self, domain: &str) -> Result<Arc<CertificateBundle>> {
        let seen = self.lookup(domain).await;
        self.issue_after(domain, seen).await
    }

    /// `seen` is what the caller found before queueing on the flight lock.
    /// Anything else that is unexpired was issued by whoever held the lock.
    async fn issue_after(
        &self,
        domain: &str,
        seen: Option<Arc<CertificateBundle>>,
    ) -> Result<Arc<CertificateBundle>> {
        let flight = self.flight(domain);
        let _guard = flight.lock().await;

        if let Some(current) = self.lookup(domain).await {
            let replaced = seen
                .as_ref()
                .map_or(true, |seen| seen.fingerprint() != current.fingerprint());
            if !needs_renewal(&current) || (replaced && !current.is_expired()) {
                return Ok(current);
            }
        }

        self.order(domain).await
    }

    /// Order from the CA, then cache. Callers hold the domain's flight lock.
    async fn order(&self, domain: &str) -> Result<Arc<CertificateBundle>> {
        if self.backing_off(domain) {
            return Err(ProxyError::CertificateUnavailable(format!(
                "last order for {} failed less than {:?} ago",
                domain, RETRY_BACKOFF
            )));
        }

        info!("Requesting certificate for {}", domain);
        let issued = match self.authority.order_certificate(domain, &self.challenges).await {
            Ok(issued) => issued,
            Err(e) => {
                self.failures.insert(domain.to_string(), Instant::now());
                return Err(e);
            }
        };
        self.failures.remove(domain);

        let bundle = Arc::new(CertificateBundle::from_pem(
            issued.certificate_pem,
            issued.private_key_pem,
        )?);

        let cache = self.cache.clone();
        let (name, stored) = (domain.to_string(), bundle.clone());
        match tokio::task::spawn_blocking(move || cache.store(&name, &stored)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to cache certificate for {}: {}", domain, e),
            Err(e) => warn!("Failed to cache certificate for {}: {}", domain, e),
        }
        self.certificates.insert(domain.to_string(), bundle.clone());

        info!("Certificate for {} valid until {}", domain, bundle.not_after());
        Ok(bundle)
    }

    fn backing_off(&self, domain: &str) -> bool {
        self.failures
            .get(domain)
            .map(|failed| failed.value().elapsed() < RETRY_BACKOFF)
            .unwrap_or(false)
    }

    fn flight(&self, domain: &str) -> Arc<Mutex<()>> {
        self.in_flight
            .entry(domain.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Memory first, then disk
    async fn lookup(&self, domain: &str) -> Option<Arc<CertificateBundle>> {
        if let Some(bundle) = self.certificates.get(domain) {
            return Some(bundle.value().clone());
        }

        let cache = self.cache.clone();
        let name = domain.to_string();
        let loaded = tokio::task::spawn_blocking(move || cache.load(&name))
            .await
            .map_err(|e| ProxyError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
            .and_then(|loaded| loaded);

        match loaded {
            Ok(Some(bundle)) => {
                debug!("Loaded cached certificate for {}", domain);
                let bundle = Arc::new(bundle);
                self.certificates.insert(domain.to_string(), bundle.clone());
                Some(bundle)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Ignoring unreadable cached certificate for {}: {}", domain, e);
                None
            }
        }
    }
}

/// Inside the renewal window: [`RENEW_BEFORE`], capped at a third of the
/// certificate's lifetime for short-lived certificates
fn needs_renewal(bundle: &CertificateBundle) -> bool {
    let lifetime = bundle.validity().to_std().unwrap_or_default();
    bundle.expires_within(RENEW_BEFORE.min(lifetime / 3))
}

/// ACME v2 client answering TLS-ALPN-01 challenges
pub struct AcmeAuthority {
    directory_url: String,
    contact: Option<String>,
    account_path: PathBuf,
    account: OnceCell<Account>,
}

impl AcmeAuthority {
    pub fn new(directory_url: impl Into<String>, contact: Option<String>, cache: &DirCache) -> Self {
        Self {
            directory_url: directory_url.into(),
            contact,
            account_path: cache.account_path(),
            account: OnceCell::new(),
        }
    }

    /// Load or create an ACME account, persisting its credentials
    async fn account(&self) -> Result<&Account> {
        self.account
            .get_or_try_init(|| async {
                if self.account_path.exists() {
                    debug!("Loading ACME account from {}", self.account_path.display());
                    let data = fs::read_to_string(&self.account_path)?;
                    let credentials: AccountCredentials =
                        serde_json::from_str(&data).map_err(acme_error)?;
                    return Account::from_credentials(credentials)
                        .await
                        .map_err(acme_error);
                }

                info!("Creating ACME account at {}", self.directory_url);
                let contact = self.contact.as_ref().map(|email| format!("mailto:{}", email));
                let contacts: Vec<&str> = contact.iter().map(String::as_str).collect();

                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: &contacts,
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    &self.directory_url,
                    None,
                )
                .await
                .map_err(acme_error)?;

                if let Some(parent) = self.account_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let data = serde_json::to_string_pretty(&credentials).map_err(acme_error)?;
                write_private(&self.account_path, data.as_bytes())?;
                info!("ACME account credentials saved to {}", self.account_path.display());

                Ok::<_, ProxyError>(account)
            })
            .await
    }

    /// Publish challenge certificates and wait until the order is ready
    async fn validate(
        &self,
        order: &mut Order,
        domain: &str,
        challenges: &ChallengeStore,
    ) -> Result<()> {
        let authorizations = order.authorizations().await.map_err(acme_error)?;

        for authz in authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::TlsAlpn01)
                .ok_or_else(|| {
                    ProxyError::CertificateUnavailable(format!(
                        "no tls-alpn-01 challenge offered for {}",
                        domain
                    ))
                })?;

            let key_authorization = order.key_authorization(challenge);
            let config = challenge_config(domain, key_authorization.digest().as_ref())?;
            challenges.set(domain, Arc::new(config));

            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(acme_error)?;
        }

        for attempt in 1..=POLL_ATTEMPTS {
            tokio::time::sleep(POLL_INTERVAL).await;
            order.refresh().await.map_err(acme_error)?;

            match &order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    return Err(ProxyError::CertificateUnavailable(format!(
                        "ACME order for {} is invalid",
                        domain
                    )))
                }
                status => debug!("Order for {} is {:?} (attempt {})", domain, status, attempt),
            }
        }

        Err(ProxyError::CertificateUnavailable(format!(
            "timed out validating {}",
            domain
        )))
    }
}

#[async_trait]
impl CertificateAuthority for AcmeAuthority {
    async fn order_certificate(
        &self,
        domain: &str,
        challenges: &ChallengeStore,
    ) -> Result<IssuedCertificate> {
        let account = self.account().await?;

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(acme_error)?;

        let validated = self.validate(&mut order, domain, challenges).await;
        challenges.remove(domain);
        validated?;

        let mut params = CertificateParams::new(vec![domain.to_string()]);
        params.distinguished_name = DistinguishedName::new();
        let key = Certificate::from_params(params).map_err(acme_error)?;
        let csr = key.serialize_request_der().map_err(acme_error)?;

        order.finalize(&csr).await.map_err(acme_error)?;

        for _ in 0..POLL_ATTEMPTS {
            if let Some(chain) = order.certificate().await.map_err(acme_error)? {
                return Ok(IssuedCertificate {
                    certificate_pem: chain.into_bytes(),
                    private_key_pem: key.serialize_private_key_pem().into_bytes(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            order.refresh().await.map_err(acme_error)?;
        }

        Err(ProxyError::CertificateUnavailable(format!(
            "timed out waiting for the certificate of {}",
            domain
        )))
    }
}

/// Self-signed certificate carrying the acmeIdentifier extension, served
/// only to clients negotiating `acme-tls/1`
fn challenge_config(domain: &str, digest: &[u8]) -> Result<ServerConfig> {
    let mut params = CertificateParams::new(vec![domain.to_string()]);
    params.custom_extensions = vec![CustomExtension::new_acme_identifier(digest)];
    let cert = Certificate::from_params(params).map_err(acme_error)?;

    let der = cert.serialize_der().map_err(acme_error)?;
    let key = PrivatePkcs8KeyDer::from(cert.serialize_private_key_der());

    let mut config = build_server_config(vec![CertificateDer::from(der)], PrivateKeyDer::Pkcs8(key))?;
    config.alpn_protocols = vec![ACME_TLS_ALPN_NAME.to_vec()];
    Ok(config)
}

fn acme_error(e: impl fmt::Display) -> ProxyError {
    ProxyError::CertificateUnavailable(e.to_string())
}

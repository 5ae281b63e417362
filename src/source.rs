//! Certificate selection for TLS handshakes
//!
//! The TLS listener asks a [`CertificateSource`] for the bundle to present
//! once the ClientHello has been read, so the handshake path is the same
//! for static files and for ACME-managed certificates.

use crate::acme::AcmeClient;
use crate::certificate::CertificateBundle;
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use rustls::ServerConfig;
use std::collections::HashSet;
use std::sync::Arc;

#[async_trait]
pub trait CertificateSource: Send + Sync {
    /// Bundle to present to a client that announced `server_name` (SNI)
    async fn resolve_certificate(&self, server_name: Option<&str>) -> Result<Arc<CertificateBundle>>;

    /// TLS config answering an ACME TLS-ALPN-01 challenge for `server_name`
    fn challenge_config(&self, _server_name: &str) -> Option<Arc<ServerConfig>> {
        None
    }
}

/// One pre-loaded bundle, whatever the client asks for
#[derive(Debug, Clone)]
pub struct StaticFiles {
    bundle: Arc<CertificateBundle>,
}

impl StaticFiles {
    pub fn new(bundle: CertificateBundle) -> Self {
        Self {
            bundle: Arc::new(bundle),
        }
    }

    pub fn bundle(&self) -> &CertificateBundle {
        &self.bundle
    }
}

#[async_trait]
impl CertificateSource for StaticFiles {
    async fn resolve_certificate(&self, _server_name: Option<&str>) -> Result<Arc<CertificateBundle>> {
        Ok(self.bundle.clone())
    }
}

/// Certificates issued on demand by a CA for whitelisted domains
pub struct ManagedAcme {
    whitelist: HashSet<String>,
    client: Arc<AcmeClient>,
}

impl ManagedAcme {
    pub fn new<I, S>(whitelist: I, client: Arc<AcmeClient>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            whitelist: whitelist.into_iter().map(Into::into).collect(),
            client,
        }
    }

    pub fn is_authorized(&self, server_name: &str) -> bool {
        self.whitelist.contains(server_name)
    }
}

#[async_trait]
impl CertificateSource for ManagedAcme {
    async fn resolve_certificate(&self, server_name: Option<&str>) -> Result<Arc<CertificateBundle>> {
        let server_name = server_name.ok_or(ProxyError::MissingServerName)?;

        if !self.is_authorized(server_name) {
            return Err(ProxyError::HostNotAuthorized(server_name.to_string()));
        }

        self.client.certificate(server_name).await
    }

    fn challenge_config(&self, server_name: &str) -> Option<Arc<ServerConfig>> {
        if !self.is_authorized(server_name) {
            return None;
        }
        self.client.challenges().get(server_name)
    }
}

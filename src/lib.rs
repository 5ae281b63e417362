//! sslproxy - A TLS-terminating reverse proxy
//!
//! Provides:
//! - Exact host-based routing to http or https backends
//! - Certificates from PEM files, a generated self-signed pair, or ACME
//! - Streaming request/response forwarding, including protocol upgrades
//! - An optional plain HTTP listener redirecting to HTTPS

pub mod acme;
pub mod certificate;
pub mod config;
pub mod error;
pub mod forward;
pub mod proxy;
pub mod redirect;
pub mod router;
pub mod source;

pub use acme::{AcmeAuthority, AcmeClient, CertificateAuthority, ChallengeStore, DirCache};
pub use certificate::{CertificateBundle, KeyPairGenerator, SelfSignedGenerator};
pub use config::{Args, CertificateMode, Settings};
pub use error::{ProxyError, Result};
pub use forward::Dispatcher;
pub use proxy::{ProxyConfig, ProxyServer};
pub use redirect::Redirector;
pub use router::{DomainMapping, DomainRouter, ProxyTarget};
pub use source::{CertificateSource, ManagedAcme, StaticFiles};

//! Command line and environment configuration

use crate::acme::LETS_ENCRYPT_PRODUCTION;
use crate::certificate::{DEFAULT_CERT_FILE, DEFAULT_KEY_FILE};
use crate::error::{ProxyError, Result};
use crate::router::{DomainMapping, ProxyTarget};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn, Level};

/// sslproxy - TLS-terminating reverse proxy with host-based routing
#[derive(Parser, Debug, Clone)]
#[command(name = "sslproxy")]
#[command(version = "1.0.0")]
#[command(about = "TLS-terminating reverse proxy with host-based routing")]
pub struct Args {
    /// Backend for ACME domains that have no explicit mapping
    #[arg(long, env = "SSL_PROXY_TO", default_value = "http://127.0.0.1:80")]
    pub to: String,

    /// TLS listen address
    #[arg(long, env = "SSL_PROXY_FROM", default_value = "127.0.0.1:443")]
    pub from: SocketAddr,

    /// Certificate PEM file
    #[arg(long, env = "SSL_PROXY_CERT")]
    pub cert: Option<PathBuf>,

    /// Private key PEM file
    #[arg(long, env = "SSL_PROXY_KEY")]
    pub key: Option<PathBuf>,

    /// Comma separated domains to obtain certificates for via ACME.
    /// Implies acceptance of the CA's terms of service.
    #[arg(long, env = "SSL_PROXY_DOMAINS", value_delimiter = ',')]
    pub domains: Vec<String>,

    /// Redirect plain HTTP requests to HTTPS
    #[arg(long, env = "SSL_PROXY_REDIRECT_HTTP", default_value = "false")]
    pub redirect_http: bool,

    /// Listen address of the HTTP redirector
    #[arg(long, env = "SSL_PROXY_REDIRECT_ADDR", default_value = "0.0.0.0:80")]
    pub redirect_addr: SocketAddr,

    /// Directory for ACME certificates and account credentials
    #[arg(long, env = "SSL_PROXY_CACHE_DIR", default_value = "certs")]
    pub cache_dir: PathBuf,

    /// Domain to backend pairs, e.g. `a.com=http://127.0.0.1:8081,b.com=http://127.0.0.1:8082`
    #[arg(long, env = "SSL_PROXY_DOMAIN_MAP")]
    pub domain_map: Option<String>,

    /// ACME directory URL
    #[arg(long, env = "ACME_DIRECTORY_URL", default_value = LETS_ENCRYPT_PRODUCTION)]
    pub acme_directory_url: String,

    /// Contact email for the ACME account
    #[arg(long, env = "ACME_EMAIL")]
    pub acme_email: Option<String>,

    /// Seconds to wait for a backend's response headers
    #[arg(long, env = "SSL_PROXY_BACKEND_TIMEOUT", default_value = "30")]
    pub backend_timeout: u64,

    /// Validity of a generated self-signed certificate, in hours
    #[arg(long, env = "SSL_PROXY_SELF_SIGNED_VALIDITY_HOURS", default_value = "8760")]
    pub self_signed_validity_hours: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Where the TLS listener gets its certificates from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateMode {
    /// Operator supplied PEM files
    Files { cert: PathBuf, key: PathBuf },
    /// Generated on first start, reused afterwards
    SelfSigned { cert: PathBuf, key: PathBuf },
    /// Issued on demand for whitelisted domains
    Acme {
        domains: Vec<String>,
        cache_dir: PathBuf,
        directory_url: String,
        email: Option<String>,
    },
}

/// Validated runtime settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_addr: SocketAddr,
    pub mapping: DomainMapping,
    pub certificates: CertificateMode,
    pub redirect_addr: Option<SocketAddr>,
    pub backend_timeout: Duration,
    pub self_signed_validity: Duration,
}

impl Args {
    /// Resolve the certificate mode and the domain map. Any malformed
    /// mapping is an error.
    pub fn into_settings(self) -> Result<Settings> {
        if !ProxyTarget::has_scheme(&self.to) {
            info!("Assuming --to URL is using http://");
        }
        let fallback = ProxyTarget::parse(&self.to)?;

        let mut mapping = match &self.domain_map {
            Some(raw) => DomainMapping::parse(raw)?,
            None => DomainMapping::defaults()?,
        };

        let domains: Vec<String> = self
            .domains
            .iter()
            .map(|d| d.trim())
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .collect();

        for domain in &domains {
            if !mapping.contains(domain) {
                mapping.insert(domain.clone(), fallback.clone())?;
            }
        }

        let certificates = if !domains.is_empty() {
            if self.cert.is_some() || self.key.is_some() {
                warn!("--cert and --key are ignored when --domains is set");
            }
            if self.from.port() != 443 {
                warn!(
                    "ACME is enabled but the proxy listens on port {}; TLS-ALPN-01 validation only reaches port 443",
                    self.from.port()
                );
            }
            CertificateMode::Acme {
                domains,
                cache_dir: self.cache_dir,
                directory_url: self.acme_directory_url,
                email: self.acme_email,
            }
        } else {
            match (self.cert, self.key) {
                (Some(cert), Some(key)) => CertificateMode::Files { cert, key },
                _ => CertificateMode::SelfSigned {
                    cert: PathBuf::from(DEFAULT_CERT_FILE),
                    key: PathBuf::from(DEFAULT_KEY_FILE),
                },
            }
        };

        let self_signed_validity = self
            .self_signed_validity_hours
            .checked_mul(60 * 60)
            .map(Duration::from_secs)
            .ok_or_else(|| {
                ProxyError::Config(format!(
                    "--self-signed-validity-hours {} is out of range",
                    self.self_signed_validity_hours
                ))
            })?;

        Ok(Settings {
            listen_addr: self.from,
            mapping,
            certificates,
            redirect_addr: self.redirect_http.then_some(self.redirect_addr),
            backend_timeout: Duration::from_secs(self.backend_timeout),
            self_signed_validity,
        })
    }
}

impl Settings {
    /// Names for a generated certificate: `localhost` plus every mapped host
    pub fn subject_alt_names(&self) -> Vec<String> {
        let mut names = vec!["localhost".to_string()];
        for host in self.mapping.hosts() {
            let name = strip_port(host);
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        names
    }
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !name.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Parse a log level name, falling back to info
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["sslproxy"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let settings = parse(&[]).into_settings().unwrap();

        assert_eq!(settings.listen_addr, "127.0.0.1:443".parse().unwrap());
        assert_eq!(settings.redirect_addr, None);
        assert_eq!(settings.backend_timeout, Duration::from_secs(30));
        assert_eq!(settings.self_signed_validity, Duration::from_secs(8760 * 3600));
        assert_eq!(
            settings.certificates,
            CertificateMode::SelfSigned {
                cert: PathBuf::from("cert.pem"),
                key: PathBuf::from("key.pem"),
            }
        );

        let hosts: Vec<_> = settings.mapping.hosts().collect();
        assert_eq!(hosts, vec!["example1.com", "example2.com"]);
    }

    #[test]
    fn test_domain_map_replaces_defaults() {
        let settings = parse(&["--domain-map", "a.com=http://127.0.0.1:9001,b.com=127.0.0.1:9002"])
            .into_settings()
            .unwrap();

        let hosts: Vec<_> = settings.mapping.hosts().collect();
        assert_eq!(hosts, vec!["a.com", "b.com"]);
        assert_eq!(settings.mapping.get("b.com").unwrap().scheme(), "http");
        assert!(!settings.mapping.contains("example1.com"));
    }

    #[test]
    fn test_malformed_domain_map_is_fatal() {
        for raw in ["a.com", "=http://127.0.0.1:9001", "a.com=x,a.com=y", "a.com=http://"] {
            let result = parse(&["--domain-map", raw]).into_settings();
            assert!(matches!(result, Err(ProxyError::Config(_))), "{}", raw);
        }
    }

    #[test]
    fn test_static_files_mode() {
        let settings = parse(&["--cert", "/etc/proxy/cert.pem", "--key", "/etc/proxy/key.pem"])
            .into_settings()
            .unwrap();

        assert_eq!(
            settings.certificates,
            CertificateMode::Files {
                cert: PathBuf::from("/etc/proxy/cert.pem"),
                key: PathBuf::from("/etc/proxy/key.pem"),
            }
        );
    }

    #[test]
    fn test_cert_without_key_falls_back_to_self_signed() {
        let settings = parse(&["--cert", "/etc/proxy/cert.pem"]).into_settings().unwrap();
        assert!(matches!(settings.certificates, CertificateMode::SelfSigned { .. }));
    }

    #[test]
    fn test_acme_mode_maps_unlisted_domains_to_fallback() {
        let settings = parse(&[
            "--domains",
            "example1.com, app.example.org",
            "--to",
            "127.0.0.1:3000",
            "--cert",
            "ignored.pem",
            "--key",
            "ignored.key",
        ])
        .into_settings()
        .unwrap();

        match &settings.certificates {
            CertificateMode::Acme {
                domains,
                cache_dir,
                directory_url,
                email,
            } => {
                assert_eq!(domains, &vec!["example1.com".to_string(), "app.example.org".to_string()]);
                assert_eq!(cache_dir, &PathBuf::from("certs"));
                assert_eq!(directory_url, LETS_ENCRYPT_PRODUCTION);
                assert!(email.is_none());
            }
            other => panic!("expected ACME mode, got {:?}", other),
        }

        assert_eq!(
            settings.mapping.get("example1.com").unwrap().authority(),
            "127.0.0.1:8081"
        );
        assert_eq!(
            settings.mapping.get("app.example.org").unwrap().authority(),
            "127.0.0.1:3000"
        );
    }

    #[test]
    fn test_redirect_enabled() {
        let settings = parse(&["--redirect-http", "--redirect-addr", "127.0.0.1:8080"])
            .into_settings()
            .unwrap();
        assert_eq!(settings.redirect_addr, Some("127.0.0.1:8080".parse().unwrap()));
    }

    #[test]
    fn test_subject_alt_names() {
        let settings = parse(&["--domain-map", "localhost:8443=127.0.0.1:1,a.com=127.0.0.1:2"])
            .into_settings()
            .unwrap();
        assert_eq!(settings.subject_alt_names(), vec!["localhost", "a.com"]);
    }

    #[test]
    fn test_validity_overflow_is_config_error() {
        let result = parse(&["--self-signed-validity-hours", &u64::MAX.to_string()]).into_settings();
        assert!(matches!(result, Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("verbose"), Level::INFO);
    }
}

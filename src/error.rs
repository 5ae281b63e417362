//! Error types for sslproxy

use hyper::StatusCode;
use std::net::SocketAddr;
use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Proxy error types
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Host header did not match any configured domain
    #[error("unknown host: {0}")]
    UnknownHost(String),

    /// TLS server name is outside the ACME whitelist
    #[error("host not authorized for certificate issuance: {0}")]
    HostNotAuthorized(String),

    /// ClientHello carried no SNI but the certificate source needs one
    #[error("TLS client did not send a server name")]
    MissingServerName,

    /// Key-pair generation or CA issuance failed
    #[error("certificate unavailable: {0}")]
    CertificateUnavailable(String),

    /// Dial or timeout towards a backend
    #[error("backend {target} unreachable: {reason}")]
    BackendUnreachable { target: String, reason: String },

    /// Backend answered with something that is not valid HTTP
    #[error("malformed response from backend {target}: {reason}")]
    BackendProtocol { target: String, reason: String },

    /// Listening socket could not be bound
    #[error("failed to bind {addr}: {source}")]
    ListenBind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// HTTP status a client sees when this error ends a request
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::UnknownHost(_) => StatusCode::FORBIDDEN,
            ProxyError::BackendUnreachable { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::UnknownHost("unknown.com".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ProxyError::BackendUnreachable {
                target: "http://127.0.0.1:1".into(),
                reason: "connection refused".into(),
            }
            .status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::BackendProtocol {
                target: "http://127.0.0.1:1".into(),
                reason: "invalid status line".into(),
            }
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

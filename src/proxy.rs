//! TLS proxy server
//! Terminates TLS, picks the certificate per handshake and routes requests by Host

use crate::acme::ACME_TLS_ALPN_NAME;
use crate::error::{ProxyError, Result};
use crate::forward::{Dispatcher, ForwardContext, ProxyResponse};
use crate::router::{request_host, DomainRouter};
use crate::source::CertificateSource;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rustls::server::Acceptor;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, warn};

/// Proxy server configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub backend_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 443)),
            backend_timeout: Duration::from_secs(30),
        }
    }
}

/// TLS-terminating reverse proxy
pub struct ProxyServer {
    config: ProxyConfig,
    router: DomainRouter,
    certificates: Arc<dyn CertificateSource>,
    dispatcher: Dispatcher,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(
        config: ProxyConfig,
        router: DomainRouter,
        certificates: Arc<dyn CertificateSource>,
    ) -> Self {
        let dispatcher = Dispatcher::new(config.backend_timeout);
        Self {
            config,
            router,
            certificates,
            dispatcher,
        }
    }

    /// Bind the TLS listener and serve forever. A bind failure is returned
    /// as [`ProxyError::ListenBind`].
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::ListenBind { addr, source })?;

        info!(
            "Proxying calls from https://{} (SSL/TLS) to respective endpoints based on domain",
            addr
        );

        self.serve(listener).await
    }

    /// Accept loop on an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let listen_port = listener.local_addr()?.port();

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("TLS listener accept error: {}", e);
                    continue;
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                let ctx = ForwardContext {
                    remote_addr,
                    listen_port,
                };
                match server.handle_connection(stream, ctx).await {
                    Ok(()) => {}
                    Err(e @ ProxyError::CertificateUnavailable(_)) => {
                        error!("TLS connection from {} failed: {}", remote_addr, e)
                    }
                    Err(e) => debug!("TLS connection error from {}: {}", remote_addr, e),
                }
            });
        }
    }

    /// Handshake, then serve HTTP/1.1 or HTTP/2 on the decrypted stream
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, ctx: ForwardContext) -> Result<()> {
        let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;

        let (server_name, acme_challenge) = {
            let hello = start.client_hello();
            let acme_challenge = hello
                .alpn()
                .map(|mut protocols| protocols.any(|p| p == ACME_TLS_ALPN_NAME))
                .unwrap_or(false);
            (hello.server_name().map(str::to_string), acme_challenge)
        };

        if acme_challenge {
            let name = server_name.ok_or(ProxyError::MissingServerName)?;
            let config = self.certificates.challenge_config(&name).ok_or_else(|| {
                ProxyError::Tls(format!("no pending ACME challenge for {}", name))
            })?;
            let mut tls = start.into_stream(config).await?;
            tls.shutdown().await?;
            info!("Answered TLS-ALPN-01 challenge for {}", name);
            return Ok(());
        }

        let bundle = self
            .certificates
            .resolve_certificate(server_name.as_deref())
            .await?;
        let tls = start.into_stream(bundle.server_config()).await?;
        debug!(
            "TLS handshake with {} completed (server name: {})",
            ctx.remote_addr,
            server_name.as_deref().unwrap_or("-")
        );

        let io = TokioIo::new(tls);
        let server = self.clone();
        auto::Builder::new(TokioExecutor::new())
            .serve_connection_with_upgrades(
                io,
                service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req, ctx).await }
                }),
            )
            .await
            .map_err(|e| ProxyError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
    }

    /// Route by Host, then forward. Every failure becomes an HTTP status.
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        ctx: ForwardContext,
    ) -> std::result::Result<ProxyResponse, Infallible> {
        let host = match request_host(&req) {
            Some(host) => host,
            None => return Ok(error_response(StatusCode::BAD_REQUEST, "Missing Host header")),
        };

        let target = match self.router.resolve_backend(&host) {
            Ok(target) => target,
            Err(e) => {
                debug!("Rejecting request from {}: {}", ctx.remote_addr, e);
                return Ok(error_response(e.status(), "Forbidden"));
            }
        };

        match self.dispatcher.forward(req, target, ctx).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!("Request for {} failed: {}", host, e);
                let status = e.status();
                Ok(error_response(
                    status,
                    status.canonical_reason().unwrap_or("Error"),
                ))
            }
        }
    }
}

/// Create error response
pub fn error_response(status: StatusCode, message: &str) -> ProxyResponse {
    let mut response = Response::new(full_body(Bytes::from(message.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// Create a 301 redirect response
pub fn redirect_response(location: &str) -> ProxyResponse {
    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
    if let Ok(location) = HeaderValue::from_str(location) {
        response.headers_mut().insert(LOCATION, location);
    }
    response
}

/// Create full body
pub fn full_body(bytes: Bytes) -> http_body_util::combinators::BoxBody<Bytes, hyper::Error> {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Create empty body
pub fn empty_body() -> http_body_util::combinators::BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

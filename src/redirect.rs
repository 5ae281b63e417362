//! Plaintext listener redirecting to the TLS listener

use crate::error::{ProxyError, Result};
use crate::forward::ProxyResponse;
use crate::proxy::{error_response, redirect_response};
use crate::router::{request_host, DomainRouter};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Answers every request with `301 https://<host><path>?<query>` for
/// mapped hosts and `403` for everything else
pub struct Redirector {
    addr: SocketAddr,
    router: DomainRouter,
}

impl Redirector {
    pub fn new(addr: SocketAddr, router: DomainRouter) -> Self {
        Self { addr, router }
    }

    /// Bind and serve until the process exits
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|source| ProxyError::ListenBind {
                addr: self.addr,
                source,
            })?;

        info!("Redirecting http requests on {} to https based on domain mapping", self.addr);
        self.serve(listener).await
    }

    /// Accept loop on an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Redirect listener accept error: {}", e);
                    continue;
                }
            };

            let redirector = self.clone();
            tokio::spawn(async move {
                if let Err(e) = redirector.handle_connection(stream).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> std::result::Result<(), hyper::Error> {
        let io = TokioIo::new(stream);
        http1::Builder::new()
            .serve_connection(
                io,
                service_fn(move |req| {
                    let redirector = self.clone();
                    async move { Ok::<_, Infallible>(redirector.redirect(&req)) }
                }),
            )
            .await
    }

    /// Build the redirect (or rejection) for one request
    pub fn redirect<B>(&self, req: &Request<B>) -> ProxyResponse {
        let host = match request_host(req) {
            Some(host) => host,
            None => return error_response(StatusCode::BAD_REQUEST, "Missing Host header"),
        };

        if let Err(e) = self.router.resolve_backend(&host) {
            debug!("Refusing redirect: {}", e);
            return error_response(StatusCode::FORBIDDEN, "Forbidden");
        }

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        redirect_response(&format!("https://{}{}", host, path_and_query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::DomainMapping;
    use hyper::header::{HOST, LOCATION};

    fn redirector() -> Redirector {
        let mapping = DomainMapping::parse("example1.com=http://127.0.0.1:8081").unwrap();
        Redirector::new("127.0.0.1:0".parse().unwrap(), DomainRouter::new(mapping))
    }

    #[test]
    fn test_redirect_preserves_host_path_and_query() {
        let req = Request::builder()
            .uri("/a?b=1")
            .header(HOST, "example1.com")
            .body(())
            .unwrap();

        let response = redirector().redirect(&req);
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers().get(LOCATION).unwrap(), "https://example1.com/a?b=1");
    }

    #[test]
    fn test_redirect_root() {
        let req = Request::builder()
            .uri("/")
            .header(HOST, "example1.com")
            .body(())
            .unwrap();

        let response = redirector().redirect(&req);
        assert_eq!(response.headers().get(LOCATION).unwrap(), "https://example1.com/");
    }

    #[test]
    fn test_unknown_host_forbidden() {
        let req = Request::builder()
            .uri("/foo?q=1")
            .header(HOST, "unknown.com")
            .body(())
            .unwrap();

        let response = redirector().redirect(&req);
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(response.headers().get(LOCATION).is_none());
    }
}

//! Request forwarding to backends
//! Streams request and response bodies without buffering them

use crate::error::{ProxyError, Result};
use crate::router::ProxyTarget;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::{Request, Response, StatusCode, Version};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error};

/// Response type shared by every handler in the proxy
pub type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

type HttpClient = Client<HttpsConnector<HttpConnector>, Incoming>;

/// Headers that only describe a single connection
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Per-request information the forwarder adds as X-Forwarded-* headers
#[derive(Debug, Clone, Copy)]
pub struct ForwardContext {
    pub remote_addr: SocketAddr,
    pub listen_port: u16,
}

/// Forwards requests to a [`ProxyTarget`] over http or https
#[derive(Clone)]
pub struct Dispatcher {
    client: HttpClient,
    timeout: Duration,
}

impl Dispatcher {
    /// `timeout` bounds the wait for the backend's response headers
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(HttpsConnector::new());

        Self { client, timeout }
    }

    /// Forward `req` to `target` and hand back the backend's response with
    /// its body still streaming. No retries.
    pub async fn forward(
        &self,
        mut req: Request<Incoming>,
        target: &ProxyTarget,
        ctx: ForwardContext,
    ) -> Result<ProxyResponse> {
        let client_upgrade = upgrade_protocol(req.headers()).map(|protocol| {
            let on_upgrade = hyper::upgrade::on(&mut req);
            (protocol, on_upgrade)
        });

        let original_host = crate::router::request_host(&req).unwrap_or_default();
        let uri = target.rewrite_uri(req.uri())?;
        debug!("Proxying {} {} to {}", req.method(), req.uri(), uri);

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        parts.version = Version::HTTP_11;

        strip_hop_by_hop(&mut parts.headers);
        if let Some((protocol, _)) = &client_upgrade {
            parts.headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
            parts.headers.insert(UPGRADE, protocol.clone());
        }
        if !parts.headers.contains_key(HOST) {
            if let Ok(host) = HeaderValue::from_str(&original_host) {
                parts.headers.insert(HOST, host);
            }
        }
        add_forwarded_headers(&mut parts.headers, &original_host, ctx);

        let outgoing = Request::from_parts(parts, body);

        let mut response = match tokio::time::timeout(self.timeout, self.client.request(outgoing)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(classify(target, &e)),
            Err(_) => {
                return Err(ProxyError::BackendUnreachable {
                    target: target.to_string(),
                    reason: format!("no response within {:?}", self.timeout),
                })
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some((_, on_client_upgrade)) = client_upgrade {
                let on_backend_upgrade = hyper::upgrade::on(&mut response);
                let target = target.to_string();
                tokio::spawn(async move {
                    if let Err(e) = tunnel(on_client_upgrade, on_backend_upgrade).await {
                        debug!("Upgraded connection to {} closed: {}", target, e);
                    }
                });
                let (parts, _) = response.into_parts();
                return Ok(Response::from_parts(parts, crate::proxy::empty_body()));
            }
        }

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Copy bytes between both upgraded connections until either side closes
async fn tunnel(
    client: hyper::upgrade::OnUpgrade,
    backend: hyper::upgrade::OnUpgrade,
) -> std::result::Result<(), Box<dyn StdError + Send + Sync>> {
    let (client, backend) = futures_util::future::try_join(client, backend).await?;
    let mut client = TokioIo::new(client);
    let mut backend = TokioIo::new(backend);
    tokio::io::copy_bidirectional(&mut client, &mut backend).await?;
    Ok(())
}

/// Connect failures, resets and timeouts are the backend being unreachable;
/// a response hyper cannot parse is a protocol error.
fn classify(target: &ProxyTarget, err: &hyper_util::client::legacy::Error) -> ProxyError {
    let malformed = err
        .source()
        .and_then(|source| source.downcast_ref::<hyper::Error>())
        .map(|e| e.is_parse() || e.is_parse_status())
        .unwrap_or(false);

    let reason = match err.source() {
        Some(source) => format!("{}: {}", err, source),
        None => err.to_string(),
    };

    if malformed && !err.is_connect() {
        error!("Malformed response from backend {}: {}", target, reason);
        ProxyError::BackendProtocol {
            target: target.to_string(),
            reason,
        }
    } else {
        error!("Failed to reach backend {}: {}", target, reason);
        ProxyError::BackendUnreachable {
            target: target.to_string(),
            reason,
        }
    }
}

/// Value of `Upgrade` when the request also lists it in `Connection`
fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    if wants_upgrade {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn add_forwarded_headers(headers: &mut HeaderMap, original_host: &str, ctx: ForwardContext) {
    let client_ip = ctx.remote_addr.ip().to_string();
    let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{}, {}", prior, client_ip),
        None => client_ip,
    };

    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }
    if let Ok(value) = HeaderValue::from_str(original_host) {
        headers.insert("x-forwarded-host", value);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
    headers.insert("x-forwarded-port", HeaderValue::from(ctx.listen_port));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-session-hint"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-session-hint", HeaderValue::from_static("abc"));
        headers.insert("x-request-id", HeaderValue::from_static("42"));
        headers.insert(HOST, HeaderValue::from_static("example1.com"));

        strip_hop_by_hop(&mut headers);

        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("x-session-hint").is_none());
        assert_eq!(headers.get("x-request-id").unwrap(), "42");
        assert_eq!(headers.get(HOST).unwrap(), "example1.com");
    }

    #[test]
    fn test_upgrade_protocol() {
        let mut headers = HeaderMap::new();
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(upgrade_protocol(&headers).is_none());

        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert_eq!(upgrade_protocol(&headers).unwrap(), "websocket");
    }

    #[test]
    fn test_forwarded_headers_append_client_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        let ctx = ForwardContext {
            remote_addr: "192.168.1.20:50000".parse().unwrap(),
            listen_port: 443,
        };

        add_forwarded_headers(&mut headers, "example1.com", ctx);

        assert_eq!(headers.get("x-forwarded-for").unwrap(), "10.0.0.1, 192.168.1.20");
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "example1.com");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
        assert_eq!(headers.get("x-forwarded-port").unwrap(), "443");
    }
}

//! Host-based routing
//! Maps the Host header of a request to the backend that serves it

use crate::error::{ProxyError, Result};
use hyper::header::HOST;
use hyper::{Request, Uri};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use url::Url;

const HTTP_PREFIX: &str = "http://";
const HTTPS_PREFIX: &str = "https://";

const DEFAULT_DOMAIN_MAP: &str = "example1.com=http://127.0.0.1:8081,example2.com=http://127.0.0.1:8082";

/// A validated absolute backend URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    url: Url,
}

impl ProxyTarget {
    /// Parse a backend URL, assuming `http://` when no scheme is given
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let normalized = if Self::has_scheme(raw) {
            raw.to_string()
        } else {
            format!("{}{}", HTTP_PREFIX, raw)
        };

        let url = Url::parse(&normalized)
            .map_err(|e| ProxyError::Config(format!("invalid backend URL '{}': {}", raw, e)))?;

        if url.host_str().is_none() {
            return Err(ProxyError::Config(format!("backend URL '{}' has no host", raw)));
        }

        Ok(Self { url })
    }

    /// Whether a raw backend string already names http or https
    pub fn has_scheme(raw: &str) -> bool {
        raw.starts_with(HTTP_PREFIX) || raw.starts_with(HTTPS_PREFIX)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// `host[:port]` as it appears in the backend URL
    pub fn authority(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Point an incoming request URI at this backend.
    ///
    /// The backend path prefix and the request path are joined by exactly
    /// one slash; backend and request query strings are joined with `&`.
    pub fn rewrite_uri(&self, incoming: &Uri) -> Result<Uri> {
        let path = join_paths(self.url.path(), incoming.path());

        let query = match (self.url.query().unwrap_or(""), incoming.query().unwrap_or("")) {
            ("", request) => request.to_string(),
            (target, "") => target.to_string(),
            (target, request) => format!("{}&{}", target, request),
        };

        let mut uri = format!("{}://{}{}", self.scheme(), self.authority(), path);
        if !query.is_empty() {
            uri.push('?');
            uri.push_str(&query);
        }

        uri.parse()
            .map_err(|e| ProxyError::Config(format!("cannot build backend URI '{}': {}", uri, e)))
    }
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Ordered hostname → backend pairs with unique hosts
#[derive(Debug, Clone, Default)]
pub struct DomainMapping {
    entries: Vec<(String, ProxyTarget)>,
    index: HashMap<String, usize>,
}

impl DomainMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mapping used when no `--domain-map` is configured
    pub fn defaults() -> Result<Self> {
        Self::parse(DEFAULT_DOMAIN_MAP)
    }

    /// Parse `host=url,host=url`
    pub fn parse(raw: &str) -> Result<Self> {
        let mut mapping = Self::new();

        for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (host, backend) = pair
                .split_once('=')
                .ok_or_else(|| ProxyError::Config(format!("invalid domain mapping: {}", pair)))?;

            let host = host.trim();
            if host.is_empty() {
                return Err(ProxyError::Config(format!("invalid domain mapping: {}", pair)));
            }

            mapping.insert(host, ProxyTarget::parse(backend)?)?;
        }

        Ok(mapping)
    }

    /// Add a pair; a host may appear only once
    pub fn insert(&mut self, host: impl Into<String>, target: ProxyTarget) -> Result<()> {
        let host = host.into();
        if self.index.contains_key(&host) {
            return Err(ProxyError::Config(format!("duplicate domain mapping for {}", host)));
        }

        self.index.insert(host.clone(), self.entries.len());
        self.entries.push((host, target));
        Ok(())
    }

    pub fn get(&self, host: &str) -> Option<&ProxyTarget> {
        self.index.get(host).map(|&i| &self.entries[i].1)
    }

    pub fn contains(&self, host: &str) -> bool {
        self.index.contains_key(host)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ProxyTarget)> {
        self.entries.iter().map(|(host, target)| (host.as_str(), target))
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(host, _)| host.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolves Host headers against an immutable, shared [`DomainMapping`]
#[derive(Debug, Clone)]
pub struct DomainRouter {
    mapping: Arc<DomainMapping>,
}

impl DomainRouter {
    pub fn new(mapping: DomainMapping) -> Self {
        Self {
            mapping: Arc::new(mapping),
        }
    }

    /// Exact, case-sensitive lookup. No wildcard, suffix or default match.
    pub fn resolve_backend(&self, host: &str) -> Result<&ProxyTarget> {
        self.mapping
            .get(host)
            .ok_or_else(|| ProxyError::UnknownHost(host.to_string()))
    }

    pub fn mapping(&self) -> &DomainMapping {
        &self.mapping
    }
}

/// Host the client asked for: the Host header, or the URI authority for HTTP/2
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> DomainRouter {
        DomainRouter::new(DomainMapping::parse("example1.com=http://127.0.0.1:8081").unwrap())
    }

    #[test]
    fn test_resolve_known_host() {
        let router = router();
        let target = router.resolve_backend("example1.com").unwrap();
        assert_eq!(target.authority(), "127.0.0.1:8081");
        assert_eq!(target.scheme(), "http");
    }

    #[test]
    fn test_resolve_is_exact_and_case_sensitive() {
        let router = router();
        for host in ["unknown.com", "EXAMPLE1.COM", "www.example1.com", "example1.com:443", "com"] {
            match router.resolve_backend(host) {
                Err(ProxyError::UnknownHost(h)) => assert_eq!(h, host),
                other => panic!("expected UnknownHost for {}, got {:?}", host, other),
            }
        }
    }

    #[test]
    fn test_parse_domain_map() {
        let mapping = DomainMapping::parse(
            "example1.com=http://127.0.0.1:8081, example2.com=127.0.0.1:8082,",
        )
        .unwrap();

        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping.hosts().collect::<Vec<_>>(), vec!["example1.com", "example2.com"]);
        assert_eq!(
            mapping.get("example2.com").unwrap().url().as_str(),
            "http://127.0.0.1:8082/"
        );
    }

    #[test]
    fn test_parse_domain_map_rejects_bad_pairs() {
        assert!(matches!(DomainMapping::parse("example.com"), Err(ProxyError::Config(_))));
        assert!(matches!(DomainMapping::parse("=http://a"), Err(ProxyError::Config(_))));
        assert!(matches!(
            DomainMapping::parse("a.com=http://1.1.1.1,a.com=http://2.2.2.2"),
            Err(ProxyError::Config(_))
        ));
        assert!(matches!(DomainMapping::parse("a.com=http://"), Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_defaults() {
        let mapping = DomainMapping::defaults().unwrap();
        assert!(mapping.contains("example1.com"));
        assert!(mapping.contains("example2.com"));
        assert_eq!(mapping.len(), 2);
    }

    #[test]
    fn test_rewrite_uri_joins_paths_and_queries() {
        let target = ProxyTarget::parse("http://127.0.0.1:8081").unwrap();
        let uri: Uri = "/foo?q=1".parse().unwrap();
        assert_eq!(
            target.rewrite_uri(&uri).unwrap().to_string(),
            "http://127.0.0.1:8081/foo?q=1"
        );

        let target = ProxyTarget::parse("https://api.internal/v1/?key=abc").unwrap();
        let uri: Uri = "/users?id=7".parse().unwrap();
        assert_eq!(
            target.rewrite_uri(&uri).unwrap().to_string(),
            "https://api.internal/v1/users?key=abc&id=7"
        );

        let target = ProxyTarget::parse("http://backend:9000/base").unwrap();
        let uri: Uri = "/".parse().unwrap();
        assert_eq!(target.rewrite_uri(&uri).unwrap().to_string(), "http://backend:9000/base/");
    }

    #[test]
    fn test_join_paths() {
        assert_eq!(join_paths("/", "/a"), "/a");
        assert_eq!(join_paths("/base", "a"), "/base/a");
        assert_eq!(join_paths("/base/", "a"), "/base/a");
        assert_eq!(join_paths("/base", "/a"), "/base/a");
    }

    #[test]
    fn test_request_host_prefers_header() {
        let req = Request::builder()
            .uri("https://example2.com/x")
            .header(HOST, "example1.com")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("example1.com"));

        let req = Request::builder().uri("https://example2.com/x").body(()).unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("example2.com"));

        let req = Request::builder().uri("/x").body(()).unwrap();
        assert_eq!(request_host(&req), None);
    }
}

//! Host router
//! Canonicalises the Host header, intercepts reserved paths and dispatches to a site's backend

use crate::proxy::{empty_response, redirect_response, text_response, Dispatcher, ProxyBody};
use crate::registry::{Site, SiteRegistry};
use crate::visits::{VisitLogger, VisitRecord};
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::{Request, Response, StatusCode, Uri};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Path suffix of the browser beacon used to tell real visits from bots
pub const PING_SUFFIX: &str = "/____reserved/_ping";

/// Path suffix answered locally with [`ROBOTS_BODY`]
pub const ROBOTS_SUFFIX: &str = "/robots.txt";

pub const ROBOTS_BODY: &str = "User-agent: *\nDisallow:";

/// Default prefix every canonical host carries
pub const DEFAULT_CANONICAL_PREFIX: &str = "www.";

/// Errors produced while building the canonical-host policy
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("invalid host rewrite rule {0:?}, expected \"matcher=target\"")]
    Malformed(String),

    #[error("host rewrite target {0} is not canonical itself")]
    NonCanonicalTarget(String),
}

/// Scheme clients are redirected to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Rewrites any host equal to `matcher`, or a subdomain of it, to `target`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRule {
    pub matcher: String,
    pub target: String,
}

impl CanonicalRule {
    pub fn new(matcher: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            matcher: matcher.into().to_ascii_lowercase(),
            target: target.into().to_ascii_lowercase(),
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        host == self.matcher
            || host
                .strip_suffix(self.matcher.as_str())
                .is_some_and(|rest| rest.ends_with('.'))
    }

    /// Parse `"old.com=www.new.com,other.net=www.other.org"`. An empty spec
    /// yields no rules.
    pub fn parse_list(spec: &str) -> Result<Vec<Self>, RuleError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(Vec::new());
        }

        spec.split(',')
            .map(|rule| match rule.split('=').map(str::trim).collect::<Vec<_>>().as_slice() {
                [matcher, target] if !matcher.is_empty() && !target.is_empty() => {
                    Ok(Self::new(*matcher, *target))
                }
                _ => Err(RuleError::Malformed(rule.trim().to_string())),
            })
            .collect()
    }
}

/// Ordered canonical-host rules. The first matching rule decides; when none
/// matches, a host without the prefix gets it prepended.
#[derive(Debug, Clone)]
pub struct CanonicalPolicy {
    prefix: String,
    rules: Vec<CanonicalRule>,
}

impl CanonicalPolicy {
    /// Every rule target must already be canonical, so redirecting twice
    /// lands on the same URL.
    pub fn new(prefix: impl Into<String>, rules: Vec<CanonicalRule>) -> Result<Self, RuleError> {
        let policy = Self {
            prefix: prefix.into().to_ascii_lowercase(),
            rules,
        };

        if let Some(rule) = policy
            .rules
            .iter()
            .find(|r| policy.canonical_host(&r.target).is_some())
        {
            return Err(RuleError::NonCanonicalTarget(rule.target.clone()));
        }

        Ok(policy)
    }

    /// `www.` prefix, no rewrite rules
    pub fn prefix_only() -> Self {
        Self {
            prefix: DEFAULT_CANONICAL_PREFIX.to_string(),
            rules: Vec::new(),
        }
    }

    /// The host clients should be redirected to, or `None` if `host` is
    /// already canonical
    pub fn canonical_host(&self, host: &str) -> Option<String> {
        if let Some(rule) = self.rules.iter().find(|r| r.matches(host)) {
            return (host != rule.target).then(|| rule.target.clone());
        }

        if host.starts_with(&self.prefix) {
            None
        } else {
            Some(format!("{}{}", self.prefix, host))
        }
    }

    /// Registry domain for a canonical host
    pub fn strip_prefix<'a>(&self, host: &'a str) -> &'a str {
        host.strip_prefix(self.prefix.as_str()).unwrap_or(host)
    }
}

/// Lowercase a Host header value and drop any `:port` suffix
pub fn normalize_host(raw: &str) -> String {
    strip_port(raw.trim()).to_ascii_lowercase()
}

/// Host part of `host[:port]`. Bracketed IPv6 literals keep their brackets;
/// a bare IPv6 address has no port to strip.
pub(crate) fn strip_port(addr: &str) -> &str {
    if addr.starts_with('[') {
        return match addr.find(']') {
            Some(end) => &addr[..=end],
            None => addr,
        };
    }

    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    }
}

/// What to do with a request
#[derive(Debug, PartialEq, Eq)]
pub enum Route<'a> {
    /// 301 to this absolute URL
    Redirect(String),
    /// Answer 200 and record a website visit
    Ping,
    /// Answer with the fixed robots.txt body
    Robots,
    /// Forward to this site's backend
    Proxy(&'a Site),
    /// No site registered for the host
    Miss,
}

/// Routes every request on the site-serving listener
pub struct HostRouter {
    registry: Arc<SiteRegistry>,
    policy: CanonicalPolicy,
    scheme: Scheme,
    dispatcher: Dispatcher,
    visits: VisitLogger,
}

impl HostRouter {
    pub fn new(
        registry: Arc<SiteRegistry>,
        policy: CanonicalPolicy,
        scheme: Scheme,
        proxy_timeout: Duration,
        visits: VisitLogger,
    ) -> Self {
        Self {
            registry,
            policy,
            scheme,
            dispatcher: Dispatcher::new(proxy_timeout, scheme.as_str()),
            visits,
        }
    }

    /// Decide a request's fate from its normalised host and target.
    /// Canonicalisation runs first, then the registry lookup, then the
    /// reserved paths.
    pub fn decide<'a>(&'a self, host: &str, uri: &Uri) -> Route<'a> {
        if let Some(canonical) = self.policy.canonical_host(host) {
            return Route::Redirect(self.location(&canonical, uri));
        }

        let site = match self.registry.get(self.policy.strip_prefix(host)) {
            Some(site) => site,
            None => return Route::Miss,
        };

        let path = uri.path();
        if path.ends_with(PING_SUFFIX) {
            Route::Ping
        } else if path.ends_with(ROBOTS_SUFFIX) {
            Route::Robots
        } else {
            Route::Proxy(site)
        }
    }

    /// Handle one request end to end
    pub async fn handle(&self, req: Request<Incoming>, remote_addr: SocketAddr) -> Response<ProxyBody> {
        let host = match request_host(&req) {
            Some(h) => normalize_host(&h),
            None => return text_response(StatusCode::BAD_REQUEST, "Missing Host header"),
        };

        debug!("{} {}{} from {}", req.method(), host, req.uri().path(), remote_addr);

        let route = self.decide(&host, req.uri());
        match route {
            Route::Redirect(location) => redirect_response(&location),
            Route::Miss => {
                warn!("No site registered for host {}", host);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
            Route::Ping => {
                let path = req.uri().path();
                let page = path.strip_suffix(PING_SUFFIX).unwrap_or(path);
                self.visits.record(VisitRecord::website_visit(
                    self.visit_url(&host, page),
                    &remote_addr.to_string(),
                ));
                empty_response(StatusCode::OK)
            }
            Route::Robots => text_response(StatusCode::OK, ROBOTS_BODY),
            Route::Proxy(site) => {
                let url = self.visit_url(&host, req.uri().path());
                let forwarded = self.dispatcher.forward(site, req, remote_addr).await;

                if forwarded.reached_backend {
                    self.visits.record(VisitRecord::page(
                        url,
                        &remote_addr.to_string(),
                        forwarded.elapsed.as_millis() as u64,
                    ));
                }

                forwarded.response
            }
        }
    }

    fn location(&self, host: &str, uri: &Uri) -> String {
        let mut location = format!("{}://{}{}", self.scheme.as_str(), host, uri.path());
        if let Some(query) = uri.query().filter(|q| !q.is_empty()) {
            location.push('?');
            location.push_str(query);
        }
        location
    }

    fn visit_url(&self, host: &str, path: &str) -> String {
        format!("{}{}", self.policy.strip_prefix(host), path)
    }
}

/// Host header, or the authority of an absolute-form target
pub(crate) fn request_host<T>(req: &Request<T>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .filter(|h| !h.is_empty())
}

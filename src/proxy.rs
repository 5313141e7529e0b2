//! Reverse proxy dispatcher
//! Forwards a request to a site's backend on localhost and streams the response back

use crate::registry::Site;
use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, HOST, LOCATION};
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

/// Body type used for every response the router produces
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Headers that only apply to a single connection (RFC 7230 section 6.1)
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A response plus how long the backend took to produce it.
/// `reached_backend` is false when the response was synthesised locally.
pub struct Forwarded {
    pub response: Response<ProxyBody>,
    pub elapsed: Duration,
    pub reached_backend: bool,
}

/// Forwards requests to `http://127.0.0.1:<port>`.
///
/// One connection per request, no retries. `timeout` bounds the connect and
/// the wait for the response head; the body is streamed afterwards.
#[derive(Clone)]
pub struct Dispatcher {
    timeout: Duration,
    forwarded_proto: &'static str,
}

impl Dispatcher {
    pub fn new(timeout: Duration, forwarded_proto: &'static str) -> Self {
        Self {
            timeout,
            forwarded_proto,
        }
    }

    /// Forward `req` to the site's backend. Transport failures become
    /// `502 Bad Gateway`, an elapsed timeout becomes `504 Gateway Timeout`.
    pub async fn forward(
        &self,
        site: &Site,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Forwarded {
        let started = Instant::now();
        let backend = site.backend_authority();

        let (response, reached_backend) =
            match tokio::time::timeout(self.timeout, self.send(&backend, req, remote_addr)).await {
                Ok(Ok(response)) => (response, true),
                Ok(Err(e)) => {
                    error!("Backend {} for {} failed: {:#}", backend, site.domain, e);
                    (text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"), false)
                }
                Err(_) => {
                    warn!("Backend {} for {} timed out after {:?}", backend, site.domain, self.timeout);
                    (text_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout"), false)
                }
            };

        Forwarded {
            response,
            elapsed: started.elapsed(),
            reached_backend,
        }
    }

    async fn send(
        &self,
        backend: &str,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>> {
        debug!("Proxying {} {} to {}", req.method(), req.uri(), backend);

        let stream = TcpStream::connect(backend)
            .await
            .with_context(|| format!("Failed to connect to backend {}", backend))?;

        let proxy_req = self.build_backend_request(req, remote_addr)?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .context("Failed to establish connection to backend")?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Backend connection error: {}", e);
            }
        });

        let response = sender
            .send_request(proxy_req)
            .await
            .context("Failed to send request to backend")?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Rewrite an inbound request into one addressed at the backend: origin-form
    /// target, original method, headers and body, plus forwarding headers.
    fn build_backend_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Request<Incoming>> {
        let (mut parts, body) = req.into_parts();

        let target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = target.parse::<Uri>().context("Invalid URI")?;
        parts.version = Version::HTTP_11;

        let original_host = parts.headers.get(HOST).cloned();
        strip_hop_by_hop(&mut parts.headers);

        let headers = &mut parts.headers;
        let forwarded_for = forwarded_for(headers, &remote_addr.ip().to_string());
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_str(&forwarded_for)?);
        if let Some(host) = original_host {
            headers.insert("x-forwarded-host", host);
        }
        headers.insert(
            "x-forwarded-proto",
            HeaderValue::from_static(self.forwarded_proto),
        );

        Ok(Request::from_parts(parts, body))
    }
}

/// Client address appended to any `X-Forwarded-For` chain already present
fn forwarded_for(headers: &HeaderMap, client_ip: &str) -> String {
    let mut chain: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect();
    chain.push(client_ip);
    chain.join(", ")
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Create text response
pub fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("text/plain"));
    response
}

/// Create empty response
pub fn empty_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response
}

/// Create a 301 redirect. A location that is not a valid header value
/// cannot be redirected to and yields `400 Bad Request`.
pub fn redirect_response(location: &str) -> Response<ProxyBody> {
    match HeaderValue::from_str(location) {
        Ok(value) => {
            let mut response = empty_response(StatusCode::MOVED_PERMANENTLY);
            response.headers_mut().insert(LOCATION, value);
            response
        }
        Err(_) => text_response(StatusCode::BAD_REQUEST, "Bad Request"),
    }
}

/// Create full body
pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

/// Create empty body
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

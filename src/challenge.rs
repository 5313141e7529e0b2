//! ACME challenge server
//! Serves HTTP-01 challenge files from disk and redirects plaintext traffic to HTTPS

use crate::proxy::{full_body, redirect_response, text_response, ProxyBody};
use crate::router::{normalize_host, request_host};
use bytes::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Request paths under this prefix are answered from the challenge directory
pub const WELL_KNOWN_PREFIX: &str = "/.well-known/";

/// Serves files the renewal client drops into the challenge directory.
/// `/.well-known/acme-challenge/<token>` maps to `<dir>/acme-challenge/<token>`.
#[derive(Debug, Clone)]
pub struct ChallengeServer {
    dir: PathBuf,
}

impl ChallengeServer {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn is_challenge_path(path: &str) -> bool {
        path.starts_with(WELL_KNOWN_PREFIX)
    }

    /// File backing a well-known request path. `None` for paths outside the
    /// prefix, bare directories, and anything trying to climb out of the
    /// challenge directory.
    pub fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = path.strip_prefix(WELL_KNOWN_PREFIX)?;

        let mut file = self.dir.clone();
        let mut depth = 0;
        for segment in relative.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return None,
                s if s.contains('\\') => return None,
                s => {
                    file.push(s);
                    depth += 1;
                }
            }
        }

        (depth > 0).then_some(file)
    }

    /// Answer a well-known request from disk
    pub async fn serve(&self, path: &str) -> Response<ProxyBody> {
        let Some(file) = self.resolve(path) else {
            return text_response(StatusCode::NOT_FOUND, "Not Found");
        };

        match tokio::fs::read(&file).await {
            Ok(contents) => {
                info!("Served challenge file {}", file.display());
                let mut response = Response::new(full_body(Bytes::from(contents)));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
                response
            }
            Err(e) => {
                debug!("Challenge file {} not served: {}", file.display(), e);
                text_response(StatusCode::NOT_FOUND, "Not Found")
            }
        }
    }
}

/// `https://` location for the same host (without port), path and query
pub fn https_location<T>(req: &Request<T>) -> Option<String> {
    let host = request_host(req)?;

    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Some(format!("https://{}{}", normalize_host(&host), target))
}

/// 301 to the HTTPS equivalent of the request
pub fn redirect_to_https<T>(req: &Request<T>) -> Response<ProxyBody> {
    match https_location(req) {
        Some(location) => redirect_response(&location),
        None => text_response(StatusCode::BAD_REQUEST, "Missing Host header"),
    }
}

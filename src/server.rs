//! Edge server
//! Owns the listeners: port 80 for challenges and redirects, port 443 for TLS,
//! or a single plain development port

use crate::challenge::{redirect_to_https, ChallengeServer};
use crate::proxy::ProxyBody;
use crate::router::{HostRouter, Scheme};
use crate::shutdown::Shutdown;
use anyhow::{anyhow, Context, Result};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Listener ports
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub http_port: u16,
    pub https_port: u16,
    pub dev_port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_port: 80,
            https_port: 443,
            dev_port: 8888,
        }
    }
}

/// How the instance serves traffic this run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Plain HTTP on the development port, no certificates, no port 80
    LocalDev,
    /// Port 80 only: challenges plus routing, because a certificate is missing
    HttpOnly,
    /// Port 80 for challenges and redirects, port 443 for routing
    Https,
}

impl Mode {
    pub fn select(local_dev: bool, tls_available: bool) -> Self {
        match (local_dev, tls_available) {
            (true, _) => Mode::LocalDev,
            (false, false) => Mode::HttpOnly,
            (false, true) => Mode::Https,
        }
    }

    /// Scheme canonical redirects point at
    pub fn scheme(&self) -> Scheme {
        match self {
            Mode::Https => Scheme::Https,
            Mode::LocalDev | Mode::HttpOnly => Scheme::Http,
        }
    }
}

/// Which handler a listener feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    /// Port 80: challenge files first, then redirect or route
    Plaintext,
    /// Site-serving listener: everything goes to the host router
    Sites,
}

/// Edge server
pub struct ProxyServer {
    config: ProxyConfig,
    router: Arc<HostRouter>,
    challenges: ChallengeServer,
    tls: Option<TlsAcceptor>,
    mode: Mode,
}

impl ProxyServer {
    /// `tls` is ignored in local-development mode
    pub fn new(
        config: ProxyConfig,
        router: Arc<HostRouter>,
        challenges: ChallengeServer,
        tls: Option<TlsAcceptor>,
        local_dev: bool,
    ) -> Self {
        let mode = Mode::select(local_dev, tls.is_some());
        Self {
            config,
            router,
            challenges,
            tls,
            mode,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Bind the listeners for this mode and serve until `shutdown` fires.
    /// Failing to bind is fatal; in-flight connections are not drained.
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) -> Result<()> {
        match self.mode {
            Mode::LocalDev => {
                let listener = bind(self.config.dev_port).await?;
                info!("Starting HTTP server on :{} (local development)", self.config.dev_port);
                self.accept_loop(listener, None, Entry::Sites, shutdown).await
            }
            Mode::HttpOnly => {
                let listener = bind(self.config.http_port).await?;
                warn!(
                    "Skipping HTTPS server start as not every certificate loaded; serving HTTP on :{}",
                    self.config.http_port
                );
                self.accept_loop(listener, None, Entry::Plaintext, shutdown).await
            }
            Mode::Https => {
                let plaintext = bind(self.config.http_port).await?;
                let secure = bind(self.config.https_port).await?;
                info!("Starting HTTP server on :{}", self.config.http_port);
                info!("Starting HTTPS server on :{}", self.config.https_port);

                tokio::try_join!(
                    self.clone()
                        .accept_loop(plaintext, None, Entry::Plaintext, shutdown.clone()),
                    self.clone()
                        .accept_loop(secure, self.tls.clone(), Entry::Sites, shutdown),
                )?;
                Ok(())
            }
        }
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
        entry: Entry,
        mut shutdown: Shutdown,
    ) -> Result<()> {
        let local_addr = listener.local_addr()?;

        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Listener on {} stopped", local_addr);
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept error on {}: {}", local_addr, e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };

            let server = self.clone();
            let tls = tls.clone();

            tokio::spawn(async move {
                let result = match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => server.serve_connection(stream, remote_addr, entry).await,
                        Err(e) => Err(anyhow!("TLS handshake failed: {}", e)),
                    },
                    None => server.serve_connection(stream, remote_addr, entry).await,
                };

                if let Err(e) = result {
                    debug!("Connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single connection
    async fn serve_connection<S>(
        self: Arc<Self>,
        stream: S,
        remote_addr: SocketAddr,
        entry: Entry,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let server = self.clone();
                    async move {
                        Ok::<_, Infallible>(server.handle_request(req, remote_addr, entry).await)
                    }
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        entry: Entry,
    ) -> Response<ProxyBody> {
        match entry {
            Entry::Sites => self.router.handle(req, remote_addr).await,
            Entry::Plaintext => {
                let path = req.uri().path().to_string();
                if ChallengeServer::is_challenge_path(&path) {
                    return self.challenges.serve(&path).await;
                }

                match self.mode {
                    Mode::Https => redirect_to_https(&req),
                    Mode::HttpOnly | Mode::LocalDev => self.router.handle(req, remote_addr).await,
                }
            }
        }
    }
}

async fn bind(port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))
}

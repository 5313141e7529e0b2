//! Edge Router - Main entry point
//!
//! Terminates TLS for every configured domain and forwards traffic to local backends

use anyhow::Result;
use clap::Parser;
use edge_router::router::DEFAULT_CANONICAL_PREFIX;
use edge_router::shutdown::wait_for_signal;
use edge_router::{
    AnalyticsConfig, CanonicalPolicy, CanonicalRule, CertificateLoader, ChallengeServer,
    HostRouter, Mode, ProxyConfig, ProxyServer, ShutdownCoordinator, SiteRegistry, VisitLogger,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Edge Router - multi-tenant TLS edge with Host-based dispatch
#[derive(Parser, Debug)]
#[command(name = "edge-router")]
#[command(author = "Edge Router Contributors")]
#[command(version)]
#[command(about = "Multi-tenant TLS edge router with Host-based dispatch")]
struct Args {
    /// Domain to backend port mapping: "domain1:port1,domain2:port2"
    #[arg(long, env = "DOMAINS_TO_PORTS")]
    domains_to_ports: String,

    /// Serve plain HTTP on the development port and skip certificates
    #[arg(long, env = "LOCAL_DEV", default_value = "false")]
    local_dev: bool,

    /// Analytics endpoint base URL; visit logging is disabled when unset
    #[arg(long, env = "SQLITE_URL")]
    analytics_url: Option<String>,

    /// Root directory holding <domain>/fullchain.pem and <domain>/privkey.pem
    #[arg(long, env = "CERT_ROOT", default_value = "/etc/letsencrypt/live")]
    cert_root: PathBuf,

    /// Directory served under /.well-known/ on the HTTP port
    #[arg(long, env = "CHALLENGE_DIR", default_value = "/home/ubuntu/.well-known")]
    challenge_dir: PathBuf,

    /// HTTP port (challenges and redirects)
    #[arg(long, env = "HTTP_PORT", default_value = "80")]
    http_port: u16,

    /// HTTPS port
    #[arg(long, env = "HTTPS_PORT", default_value = "443")]
    https_port: u16,

    /// Port used in local development mode
    #[arg(long, env = "DEV_PORT", default_value = "8888")]
    dev_port: u16,

    /// Prefix every canonical host carries
    #[arg(long, env = "CANONICAL_PREFIX", default_value = DEFAULT_CANONICAL_PREFIX)]
    canonical_prefix: String,

    /// Ordered canonical host rewrites: "old.com=www.new.com,..."
    #[arg(long, env = "HOST_REWRITES", default_value = "")]
    host_rewrites: String,

    /// Marker file written on shutdown
    #[arg(long, env = "CLEANUP_FILE", default_value = "cleanup.txt")]
    cleanup_file: PathBuf,

    /// Seconds to wait for a backend to connect and answer
    #[arg(long, env = "PROXY_TIMEOUT_SECS", default_value = "30")]
    proxy_timeout_secs: u64,

    /// Seconds allowed for each analytics request
    #[arg(long, env = "ANALYTICS_TIMEOUT_SECS", default_value = "5")]
    analytics_timeout_secs: u64,

    /// Seconds to wait for listeners to stop after a signal
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value = "5")]
    shutdown_grace_secs: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting edge-router v{}", env!("CARGO_PKG_VERSION"));

    // Configuration errors abort before any listener binds
    let registry = Arc::new(SiteRegistry::load(&args.domains_to_ports)?);
    for site in registry.sites() {
        info!("Domain: {}, Port: {}", site.domain, site.backend_port);
    }

    let rules = CanonicalRule::parse_list(&args.host_rewrites)?;
    let policy = CanonicalPolicy::new(args.canonical_prefix.as_str(), rules)?;

    let coordinator = ShutdownCoordinator::new(
        &args.cleanup_file,
        Duration::from_secs(args.shutdown_grace_secs),
    );

    let tls = if args.local_dev {
        None
    } else {
        load_tls(&args.cert_root, &registry)
    };
    let mode = Mode::select(args.local_dev, tls.is_some());
    info!("Serving mode: {:?}", mode);

    let visits = start_visit_logger(&args, &coordinator);

    let router = Arc::new(HostRouter::new(
        registry,
        policy,
        mode.scheme(),
        Duration::from_secs(args.proxy_timeout_secs),
        visits,
    ));

    let config = ProxyConfig {
        http_port: args.http_port,
        https_port: args.https_port,
        dev_port: args.dev_port,
    };

    let server = Arc::new(ProxyServer::new(
        config,
        router,
        ChallengeServer::new(&args.challenge_dir),
        tls,
        args.local_dev,
    ));

    let mut server_task = tokio::spawn(server.run(coordinator.subscribe()));

    tokio::select! {
        result = &mut server_task => {
            return result?;
        }
        signal = wait_for_signal() => {
            info!("Received signal: {}", signal?);
            coordinator.trigger();

            match tokio::time::timeout(coordinator.grace(), server_task).await {
                Ok(Ok(Err(e))) => warn!("Server stopped with error: {:#}", e),
                Ok(Err(e)) => warn!("Server task failed: {}", e),
                Err(_) => warn!("Listeners did not stop within {:?}", coordinator.grace()),
                Ok(Ok(Ok(()))) => {}
            }
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Load every domain's certificate; `None` means HTTP-only for this run
fn load_tls(cert_root: &Path, registry: &SiteRegistry) -> Option<TlsAcceptor> {
    CertificateLoader::new(cert_root)
        .load_all(registry.domains())
        .acceptor_for_run()
}

fn start_visit_logger(args: &Args, coordinator: &ShutdownCoordinator) -> VisitLogger {
    let endpoint = match args.analytics_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => url.to_string(),
        _ => {
            warn!("SQLITE_URL is not set, visit logging disabled");
            return VisitLogger::disabled();
        }
    };

    let config = AnalyticsConfig {
        endpoint,
        timeout: Duration::from_secs(args.analytics_timeout_secs),
    };

    match VisitLogger::spawn(config, coordinator.subscribe()) {
        Ok(logger) => logger,
        Err(e) => {
            error!("Visit logging disabled: {:#}", e);
            VisitLogger::disabled()
        }
    }
}

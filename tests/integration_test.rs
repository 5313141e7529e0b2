//! Integration tests for the edge router
//!
//! Tests the full request path including:
//! - Host-based proxying and canonical redirects
//! - Reserved paths (ping beacon, robots.txt)
//! - Visit analytics delivery
//! - HTTP-only fallback and the TLS listener
//! - Shutdown

use bytes::Bytes;
use edge_router::{
    AnalyticsConfig, CanonicalPolicy, CertificateLoader, ChallengeServer, HostRouter, Mode,
    ProxyConfig, ProxyServer, ShutdownCoordinator, SiteRegistry, VisitLogger,
};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use rcgen::generate_simple_self_signed;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::time::sleep;
use tokio_rustls::TlsAcceptor;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// Counter for unique port allocation
static PORT_COUNTER: AtomicU16 = AtomicU16::new(21000);

fn get_unique_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Simple backend server for testing
async fn run_backend_server(
    port: u16,
    response_body: &'static str,
) -> tokio::task::JoinHandle<()> {
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let listener = TcpListener::bind(addr).await.unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| async move {
                    let header = |name: &str| {
                        req.headers()
                            .get(name)
                            .and_then(|h| h.to_str().ok())
                            .unwrap_or("none")
                            .to_string()
                    };

                    let response_text = format!(
                        "{}|method={}|path={}|query={}|host={}|xff={}|xfp={}",
                        response_body,
                        req.method(),
                        req.uri().path(),
                        req.uri().query().unwrap_or(""),
                        header("host"),
                        header("x-forwarded-for"),
                        header("x-forwarded-proto"),
                    );

                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(200)
                            .header("x-backend", response_body)
                            .body(Full::new(Bytes::from(response_text)))
                            .unwrap(),
                    )
                });

                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    })
}

struct TestEdge {
    config: ProxyConfig,
    coordinator: ShutdownCoordinator,
    server: Arc<ProxyServer>,
}

/// Create test edge server
fn setup_edge(
    registry_spec: &str,
    local_dev: bool,
    tls: Option<TlsAcceptor>,
    challenge_dir: &Path,
    analytics_url: Option<String>,
) -> TestEdge {
    let dir = challenge_dir.to_path_buf();
    let coordinator = ShutdownCoordinator::new(dir.join("cleanup.txt"), Duration::from_secs(1));

    let config = ProxyConfig {
        http_port: get_unique_port(),
        https_port: get_unique_port(),
        dev_port: get_unique_port(),
    };

    let visits = match analytics_url {
        Some(endpoint) => VisitLogger::spawn(
            AnalyticsConfig {
                endpoint,
                timeout: Duration::from_secs(1),
            },
            coordinator.subscribe(),
        )
        .unwrap(),
        None => VisitLogger::disabled(),
    };

    let mode = Mode::select(local_dev, tls.is_some());
    let router = Arc::new(HostRouter::new(
        Arc::new(SiteRegistry::load(registry_spec).unwrap()),
        CanonicalPolicy::prefix_only(),
        mode.scheme(),
        Duration::from_secs(2),
        visits,
    ));

    let server = Arc::new(ProxyServer::new(
        config.clone(),
        router,
        ChallengeServer::new(challenge_dir),
        tls,
        local_dev,
    ));

    TestEdge {
        config,
        coordinator,
        server,
    }
}

impl TestEdge {
    async fn start(&self) {
        let server = self.server.clone();
        let shutdown = self.coordinator.subscribe();
        tokio::spawn(async move {
            let _ = server.run(shutdown).await;
        });

        // Wait for listeners to bind
        sleep(Duration::from_millis(150)).await;
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

async fn mock_analytics() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/execute"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

/// Wait until the sink has seen `count` requests and return their JSON bodies
async fn received_commands(server: &MockServer, count: usize) -> Vec<serde_json::Value> {
    for _ in 0..40 {
        let requests = server.received_requests().await.unwrap();
        if requests.len() >= count {
            return requests
                .iter()
                .map(|r| serde_json::from_slice(&r.body).unwrap())
                .collect();
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("analytics sink did not receive {} requests", count);
}

fn write_certificate(root: &Path, domain: &str) {
    let cert = generate_simple_self_signed(vec![domain.to_string(), format!("www.{}", domain)]).unwrap();
    let dir = root.join(domain);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("fullchain.pem"), cert.serialize_pem().unwrap()).unwrap();
    std::fs::write(dir.join("privkey.pem"), cert.serialize_private_key_pem()).unwrap();
}

#[tokio::test]
async fn test_proxy_to_registered_site() {
    let dir = tempdir().unwrap();
    let backend_port = get_unique_port();
    let _backend = run_backend_server(backend_port, "SITE_A").await;

    let edge = setup_edge(&format!("a.com:{}", backend_port), true, None, dir.path(), None);
    edge.start().await;

    let response = client()
        .post(format!("http://127.0.0.1:{}/hello?x=1", edge.config.dev_port))
        .header("Host", "www.a.com")
        .body("payload")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.headers().get("x-backend").unwrap(), "SITE_A");
    let body = response.text().await.unwrap();
    assert!(body.contains("SITE_A"));
    assert!(body.contains("method=POST"));
    assert!(body.contains("path=/hello"));
    assert!(body.contains("query=x=1"));
    assert!(body.contains("host=www.a.com"));
    assert!(body.contains("xff=127.0.0.1"));
    assert!(body.contains("xfp=http"));
}

#[tokio::test]
async fn test_forwarded_for_chain_is_extended() {
    let dir = tempdir().unwrap();
    let backend_port = get_unique_port();
    let _backend = run_backend_server(backend_port, "SITE_A").await;

    let edge = setup_edge(&format!("a.com:{}", backend_port), true, None, dir.path(), None);
    edge.start().await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/", edge.config.dev_port))
        .header("Host", "www.a.com")
        .header("X-Forwarded-For", "203.0.113.7")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("xff=203.0.113.7, 127.0.0.1|"));
}

#[tokio::test]
async fn test_each_domain_reaches_its_own_backend() {
    let dir = tempdir().unwrap();
    let port_a = get_unique_port();
    let port_b = get_unique_port();
    let _backend_a = run_backend_server(port_a, "SITE_A").await;
    let _backend_b = run_backend_server(port_b, "SITE_B").await;

    let edge = setup_edge(&format!("a.com:{},b.com:{}", port_a, port_b), true, None, dir.path(), None);
    edge.start().await;

    for (host, expected) in [("www.a.com", "SITE_A"), ("www.b.com", "SITE_B")] {
        let body = client()
            .get(format!("http://127.0.0.1:{}/", edge.config.dev_port))
            .header("Host", host)
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.starts_with(expected), "{} got {}", host, body);
    }
}

#[tokio::test]
async fn test_bare_host_redirects_to_canonical() {
    let dir = tempdir().unwrap();
    let edge = setup_edge("a.com:3000", true, None, dir.path(), None);
    edge.start().await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/blog/post?id=7", edge.config.dev_port))
        .header("Host", "a.com")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 301);
    assert_eq!(
        response.headers().get("location").unwrap(),
        "http://www.a.com/blog/post?id=7"
    );
}

#[tokio::test]
async fn test_unknown_host_is_500() {
    let dir = tempdir().unwrap();
    let edge = setup_edge("a.com:3000", true, None, dir.path(), None);
    edge.start().await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/", edge.config.dev_port))
        .header("Host", "www.b.org")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 500);
}

#[tokio::test]
async fn test_robots_txt_bypasses_backend() {
    let dir = tempdir().unwrap();
    // Nothing listens on the backend port
    let edge = setup_edge(&format!("a.com:{}", get_unique_port()), true, None, dir.path(), None);
    edge.start().await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/robots.txt", edge.config.dev_port))
        .header("Host", "www.a.com")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "User-agent: *\nDisallow:");
}

#[tokio::test]
async fn test_backend_down_is_502() {
    let dir = tempdir().unwrap();
    let edge = setup_edge(&format!("a.com:{}", get_unique_port()), true, None, dir.path(), None);
    edge.start().await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/", edge.config.dev_port))
        .header("Host", "www.a.com")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 502);
}

#[tokio::test]
async fn test_ping_records_one_website_visit() {
    let dir = tempdir().unwrap();
    let analytics = mock_analytics().await;
    // Backend is down: the ping must not care
    let edge = setup_edge(
        &format!("a.com:{}", get_unique_port()),
        true,
        None,
        dir.path(),
        Some(analytics.uri()),
    );
    edge.start().await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/blog/____reserved/_ping", edge.config.dev_port))
        .header("Host", "www.a.com")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);

    let commands = received_commands(&analytics, 1).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(analytics.received_requests().await.unwrap().len(), 1);

    let command = &commands[0];
    assert_eq!(
        command["query"],
        "INSERT INTO reverse_proxy_website_visits (url_without_params, vistor_hash) VALUES (?, ?)"
    );
    assert_eq!(command["parameters"][0], "a.com/blog");
    assert_eq!(command["parameters"][1], edge_router::visits::visitor_hash("127.0.0.1"));
    assert_eq!(command["database"], "visits");
}

#[tokio::test]
async fn test_proxied_request_records_visit() {
    let dir = tempdir().unwrap();
    let analytics = mock_analytics().await;
    let backend_port = get_unique_port();
    let _backend = run_backend_server(backend_port, "SITE_A").await;

    let edge = setup_edge(
        &format!("a.com:{}", backend_port),
        true,
        None,
        dir.path(),
        Some(analytics.uri()),
    );
    edge.start().await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/page?secret=1", edge.config.dev_port))
        .header("Host", "www.a.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let commands = received_commands(&analytics, 1).await;
    let command = &commands[0];
    assert_eq!(
        command["query"],
        "INSERT INTO reverse_proxy_visits (url_without_params, vistor_hash, duration) VALUES (?, ?, ?)"
    );
    assert_eq!(command["parameters"][0], "a.com/page");
    assert!(command["parameters"][2].is_u64());
}

#[tokio::test]
async fn test_favicon_is_not_recorded() {
    let dir = tempdir().unwrap();
    let analytics = mock_analytics().await;
    let backend_port = get_unique_port();
    let _backend = run_backend_server(backend_port, "SITE_A").await;

    let edge = setup_edge(
        &format!("a.com:{}", backend_port),
        true,
        None,
        dir.path(),
        Some(analytics.uri()),
    );
    edge.start().await;

    let response = client()
        .get(format!("http://127.0.0.1:{}/favicon.ico", edge.config.dev_port))
        .header("Host", "www.a.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    sleep(Duration::from_millis(300)).await;
    assert!(analytics.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unreachable_analytics_does_not_affect_response() {
    let dir = tempdir().unwrap();
    let backend_port = get_unique_port();
    let _backend = run_backend_server(backend_port, "SITE_A").await;

    // Nothing listens on the analytics port
    let edge = setup_edge(
        &format!("a.com:{}", backend_port),
        true,
        None,
        dir.path(),
        Some(format!("http://127.0.0.1:{}", get_unique_port())),
    );
    edge.start().await;

    for _ in 0..3 {
        let response = client()
            .get(format!("http://127.0.0.1:{}/", edge.config.dev_port))
            .header("Host", "www.a.com")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }
}

#[tokio::test]
async fn test_http_only_mode_serves_port_80() {
    let dir = tempdir().unwrap();
    let backend_port = get_unique_port();
    let _backend = run_backend_server(backend_port, "SITE_A").await;

    std::fs::create_dir_all(dir.path().join("acme-challenge")).unwrap();
    std::fs::write(dir.path().join("acme-challenge").join("tok"), "tok.auth").unwrap();

    // b.com has no certificate, so neither domain gets HTTPS
    let certs_dir = dir.path().join("certs");
    write_certificate(&certs_dir, "a.com");
    let certs = CertificateLoader::new(&certs_dir).load_all(["a.com", "b.com"]);
    assert!(certs.http_only);
    assert_eq!(certs.domains().collect::<Vec<_>>(), vec!["a.com"]);

    let edge = setup_edge(
        &format!("a.com:{},b.com:{}", backend_port, get_unique_port()),
        false,
        certs.acceptor_for_run(),
        dir.path(),
        None,
    );
    assert_eq!(edge.server.mode(), Mode::HttpOnly);
    edge.start().await;

    let base = format!("http://127.0.0.1:{}", edge.config.http_port);

    let response = client()
        .get(format!("{}/.well-known/acme-challenge/tok", base))
        .header("Host", "a.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "tok.auth");

    let response = client()
        .get(format!("{}/x", base))
        .header("Host", "a.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 301);
    assert_eq!(response.headers().get("location").unwrap(), "http://www.a.com/x");

    let response = client()
        .get(format!("{}/x", base))
        .header("Host", "www.a.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(response.text().await.unwrap().contains("SITE_A"));

    // No TLS listener was started
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", edge.config.https_port)).await.is_err());
}

#[tokio::test]
async fn test_https_mode() {
    let dir = tempdir().unwrap();
    let backend_port = get_unique_port();
    let _backend = run_backend_server(backend_port, "SITE_A").await;

    std::fs::create_dir_all(dir.path().join("acme-challenge")).unwrap();
    std::fs::write(dir.path().join("acme-challenge").join("tok"), "tok.auth").unwrap();

    let certs_dir = dir.path().join("certs");
    write_certificate(&certs_dir, "a.com");
    let certs = CertificateLoader::new(&certs_dir).load_all(["a.com"]);
    assert!(!certs.http_only);

    let edge = setup_edge(
        &format!("a.com:{}", backend_port),
        false,
        certs.acceptor_for_run(),
        dir.path(),
        None,
    );
    assert_eq!(edge.server.mode(), Mode::Https);
    edge.start().await;

    // Port 80: challenge files still served, everything else goes to HTTPS
    let plain = format!("http://127.0.0.1:{}", edge.config.http_port);
    let response = client()
        .get(format!("{}/.well-known/acme-challenge/tok", plain))
        .header("Host", "www.a.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "tok.auth");

    let response = client()
        .get(format!("{}/x?y=1", plain))
        .header("Host", "www.a.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 301);
    assert_eq!(response.headers().get("location").unwrap(), "https://www.a.com/x?y=1");

    // TLS listener
    let https_addr: SocketAddr = format!("127.0.0.1:{}", edge.config.https_port).parse().unwrap();
    let tls_client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .danger_accept_invalid_certs(true)
        .resolve("www.a.com", https_addr)
        .resolve("a.com", https_addr)
        .build()
        .unwrap();

    let response = tls_client
        .get(format!("https://www.a.com:{}/hello", edge.config.https_port))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("path=/hello"));
    assert!(body.contains("xfp=https"));

    let response = tls_client
        .get(format!("https://a.com:{}/hello?z=2", edge.config.https_port))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 301);
    assert_eq!(response.headers().get("location").unwrap(), "https://www.a.com/hello?z=2");
}

#[tokio::test]
async fn test_shutdown_stops_listeners() {
    let dir = tempdir().unwrap();
    let edge = setup_edge("a.com:3000", true, None, dir.path(), None);

    let server = edge.server.clone();
    let shutdown = edge.coordinator.subscribe();
    let handle = tokio::spawn(async move { server.run(shutdown).await });
    sleep(Duration::from_millis(150)).await;

    edge.coordinator.trigger();

    let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    assert!(result.is_ok());

    let marker = std::fs::read_to_string(dir.path().join("cleanup.txt")).unwrap();
    assert!(marker.starts_with("This File was created at: "));

    sleep(Duration::from_millis(50)).await;
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", edge.config.dev_port)).await.is_err());
}

#[tokio::test]
async fn test_port_in_use_is_fatal() {
    let dir = tempdir().unwrap();
    let edge = setup_edge("a.com:3000", true, None, dir.path(), None);

    let _occupied = TcpListener::bind(("0.0.0.0", edge.config.dev_port)).await.unwrap();

    let result = edge.server.clone().run(edge.coordinator.subscribe()).await;
    assert!(result.is_err());
}

//! Visit logger
//! Hashes visitor addresses and posts visit records to a remote analytics store
//! from a background worker, off the response path.

use crate::router::strip_port;
use crate::shutdown::Shutdown;
use anyhow::{Context, Result};
use ring::digest;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use url::Url;

/// Paths never worth recording
pub const EXCLUDED_PATHS: &[&str] = &["/favicon.ico"];

/// Trailing characters of the address that feed the hash (a full dotted quad)
pub const VISITOR_ADDR_CHARS: usize = 15;

/// Hex characters of the digest that are kept
pub const VISITOR_HASH_LEN: usize = 10;

/// Records buffered ahead of the worker before new ones are dropped
pub const QUEUE_CAPACITY: usize = 1024;

const DATABASE: &str = "visits";

const INSERT_VISIT: &str =
    "INSERT INTO reverse_proxy_visits (url_without_params, vistor_hash, duration) VALUES (?, ?, ?)";

const INSERT_WEBSITE_VISIT: &str =
    "INSERT INTO reverse_proxy_website_visits (url_without_params, vistor_hash) VALUES (?, ?)";

/// One visit. A page visit carries the proxied duration; a website visit
/// (from the browser ping beacon) does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitRecord {
    pub url_without_query_params: String,
    pub visitor_hash: String,
    pub duration_millis: Option<u64>,
}

impl VisitRecord {
    /// A successfully proxied request
    pub fn page(url: impl Into<String>, remote_addr: &str, duration_millis: u64) -> Self {
        Self {
            url_without_query_params: url.into(),
            visitor_hash: visitor_hash(remote_addr),
            duration_millis: Some(duration_millis),
        }
    }

    /// A hit on the ping beacon
    pub fn website_visit(url: impl Into<String>, remote_addr: &str) -> Self {
        Self {
            url_without_query_params: url.into(),
            visitor_hash: visitor_hash(remote_addr),
            duration_millis: None,
        }
    }

    /// The command sent to the analytics endpoint
    pub fn command(&self) -> AnalyticsCommand {
        match self.duration_millis {
            Some(duration) => AnalyticsCommand {
                query: INSERT_VISIT,
                parameters: vec![
                    json!(self.url_without_query_params),
                    json!(self.visitor_hash),
                    json!(duration),
                ],
                database: DATABASE,
            },
            None => AnalyticsCommand {
                query: INSERT_WEBSITE_VISIT,
                parameters: vec![
                    json!(self.url_without_query_params),
                    json!(self.visitor_hash),
                ],
                database: DATABASE,
            },
        }
    }
}

/// JSON body of an `/execute` call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsCommand {
    pub query: &'static str,
    pub parameters: Vec<Value>,
    pub database: &'static str,
}

/// Whether a visit to `url` should be dropped without recording
pub fn is_excluded(url: &str) -> bool {
    EXCLUDED_PATHS.iter().any(|p| url.contains(p))
}

/// One-way visitor identifier: the address with its port removed, cut to its
/// last 15 characters, SHA-256 hashed, hex encoded and cut to 10 characters.
///
/// IPv6 addresses longer than 15 characters lose their leading part.
pub fn visitor_hash(remote_addr: &str) -> String {
    let ip = strip_port(remote_addr)
        .trim_start_matches('[')
        .trim_end_matches(']');
    let skip = ip.chars().count().saturating_sub(VISITOR_ADDR_CHARS);
    let truncated: String = ip.chars().skip(skip).collect();

    let digest = digest::digest(&digest::SHA256, truncated.as_bytes());
    let hex: String = digest.as_ref().iter().map(|b| format!("{:02x}", b)).collect();

    hex[..VISITOR_HASH_LEN].to_string()
}

/// Analytics endpoint settings
#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    pub endpoint: String,
    pub timeout: Duration,
}

/// Handle used by request handlers to submit visits.
///
/// `record` never waits: the record is queued for the background worker, or
/// dropped if logging is disabled, the queue is full, or the worker is gone.
#[derive(Clone)]
pub struct VisitLogger {
    tx: Option<mpsc::Sender<VisitRecord>>,
}

impl VisitLogger {
    /// A logger that discards everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Start the delivery worker. It stops when `shutdown` fires, abandoning
    /// whatever is still queued.
    pub fn spawn(config: AnalyticsConfig, shutdown: Shutdown) -> Result<Self> {
        let sink = AnalyticsSink::new(&config)?;
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);

        info!("Visit logging to {}", sink.execute_url);
        tokio::spawn(sink.run(rx, shutdown));

        Ok(Self { tx: Some(tx) })
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue a visit for delivery
    pub fn record(&self, record: VisitRecord) {
        if is_excluded(&record.url_without_query_params) {
            return;
        }

        let Some(tx) = &self.tx else {
            debug!("Visit logging disabled, skipping {}", record.url_without_query_params);
            return;
        };

        match tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                warn!("Visit queue full, dropping record for {}", record.url_without_query_params);
            }
            Err(TrySendError::Closed(record)) => {
                debug!("Visit worker stopped, dropping record for {}", record.url_without_query_params);
            }
        }
    }
}

struct AnalyticsSink {
    client: reqwest::Client,
    execute_url: Url,
}

impl AnalyticsSink {
    fn new(config: &AnalyticsConfig) -> Result<Self> {
        let execute_url = format!("{}/execute", config.endpoint.trim_end_matches('/'));
        let execute_url = Url::parse(&execute_url)
            .with_context(|| format!("Invalid analytics endpoint: {}", config.endpoint))?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build analytics client")?;

        Ok(Self { client, execute_url })
    }

    async fn run(self, mut rx: mpsc::Receiver<VisitRecord>, mut shutdown: Shutdown) {
        loop {
            let record = tokio::select! {
                _ = shutdown.cancelled() => break,
                record = rx.recv() => match record {
                    Some(record) => record,
                    None => break,
                },
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.send(&record) => {
                    if let Err(e) = result {
                        warn!("Failed to write visit record for {}: {:#}", record.url_without_query_params, e);
                    }
                }
            }
        }

        debug!("Visit worker stopped");
    }

    async fn send(&self, record: &VisitRecord) -> Result<()> {
        let command = record.command();
        debug!("Sending visit record: {:?}", command);

        self.client
            .post(self.execute_url.clone())
            .json(&command)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}

//! Certificate loader for per-domain TLS material
//! Reads `<cert-root>/<domain>/{fullchain,privkey}.pem` and selects certificates by SNI

use anyhow::{anyhow, bail, Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

/// Certificate chain file name inside a domain directory
pub const FULLCHAIN_FILE: &str = "fullchain.pem";

/// Private key file name inside a domain directory
pub const PRIVKEY_FILE: &str = "privkey.pem";

/// A loaded credential for one registered domain
#[derive(Clone)]
pub struct DomainCertificate {
    pub domain: String,
    pub key: Arc<CertifiedKey>,
}

/// Outcome of loading certificates for every registered domain.
///
/// `http_only` is set when any domain failed to load; in that case the
/// caller skips the TLS listener for all domains.
#[derive(Clone)]
pub struct CertificateSet {
    pub http_only: bool,
    pub certs: Vec<DomainCertificate>,
}

impl CertificateSet {
    /// Domains that loaded successfully
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.certs.iter().map(|c| c.domain.as_str())
    }

    /// Build a TLS acceptor that picks a certificate per SNI name
    pub fn tls_acceptor(&self) -> Result<TlsAcceptor> {
        if self.certs.is_empty() {
            bail!("no certificates loaded");
        }

        let resolver = SiteCertResolver::new(self.certs.clone());

        let mut tls_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(TlsAcceptor::from(Arc::new(tls_config)))
    }

    /// Acceptor for this run, or `None` to serve HTTP only. Any failed domain
    /// disables HTTPS for every domain, even those that loaded.
    pub fn acceptor_for_run(&self) -> Option<TlsAcceptor> {
        if self.http_only {
            warn!(
                "Not every certificate could be loaded; this is expected on a first deployment. \
                 Set LOCAL_DEV=true to skip HTTPS during local development."
            );
            return None;
        }

        match self.tls_acceptor() {
            Ok(acceptor) => Some(acceptor),
            Err(e) => {
                error!("Failed to build TLS configuration: {:#}", e);
                None
            }
        }
    }
}

/// Loads key/cert pairs from the certificate root
pub struct CertificateLoader {
    cert_root: PathBuf,
}

impl CertificateLoader {
    pub fn new<P: AsRef<Path>>(cert_root: P) -> Self {
        Self {
            cert_root: cert_root.as_ref().to_path_buf(),
        }
    }

    /// Path of the certificate chain for a domain
    pub fn cert_path(&self, domain: &str) -> PathBuf {
        self.cert_root.join(domain).join(FULLCHAIN_FILE)
    }

    /// Path of the private key for a domain
    pub fn key_path(&self, domain: &str) -> PathBuf {
        self.cert_root.join(domain).join(PRIVKEY_FILE)
    }

    /// Load every domain's credential. Never fails: a domain that cannot be
    /// loaded is logged, left out of the set, and flips `http_only`.
    pub fn load_all<'a, I>(&self, domains: I) -> CertificateSet
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut certs = Vec::new();
        let mut http_only = false;

        for domain in domains {
            match self.load_domain(domain) {
                Ok(key) => {
                    info!("Loaded certificate for: {}", domain);
                    certs.push(DomainCertificate {
                        domain: domain.to_string(),
                        key: Arc::new(key),
                    });
                }
                Err(e) => {
                    warn!("Failed to load certificate for domain {}: {:#}", domain, e);
                    http_only = true;
                }
            }
        }

        CertificateSet { http_only, certs }
    }

    /// Load the credential for a single domain
    pub fn load_domain(&self, domain: &str) -> Result<CertifiedKey> {
        let cert_path = self.cert_path(domain);
        let key_path = self.key_path(domain);

        let chain = Self::read_chain(&cert_path)?;
        let key = Self::read_key(&key_path)?;

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| anyhow!("Unsupported private key in {}: {}", key_path.display(), e))?;

        Ok(CertifiedKey::new(chain, signing_key))
    }

    fn read_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut reader = BufReader::new(file);

        let chain = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        if chain.is_empty() {
            bail!("No certificates found in {}", path.display());
        }

        Ok(chain)
    }

    fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut reader = BufReader::new(file);

        rustls_pemfile::private_key(&mut reader)
            .with_context(|| format!("Failed to parse {}", path.display()))?
            .ok_or_else(|| anyhow!("No private key found in {}", path.display()))
    }
}

/// Picks the certificate whose domain equals the SNI name or is a parent of
/// it (`www.a.com` resolves to the `a.com` certificate). Clients without SNI,
/// or with an unknown name, get the first certificate.
pub struct SiteCertResolver {
    certs: Vec<DomainCertificate>,
}

impl SiteCertResolver {
    pub fn new(certs: Vec<DomainCertificate>) -> Self {
        Self { certs }
    }

    /// Domain whose certificate serves `server_name`
    pub fn select(&self, server_name: Option<&str>) -> Option<&DomainCertificate> {
        let matched = server_name.and_then(|name| {
            let name = name.to_ascii_lowercase();
            self.certs
                .iter()
                .filter(|c| name == c.domain || name.ends_with(&format!(".{}", c.domain)))
                .max_by_key(|c| c.domain.len())
        });

        matched.or_else(|| self.certs.first())
    }
}

impl fmt::Debug for SiteCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiteCertResolver")
            .field("domains", &self.certs.iter().map(|c| &c.domain).collect::<Vec<_>>())
            .finish()
    }
}

impl ResolvesServerCert for SiteCertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        self.select(client_hello.server_name()).map(|c| c.key.clone())
    }
}

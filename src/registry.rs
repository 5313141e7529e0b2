//! Site registry
//! Parses the `domain:port,domain:port` mapping into an immutable lookup table

use std::collections::HashMap;
use thiserror::Error;

/// Separator between `domain:port` pairs
pub const PAIR_SEPARATOR: char = ',';

/// Separator between a domain and its backend port
pub const PORT_SEPARATOR: char = ':';

/// Errors produced while parsing the registry spec
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("domain mapping must be set and formatted like \"domain1:port1,domain2:port2\"")]
    Empty,

    #[error("invalid domain to port mapping: {0:?}")]
    MalformedPair(String),

    #[error("invalid backend port {port:?} for domain {domain}")]
    InvalidPort { domain: String, port: String },

    #[error("domain {0} is mapped more than once")]
    DuplicateDomain(String),
}

/// A hosted domain and the local port its backend listens on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    pub domain: String,
    pub backend_port: u16,
}

impl Site {
    /// Authority of the backend on the loopback interface
    pub fn backend_authority(&self) -> String {
        format!("127.0.0.1:{}", self.backend_port)
    }

    /// Base URL requests for this site are forwarded to
    pub fn backend_url(&self) -> String {
        format!("http://{}", self.backend_authority())
    }
}

/// Ordered, read-only table of sites keyed by domain.
///
/// Built once at startup and shared by reference afterwards; there is no
/// interior mutability, so concurrent reads need no synchronisation.
#[derive(Debug, Clone)]
pub struct SiteRegistry {
    sites: Vec<Site>,
    by_domain: HashMap<String, usize>,
}

impl SiteRegistry {
    /// Parse a registry spec such as `"a.com:3000,b.com:3001"`.
    ///
    /// Domains are lowercased. Every pair must split into exactly one
    /// non-empty domain and one valid port, and no domain may repeat.
    pub fn load(spec: &str) -> Result<Self, RegistryError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(RegistryError::Empty);
        }

        let mut sites = Vec::new();
        let mut by_domain = HashMap::new();

        for pair in spec.split(PAIR_SEPARATOR) {
            let pair = pair.trim();
            let parts: Vec<&str> = pair.split(PORT_SEPARATOR).map(str::trim).collect();

            let (domain, port) = match parts.as_slice() {
                [domain, port] if !domain.is_empty() && !port.is_empty() => (*domain, *port),
                _ => return Err(RegistryError::MalformedPair(pair.to_string())),
            };

            let domain = domain.to_ascii_lowercase();
            let backend_port = match port.parse::<u16>() {
                Ok(p) if p != 0 => p,
                _ => {
                    return Err(RegistryError::InvalidPort {
                        domain,
                        port: port.to_string(),
                    })
                }
            };

            if by_domain.contains_key(&domain) {
                return Err(RegistryError::DuplicateDomain(domain));
            }

            by_domain.insert(domain.clone(), sites.len());
            sites.push(Site { domain, backend_port });
        }

        Ok(Self { sites, by_domain })
    }

    /// Look up a site by its (already normalised) domain
    pub fn get(&self, domain: &str) -> Option<&Site> {
        self.by_domain.get(domain).map(|&i| &self.sites[i])
    }

    /// Sites in configuration order
    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    /// Domains in configuration order
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.sites.iter().map(|s| s.domain.as_str())
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

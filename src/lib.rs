//! Edge Router - a small multi-tenant TLS edge
//!
//! Provides:
//! - Host-based routing to one local backend per domain
//! - Canonical-host redirects (`www.` prefix and legacy-domain rewrites)
//! - Per-domain certificates loaded from disk, with HTTP-only fallback
//! - ACME HTTP-01 challenge files served on port 80
//! - Anonymised, fire-and-forget visit analytics
//! - Signal-driven shutdown with a cleanup marker

pub mod certificate;
pub mod challenge;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod server;
pub mod shutdown;
pub mod visits;

pub use certificate::{CertificateLoader, CertificateSet};
pub use challenge::ChallengeServer;
pub use registry::{Site, SiteRegistry};
pub use router::{CanonicalPolicy, CanonicalRule, HostRouter, Scheme};
pub use server::{Mode, ProxyConfig, ProxyServer};
pub use shutdown::{Shutdown, ShutdownCoordinator};
pub use visits::{AnalyticsConfig, VisitLogger, VisitRecord};

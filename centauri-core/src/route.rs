use arc_swap::ArcSwap;
use rustls::sign::CertifiedKey;
use std::sync::Arc;

/// How a header rule is applied to a header map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderOp {
    /// Deletes all instances of the header.
    Delete,
    /// Adds a new header, regardless of existing ones.
    Add,
    /// Removes any existing headers of the same name, and adds a new one.
    Replace,
    /// Sets the header if it doesn't already exist, otherwise leaves it alone.
    Default,
}

/// A header that should be modified in the response from upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRule {
    pub name: String,
    pub value: String,
    pub op: HeaderOp,
}

/// The current status of a route's certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateStatus {
    /// The route has just been initialised, so we don't yet know.
    NotChecked,
    /// A certificate is required and no valid one is held.
    Missing,
    /// We have a certificate but it needs to be renewed.
    ExpiringSoon,
    /// We have a certificate and it is in good order.
    Good,
    /// We don't have a certificate and are happy about it.
    NotRequired,
}

/// The certificate pointer and its status, published together so the TLS
/// handshake callback always reads a consistent pair.
pub struct CertificateState {
    pub certificate: Option<Arc<CertifiedKey>>,
    pub status: CertificateStatus,
}

/// One way that a request may be mapped from the original HTTP request to an
/// upstream server.
///
/// The first domain is the route's *primary* domain; the rest become the
/// certificate's alt names. The certificate state is runtime-only: written by
/// the route manager, read lock-free by the TLS handshake.
pub struct Route {
    pub domains: Vec<String>,
    pub upstreams: Vec<String>,
    pub headers: Vec<HeaderRule>,
    pub provider: String,
    pub redirect_to_primary: bool,

    cert_state: ArcSwap<CertificateState>,
}

impl Route {
    pub fn new(domains: Vec<String>) -> Self {
        Route {
            domains,
            upstreams: Vec::new(),
            headers: Vec::new(),
            provider: String::new(),
            redirect_to_primary: false,
            cert_state: ArcSwap::from_pointee(CertificateState {
                certificate: None,
                status: CertificateStatus::NotChecked,
            }),
        }
    }

    pub fn primary_domain(&self) -> &str {
        &self.domains[0]
    }

    pub fn alt_names(&self) -> &[String] {
        &self.domains[1..]
    }

    pub fn certificate(&self) -> Option<Arc<CertifiedKey>> {
        self.cert_state.load().certificate.clone()
    }

    pub fn certificate_status(&self) -> CertificateStatus {
        self.cert_state.load().status
    }

    /// Publishes a new certificate pointer and status atomically.
    pub fn set_certificate(
        &self,
        certificate: Option<Arc<CertifiedKey>>,
        status: CertificateStatus,
    ) {
        self.cert_state.store(Arc::new(CertificateState {
            certificate,
            status,
        }));
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("domains", &self.domains)
            .field("upstreams", &self.upstreams)
            .field("headers", &self.headers)
            .field("provider", &self.provider)
            .field("redirect_to_primary", &self.redirect_to_primary)
            .field("certificate_status", &self.certificate_status())
            .finish()
    }
}

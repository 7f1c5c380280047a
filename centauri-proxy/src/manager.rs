use crate::route_map::RouteMap;
use arc_swap::ArcSwapOption;
use centauri_cert::CertificateProvider;
use centauri_core::route::{CertificateStatus, Route};
use centauri_core::{is_domain_name, CentauriError, RouteSet};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maintains the set of routes, maps domains to them, and keeps their
/// certificates fresh.
///
/// If no certificate provider is given the manager never obtains
/// certificates: routes are marked [`CertificateStatus::NotRequired`] and
/// `certificate_for_client` always fails.
pub struct RouteManager {
    provider: Option<Arc<dyn CertificateProvider>>,
    route_map: RouteMap,
    fallback: ArcSwapOption<Route>,
}

impl RouteManager {
    pub fn new(provider: Option<Arc<dyn CertificateProvider>>) -> Self {
        RouteManager {
            provider,
            route_map: RouteMap::new(),
            fallback: ArcSwapOption::const_empty(),
        }
    }

    /// Replaces all previously registered routes with the given new set.
    ///
    /// Existing certificates are bound to each route so it can be served
    /// immediately; obtaining or renewing certificates happens in a
    /// background sweep launched at the end, so this call never blocks on
    /// the network. Routes without a usable certificate are published with
    /// status `Missing` and not served until a sweep succeeds.
    pub async fn set_routes(self: &Arc<Self>, set: RouteSet) -> Result<(), CentauriError> {
        for route in &set.routes {
            for domain in &route.domains {
                if !is_domain_name(domain) {
                    return Err(CentauriError::InvalidDomain(domain.clone()));
                }
            }
            self.load_certificate(route).await;
        }

        self.route_map.update(set.routes)?;
        self.fallback.store(set.fallback);

        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.check_certificates().await });
        Ok(())
    }

    /// Binds an existing certificate to the route so it can be served
    /// without waiting for renewals.
    async fn load_certificate(&self, route: &Arc<Route>) {
        let Some(provider) = &self.provider else {
            route.set_certificate(None, CertificateStatus::NotRequired);
            return;
        };

        match provider
            .get_existing_certificate(&route.provider, route.primary_domain(), route.alt_names())
            .await
        {
            Ok((cert, needs_renewal)) => {
                if needs_renewal {
                    info!(domains = ?route.domains, "Existing certificate found but it expires soon");
                    route.set_certificate(Some(cert), CertificateStatus::ExpiringSoon);
                } else {
                    debug!(domains = ?route.domains, "Existing certificate found");
                    route.set_certificate(Some(cert), CertificateStatus::Good);
                }
            }
            Err(e) => {
                info!(
                    domains = ?route.domains,
                    error = %e,
                    "No existing certificate, route will not be served until one is obtained"
                );
                route.set_certificate(None, CertificateStatus::Missing);
            }
        }
    }

    /// Returns the route to serve for the given domain, or `None` if there
    /// is no usable route. Routes whose certificate is missing are withheld.
    pub fn route_for_domain(&self, domain: &str) -> Option<Arc<Route>> {
        let route = self.route_for(domain)?;
        match route.certificate_status() {
            CertificateStatus::Missing | CertificateStatus::NotChecked => None,
            _ => Some(route),
        }
    }

    /// Returns the certificate for the server name in a TLS client hello.
    /// `Ok(None)` means the handshake should fail for lack of a certificate.
    pub fn certificate_for_client(
        &self,
        server_name: &str,
    ) -> Result<Option<Arc<CertifiedKey>>, CentauriError> {
        if self.provider.is_none() {
            return Err(CentauriError::NoProvider);
        }

        Ok(self.route_for(server_name).and_then(|r| r.certificate()))
    }

    /// Looks up a route for the domain, falling back to the fallback route
    /// if one is configured.
    fn route_for(&self, domain: &str) -> Option<Arc<Route>> {
        self.route_map.get(domain).or_else(|| self.fallback.load_full())
    }

    /// Checks and updates the certificates for all registered routes.
    /// Should be called periodically to renew certificates and refresh OCSP
    /// staples.
    ///
    /// Routes are processed sequentially: ACME endpoints rate-limit per
    /// account, so parallel issuance buys nothing. The route list is
    /// snapshotted up front, so a concurrent reconfiguration can at worst
    /// cause one superfluous renewal of a dropped route.
    pub async fn check_certificates(&self) {
        let routes = self.route_map.routes();
        for route in routes.iter() {
            match &self.provider {
                None => route.set_certificate(None, CertificateStatus::NotRequired),
                Some(provider) => self.update_certificate(provider, route).await,
            }
        }
    }

    async fn update_certificate(
        &self,
        provider: &Arc<dyn CertificateProvider>,
        route: &Arc<Route>,
    ) {
        match provider
            .get_certificate(&route.provider, route.primary_domain(), route.alt_names())
            .await
        {
            Ok(cert) => route.set_certificate(Some(cert), CertificateStatus::Good),
            Err(e) => {
                warn!(domains = ?route.domains, error = %e, "Failed to update certificate");
                // Re-derive the status from what's stored, so a still-valid
                // route degrades to ExpiringSoon rather than dropping out.
                self.load_certificate(route).await;
            }
        }
    }
}

impl ResolvesServerCert for RouteManager {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name().unwrap_or_default().to_owned();
        self.certificate_for_client(&server_name).ok().flatten()
    }
}

impl Debug for RouteManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteManager")
            .field("routes", &self.route_map.routes().len())
            .field("has_provider", &self.provider.is_some())
            .finish()
    }
}

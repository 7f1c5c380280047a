use crate::details::CertificateDetails;
use crate::store::CertificateStore;
use async_trait::async_trait;
use centauri_core::CentauriError;
use chrono::Duration;
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// A source of new certificates and OCSP staples.
#[async_trait]
pub trait Supplier: Send + Sync {
    /// Obtains a brand new certificate for the given names, requesting the
    /// must-staple extension if asked to.
    async fn get_certificate(
        &self,
        subject: &str,
        alt_names: &[String],
        should_staple: bool,
    ) -> Result<CertificateDetails, CentauriError>;

    /// Refreshes the OCSP staple fields of the given certificate in place.
    async fn update_staple(&self, cert: &mut CertificateDetails) -> Result<(), CentauriError>;

    /// The minimum remaining validity a certificate must have before this
    /// supplier considers it due for renewal.
    fn min_certificate_validity(&self) -> Duration;

    /// The minimum remaining staple validity before a refresh is due.
    fn min_staple_validity(&self) -> Duration;
}

/// Provides TLS certificates for a set of names: either a fully managed
/// manager, or a wrapper such as the wildcard resolver.
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    /// Returns a certificate for the given names, obtaining or refreshing
    /// one if necessary. May take some time if the supplier is contacted.
    async fn get_certificate(
        &self,
        preferred_supplier: &str,
        subject: &str,
        alt_names: &[String],
    ) -> Result<Arc<CertifiedKey>, CentauriError>;

    /// Returns a previously stored, still-usable certificate together with a
    /// flag indicating it is due for renewal. Never contacts a supplier and
    /// never writes to the store.
    async fn get_existing_certificate(
        &self,
        preferred_supplier: &str,
        subject: &str,
        alt_names: &[String],
    ) -> Result<(Arc<CertifiedKey>, bool), CentauriError>;
}

/// Co-ordinates a certificate store and a set of suppliers, providing a
/// means to obtain a valid certificate with an OCSP staple.
pub struct CertificateManager {
    store: Arc<CertificateStore>,
    suppliers: HashMap<String, Arc<dyn Supplier>>,
    supplier_preference: Vec<String>,
    should_staple: bool,
}

impl CertificateManager {
    pub fn new(
        store: Arc<CertificateStore>,
        suppliers: HashMap<String, Arc<dyn Supplier>>,
        supplier_preference: Vec<String>,
        should_staple: bool,
    ) -> Self {
        CertificateManager {
            store,
            suppliers,
            supplier_preference,
            should_staple,
        }
    }

    fn supplier(&self, preferred: &str) -> Result<&Arc<dyn Supplier>, CentauriError> {
        if !preferred.is_empty() {
            return self
                .suppliers
                .get(preferred)
                .ok_or_else(|| CentauriError::SupplierUnknown(preferred.to_owned()));
        }

        self.supplier_preference
            .iter()
            .find_map(|name| self.suppliers.get(name))
            .ok_or_else(|| CentauriError::NoSupplier(self.supplier_preference.clone()))
    }

    /// Obtains a new certificate from the supplier and saves it.
    async fn obtain(
        &self,
        supplier: &Arc<dyn Supplier>,
        subject: &str,
        alt_names: &[String],
    ) -> Result<Arc<CertifiedKey>, CentauriError> {
        let cert = supplier
            .get_certificate(subject, alt_names, self.should_staple)
            .await?;
        let key = cert.certified_key()?;
        self.store.save_certificate(cert)?;
        Ok(Arc::new(key))
    }

    /// Refreshes the OCSP staple for the certificate and saves it.
    async fn staple(
        &self,
        supplier: &Arc<dyn Supplier>,
        mut cert: CertificateDetails,
    ) -> Result<Arc<CertifiedKey>, CentauriError> {
        supplier.update_staple(&mut cert).await?;
        let key = cert.certified_key()?;
        self.store.save_certificate(cert)?;
        Ok(Arc::new(key))
    }
}

#[async_trait]
impl CertificateProvider for CertificateManager {
    async fn get_certificate(
        &self,
        preferred_supplier: &str,
        subject: &str,
        alt_names: &[String],
    ) -> Result<Arc<CertifiedKey>, CentauriError> {
        let supplier = self.supplier(preferred_supplier)?;

        let _guard = self.store.lock_certificate(subject, alt_names).await;

        match self.store.get_certificate(subject, alt_names) {
            None => {
                info!(domain = subject, "Obtaining new certificate");
                self.obtain(supplier, subject, alt_names).await
            }
            Some(cert) if !cert.valid_for(supplier.min_certificate_validity()) => {
                info!(domain = subject, "Renewing certificate");
                self.obtain(supplier, subject, alt_names).await
            }
            Some(cert)
                if cert.requires_staple()
                    && !cert.has_staple_for(supplier.min_staple_validity()) =>
            {
                info!(domain = subject, "Obtaining new OCSP staple");
                self.staple(supplier, cert).await
            }
            Some(cert) => Ok(Arc::new(cert.certified_key()?)),
        }
    }

    async fn get_existing_certificate(
        &self,
        preferred_supplier: &str,
        subject: &str,
        alt_names: &[String],
    ) -> Result<(Arc<CertifiedKey>, bool), CentauriError> {
        let supplier = self.supplier(preferred_supplier)?;

        let Some(cert) = self.store.get_certificate(subject, alt_names) else {
            return Err(CentauriError::ExpiredOrMissing(subject.to_owned()));
        };

        if !cert.valid_for(Duration::zero())
            || (cert.requires_staple() && !cert.has_staple_for(Duration::zero()))
        {
            return Err(CentauriError::ExpiredOrMissing(subject.to_owned()));
        }

        let needs_renewal = !cert.valid_for(supplier.min_certificate_validity())
            || (cert.requires_staple() && !cert.has_staple_for(supplier.min_staple_validity()));

        Ok((Arc::new(cert.certified_key()?), needs_renewal))
    }
}

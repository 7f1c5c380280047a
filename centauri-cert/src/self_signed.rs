use crate::details::CertificateDetails;
use crate::manager::Supplier;
use async_trait::async_trait;
use centauri_core::CentauriError;
use chrono::{Duration, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

const VALIDITY_DAYS: i64 = 30;

/// Issues throwaway self-signed certificates, primarily for development and
/// testing. Certificates are never stapled; the staple fields are set to the
/// certificate's own expiry so the rest of the pipeline is satisfied.
pub struct SelfSignedSupplier;

impl SelfSignedSupplier {
    pub fn new() -> Self {
        SelfSignedSupplier
    }
}

impl Default for SelfSignedSupplier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Supplier for SelfSignedSupplier {
    async fn get_certificate(
        &self,
        subject: &str,
        alt_names: &[String],
        _should_staple: bool,
    ) -> Result<CertificateDetails, CentauriError> {
        let mut names = vec![subject.to_owned()];
        names.extend_from_slice(alt_names);

        let mut params = CertificateParams::new(names)
            .map_err(|e| CentauriError::supplier(subject, e))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "Centauri");
        dn.push(DnType::CommonName, subject);
        params.distinguished_name = dn;

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::hours(1);
        params.not_after = now + time::Duration::days(VALIDITY_DAYS);

        let key_pair = KeyPair::generate().map_err(|e| CentauriError::supplier(subject, e))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CentauriError::supplier(subject, e))?;

        let not_after = Utc::now() + Duration::days(VALIDITY_DAYS);
        let details = CertificateDetails::new(
            String::new(),
            key_pair.serialize_pem(),
            cert.pem(),
            subject.to_owned(),
            alt_names.to_vec(),
            not_after,
            Vec::new(),
            // As the cert expires.
            not_after,
        );
        details.prime_requires_staple();
        Ok(details)
    }

    async fn update_staple(&self, _cert: &mut CertificateDetails) -> Result<(), CentauriError> {
        // Shouldn't be called - self-signed certs aren't stapled.
        Ok(())
    }

    fn min_certificate_validity(&self) -> Duration {
        Duration::days(7)
    }

    fn min_staple_validity(&self) -> Duration {
        Duration::seconds(1)
    }
}

use centauri_core::CentauriError;
use chrono::{DateTime, Duration, Utc};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// The OID of the X.509 TLS-feature extension that carries the `must-staple`
/// flag.
const TLS_FEATURE_OID: &str = "1.3.6.1.5.5.7.1.24";

/// The details of a certificate we've previously obtained and saved for
/// future use.
///
/// Records are immutable after issuance except for the OCSP staple fields,
/// which a supplier refreshes in place before the record is saved again.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateDetails {
    #[serde(default)]
    pub issuer: String,
    pub private_key: String,
    pub certificate: String,

    pub subject: String,
    #[serde(default)]
    pub alt_names: Vec<String>,
    pub not_after: DateTime<Utc>,

    #[serde(with = "base64_bytes", default)]
    pub ocsp_response: Vec<u8>,
    pub next_ocsp_update: DateTime<Utc>,

    #[serde(skip)]
    requires_staple: OnceLock<bool>,
}

impl CertificateDetails {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        issuer: String,
        private_key: String,
        certificate: String,
        subject: String,
        alt_names: Vec<String>,
        not_after: DateTime<Utc>,
        ocsp_response: Vec<u8>,
        next_ocsp_update: DateTime<Utc>,
    ) -> Self {
        CertificateDetails {
            issuer,
            private_key,
            certificate,
            subject,
            alt_names,
            not_after,
            ocsp_response,
            next_ocsp_update,
            requires_staple: OnceLock::new(),
        }
    }

    /// Whether the certificate will be valid for the entirety of the given
    /// period.
    pub fn valid_for(&self, period: Duration) -> bool {
        self.not_after > Utc::now() + period
    }

    /// Whether the OCSP staple covers the entirety of the given period.
    pub fn has_staple_for(&self, period: Duration) -> bool {
        self.next_ocsp_update > Utc::now() + period
    }

    /// Whether this certificate covers the given subject and alt names (and
    /// no more). Alt name order is irrelevant, multiplicity is not.
    pub fn is_for(&self, subject: &str, alt_names: &[String]) -> bool {
        if self.subject != subject || self.alt_names.len() != alt_names.len() {
            return false;
        }

        let mut ours = self.alt_names.clone();
        let mut theirs = alt_names.to_vec();
        ours.sort_unstable();
        theirs.sort_unstable();
        ours == theirs
    }

    /// Whether this certificate has the `must-staple` extension enabled.
    ///
    /// The PEM is parsed at most once; the result is memoised. A record that
    /// fails to parse is treated as not requiring a staple.
    pub fn requires_staple(&self) -> bool {
        *self.requires_staple.get_or_init(|| {
            let Ok((_, pem)) = x509_parser::pem::parse_x509_pem(self.certificate.as_bytes())
            else {
                return false;
            };
            let Ok(cert) = pem.parse_x509() else {
                return false;
            };
            cert.extensions()
                .iter()
                .any(|ext| ext.oid.to_id_string() == TLS_FEATURE_OID)
        })
    }

    /// Forces the must-staple flag to be computed now, so later reads never
    /// hit the parse path. Suppliers call this on freshly issued records.
    pub fn prime_requires_staple(&self) {
        let _ = self.requires_staple();
    }

    /// Assembles this certificate's key, chain and OCSP staple into a TLS
    /// certificate ready to serve.
    pub fn certified_key(&self) -> Result<CertifiedKey, CentauriError> {
        let chain: Vec<CertificateDer<'static>> =
            CertificateDer::pem_slice_iter(self.certificate.as_bytes())
                .collect::<Result<_, _>>()
                .map_err(|e| CentauriError::BadKeyMaterial(e.to_string()))?;
        if chain.is_empty() {
            return Err(CentauriError::BadKeyMaterial(format!(
                "no certificates in PEM for {}",
                self.subject
            )));
        }

        let key = PrivateKeyDer::from_pem_slice(self.private_key.as_bytes())
            .map_err(|e| CentauriError::BadKeyMaterial(e.to_string()))?;

        let provider = rustls::crypto::ring::default_provider();
        let mut certified = CertifiedKey::from_der(chain, key, &provider)
            .map_err(|e| CentauriError::BadKeyMaterial(e.to_string()))?;

        if !self.ocsp_response.is_empty() {
            certified.ocsp = Some(self.ocsp_response.clone());
        }

        Ok(certified)
    }
}

/// The identity of a stored certificate: its subject plus the sorted alt
/// names. Two records are "for the same names" iff these keys are equal.
pub fn identity_key(subject: &str, alt_names: &[String]) -> String {
    let mut names = alt_names.to_vec();
    names.sort_unstable();
    let mut key = String::from(subject);
    for name in names {
        key.push(';');
        key.push_str(&name);
    }
    key
}

/// Serialises the OCSP response bytes as standard base64, and accepts either
/// a base64 string or `null` when reading.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if bytes.is_empty() {
            serializer.serialize_none()
        } else {
            serializer.serialize_str(&STANDARD.encode(bytes))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value: Option<String> = Option::deserialize(deserializer)?;
        match value {
            None => Ok(Vec::new()),
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
        }
    }
}

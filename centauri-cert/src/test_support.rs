use crate::details::CertificateDetails;
use chrono::{Duration, Utc};
use rcgen::{CertificateParams, CustomExtension, DistinguishedName, DnType, KeyPair};

/// Issues a real self-signed certificate for tests, optionally carrying the
/// TLS-feature (must-staple) extension.
pub(crate) fn issue_test_cert(
    subject: &str,
    alt_names: &[&str],
    validity: Duration,
    must_staple: bool,
) -> CertificateDetails {
    let mut names = vec![subject.to_owned()];
    names.extend(alt_names.iter().map(|s| s.to_string()));

    let mut params = CertificateParams::new(names).expect("certificate params");
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, subject);
    params.distinguished_name = dn;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::hours(1);
    params.not_after = now + time::Duration::seconds(validity.num_seconds());

    if must_staple {
        params.custom_extensions.push(CustomExtension::from_oid_content(
            &[1, 3, 6, 1, 5, 5, 7, 1, 24],
            vec![0x30, 0x03, 0x02, 0x01, 0x05],
        ));
    }

    let key_pair = KeyPair::generate().expect("key pair");
    let cert = params.self_signed(&key_pair).expect("self signed");

    let not_after = Utc::now() + validity;
    CertificateDetails::new(
        String::new(),
        key_pair.serialize_pem(),
        cert.pem(),
        subject.to_owned(),
        alt_names.iter().map(|s| s.to_string()).collect(),
        not_after,
        Vec::new(),
        not_after,
    )
}

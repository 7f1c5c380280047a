//! The minimal slice of OCSP (RFC 6960) needed for stapling: encoding a
//! single-certificate request, POSTing it to the responder named in the
//! certificate's authority-information-access extension, and pulling the
//! certificate status and `nextUpdate` out of the response. The response
//! bytes are otherwise treated as opaque and stapled verbatim.

use crate::details::CertificateDetails;
use centauri_core::CentauriError;
use chrono::{DateTime, NaiveDateTime, Utc};
use sha2::{Digest, Sha256};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{GeneralName, ParsedExtension};

const OID_AD_OCSP: &str = "1.3.6.1.5.5.7.48.1";

/// DER content bytes of the id-sha256 algorithm OID (2.16.840.1.101.3.4.2.1).
const SHA256_OID: [u8; 9] = [0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];

const TAG_SEQUENCE: u8 = 0x30;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_OID: u8 = 0x06;
const TAG_NULL: u8 = 0x05;
const TAG_INTEGER: u8 = 0x02;
const TAG_ENUMERATED: u8 = 0x0a;
const TAG_GENERALIZED_TIME: u8 = 0x18;

/// A freshly fetched staple: the raw DER response plus its `nextUpdate`.
pub struct Staple {
    pub raw: Vec<u8>,
    pub next_update: DateTime<Utc>,
}

/// Queries the certificate's OCSP responder and returns the staple. Fails
/// unless the responder reports the certificate status as good and provides
/// a `nextUpdate` time.
pub async fn fetch_staple(
    client: &reqwest::Client,
    cert: &CertificateDetails,
) -> Result<Staple, CentauriError> {
    let subject = cert.subject.as_str();
    let wrap = |e: String| CentauriError::supplier(subject, e);

    let leaf_pem = first_pem_block(&cert.certificate)
        .ok_or_else(|| wrap("certificate PEM is empty".to_owned()))?;
    let issuer_text = if cert.issuer.is_empty() {
        rest_pem_blocks(&cert.certificate)
            .ok_or_else(|| wrap("certificate chain has no issuer".to_owned()))?
    } else {
        cert.issuer.clone()
    };
    let issuer_pem = first_pem_block(&issuer_text)
        .ok_or_else(|| wrap("issuer PEM is empty".to_owned()))?;

    let (_, leaf_der) = x509_parser::pem::parse_x509_pem(leaf_pem.as_bytes())
        .map_err(|e| wrap(e.to_string()))?;
    let leaf = leaf_der.parse_x509().map_err(|e| wrap(e.to_string()))?;
    let (_, issuer_der) = x509_parser::pem::parse_x509_pem(issuer_pem.as_bytes())
        .map_err(|e| wrap(e.to_string()))?;
    let issuer = issuer_der.parse_x509().map_err(|e| wrap(e.to_string()))?;

    let url = responder_url(&leaf)
        .ok_or_else(|| wrap("certificate has no OCSP responder URL".to_owned()))?;

    let request = encode_request(
        &Sha256::digest(leaf.tbs_certificate.issuer.as_raw()),
        &Sha256::digest(issuer.tbs_certificate.subject_pki.subject_public_key.data.as_ref()),
        leaf.tbs_certificate.raw_serial(),
    );

    let response = client
        .post(&url)
        .header("Content-Type", "application/ocsp-request")
        .body(request)
        .send()
        .await
        .map_err(|e| wrap(e.to_string()))?
        .error_for_status()
        .map_err(|e| wrap(e.to_string()))?
        .bytes()
        .await
        .map_err(|e| wrap(e.to_string()))?;

    let next_update = parse_response(&response).map_err(|e| wrap(e))?;
    Ok(Staple {
        raw: response.to_vec(),
        next_update,
    })
}

/// Extracts the OCSP responder URL from the authority-information-access
/// extension, if present.
fn responder_url(cert: &X509Certificate) -> Option<String> {
    for ext in cert.extensions() {
        if let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() {
            for desc in &aia.accessdescs {
                if desc.access_method.to_id_string() == OID_AD_OCSP {
                    if let GeneralName::URI(uri) = &desc.access_location {
                        return Some(uri.to_string());
                    }
                }
            }
        }
    }
    None
}

pub(crate) fn first_pem_block(pem: &str) -> Option<String> {
    let start = pem.find("-----BEGIN CERTIFICATE-----")?;
    let end_marker = "-----END CERTIFICATE-----";
    let end = pem[start..].find(end_marker)? + start + end_marker.len();
    Some(pem[start..end].to_owned())
}

pub(crate) fn rest_pem_blocks(pem: &str) -> Option<String> {
    let end_marker = "-----END CERTIFICATE-----";
    let first_end = pem.find(end_marker)? + end_marker.len();
    let rest = pem[first_end..].trim();
    if rest.contains("-----BEGIN CERTIFICATE-----") {
        Some(rest.to_owned())
    } else {
        None
    }
}

/// Encodes a DER TLV with definite length.
fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
        out.push(0x80 | (bytes.len() - first) as u8);
        out.extend_from_slice(&bytes[first..]);
    }
    out.extend_from_slice(content);
    out
}

/// Encodes an OCSPRequest for a single certificate, identified by SHA-256
/// hashes of the issuer name and key.
fn encode_request(issuer_name_hash: &[u8], issuer_key_hash: &[u8], serial: &[u8]) -> Vec<u8> {
    let algorithm = tlv(
        TAG_SEQUENCE,
        &[tlv(TAG_OID, &SHA256_OID), tlv(TAG_NULL, &[])].concat(),
    );
    let cert_id = tlv(
        TAG_SEQUENCE,
        &[
            algorithm,
            tlv(TAG_OCTET_STRING, issuer_name_hash),
            tlv(TAG_OCTET_STRING, issuer_key_hash),
            tlv(TAG_INTEGER, serial),
        ]
        .concat(),
    );
    let request = tlv(TAG_SEQUENCE, &cert_id);
    let request_list = tlv(TAG_SEQUENCE, &request);
    let tbs_request = tlv(TAG_SEQUENCE, &request_list);
    tlv(TAG_SEQUENCE, &tbs_request)
}

/// A forward-only DER reader.
struct Der<'a> {
    data: &'a [u8],
}

impl<'a> Der<'a> {
    fn new(data: &'a [u8]) -> Self {
        Der { data }
    }

    fn peek_tag(&self) -> Option<u8> {
        self.data.first().copied()
    }

    /// Reads the next TLV, returning its tag and content.
    fn read(&mut self) -> Result<(u8, &'a [u8]), String> {
        let (&tag, rest) = self
            .data
            .split_first()
            .ok_or_else(|| "unexpected end of DER".to_owned())?;
        let (&first_len, rest) = rest
            .split_first()
            .ok_or_else(|| "truncated DER length".to_owned())?;

        let (len, rest) = if first_len < 0x80 {
            (first_len as usize, rest)
        } else {
            let count = (first_len & 0x7f) as usize;
            if count == 0 || count > 8 || rest.len() < count {
                return Err("unsupported DER length".to_owned());
            }
            let mut len = 0usize;
            for &b in &rest[..count] {
                len = len
                    .checked_mul(256)
                    .ok_or_else(|| "DER length overflow".to_owned())?
                    + b as usize;
            }
            (len, &rest[count..])
        };

        if rest.len() < len {
            return Err("DER content shorter than declared".to_owned());
        }
        let (content, remaining) = rest.split_at(len);
        self.data = remaining;
        Ok((tag, content))
    }

    fn expect(&mut self, want: u8) -> Result<&'a [u8], String> {
        let (tag, content) = self.read()?;
        if tag != want {
            return Err(format!("expected DER tag {want:#04x}, found {tag:#04x}"));
        }
        Ok(content)
    }
}

/// Walks an OCSPResponse far enough to confirm the status is good and
/// extract the single response's `nextUpdate`.
fn parse_response(bytes: &[u8]) -> Result<DateTime<Utc>, String> {
    let mut outer = Der::new(bytes);
    let mut response = Der::new(outer.expect(TAG_SEQUENCE)?);

    let status = response.expect(TAG_ENUMERATED)?;
    if status != [0] {
        return Err(format!("OCSP response status was not successful: {status:?}"));
    }

    // responseBytes [0] EXPLICIT
    let mut response_bytes = Der::new(response.expect(0xa0)?);
    let mut inner = Der::new(response_bytes.expect(TAG_SEQUENCE)?);
    let _response_type = inner.expect(TAG_OID)?;
    let basic_der = inner.expect(TAG_OCTET_STRING)?;

    let mut basic = Der::new(basic_der);
    let mut basic_fields = Der::new(basic.expect(TAG_SEQUENCE)?);
    let mut tbs = Der::new(basic_fields.expect(TAG_SEQUENCE)?);

    if tbs.peek_tag() == Some(0xa0) {
        tbs.read()?; // version
    }
    tbs.read()?; // responderID (byName [1] or byKey [2])
    tbs.expect(TAG_GENERALIZED_TIME)?; // producedAt

    let mut responses = Der::new(tbs.expect(TAG_SEQUENCE)?);
    let mut single = Der::new(responses.expect(TAG_SEQUENCE)?);

    single.expect(TAG_SEQUENCE)?; // certID
    let (status_tag, _) = single.read()?;
    if status_tag != 0x80 {
        return Err("OCSP response was not good".to_owned());
    }

    single.expect(TAG_GENERALIZED_TIME)?; // thisUpdate
    if single.peek_tag() != Some(0xa0) {
        return Err("OCSP response has no nextUpdate".to_owned());
    }
    let mut next_update = Der::new(single.expect(0xa0)?);
    let time = next_update.expect(TAG_GENERALIZED_TIME)?;
    parse_generalized_time(time)
}

/// Parses a DER GeneralizedTime (`YYYYMMDDHHMMSSZ`, optionally with
/// fractional seconds).
fn parse_generalized_time(bytes: &[u8]) -> Result<DateTime<Utc>, String> {
    let text = std::str::from_utf8(bytes).map_err(|e| e.to_string())?;
    let text = match text.find('.') {
        Some(dot) => {
            let (head, _) = text.split_at(dot);
            format!("{head}Z")
        }
        None => text.to_owned(),
    };
    NaiveDateTime::parse_from_str(&text, "%Y%m%d%H%M%SZ")
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("bad GeneralizedTime: {e}"))
}

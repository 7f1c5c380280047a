use crate::details::CertificateDetails;
use crate::dns::DnsProvider;
use crate::manager::Supplier;
use crate::ocsp;
use async_trait::async_trait;
use centauri_core::CentauriError;
use chrono::{DateTime, Duration, Utc};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, CustomExtension, DistinguishedName, DnType, KeyPair};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The TLS-feature extension asking clients to require a stapled OCSP
/// response: a SEQUENCE containing the status_request (5) feature.
const MUST_STAPLE_EXTENSION: [u8; 5] = [0x30, 0x03, 0x02, 0x01, 0x05];
const TLS_FEATURE_OID: [u64; 9] = [1, 3, 6, 1, 5, 5, 7, 1, 24];

const ORDER_POLL_ATTEMPTS: u32 = 10;

/// Configuration used to create a new [`AcmeSupplier`].
pub struct AcmeSupplierConfig {
    /// Where account registration data is cached on disk.
    pub user_data_path: PathBuf,
    /// Contact address supplied to the ACME endpoint.
    pub email: String,
    /// URL of the ACME directory.
    pub directory_url: String,
    /// Publishes TXT records to answer DNS-01 challenges.
    pub dns_provider: Arc<dyn DnsProvider>,
}

/// Saved ACME account state: the contact address, the registration URI, and
/// the account credentials (which embed the account private key).
#[derive(Serialize, Deserialize)]
struct AccountData {
    email: String,
    registration: Option<Registration>,
    key: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct Registration {
    uri: String,
}

/// Obtains certificates from an ACME endpoint using DNS-01 challenges.
pub struct AcmeSupplier {
    account: Account,
    dns_provider: Arc<dyn DnsProvider>,
    http: reqwest::Client,
}

impl AcmeSupplier {
    /// Creates a new supplier, registering or retrieving an account with the
    /// ACME server as necessary. Registration data is persisted to the
    /// configured path with mode 0600.
    pub async fn new(config: AcmeSupplierConfig) -> Result<Self, CentauriError> {
        let account = match load_account(&config.user_data_path)? {
            Some(data) => {
                debug!(email = %data.email, "Using saved ACME account");
                let credentials: AccountCredentials = serde_json::from_value(data.key)
                    .map_err(|e| setup_error("saved account credentials are invalid", e))?;
                Account::from_credentials(credentials)
                    .await
                    .map_err(|e| setup_error("unable to restore ACME account", e))?
            }
            None => {
                info!(email = %config.email, "Registering new ACME account");
                let contact = format!("mailto:{}", config.email);
                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: &[&contact],
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    &config.directory_url,
                    None,
                )
                .await
                .map_err(|e| setup_error("unable to register new account", e))?;

                save_account(&config.user_data_path, &config.email, &credentials)?;
                account
            }
        };

        Ok(AcmeSupplier {
            account,
            dns_provider: config.dns_provider,
            http: reqwest::Client::new(),
        })
    }

    /// Answers every pending DNS-01 challenge on the order, returning the
    /// records that were published so they can be cleaned up afterwards.
    async fn answer_challenges(
        &self,
        order: &mut Order,
    ) -> Result<Vec<(String, String)>, CentauriError> {
        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| CentauriError::supplier("order", e))?;

        let mut published = Vec::new();
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                status => {
                    return Err(CentauriError::supplier(
                        "order",
                        format!("authorization in unexpected state: {status:?}"),
                    ));
                }
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Dns01)
                .ok_or_else(|| {
                    CentauriError::supplier("order", "no DNS-01 challenge offered")
                })?;

            let Identifier::Dns(domain) = &authz.identifier;
            let value = order.key_authorization(challenge).dns_value();

            self.dns_provider.present(domain, &value).await?;
            published.push((domain.clone(), value));

            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|e| CentauriError::supplier(domain, e))?;
        }

        Ok(published)
    }

    /// Polls the order until the server has finished validating, with
    /// exponential backoff.
    async fn wait_for_order(&self, order: &mut Order) -> Result<(), CentauriError> {
        let mut delay = std::time::Duration::from_millis(500);
        for _ in 0..ORDER_POLL_ATTEMPTS {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(std::time::Duration::from_secs(8));

            let state = order
                .refresh()
                .await
                .map_err(|e| CentauriError::supplier("order", e))?;
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    return Err(CentauriError::supplier("order", "order became invalid"));
                }
                _ => {}
            }
        }
        Err(CentauriError::supplier("order", "timed out awaiting validation"))
    }

    async fn obtain(
        &self,
        subject: &str,
        alt_names: &[String],
        should_staple: bool,
    ) -> Result<CertificateDetails, CentauriError> {
        let wrap = |e: &dyn std::fmt::Display| CentauriError::supplier(subject, e);

        let identifiers: Vec<Identifier> = std::iter::once(subject)
            .chain(alt_names.iter().map(String::as_str))
            .map(|d| Identifier::Dns(d.to_owned()))
            .collect();

        let mut order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| wrap(&e))?;

        let published = self.answer_challenges(&mut order).await?;
        let outcome = self.wait_for_order(&mut order).await;

        for (domain, value) in &published {
            if let Err(e) = self.dns_provider.cleanup(domain, value).await {
                warn!(domain, error = %e, "Failed to clean up challenge record");
            }
        }
        outcome?;

        let (csr_der, key_pem) = build_csr(subject, alt_names, should_staple)?;
        order.finalize(&csr_der).await.map_err(|e| wrap(&e))?;

        let mut chain_pem = None;
        for _ in 0..ORDER_POLL_ATTEMPTS {
            if let Some(chain) = order.certificate().await.map_err(|e| wrap(&e))? {
                chain_pem = Some(chain);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
        let chain_pem =
            chain_pem.ok_or_else(|| wrap(&"timed out awaiting issued certificate"))?;

        let not_after = chain_not_after(&chain_pem).map_err(|e| wrap(&e))?;
        let issuer = ocsp::rest_pem_blocks(&chain_pem).unwrap_or_default();

        let details = CertificateDetails::new(
            issuer,
            key_pem,
            chain_pem,
            subject.to_owned(),
            alt_names.to_vec(),
            not_after,
            Vec::new(),
            DateTime::<Utc>::UNIX_EPOCH,
        );
        details.prime_requires_staple();
        Ok(details)
    }
}

#[async_trait]
impl Supplier for AcmeSupplier {
    async fn get_certificate(
        &self,
        subject: &str,
        alt_names: &[String],
        should_staple: bool,
    ) -> Result<CertificateDetails, CentauriError> {
        info!(domain = subject, alt_names = ?alt_names, "Obtaining certificate");
        let mut details = self.obtain(subject, alt_names, should_staple).await?;

        if should_staple {
            self.update_staple(&mut details).await?;
        }

        Ok(details)
    }

    async fn update_staple(&self, cert: &mut CertificateDetails) -> Result<(), CentauriError> {
        info!(domain = %cert.subject, alt_names = ?cert.alt_names, "Updating OCSP staple");
        let staple = ocsp::fetch_staple(&self.http, cert).await?;
        cert.ocsp_response = staple.raw;
        cert.next_ocsp_update = staple.next_update;
        Ok(())
    }

    fn min_certificate_validity(&self) -> Duration {
        Duration::days(30)
    }

    fn min_staple_validity(&self) -> Duration {
        Duration::hours(24)
    }
}

fn setup_error(context: &str, err: impl std::fmt::Display) -> CentauriError {
    CentauriError::ConfigSource(format!("{context}: {err}"))
}

/// Reads the cached account data, if any.
fn load_account(path: &Path) -> Result<Option<AccountData>, CentauriError> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| setup_error("unable to parse saved account data", e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CentauriError::StoreIo(e)),
    }
}

/// Persists the account data with mode 0600.
fn save_account(
    path: &Path,
    email: &str,
    credentials: &AccountCredentials,
) -> Result<(), CentauriError> {
    let key = serde_json::to_value(credentials)
        .map_err(|e| setup_error("unable to serialise account credentials", e))?;
    let uri = key
        .get("id")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .unwrap_or_default();

    let data = AccountData {
        email: email.to_owned(),
        registration: Some(Registration { uri }),
        key,
    };

    let bytes =
        serde_json::to_vec(&data).map_err(|e| setup_error("unable to serialise account", e))?;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(CentauriError::StoreIo)?;
    file.write_all(&bytes).map_err(CentauriError::StoreIo)?;
    Ok(())
}

/// Builds the certificate signing request and matching private key for the
/// given names, optionally carrying the must-staple extension.
fn build_csr(
    subject: &str,
    alt_names: &[String],
    should_staple: bool,
) -> Result<(Vec<u8>, String), CentauriError> {
    let mut names = vec![subject.to_owned()];
    names.extend_from_slice(alt_names);

    let mut params =
        CertificateParams::new(names).map_err(|e| CentauriError::supplier(subject, e))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, subject);
    params.distinguished_name = dn;

    if should_staple {
        params.custom_extensions.push(CustomExtension::from_oid_content(
            &TLS_FEATURE_OID,
            MUST_STAPLE_EXTENSION.to_vec(),
        ));
    }

    let key_pair = KeyPair::generate().map_err(|e| CentauriError::supplier(subject, e))?;
    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| CentauriError::supplier(subject, e))?;

    Ok((csr.der().to_vec(), key_pair.serialize_pem()))
}

/// Extracts the expiry time of the first (leaf) certificate in a PEM chain.
fn chain_not_after(chain_pem: &str) -> Result<DateTime<Utc>, String> {
    let leaf = ocsp::first_pem_block(chain_pem).ok_or("no certificate in chain")?;
    let (_, pem) =
        x509_parser::pem::parse_x509_pem(leaf.as_bytes()).map_err(|e| e.to_string())?;
    let cert = pem.parse_x509().map_err(|e| e.to_string())?;
    let not_after = cert.validity().not_after.to_datetime();
    DateTime::<Utc>::from_timestamp(not_after.unix_timestamp(), 0)
        .ok_or_else(|| "certificate expiry out of range".to_owned())
}

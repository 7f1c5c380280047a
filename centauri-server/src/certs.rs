use crate::Cli;
use centauri_cert::acme::{AcmeSupplier, AcmeSupplierConfig};
use centauri_cert::dns;
use centauri_cert::self_signed::SelfSignedSupplier;
use centauri_cert::{CertificateManager, CertificateProvider, CertificateStore, Supplier, WildcardResolver};
use centauri_core::CentauriError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Builds the certificate provider chain: file store, then the manager with
/// its suppliers, wrapped in the wildcard resolver.
///
/// The ACME supplier is optional: if it can't be constructed (no DNS
/// provider configured, account setup failure) a warning is logged and only
/// the self-signed supplier is registered.
pub async fn build_provider(cli: &Cli) -> Result<Arc<dyn CertificateProvider>, CentauriError> {
    let store = Arc::new(CertificateStore::open(&cli.certificate_store)?);

    let mut suppliers: HashMap<String, Arc<dyn Supplier>> = HashMap::new();
    match create_acme_supplier(cli).await {
        Ok(supplier) => {
            suppliers.insert("acme".to_owned(), supplier);
        }
        Err(e) => {
            warn!(error = %e, "Unable to create ACME certificate supplier");
        }
    }
    suppliers.insert("selfsigned".to_owned(), Arc::new(SelfSignedSupplier::new()));

    let preference: Vec<String> = cli
        .certificate_providers
        .split_whitespace()
        .map(str::to_owned)
        .collect();

    let manager = CertificateManager::new(store, suppliers, preference, cli.ocsp_stapling);

    let wildcard_bases: Vec<String> = cli
        .wildcard_domains
        .split_whitespace()
        .map(str::to_owned)
        .collect();

    Ok(Arc::new(WildcardResolver::new(
        Arc::new(manager),
        &wildcard_bases,
    )))
}

async fn create_acme_supplier(cli: &Cli) -> Result<Arc<dyn Supplier>, CentauriError> {
    if cli.dns_provider.is_empty() {
        return Err(CentauriError::ConfigSource(
            "no DNS provider specified".to_owned(),
        ));
    }

    let dns_provider = dns::create_provider(&cli.dns_provider)?;
    let supplier = AcmeSupplier::new(AcmeSupplierConfig {
        user_data_path: cli.user_data.clone(),
        email: cli.acme_email.clone(),
        directory_url: cli.acme_directory.clone(),
        dns_provider,
    })
    .await?;

    Ok(Arc::new(supplier))
}

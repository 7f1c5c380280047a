use async_trait::async_trait;
use centauri_core::CentauriError;
use std::sync::Arc;
use tracing::debug;

/// Places and removes the TXT records used to answer ACME DNS-01 challenges.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Publishes `value` as a TXT record at `_acme-challenge.<domain>`.
    /// Implementations should not return until the record is visible to the
    /// authority's resolvers.
    async fn present(&self, domain: &str, value: &str) -> Result<(), CentauriError>;

    /// Removes a previously published record.
    async fn cleanup(&self, domain: &str, value: &str) -> Result<(), CentauriError>;
}

/// Creates a DNS provider by name.
pub fn create_provider(name: &str) -> Result<Arc<dyn DnsProvider>, CentauriError> {
    match name {
        "exec" => Ok(Arc::new(ExecDnsProvider::from_env()?)),
        _ => Err(CentauriError::ConfigSource(format!(
            "unknown DNS provider: {name}"
        ))),
    }
}

/// Runs user-supplied shell commands to manage challenge records. The record
/// details are passed in the `ACME_DOMAIN` and `ACME_DNS_VALUE` environment
/// variables.
pub struct ExecDnsProvider {
    present_command: String,
    cleanup_command: String,
}

impl ExecDnsProvider {
    /// Reads the present/cleanup commands from `ACME_DNS_EXEC_PRESENT` and
    /// `ACME_DNS_EXEC_CLEANUP`.
    pub fn from_env() -> Result<Self, CentauriError> {
        let present_command = std::env::var("ACME_DNS_EXEC_PRESENT").map_err(|_| {
            CentauriError::ConfigSource(
                "exec DNS provider requires ACME_DNS_EXEC_PRESENT".to_owned(),
            )
        })?;
        let cleanup_command = std::env::var("ACME_DNS_EXEC_CLEANUP").map_err(|_| {
            CentauriError::ConfigSource(
                "exec DNS provider requires ACME_DNS_EXEC_CLEANUP".to_owned(),
            )
        })?;
        Ok(ExecDnsProvider {
            present_command,
            cleanup_command,
        })
    }

    pub fn new(present_command: String, cleanup_command: String) -> Self {
        ExecDnsProvider {
            present_command,
            cleanup_command,
        }
    }

    async fn run(&self, command: &str, domain: &str, value: &str) -> Result<(), CentauriError> {
        debug!(domain, command, "Running DNS exec command");
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("ACME_DOMAIN", domain)
            .env("ACME_DNS_VALUE", value)
            .output()
            .await
            .map_err(|e| CentauriError::supplier(domain, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CentauriError::supplier(
                domain,
                format!("DNS exec command failed ({command}): {stderr}"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DnsProvider for ExecDnsProvider {
    async fn present(&self, domain: &str, value: &str) -> Result<(), CentauriError> {
        self.run(&self.present_command, domain, value).await
    }

    async fn cleanup(&self, domain: &str, value: &str) -> Result<(), CentauriError> {
        self.run(&self.cleanup_command, domain, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exec_provider_passes_record_in_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("record");
        let provider = ExecDnsProvider::new(
            format!(
                "printf '%s %s' \"$ACME_DOMAIN\" \"$ACME_DNS_VALUE\" > {}",
                out.display()
            ),
            "true".to_owned(),
        );

        provider.present("example.com", "token-value").await.unwrap();
        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written, "example.com token-value");

        provider.cleanup("example.com", "token-value").await.unwrap();
    }

    #[tokio::test]
    async fn exec_provider_surfaces_command_failure() {
        let provider = ExecDnsProvider::new("exit 3".to_owned(), "true".to_owned());
        let err = provider.present("example.com", "v").await.unwrap_err();
        assert!(matches!(err, CentauriError::Supplier { .. }));
    }

    #[test]
    fn unknown_provider_name_is_rejected() {
        assert!(create_provider("route53").is_err());
    }
}

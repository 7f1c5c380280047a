use crate::manager::CertificateProvider;
use async_trait::async_trait;
use centauri_core::CentauriError;
use rustls::sign::CertifiedKey;
use std::sync::Arc;

/// Wraps a certificate provider and rewrites requested names according to a
/// set of wildcard base domains.
///
/// If `.example.com` is configured as a wildcard base, requests for
/// `foo.example.com`, `bar.example.com`, etc, are converted to
/// `*.example.com`. Requests for `example.com` itself or for
/// `a.b.example.com` are left alone.
pub struct WildcardResolver {
    upstream: Arc<dyn CertificateProvider>,
    domains: Vec<String>,
}

impl WildcardResolver {
    /// Creates a resolver treating each of the given domains as a wildcard
    /// base. Bare entries gain a leading dot; empty entries are dropped.
    pub fn new(upstream: Arc<dyn CertificateProvider>, domains: &[String]) -> Self {
        let domains = domains
            .iter()
            .filter(|d| !d.is_empty())
            .map(|d| {
                if d.starts_with('.') {
                    d.clone()
                } else {
                    format!(".{d}")
                }
            })
            .collect();

        WildcardResolver { upstream, domains }
    }

    /// Replaces the domain with its wildcard equivalent if it is a direct
    /// child of any configured base.
    fn apply_wildcard(&self, domain: &str) -> String {
        for base in &self.domains {
            if let Some(prefix) = domain.strip_suffix(base.as_str()) {
                if !prefix.is_empty() && !prefix.contains('.') {
                    return format!("*{base}");
                }
            }
        }
        domain.to_owned()
    }

    fn apply_wildcards(&self, domains: &[String]) -> Vec<String> {
        domains.iter().map(|d| self.apply_wildcard(d)).collect()
    }
}

#[async_trait]
impl CertificateProvider for WildcardResolver {
    async fn get_certificate(
        &self,
        preferred_supplier: &str,
        subject: &str,
        alt_names: &[String],
    ) -> Result<Arc<CertifiedKey>, CentauriError> {
        self.upstream
            .get_certificate(
                preferred_supplier,
                &self.apply_wildcard(subject),
                &self.apply_wildcards(alt_names),
            )
            .await
    }

    async fn get_existing_certificate(
        &self,
        preferred_supplier: &str,
        subject: &str,
        alt_names: &[String],
    ) -> Result<(Arc<CertifiedKey>, bool), CentauriError> {
        self.upstream
            .get_existing_certificate(
                preferred_supplier,
                &self.apply_wildcard(subject),
                &self.apply_wildcards(alt_names),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records the names requested from it and fails every call, which is
    /// all these tests need.
    #[derive(Default)]
    struct RecordingProvider {
        seen: Mutex<Vec<(String, Vec<String>)>>,
    }

    #[async_trait]
    impl CertificateProvider for RecordingProvider {
        async fn get_certificate(
            &self,
            _preferred_supplier: &str,
            subject: &str,
            alt_names: &[String],
        ) -> Result<Arc<CertifiedKey>, CentauriError> {
            self.seen
                .lock()
                .push((subject.to_owned(), alt_names.to_vec()));
            Err(CentauriError::supplier(subject, "recording only"))
        }

        async fn get_existing_certificate(
            &self,
            _preferred_supplier: &str,
            subject: &str,
            alt_names: &[String],
        ) -> Result<(Arc<CertifiedKey>, bool), CentauriError> {
            self.seen
                .lock()
                .push((subject.to_owned(), alt_names.to_vec()));
            Err(CentauriError::ExpiredOrMissing(subject.to_owned()))
        }
    }

    async fn request(resolver: &WildcardResolver, subject: &str, alts: &[&str]) {
        let alts: Vec<String> = alts.iter().map(|s| s.to_string()).collect();
        let _ = resolver.get_certificate("", subject, &alts).await;
    }

    fn resolver_with(
        bases: &[&str],
    ) -> (WildcardResolver, Arc<RecordingProvider>) {
        let provider = Arc::new(RecordingProvider::default());
        let bases: Vec<String> = bases.iter().map(|s| s.to_string()).collect();
        (
            WildcardResolver::new(Arc::clone(&provider) as Arc<dyn CertificateProvider>, &bases),
            provider,
        )
    }

    #[tokio::test]
    async fn rewrites_direct_children_of_bases() {
        let (resolver, provider) = resolver_with(&["example.com", ".example.org"]);
        request(&resolver, "foo.example.com", &["bar.example.org"]).await;

        let seen = provider.seen.lock();
        assert_eq!(seen[0].0, "*.example.com");
        assert_eq!(seen[0].1, ["*.example.org"]);
    }

    #[tokio::test]
    async fn leaves_deeper_names_and_bases_alone() {
        let (resolver, provider) = resolver_with(&["example.com"]);
        request(&resolver, "foo.bar.example.com", &["example.com"]).await;

        let seen = provider.seen.lock();
        assert_eq!(seen[0].0, "foo.bar.example.com");
        assert_eq!(seen[0].1, ["example.com"]);
    }

    #[tokio::test]
    async fn unrelated_domains_pass_through() {
        let (resolver, provider) = resolver_with(&["example.com"]);
        request(&resolver, "other.net", &["sub.other.net"]).await;

        let seen = provider.seen.lock();
        assert_eq!(seen[0].0, "other.net");
        assert_eq!(seen[0].1, ["sub.other.net"]);
    }

    #[tokio::test]
    async fn empty_bases_are_dropped() {
        let (resolver, provider) = resolver_with(&["", "example.com"]);
        request(&resolver, "foo.example.com", &[]).await;

        let seen = provider.seen.lock();
        assert_eq!(seen[0].0, "*.example.com");
    }

    #[tokio::test]
    async fn existing_certificate_path_is_rewritten_too() {
        let (resolver, provider) = resolver_with(&["example.com"]);
        let _ = resolver
            .get_existing_certificate("", "foo.example.com", &[])
            .await;

        let seen = provider.seen.lock();
        assert_eq!(seen[0].0, "*.example.com");
    }
}

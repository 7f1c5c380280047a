use centauri_core::CentauriError;
use rustls::crypto::ring;
use rustls::server::ResolvesServerCert;
use rustls::{ServerConfig, SupportedCipherSuite};
use std::sync::Arc;

/// Mozilla "intermediate" profile: TLS 1.3 suites plus ECDHE + AEAD for
/// TLS 1.2.
static CIPHER_SUITES: &[SupportedCipherSuite] = &[
    ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
    ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
    ring::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
    ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    ring::cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
];

/// Builds the TLS listener configuration: minimum TLS 1.2, the intermediate
/// cipher profile, certificates resolved per-handshake by the given
/// resolver, and ALPN offering h2 then http/1.1.
pub fn server_config(
    resolver: Arc<dyn ResolvesServerCert>,
) -> Result<ServerConfig, CentauriError> {
    let provider = rustls::crypto::CryptoProvider {
        cipher_suites: CIPHER_SUITES.to_vec(),
        ..ring::default_provider()
    };

    let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .map_err(|e| CentauriError::FrontendBind(std::io::Error::other(e)))?
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

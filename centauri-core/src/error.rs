use thiserror::Error;

/// Unified error type for Centauri.
#[derive(Error, Debug)]
pub enum CentauriError {
    #[error("invalid domain name: {0}")]
    InvalidDomain(String),

    #[error("certificate store I/O failure: {0}")]
    StoreIo(#[source] std::io::Error),

    #[error("certificate store is corrupt: {0}")]
    StoreCorrupt(#[source] serde_json::Error),

    #[error("certificate supplier failure for {subject}: {reason}")]
    Supplier { subject: String, reason: String },

    #[error("requested supplier not found: {0}")]
    SupplierUnknown(String),

    #[error("no suppliers found for preference: {0:?}")]
    NoSupplier(Vec<String>),

    #[error("bad key material: {0}")]
    BadKeyMaterial(String),

    #[error("certificate expired or missing for {0}")]
    ExpiredOrMissing(String),

    #[error("config parse error: {0}")]
    ConfigParse(String),

    #[error("frontend failed to bind: {0}")]
    FrontendBind(#[source] std::io::Error),

    #[error("config source failure: {0}")]
    ConfigSource(String),

    #[error("this manager does not support obtaining certificates")]
    NoProvider,
}

impl CentauriError {
    /// Wraps an arbitrary supplier failure with the subject it was for.
    pub fn supplier(subject: impl Into<String>, err: impl std::fmt::Display) -> Self {
        CentauriError::Supplier {
            subject: subject.into(),
            reason: err.to_string(),
        }
    }
}

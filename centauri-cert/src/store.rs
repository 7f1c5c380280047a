use crate::details::{identity_key, CertificateDetails};
use centauri_core::CentauriError;
use chrono::Duration;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// File-backed certificate store.
///
/// Certificates are kept in memory and serialised to a single JSON file on
/// every save. Expired records are pruned as part of saving. Each identity
/// (subject + sorted alt names) has its own async lock so that at most one
/// caller at a time runs the get-decide-renew-save critical section for a
/// given set of names.
pub struct CertificateStore {
    path: PathBuf,
    certificates: Mutex<Vec<CertificateDetails>>,
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl CertificateStore {
    /// Opens the store at the given path, loading any previously saved
    /// certificates. A missing file is treated as an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CentauriError> {
        let path = path.into();
        let certificates = match fs::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(CentauriError::StoreCorrupt)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(CentauriError::StoreIo(e)),
        };

        Ok(CertificateStore {
            path,
            certificates: Mutex::new(certificates),
            locks: DashMap::new(),
        })
    }

    /// Returns a previously stored certificate with the given subject and
    /// alt names, or `None` if there isn't one.
    ///
    /// Returned certificates are not guaranteed to be valid.
    pub fn get_certificate(
        &self,
        subject: &str,
        alt_names: &[String],
    ) -> Option<CertificateDetails> {
        self.certificates
            .lock()
            .iter()
            .find(|c| c.is_for(subject, alt_names))
            .cloned()
    }

    /// Adds the given certificate to the store, replacing any previously
    /// saved certificate for the same names, pruning expired records, and
    /// serialising the result to disk.
    ///
    /// Callers should hold the identity lock from [`lock_certificate`]
    /// across the read-modify-save sequence.
    ///
    /// [`lock_certificate`]: CertificateStore::lock_certificate
    pub fn save_certificate(&self, certificate: CertificateDetails) -> Result<(), CentauriError> {
        let mut certs = self.certificates.lock();
        certs.retain(|c| !c.is_for(&certificate.subject, &certificate.alt_names));
        certs.push(certificate);
        certs.retain(|c| c.valid_for(Duration::zero()));
        self.persist(&certs)
    }

    /// Acquires the write lock for the given identity. The critical section
    /// ends when the returned guard is dropped.
    pub async fn lock_certificate(
        &self,
        subject: &str,
        alt_names: &[String],
    ) -> OwnedMutexGuard<()> {
        let key = identity_key(subject, alt_names);
        let lock = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Serialises the given list to disk: write to a temporary file with
    /// mode 0600, then rename over the target.
    fn persist(&self, certs: &[CertificateDetails]) -> Result<(), CentauriError> {
        let bytes = serde_json::to_vec(certs).map_err(CentauriError::StoreCorrupt)?;

        let tmp = self.path.with_extension("tmp");
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)
            .map_err(CentauriError::StoreIo)?;
        file.write_all(&bytes).map_err(CentauriError::StoreIo)?;
        file.sync_all().map_err(CentauriError::StoreIo)?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(CentauriError::StoreIo)
    }
}

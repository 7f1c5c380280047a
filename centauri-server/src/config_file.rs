use crate::config_source::{Apply, ConfigSource};
use async_trait::async_trait;
use centauri_core::{config, CentauriError};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Reads routes from a file on disk. Reloads are requested through a
/// single-slot channel, so a reload asked for while another is pending is
/// coalesced into it.
pub struct FileConfigSource {
    path: PathBuf,
    update_tx: mpsc::Sender<()>,
    update_rx: Option<mpsc::Receiver<()>>,
    stop_tx: mpsc::Sender<()>,
    stop_rx: Option<mpsc::Receiver<()>>,
    worker: Option<JoinHandle<()>>,
}

impl FileConfigSource {
    pub fn new(path: PathBuf) -> Self {
        let (update_tx, update_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        FileConfigSource {
            path,
            update_tx,
            update_rx: Some(update_rx),
            stop_tx,
            stop_rx: Some(stop_rx),
            worker: None,
        }
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn start(
        &mut self,
        apply: Apply,
        err_tx: mpsc::Sender<CentauriError>,
    ) -> Result<(), CentauriError> {
        let update_rx = self
            .update_rx
            .take()
            .ok_or_else(|| CentauriError::ConfigSource("file source already started".into()))?;
        let stop_rx = self.stop_rx.take().expect("stop channel present");

        self.worker = Some(tokio::spawn(run(
            self.path.clone(),
            update_rx,
            stop_rx,
            apply,
            err_tx,
        )));
        self.reload();
        Ok(())
    }

    async fn stop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }

    fn reload(&self) {
        match self.update_tx.try_send(()) {
            Ok(()) => info!("Scheduled config update"),
            Err(_) => info!("A config update was already scheduled; ignoring"),
        }
    }

    async fn validate(&self) -> Result<(), CentauriError> {
        debug!(path = %self.path.display(), "Validating config file");
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| CentauriError::ConfigParse(format!("failed to read config file: {e}")))?;
        config::parse(&text)?;
        info!(path = %self.path.display(), "Config file is valid");
        Ok(())
    }
}

async fn run(
    path: PathBuf,
    mut update_rx: mpsc::Receiver<()>,
    mut stop_rx: mpsc::Receiver<()>,
    apply: Apply,
    err_tx: mpsc::Sender<CentauriError>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.recv() => return,
            Some(()) = update_rx.recv() => {
                if let Err(e) = load_and_apply(&path, &apply).await {
                    let _ = err_tx.send(e).await;
                }
            }
        }
    }
}

async fn load_and_apply(path: &PathBuf, apply: &Apply) -> Result<(), CentauriError> {
    debug!(path = %path.display(), "Reading config file");
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CentauriError::ConfigParse(format!("failed to read config file: {e}")))?;

    let set = config::parse(&text)?;
    let count = set.routes.len();

    debug!(count, "Installing routes");
    apply(set).await?;
    debug!(count, "Finished installing routes");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn apply_into(store: Arc<Mutex<Vec<usize>>>) -> Apply {
        Arc::new(move |set| {
            let store = Arc::clone(&store);
            Box::pin(async move {
                store.lock().push(set.routes.len());
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn start_loads_the_initial_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("centauri.conf");
        std::fs::write(&path, "route example.com\n    upstream 127.0.0.1:8080\n").unwrap();

        let applied = Arc::new(Mutex::new(Vec::new()));
        let (err_tx, mut err_rx) = mpsc::channel(1);
        let mut source = FileConfigSource::new(path);
        source.start(apply_into(Arc::clone(&applied)), err_tx).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(*applied.lock(), [1]);
        assert!(err_rx.try_recv().is_err());

        source.stop().await;
    }

    #[tokio::test]
    async fn reload_rereads_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("centauri.conf");
        std::fs::write(&path, "route example.com\n    upstream 127.0.0.1:8080\n").unwrap();

        let applied = Arc::new(Mutex::new(Vec::new()));
        let (err_tx, _err_rx) = mpsc::channel(1);
        let mut source = FileConfigSource::new(path.clone());
        source.start(apply_into(Arc::clone(&applied)), err_tx).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        std::fs::write(
            &path,
            "route example.com\n    upstream 127.0.0.1:8080\n\
             route other.com\n    upstream 127.0.0.1:8081\n",
        )
        .unwrap();
        source.reload();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert_eq!(*applied.lock(), [1, 2]);
        source.stop().await;
    }

    #[tokio::test]
    async fn parse_errors_reach_the_error_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("centauri.conf");
        std::fs::write(&path, "route example.com\n").unwrap(); // no upstream

        let applied = Arc::new(Mutex::new(Vec::new()));
        let (err_tx, mut err_rx) = mpsc::channel(1);
        let mut source = FileConfigSource::new(path);
        source.start(apply_into(Arc::clone(&applied)), err_tx).await.unwrap();

        let err = tokio::time::timeout(std::time::Duration::from_secs(1), err_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, CentauriError::ConfigParse(_)));
        assert!(applied.lock().is_empty());

        source.stop().await;
    }

    #[tokio::test]
    async fn validate_does_not_apply() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("centauri.conf");
        std::fs::write(&path, "route example.com\n    upstream 127.0.0.1:8080\n").unwrap();

        let source = FileConfigSource::new(path);
        source.validate().await.unwrap();
    }

    #[tokio::test]
    async fn validate_rejects_bad_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("centauri.conf");
        std::fs::write(&path, "nonsense\n").unwrap();

        let source = FileConfigSource::new(path);
        assert!(source.validate().await.is_err());
    }
}

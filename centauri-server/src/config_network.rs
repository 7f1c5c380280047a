use crate::config_source::{Apply, ConfigSource};
use async_trait::async_trait;
use centauri_core::{config, CentauriError};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MAGIC_BYTES: &[u8; 8] = b"CENTAURI";
const PROTOCOL_VERSION: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
const RECONNECT_INTERVAL: Duration = Duration::from_millis(100);
const INITIAL_CONFIG_TIMEOUT: Duration = Duration::from_secs(10);

/// Streams route configuration over TCP. Each message is framed as the
/// `CENTAURI` magic, a 4-byte big-endian protocol version, a 4-byte
/// big-endian payload length, and the payload in the same grammar as the
/// config file.
///
/// The first message must arrive within a fixed deadline. A read failure is
/// retried once after a short backoff by reconnecting; a second consecutive
/// failure takes the source down.
pub struct NetworkConfigSource {
    address: String,
    stop_tx: mpsc::Sender<()>,
    stop_rx: Option<mpsc::Receiver<()>>,
    worker: Option<JoinHandle<()>>,
}

impl NetworkConfigSource {
    pub fn new(address: String) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        NetworkConfigSource {
            address,
            stop_tx,
            stop_rx: Some(stop_rx),
            worker: None,
        }
    }
}

#[async_trait]
impl ConfigSource for NetworkConfigSource {
    async fn start(
        &mut self,
        apply: Apply,
        err_tx: mpsc::Sender<CentauriError>,
    ) -> Result<(), CentauriError> {
        if self.address.is_empty() {
            return Err(CentauriError::ConfigSource(
                "address must be specified when using network config source".to_owned(),
            ));
        }

        let conn = TcpStream::connect(&self.address).await.map_err(|e| {
            CentauriError::ConfigSource(format!("failed to connect to config server: {e}"))
        })?;

        let stop_rx = self.stop_rx.take().ok_or_else(|| {
            CentauriError::ConfigSource("network source already started".to_owned())
        })?;
        self.worker = Some(tokio::spawn(run(
            conn,
            self.address.clone(),
            stop_rx,
            apply,
            err_tx,
        )));
        Ok(())
    }

    async fn stop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(worker) = self.worker.take() {
            worker.abort();
            let _ = worker.await;
        }
    }

    fn reload(&self) {
        info!("Reloading is not supported for the network config source");
    }

    async fn validate(&self) -> Result<(), CentauriError> {
        Err(CentauriError::ConfigSource(
            "validation is not supported for the network config source".to_owned(),
        ))
    }
}

async fn run(
    mut conn: TcpStream,
    address: String,
    mut stop_rx: mpsc::Receiver<()>,
    apply: Apply,
    err_tx: mpsc::Sender<CentauriError>,
) {
    let mut second_chance = false;
    let mut initial_config_read = false;

    loop {
        let read = async {
            if initial_config_read {
                read_and_apply(&mut conn, &apply).await
            } else {
                match tokio::time::timeout(
                    INITIAL_CONFIG_TIMEOUT,
                    read_and_apply(&mut conn, &apply),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(CentauriError::ConfigSource(
                        "timed out waiting for initial config".to_owned(),
                    )),
                }
            }
        };

        tokio::select! {
            _ = stop_rx.recv() => return,
            result = read => match result {
                Ok(()) => {
                    initial_config_read = true;
                    second_chance = false;
                }
                Err(e) => {
                    warn!(error = %e, "Error reading config from network");

                    if second_chance {
                        let _ = err_tx
                            .send(CentauriError::ConfigSource(format!(
                                "failed to read config after reconnection: {e}"
                            )))
                            .await;
                        return;
                    }

                    match reconnect(&address).await {
                        Ok(new_conn) => {
                            conn = new_conn;
                            second_chance = true;
                        }
                        Err(e) => {
                            let _ = err_tx
                                .send(CentauriError::ConfigSource(format!(
                                    "failed to reconnect to config server: {e}"
                                )))
                                .await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn reconnect(address: &str) -> std::io::Result<TcpStream> {
    tokio::time::sleep(RECONNECT_INTERVAL).await;
    let conn = TcpStream::connect(address).await?;
    info!(address, "Reconnected to config server");
    Ok(conn)
}

async fn read_and_apply(conn: &mut TcpStream, apply: &Apply) -> Result<(), CentauriError> {
    let framing = |message: String| CentauriError::ConfigSource(message);

    let mut magic = [0u8; 8];
    conn.read_exact(&mut magic)
        .await
        .map_err(|e| framing(format!("failed to read magic bytes: {e}")))?;
    if &magic != MAGIC_BYTES {
        return Err(framing(format!(
            "invalid magic bytes: got {magic:?}, expected {MAGIC_BYTES:?}"
        )));
    }

    let mut version = [0u8; 4];
    conn.read_exact(&mut version)
        .await
        .map_err(|e| framing(format!("failed to read version header: {e}")))?;
    if version != PROTOCOL_VERSION {
        return Err(framing(format!("unsupported protocol version: {version:?}")));
    }

    let mut length_bytes = [0u8; 4];
    conn.read_exact(&mut length_bytes)
        .await
        .map_err(|e| framing(format!("failed to read payload length: {e}")))?;
    let length = u32::from_be_bytes(length_bytes);
    if length == 0 {
        return Err(framing("payload length is zero".to_owned()));
    }

    let mut payload = vec![0u8; length as usize];
    conn.read_exact(&mut payload)
        .await
        .map_err(|e| framing(format!("failed to read payload: {e}")))?;

    debug!(size = length, "Received config from network");

    let text = String::from_utf8(payload)
        .map_err(|e| framing(format!("config payload is not UTF-8: {e}")))?;
    let set = config::parse(&text)?;
    let count = set.routes.len();

    debug!(count, "Installing routes from network config");
    apply(set).await?;
    debug!(count, "Finished installing routes from network config");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut message = Vec::new();
        message.extend_from_slice(MAGIC_BYTES);
        message.extend_from_slice(&PROTOCOL_VERSION);
        message.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        message.extend_from_slice(payload);
        message
    }

    fn collecting_apply(domains: Arc<Mutex<Vec<String>>>) -> Apply {
        Arc::new(move |set| {
            let domains = Arc::clone(&domains);
            Box::pin(async move {
                for route in &set.routes {
                    domains.lock().push(route.primary_domain().to_owned());
                }
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn applies_a_framed_route_set() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let payload = b"route example.com\n  upstream 127.0.0.1:8080\n";
            socket.write_all(&frame(payload)).await.unwrap();
            // Hold the connection open so the reader doesn't see EOF.
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let domains = Arc::new(Mutex::new(Vec::new()));
        let (err_tx, _err_rx) = mpsc::channel(1);
        let mut source = NetworkConfigSource::new(address);
        source
            .start(collecting_apply(Arc::clone(&domains)), err_tx)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*domains.lock(), ["example.com"]);

        source.stop().await;
        server.abort();
    }

    #[tokio::test]
    async fn bad_magic_is_fatal_after_one_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            // Serve garbage to the initial connection and to the reconnect.
            for _ in 0..2 {
                let (mut socket, _) = listener.accept().await.unwrap();
                let _ = socket.write_all(b"NOTRIGHT________").await;
                let _ = socket.shutdown().await;
            }
        });

        let domains = Arc::new(Mutex::new(Vec::new()));
        let (err_tx, mut err_rx) = mpsc::channel(1);
        let mut source = NetworkConfigSource::new(address);
        source
            .start(collecting_apply(Arc::clone(&domains)), err_tx)
            .await
            .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), err_rx.recv())
            .await
            .expect("expected a fatal error")
            .unwrap();
        assert!(matches!(err, CentauriError::ConfigSource(_)));
        assert!(domains.lock().is_empty());

        source.stop().await;
        server.abort();
    }

    #[tokio::test]
    async fn recovers_after_a_single_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            // First connection: garbage, then dropped.
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = socket.write_all(b"XXXXXXXX").await;
            let _ = socket.shutdown().await;
            drop(socket);

            // Reconnect gets a valid config.
            let (mut socket, _) = listener.accept().await.unwrap();
            let payload = b"route recovered.com\n  upstream 127.0.0.1:8080\n";
            socket.write_all(&frame(payload)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let domains = Arc::new(Mutex::new(Vec::new()));
        let (err_tx, mut err_rx) = mpsc::channel(1);
        let mut source = NetworkConfigSource::new(address);
        source
            .start(collecting_apply(Arc::clone(&domains)), err_tx)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*domains.lock(), ["recovered.com"]);
        assert!(err_rx.try_recv().is_err());

        source.stop().await;
        server.abort();
    }

    #[tokio::test]
    async fn refusing_server_fails_start_synchronously() {
        let (err_tx, _err_rx) = mpsc::channel(1);
        let mut source = NetworkConfigSource::new("127.0.0.1:1".to_owned());
        let apply: Apply = Arc::new(|_| Box::pin(async { Ok(()) }));
        assert!(source.start(apply, err_tx).await.is_err());
    }

    #[tokio::test]
    async fn zero_length_payload_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let Ok((mut socket, _)) = listener.accept().await else { return };
                let mut message = Vec::new();
                message.extend_from_slice(MAGIC_BYTES);
                message.extend_from_slice(&PROTOCOL_VERSION);
                message.extend_from_slice(&0u32.to_be_bytes());
                let _ = socket.write_all(&message).await;
                let _ = socket.shutdown().await;
            }
        });

        let domains = Arc::new(Mutex::new(Vec::new()));
        let (err_tx, mut err_rx) = mpsc::channel(1);
        let mut source = NetworkConfigSource::new(address);
        source
            .start(collecting_apply(Arc::clone(&domains)), err_tx)
            .await
            .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), err_rx.recv())
            .await
            .expect("expected a fatal error")
            .unwrap();
        assert!(matches!(err, CentauriError::ConfigSource(_)));

        source.stop().await;
        server.abort();
    }
}

use crate::service::{empty_body, ProxyService};
use crate::tls;
use async_trait::async_trait;
use centauri_core::CentauriError;
use centauri_proxy::decorator::PeerInfo;
use centauri_proxy::{redirector, RouteManager};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a frontend needs to serve traffic.
pub struct FrontendContext {
    pub manager: Arc<RouteManager>,
    pub service: Arc<ProxyService>,
}

/// A set of listeners bound to the outside world.
#[async_trait]
pub trait Frontend: Send {
    /// Binds and starts serving. Synchronous bind failures are returned;
    /// later failures go to the error channel.
    async fn serve(
        &mut self,
        ctx: FrontendContext,
        err_tx: mpsc::Sender<CentauriError>,
    ) -> Result<(), CentauriError>;

    /// Gracefully stops serving, waiting up to the shutdown timeout for
    /// in-flight requests. Requests still running after that are abandoned.
    async fn stop(&mut self);

    /// Whether the supervisor should wire up a certificate provider.
    fn uses_certificates(&self) -> bool;
}

/// Creates a frontend by name.
pub fn create_frontend(
    name: &str,
    http_port: u16,
    https_port: u16,
) -> Result<Box<dyn Frontend>, CentauriError> {
    match name.to_ascii_lowercase().as_str() {
        "tcp" => Ok(Box::new(TcpFrontend::new(http_port, https_port))),
        "tailscale" => Err(CentauriError::ConfigSource(
            "the tailscale frontend is not built in this distribution".to_owned(),
        )),
        _ => Err(CentauriError::ConfigSource(format!(
            "unknown frontend: {name}"
        ))),
    }
}

/// Binds a plain HTTP port that redirects everything to HTTPS, and a TLS
/// port serving the rewriting reverse proxy.
pub struct TcpFrontend {
    http_port: u16,
    https_port: u16,
    shutdown: Option<watch::Sender<bool>>,
    active: Arc<AtomicUsize>,
    tasks: Vec<JoinHandle<()>>,
}

impl TcpFrontend {
    pub fn new(http_port: u16, https_port: u16) -> Self {
        TcpFrontend {
            http_port,
            https_port,
            shutdown: None,
            active: Arc::new(AtomicUsize::new(0)),
            tasks: Vec::new(),
        }
    }
}

#[async_trait]
impl Frontend for TcpFrontend {
    async fn serve(
        &mut self,
        ctx: FrontendContext,
        _err_tx: mpsc::Sender<CentauriError>,
    ) -> Result<(), CentauriError> {
        info!(
            https_port = self.https_port,
            http_port = self.http_port,
            "Starting TCP frontend"
        );

        let plain = TcpListener::bind(("0.0.0.0", self.http_port))
            .await
            .map_err(CentauriError::FrontendBind)?;
        let secure = TcpListener::bind(("0.0.0.0", self.https_port))
            .await
            .map_err(CentauriError::FrontendBind)?;

        let manager_clone: Arc<RouteManager> = Arc::clone(&ctx.manager);
        let resolver: Arc<dyn rustls::server::ResolvesServerCert> = manager_clone;
        let tls_config = tls::server_config(resolver)?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown = Some(shutdown_tx);

        self.tasks.push(tokio::spawn(run_plain_listener(
            plain,
            shutdown_rx.clone(),
            Arc::clone(&self.active),
        )));
        self.tasks.push(tokio::spawn(run_tls_listener(
            secure,
            acceptor,
            ctx.service,
            shutdown_rx,
            Arc::clone(&self.active),
        )));

        Ok(())
    }

    async fn stop(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };
        let _ = shutdown.send(true);

        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        // Give in-flight connections until the deadline to drain.
        let deadline = tokio::time::Instant::now() + SHUTDOWN_TIMEOUT;
        while self.active.load(Ordering::Acquire) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.active.load(Ordering::Acquire),
                    "Shutdown timeout reached with connections still open"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("TCP frontend stopped");
    }

    fn uses_certificates(&self) -> bool {
        true
    }
}

/// Decrements the active-connection count when a connection task finishes.
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard(counter)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn run_plain_listener(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    active: Arc<AtomicUsize>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                let guard = ConnectionGuard::new(Arc::clone(&active));
                tokio::spawn(async move {
                    let _guard = guard;
                    serve_plain_connection(stream).await;
                });
            }
        }
    }
}

async fn serve_plain_connection(stream: TcpStream) {
    let service = service_fn(|request: hyper::Request<hyper::body::Incoming>| async move {
        let (parts, _body) = request.into_parts();
        let response = redirector::https_redirect(&parts).map(|_| empty_body());
        Ok::<_, Infallible>(response)
    });

    if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!(error = %e, "Plain connection ended with error");
    }
}

async fn run_tls_listener(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    service: Arc<ProxyService>,
    mut shutdown: watch::Receiver<bool>,
    active: Arc<AtomicUsize>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            accepted = listener.accept() => {
                let Ok((stream, peer_addr)) = accepted else { continue };
                let acceptor = acceptor.clone();
                let service = Arc::clone(&service);
                let guard = ConnectionGuard::new(Arc::clone(&active));
                tokio::spawn(async move {
                    let _guard = guard;
                    serve_tls_connection(stream, peer_addr, acceptor, service).await;
                });
            }
        }
    }
}

async fn serve_tls_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    proxy: Arc<ProxyService>,
) {
    let tls_stream = match acceptor.accept(stream).await {
        Ok(stream) => stream,
        Err(e) => {
            // Includes handshakes failed because no certificate was
            // available for the requested name.
            debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
            return;
        }
    };

    let peer = PeerInfo {
        remote_addr: peer_addr,
        tls: true,
    };

    let service = service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
        let proxy = Arc::clone(&proxy);
        async move { Ok::<_, Infallible>(proxy.handle(request, peer).await) }
    });

    if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(tls_stream), service)
        .await
    {
        debug!(peer = %peer_addr, error = %e, "TLS connection ended with error");
    }
}

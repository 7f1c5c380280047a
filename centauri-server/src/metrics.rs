use centauri_proxy::rewriter::strip_port;
use centauri_proxy::RouteManager;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

/// Collects request metrics, labelled by the route that served them.
pub struct Recorder {
    manager: Arc<RouteManager>,
    registry: Registry,
    requests_total: IntCounterVec,
    in_flight: IntGauge,
}

impl Recorder {
    pub fn new(manager: Arc<RouteManager>) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("centauri_requests_total", "Total requests handled"),
            &["route", "method", "status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let in_flight = IntGauge::new(
            "centauri_requests_in_flight",
            "Requests currently being proxied",
        )?;
        registry.register(Box::new(in_flight.clone()))?;

        Ok(Recorder {
            manager,
            registry,
            requests_total,
            in_flight,
        })
    }

    /// Records one handled request against the route serving its host.
    pub fn record(&self, host: &str, method: &Method, status: StatusCode) {
        let route = self
            .manager
            .route_for_domain(strip_port(host))
            .map(|r| r.primary_domain().to_owned())
            .unwrap_or_else(|| "unknown".to_owned());

        self.requests_total
            .with_label_values(&[&route, method.as_str(), status.as_str()])
            .inc();
    }

    pub fn connection_opened(&self) {
        self.in_flight.inc();
    }

    pub fn connection_closed(&self) {
        self.in_flight.dec();
    }

    fn exposition(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
        }
        buffer
    }
}

/// Serves the text exposition endpoint until the shutdown flag flips.
pub async fn serve(recorder: Arc<Recorder>, port: u16, mut shutdown: watch::Receiver<bool>) {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(port, error = %e, "Failed to bind metrics listener");
            return;
        }
    };
    info!(port, "Metrics server listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                let recorder = Arc::clone(&recorder);
                tokio::spawn(async move {
                    let service = service_fn(move |_req| {
                        let body = recorder.exposition();
                        async move {
                            Ok::<_, Infallible>(hyper::Response::new(
                                Full::new(bytes::Bytes::from(body)).boxed(),
                            ))
                        }
                    });
                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        }
    }
    info!("Metrics server stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_requests_against_unknown_routes() {
        let manager = Arc::new(RouteManager::new(None));
        let recorder = Recorder::new(manager).unwrap();

        recorder.record("nowhere.com", &Method::GET, StatusCode::BAD_GATEWAY);
        recorder.connection_opened();
        recorder.connection_closed();

        let text = String::from_utf8(recorder.exposition()).unwrap();
        assert!(text.contains("centauri_requests_total"));
        assert!(text.contains("unknown"));
    }
}

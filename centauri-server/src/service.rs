use crate::metrics::Recorder;
use bytes::Bytes;
use centauri_proxy::decorator::PeerInfo;
use centauri_proxy::redirector;
use centauri_proxy::rewriter::request_host;
use centauri_proxy::{RouteManager, Rewriter};
use http::header::{HeaderValue, CONTENT_TYPE, HOST};
use http::{StatusCode, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const BAD_GATEWAY_PAGE: &str = r#"<!doctype html>
<html lang="en">
<head>
  <title>502 Bad Gateway</title>
</head>
<body>
  <h1>Bad Gateway</h1>
  <p>The server was unable to complete your request. Please try again later.</p>
</body>
</html>"#;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// The TLS-side request handler: redirects to primary domains where
/// configured, rewrites the request, streams it to the chosen upstream, and
/// rewrites the response headers on the way back. Upstream failures become a
/// 502 with a static page.
pub struct ProxyService {
    manager: Arc<RouteManager>,
    rewriter: Arc<Rewriter>,
    client: Client<HttpConnector, Incoming>,
    recorder: Arc<Recorder>,
}

impl ProxyService {
    pub fn new(
        manager: Arc<RouteManager>,
        rewriter: Arc<Rewriter>,
        recorder: Arc<Recorder>,
    ) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(100)
            .build_http();

        ProxyService {
            manager,
            rewriter,
            client,
            recorder,
        }
    }

    pub async fn handle(&self, request: Request<Incoming>, peer: PeerInfo) -> Response<ProxyBody> {
        self.recorder.connection_opened();
        let response = self.proxy(request, peer).await;
        self.recorder.connection_closed();
        response
    }

    async fn proxy(&self, request: Request<Incoming>, peer: PeerInfo) -> Response<ProxyBody> {
        let (inbound, body) = request.into_parts();
        let host = request_host(&inbound).unwrap_or_default().to_owned();

        if let Some(redirect) = redirector::primary_redirect(&self.manager, &inbound, peer.tls) {
            self.recorder
                .record(&host, &inbound.method, redirect.status());
            return redirect.map(|_| empty_body());
        }

        let mut outbound = inbound.clone();
        outbound.version = Version::HTTP_11;
        if !outbound.headers.contains_key(HOST) {
            // HTTP/2 carries the host in the :authority pseudo-header; the
            // HTTP/1.1 upstream request needs it as a Host header.
            if let Some(authority) = inbound.uri.authority() {
                if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                    outbound.headers.insert(HOST, value);
                }
            }
        }

        if !self.rewriter.rewrite_request(&inbound, &mut outbound, &peer) {
            return self.bad_gateway(&host, &inbound.method);
        }

        let upstream = outbound.uri.authority().map(|a| a.to_string());
        match self.client.request(Request::from_parts(outbound, body)).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                self.rewriter.rewrite_headers(&host, &mut parts.headers);
                self.recorder.record(&host, &inbound.method, parts.status);
                Response::from_parts(parts, body.boxed())
            }
            Err(e) => {
                warn!(
                    upstream = upstream.as_deref().unwrap_or("<none>"),
                    error = %e,
                    "Failed to connect to upstream"
                );
                self.bad_gateway(&host, &inbound.method)
            }
        }
    }

    /// Builds the 502 response, with the route's header rules applied so the
    /// error page carries the configured headers too.
    fn bad_gateway(&self, host: &str, method: &http::Method) -> Response<ProxyBody> {
        let mut response = Response::builder()
            .status(StatusCode::BAD_GATEWAY)
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .body(full_body(Bytes::from_static(BAD_GATEWAY_PAGE.as_bytes())))
            .unwrap();

        self.rewriter.rewrite_headers(host, response.headers_mut());
        self.recorder.record(host, method, StatusCode::BAD_GATEWAY);
        response
    }
}

pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

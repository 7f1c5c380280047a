use crate::decorator::{
    BannedHeaderDecorator, Decorator, PeerInfo, UserAgentDecorator, XForwardedDecorator,
};
use crate::manager::RouteManager;
use centauri_core::route::HeaderOp;
use http::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use http::request::Parts;
use http::Uri;
use ipnet::IpNet;
use rand::Rng;
use std::sync::Arc;
use tracing::warn;

/// Rewrites HTTP requests and responses according to the routes held by a
/// [`RouteManager`].
///
/// Outbound requests pass through an ordered decorator chain before an
/// upstream is chosen; response headers are adjusted per the route's header
/// rules. The chain is fixed once serving starts.
pub struct Rewriter {
    manager: Arc<RouteManager>,
    decorators: Vec<Box<dyn Decorator>>,
}

impl Rewriter {
    /// Creates a rewriter with the default decorator chain: X-Forwarded-*
    /// handling, banned header removal, and user-agent defaulting.
    pub fn new(manager: Arc<RouteManager>, trusted_downstreams: Vec<IpNet>) -> Self {
        Rewriter {
            manager,
            decorators: vec![
                Box::new(XForwardedDecorator::new(trusted_downstreams)),
                Box::new(BannedHeaderDecorator::new()),
                Box::new(UserAgentDecorator),
            ],
        }
    }

    /// Appends a decorator to the chain. Must happen before serving starts.
    pub fn add_decorator(&mut self, decorator: Box<dyn Decorator>) {
        self.decorators.push(decorator);
    }

    /// Modifies the outbound request: applies the decorator chain and points
    /// the request at an upstream chosen uniformly at random from the
    /// route's upstream list.
    ///
    /// Returns `false` if no route (or no upstream) exists for the request's
    /// host, in which case the caller should fail the request.
    pub fn rewrite_request(
        &self,
        inbound: &Parts,
        outbound: &mut Parts,
        peer: &PeerInfo,
    ) -> bool {
        let host = match request_host(inbound) {
            Some(host) => strip_port(host).to_owned(),
            None => return false,
        };

        let Some(route) = self.manager.route_for_domain(&host) else {
            return false;
        };
        if route.upstreams.is_empty() {
            return false;
        }

        for decorator in &self.decorators {
            decorator.decorate(inbound, outbound, peer);
        }

        let upstream = &route.upstreams[rand::thread_rng().gen_range(0..route.upstreams.len())];
        let path_and_query = outbound
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        match Uri::builder()
            .scheme("http")
            .authority(upstream.as_str())
            .path_and_query(path_and_query)
            .build()
        {
            Ok(uri) => outbound.uri = uri,
            Err(e) => {
                warn!(upstream, error = %e, "Upstream address is not a valid authority");
                return false;
            }
        }

        true
    }

    /// Applies the route's header rules to a response's headers. Used for
    /// both upstream responses and locally generated error responses, so
    /// error pages inherit the configured headers too.
    pub fn rewrite_headers(&self, request_host: &str, headers: &mut HeaderMap) {
        let Some(route) = self.manager.route_for_domain(strip_port(request_host)) else {
            return;
        };

        for rule in &route.headers {
            let Ok(name) = HeaderName::from_bytes(rule.name.as_bytes()) else {
                warn!(header = %rule.name, "Configured header name is invalid");
                continue;
            };

            match rule.op {
                HeaderOp::Delete => {
                    headers.remove(&name);
                }
                HeaderOp::Add => {
                    if let Ok(value) = HeaderValue::from_str(&rule.value) {
                        headers.append(name, value);
                    }
                }
                HeaderOp::Replace => {
                    if let Ok(value) = HeaderValue::from_str(&rule.value) {
                        headers.insert(name, value);
                    }
                }
                HeaderOp::Default => {
                    if !headers.contains_key(&name) {
                        if let Ok(value) = HeaderValue::from_str(&rule.value) {
                            headers.insert(name, value);
                        }
                    }
                }
            }
        }
    }
}

/// The hostname a request was addressed to: the Host header if present,
/// otherwise the URI authority (as with HTTP/2's `:authority`).
pub fn request_host(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| parts.uri.authority().map(|a| a.as_str()))
}

/// Removes a trailing `:port` from a host, if present.
pub fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port))
            if !name.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            name
        }
        _ => host,
    }
}

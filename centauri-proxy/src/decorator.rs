use http::header::{HeaderValue, FORWARDED, HOST, USER_AGENT};
use http::request::Parts;
use ipnet::IpNet;
use std::net::SocketAddr;

/// Connection-level facts about the downstream client, which `http` request
/// types don't carry.
#[derive(Debug, Clone, Copy)]
pub struct PeerInfo {
    pub remote_addr: SocketAddr,
    pub tls: bool,
}

/// Modifies an outbound HTTP request in some way before it is proxied. The
/// original, unmodified request is provided in `inbound`.
pub trait Decorator: Send + Sync {
    fn decorate(&self, inbound: &Parts, outbound: &mut Parts, peer: &PeerInfo);
}

/// Sets the X-Forwarded-For, X-Forwarded-Host and X-Forwarded-Proto headers
/// based on the downstream connection.
///
/// Values supplied by the client are only honoured (appended to or passed
/// through) when the peer address falls inside one of the trusted
/// downstream networks; otherwise they are replaced outright.
pub struct XForwardedDecorator {
    trusted_downstreams: Vec<IpNet>,
}

impl XForwardedDecorator {
    pub fn new(trusted_downstreams: Vec<IpNet>) -> Self {
        XForwardedDecorator {
            trusted_downstreams,
        }
    }

    fn trusted(&self, peer: &PeerInfo) -> bool {
        let ip = peer.remote_addr.ip();
        self.trusted_downstreams.iter().any(|net| net.contains(&ip))
    }
}

impl Decorator for XForwardedDecorator {
    fn decorate(&self, inbound: &Parts, outbound: &mut Parts, peer: &PeerInfo) {
        let ip = peer.remote_addr.ip().to_string();
        let trusted = self.trusted(peer);

        let incoming = |name: &str| {
            inbound
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
        };

        let forwarded_for = match incoming("x-forwarded-for") {
            Some(existing) if trusted => format!("{existing}, {ip}"),
            _ => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            outbound.headers.insert("x-forwarded-for", value);
        }

        let forwarded_host = match incoming("x-forwarded-host") {
            Some(existing) if trusted => existing.to_owned(),
            _ => outbound
                .headers
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
                .or_else(|| outbound.uri.authority().map(|a| a.to_string()))
                .unwrap_or_default(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_host) {
            outbound.headers.insert("x-forwarded-host", value);
        }

        let forwarded_proto = match incoming("x-forwarded-proto") {
            Some(existing) if trusted => existing.to_owned(),
            _ if peer.tls => "https".to_owned(),
            _ => "http".to_owned(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_proto) {
            outbound.headers.insert("x-forwarded-proto", value);
        }
    }
}

/// Removes identity-bearing headers supplied by the client.
///
/// Covers the common client-IP headers plus the identity headers that
/// frontend-specific decorators may set later in the chain, so clients can't
/// forge them. X-Forwarded-For/-Host/-Proto are always replaced or
/// validated by [`XForwardedDecorator`], so they aren't listed here.
pub struct BannedHeaderDecorator {
    headers: Vec<&'static str>,
}

impl BannedHeaderDecorator {
    pub fn new() -> Self {
        BannedHeaderDecorator {
            headers: vec![
                "x-real-ip",
                "true-client-ip",
                FORWARDED.as_str(),
                "tailscale-user-login",
                "tailscale-user-name",
                "tailscale-user-profile-pic",
            ],
        }
    }
}

impl Default for BannedHeaderDecorator {
    fn default() -> Self {
        Self::new()
    }
}

impl Decorator for BannedHeaderDecorator {
    fn decorate(&self, _inbound: &Parts, outbound: &mut Parts, _peer: &PeerInfo) {
        for name in &self.headers {
            outbound.headers.remove(*name);
        }
    }
}

/// Forces a blank user-agent if the client didn't send one, so the HTTP
/// client doesn't substitute its own default.
pub struct UserAgentDecorator;

impl Decorator for UserAgentDecorator {
    fn decorate(&self, _inbound: &Parts, outbound: &mut Parts, _peer: &PeerInfo) {
        if !outbound.headers.contains_key(USER_AGENT) {
            outbound
                .headers
                .insert(USER_AGENT, HeaderValue::from_static(""));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn parts(builder: http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    fn peer(addr: &str, tls: bool) -> PeerInfo {
        PeerInfo {
            remote_addr: addr.parse().unwrap(),
            tls,
        }
    }

    fn trusted_loopback() -> XForwardedDecorator {
        XForwardedDecorator::new(vec!["127.0.0.0/8".parse().unwrap()])
    }

    #[test]
    fn untrusted_peer_replaces_forwarded_for() {
        let decorator = XForwardedDecorator::new(vec![]);
        let inbound = parts(
            Request::builder()
                .uri("https://example.com/")
                .header("x-forwarded-for", "10.0.0.1"),
        );
        let mut outbound = inbound.clone();

        decorator.decorate(&inbound, &mut outbound, &peer("127.0.0.1:9999", true));
        assert_eq!(outbound.headers["x-forwarded-for"], "127.0.0.1");
    }

    #[test]
    fn trusted_peer_appends_to_forwarded_for() {
        let decorator = trusted_loopback();
        let inbound = parts(
            Request::builder()
                .uri("https://example.com/")
                .header("x-forwarded-for", "10.0.0.1"),
        );
        let mut outbound = inbound.clone();

        decorator.decorate(&inbound, &mut outbound, &peer("127.0.0.1:9999", true));
        assert_eq!(outbound.headers["x-forwarded-for"], "10.0.0.1, 127.0.0.1");
    }

    #[test]
    fn trusted_peer_without_header_still_gets_own_ip() {
        let decorator = trusted_loopback();
        let inbound = parts(Request::builder().uri("https://example.com/"));
        let mut outbound = inbound.clone();

        decorator.decorate(&inbound, &mut outbound, &peer("127.0.0.5:1000", true));
        assert_eq!(outbound.headers["x-forwarded-for"], "127.0.0.5");
    }

    #[test]
    fn forwarded_host_and_proto_replaced_for_untrusted() {
        let decorator = XForwardedDecorator::new(vec![]);
        let inbound = parts(
            Request::builder()
                .uri("/")
                .header(HOST, "example.com")
                .header("x-forwarded-host", "forged.com")
                .header("x-forwarded-proto", "https"),
        );
        let mut outbound = inbound.clone();

        decorator.decorate(&inbound, &mut outbound, &peer("192.0.2.1:5000", false));
        assert_eq!(outbound.headers["x-forwarded-host"], "example.com");
        assert_eq!(outbound.headers["x-forwarded-proto"], "http");
    }

    #[test]
    fn forwarded_host_and_proto_pass_through_for_trusted() {
        let decorator = trusted_loopback();
        let inbound = parts(
            Request::builder()
                .uri("/")
                .header(HOST, "example.com")
                .header("x-forwarded-host", "public.example.com")
                .header("x-forwarded-proto", "https"),
        );
        let mut outbound = inbound.clone();

        decorator.decorate(&inbound, &mut outbound, &peer("127.0.0.1:5000", false));
        assert_eq!(outbound.headers["x-forwarded-host"], "public.example.com");
        assert_eq!(outbound.headers["x-forwarded-proto"], "https");
    }

    #[test]
    fn proto_reflects_tls_when_not_supplied() {
        let decorator = XForwardedDecorator::new(vec![]);
        let inbound = parts(Request::builder().uri("/").header(HOST, "example.com"));

        let mut outbound = inbound.clone();
        decorator.decorate(&inbound, &mut outbound, &peer("192.0.2.1:5000", true));
        assert_eq!(outbound.headers["x-forwarded-proto"], "https");

        let mut outbound = inbound.clone();
        decorator.decorate(&inbound, &mut outbound, &peer("192.0.2.1:5000", false));
        assert_eq!(outbound.headers["x-forwarded-proto"], "http");
    }

    #[test]
    fn banned_headers_are_removed() {
        let decorator = BannedHeaderDecorator::new();
        let inbound = parts(
            Request::builder()
                .uri("/")
                .header("x-real-ip", "10.0.0.1")
                .header("true-client-ip", "10.0.0.1")
                .header("forwarded", "for=10.0.0.1")
                .header("tailscale-user-login", "someone")
                .header("x-harmless", "keep"),
        );
        let mut outbound = inbound.clone();

        decorator.decorate(&inbound, &mut outbound, &peer("192.0.2.1:5000", false));
        assert!(outbound.headers.get("x-real-ip").is_none());
        assert!(outbound.headers.get("true-client-ip").is_none());
        assert!(outbound.headers.get("forwarded").is_none());
        assert!(outbound.headers.get("tailscale-user-login").is_none());
        assert_eq!(outbound.headers["x-harmless"], "keep");
    }

    #[test]
    fn missing_user_agent_becomes_blank() {
        let decorator = UserAgentDecorator;
        let inbound = parts(Request::builder().uri("/"));
        let mut outbound = inbound.clone();

        decorator.decorate(&inbound, &mut outbound, &peer("192.0.2.1:5000", false));
        assert_eq!(outbound.headers[USER_AGENT], "");
    }

    #[test]
    fn existing_user_agent_is_kept() {
        let decorator = UserAgentDecorator;
        let inbound = parts(Request::builder().uri("/").header(USER_AGENT, "curl/8.0"));
        let mut outbound = inbound.clone();

        decorator.decorate(&inbound, &mut outbound, &peer("192.0.2.1:5000", false));
        assert_eq!(outbound.headers[USER_AGENT], "curl/8.0");
    }
}

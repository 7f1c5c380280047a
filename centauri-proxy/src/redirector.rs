use crate::manager::RouteManager;
use crate::rewriter::{request_host, strip_port};
use centauri_core::is_domain_name;
use http::header::LOCATION;
use http::request::Parts;
use http::{Response, StatusCode};
use tracing::debug;

/// Answers a plain-HTTP request with a permanent redirect to the HTTPS
/// equivalent, preserving path and query. Requests whose host is not a legal
/// domain name are rejected with 400 and no body.
pub fn https_redirect(parts: &Parts) -> Response<()> {
    let host = request_host(parts).unwrap_or_default();
    let host = strip_port(host);

    if !is_domain_name(host) {
        debug!(host, "Invalid host header, not redirecting");
        return Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(())
            .unwrap();
    }

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Response::builder()
        .status(StatusCode::PERMANENT_REDIRECT)
        .header(LOCATION, format!("https://{host}{path_and_query}"))
        .body(())
        .unwrap()
}

/// If the request's route asks for it, redirects requests on secondary
/// domains to the route's primary domain. Returns `None` when the request
/// should be handled normally.
pub fn primary_redirect(manager: &RouteManager, parts: &Parts, tls: bool) -> Option<Response<()>> {
    let host = strip_port(request_host(parts)?);
    let route = manager.route_for_domain(host)?;

    if !route.redirect_to_primary || host.eq_ignore_ascii_case(route.primary_domain()) {
        return None;
    }

    let scheme = if tls { "https" } else { "http" };
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    Some(
        Response::builder()
            .status(StatusCode::PERMANENT_REDIRECT)
            .header(
                LOCATION,
                format!("{scheme}://{}{path_and_query}", route.primary_domain()),
            )
            .body(())
            .unwrap(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use centauri_core::route::Route;
    use centauri_core::RouteSet;
    use http::header::HOST;
    use http::Request;
    use std::sync::Arc;

    fn parts_for(host: &str, path: &str) -> Parts {
        Request::builder()
            .uri(path)
            .header(HOST, host)
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[test]
    fn redirects_to_https_preserving_path_and_query() {
        let response = https_redirect(&parts_for("example.com:80", "/a?b=c"));
        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(response.headers()[LOCATION], "https://example.com/a?b=c");
    }

    #[test]
    fn rejects_bogus_hosts() {
        let response = https_redirect(&parts_for("invalid..domain", "/"));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().get(LOCATION).is_none());

        let response = https_redirect(&parts_for("127.0.0.1", "/"));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    async fn manager_with_redirect(redirect: bool) -> Arc<RouteManager> {
        let mut route = Route::new(vec!["example.com".into(), "www.example.com".into()]);
        route.upstreams = vec!["10.0.0.1:8080".into()];
        route.redirect_to_primary = redirect;

        let manager = Arc::new(RouteManager::new(None));
        manager
            .set_routes(RouteSet {
                routes: vec![Arc::new(route)],
                fallback: None,
            })
            .await
            .unwrap();
        manager
    }

    #[tokio::test]
    async fn secondary_domain_redirects_to_primary() {
        let manager = manager_with_redirect(true).await;
        let response = primary_redirect(&manager, &parts_for("www.example.com", "/p?q=v"), true)
            .expect("redirect expected");
        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(response.headers()[LOCATION], "https://example.com/p?q=v");
    }

    #[tokio::test]
    async fn primary_domain_passes_through() {
        let manager = manager_with_redirect(true).await;
        assert!(primary_redirect(&manager, &parts_for("example.com", "/p"), true).is_none());
    }

    #[tokio::test]
    async fn plain_http_redirects_with_http_scheme() {
        let manager = manager_with_redirect(true).await;
        let response = primary_redirect(&manager, &parts_for("www.example.com", "/"), false)
            .expect("redirect expected");
        assert_eq!(response.headers()[LOCATION], "http://example.com/");
    }

    #[tokio::test]
    async fn routes_without_the_flag_pass_through() {
        let manager = manager_with_redirect(false).await;
        assert!(primary_redirect(&manager, &parts_for("www.example.com", "/"), true).is_none());
    }

    #[tokio::test]
    async fn unknown_hosts_pass_through() {
        let manager = manager_with_redirect(true).await;
        assert!(primary_redirect(&manager, &parts_for("other.com", "/"), true).is_none());
    }
}

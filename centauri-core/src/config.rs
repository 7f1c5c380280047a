use crate::error::CentauriError;
use crate::route::{HeaderOp, HeaderRule, Route};
use std::sync::Arc;

/// A parsed set of routes plus the optional fallback route, which is always
/// one of the routes in the list.
#[derive(Debug)]
pub struct RouteSet {
    pub routes: Vec<Arc<Route>>,
    pub fallback: Option<Arc<Route>>,
}

/// Reads the line-oriented route configuration and returns the routes it
/// contains.
///
/// Directives are case-insensitive; blank lines and lines starting with `#`
/// are ignored. Each `route` opens a block that the following directives
/// attach to.
pub fn parse(input: &str) -> Result<RouteSet, CentauriError> {
    let mut routes: Vec<Route> = Vec::new();
    let mut fallback: Option<usize> = None;

    for raw in input.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (directive, args) = match line.split_once(char::is_whitespace) {
            Some((d, a)) => (d, a.trim()),
            None => (line, ""),
        };

        match directive.to_ascii_lowercase().as_str() {
            "route" => {
                let domains: Vec<String> =
                    args.split_whitespace().map(str::to_owned).collect();
                if domains.is_empty() {
                    return Err(CentauriError::ConfigParse(format!(
                        "route without domains: {line}"
                    )));
                }
                routes.push(Route::new(domains));
            }
            "upstream" => {
                let route = current(&mut routes, line)?;
                if args.is_empty() {
                    return Err(CentauriError::ConfigParse(format!(
                        "upstream without address: {line}"
                    )));
                }
                route.upstreams.push(args.to_owned());
            }
            "header" => {
                let route = current(&mut routes, line)?;
                route.headers.push(parse_header(args)?);
            }
            "provider" => {
                let route = current(&mut routes, line)?;
                if !route.provider.is_empty() {
                    return Err(CentauriError::ConfigParse(format!(
                        "route {:?} has multiple providers",
                        route.domains
                    )));
                }
                if args.is_empty() {
                    return Err(CentauriError::ConfigParse(format!(
                        "provider without name: {line}"
                    )));
                }
                route.provider = args.to_owned();
            }
            "fallback" => {
                current(&mut routes, line)?;
                if fallback.is_some() {
                    return Err(CentauriError::ConfigParse(
                        "multiple routes marked as fallback".to_owned(),
                    ));
                }
                fallback = Some(routes.len() - 1);
            }
            "redirect-to-primary" => {
                let route = current(&mut routes, line)?;
                if route.domains.len() < 2 {
                    return Err(CentauriError::ConfigParse(format!(
                        "redirect-to-primary requires at least two domains: {:?}",
                        route.domains
                    )));
                }
                route.redirect_to_primary = true;
            }
            _ => {
                return Err(CentauriError::ConfigParse(format!("invalid line: {line}")));
            }
        }
    }

    for route in &routes {
        if route.upstreams.is_empty() {
            return Err(CentauriError::ConfigParse(format!(
                "route {:?} has no upstreams",
                route.domains
            )));
        }
    }

    let routes: Vec<Arc<Route>> = routes.into_iter().map(Arc::new).collect();
    let fallback = fallback.map(|i| Arc::clone(&routes[i]));
    Ok(RouteSet { routes, fallback })
}

fn current<'a>(routes: &'a mut [Route], line: &str) -> Result<&'a mut Route, CentauriError> {
    routes
        .last_mut()
        .ok_or_else(|| CentauriError::ConfigParse(format!("directive without route: {line}")))
}

fn parse_header(args: &str) -> Result<HeaderRule, CentauriError> {
    let mut parts = args.splitn(3, char::is_whitespace);
    let op = parts.next().unwrap_or("");
    let name = parts.next();
    let value = parts.next().map(str::trim);

    match op.to_ascii_lowercase().as_str() {
        "delete" => match (name, value) {
            (Some(name), None) => Ok(HeaderRule {
                name: name.to_owned(),
                value: String::new(),
                op: HeaderOp::Delete,
            }),
            _ => Err(CentauriError::ConfigParse(format!(
                "invalid header delete line: {args}"
            ))),
        },
        "add" | "replace" | "default" => match (name, value) {
            (Some(name), Some(value)) => Ok(HeaderRule {
                name: name.to_owned(),
                value: value.to_owned(),
                op: match op.to_ascii_lowercase().as_str() {
                    "add" => HeaderOp::Add,
                    "replace" => HeaderOp::Replace,
                    _ => HeaderOp::Default,
                },
            }),
            _ => Err(CentauriError::ConfigParse(format!(
                "invalid header {op} line: {args}"
            ))),
        },
        _ => Err(CentauriError::ConfigParse(format!(
            "invalid header operation: {op}"
        ))),
    }
}

impl RouteSet {
    /// Renders the set back into config text. Parsing the result yields an
    /// equivalent structure (formatting and comments are not preserved).
    pub fn serialise(&self) -> String {
        let mut out = String::new();
        for route in &self.routes {
            out.push_str("route ");
            out.push_str(&route.domains.join(" "));
            out.push('\n');
            for upstream in &route.upstreams {
                out.push_str("    upstream ");
                out.push_str(upstream);
                out.push('\n');
            }
            for header in &route.headers {
                out.push_str("    header ");
                match header.op {
                    HeaderOp::Delete => {
                        out.push_str("delete ");
                        out.push_str(&header.name);
                    }
                    HeaderOp::Add => {
                        out.push_str(&format!("add {} {}", header.name, header.value));
                    }
                    HeaderOp::Replace => {
                        out.push_str(&format!("replace {} {}", header.name, header.value));
                    }
                    HeaderOp::Default => {
                        out.push_str(&format!("default {} {}", header.name, header.value));
                    }
                }
                out.push('\n');
            }
            if !route.provider.is_empty() {
                out.push_str("    provider ");
                out.push_str(&route.provider);
                out.push('\n');
            }
            if route.redirect_to_primary {
                out.push_str("    redirect-to-primary\n");
            }
            if let Some(fallback) = &self.fallback {
                if Arc::ptr_eq(fallback, route) {
                    out.push_str("    fallback\n");
                }
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_simple_route() {
        let set = parse("route example.com\n    upstream 127.0.0.1:8080\n").unwrap();
        assert_eq!(set.routes.len(), 1);
        assert_eq!(set.routes[0].domains, ["example.com"]);
        assert_eq!(set.routes[0].upstreams, ["127.0.0.1:8080"]);
        assert!(set.fallback.is_none());
    }

    #[test]
    fn parses_multiple_domains_and_upstreams() {
        let set = parse(
            "route example.com www.example.com\n\
             \tupstream 10.0.0.1:3000\n\
             \tupstream 10.0.0.2:3000\n",
        )
        .unwrap();
        assert_eq!(set.routes[0].domains, ["example.com", "www.example.com"]);
        assert_eq!(set.routes[0].upstreams.len(), 2);
    }

    #[test]
    fn directives_are_case_insensitive() {
        let set = parse("ROUTE example.com\n    UPSTREAM 127.0.0.1:8080\n").unwrap();
        assert_eq!(set.routes.len(), 1);
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let set = parse(
            "# leading comment\n\n\
             route example.com\n\
             # inline comment line\n\n\
                 upstream 127.0.0.1:8080\n",
        )
        .unwrap();
        assert_eq!(set.routes.len(), 1);
    }

    #[test]
    fn parses_header_operations() {
        let set = parse(
            "route example.com\n\
                 upstream 127.0.0.1:8080\n\
                 header add X-Test some value here\n\
                 header replace Server centauri\n\
                 header default X-Frame-Options DENY\n\
                 header delete X-Powered-By\n",
        )
        .unwrap();
        let headers = &set.routes[0].headers;
        assert_eq!(headers.len(), 4);
        assert_eq!(headers[0].op, HeaderOp::Add);
        assert_eq!(headers[0].name, "X-Test");
        assert_eq!(headers[0].value, "some value here");
        assert_eq!(headers[1].op, HeaderOp::Replace);
        assert_eq!(headers[2].op, HeaderOp::Default);
        assert_eq!(headers[3].op, HeaderOp::Delete);
        assert_eq!(headers[3].name, "X-Powered-By");
    }

    #[test]
    fn parses_provider_and_fallback_and_redirect() {
        let set = parse(
            "route example.com www.example.com\n\
                 upstream 127.0.0.1:8080\n\
                 provider selfsigned\n\
                 redirect-to-primary\n\
             route other.com\n\
                 upstream 127.0.0.1:9090\n\
                 fallback\n",
        )
        .unwrap();
        assert_eq!(set.routes[0].provider, "selfsigned");
        assert!(set.routes[0].redirect_to_primary);
        let fallback = set.fallback.as_ref().unwrap();
        assert!(Arc::ptr_eq(fallback, &set.routes[1]));
    }

    #[test]
    fn rejects_route_without_upstreams() {
        assert!(parse("route example.com\n").is_err());
    }

    #[test]
    fn rejects_directive_without_route() {
        assert!(parse("upstream 127.0.0.1:8080\n").is_err());
        assert!(parse("header delete X-Test\n").is_err());
        assert!(parse("fallback\n").is_err());
    }

    #[test]
    fn rejects_multiple_providers() {
        let result = parse(
            "route example.com\n\
                 upstream 127.0.0.1:8080\n\
                 provider a\n\
                 provider b\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_multiple_fallbacks() {
        let result = parse(
            "route a.com\n    upstream 1.2.3.4:80\n    fallback\n\
             route b.com\n    upstream 1.2.3.4:81\n    fallback\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_redirect_with_single_domain() {
        let result = parse(
            "route example.com\n\
                 upstream 127.0.0.1:8080\n\
                 redirect-to-primary\n",
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_invalid_lines() {
        assert!(parse("bogus directive\n").is_err());
        assert!(parse("route a.com\n    upstream 1.1.1.1:1\n    header frobnicate X 1\n").is_err());
    }

    #[test]
    fn serialise_then_parse_is_equivalent() {
        let text = "route example.com www.example.com\n\
                    upstream 10.0.0.1:8080\n\
                    header add X-A one\n\
                    header delete X-B\n\
                    provider acme\n\
                    redirect-to-primary\n\
                    route fallback.com\n\
                    upstream 10.0.0.2:8080\n\
                    fallback\n";
        let first = parse(text).unwrap();
        let second = parse(&first.serialise()).unwrap();

        assert_eq!(first.routes.len(), second.routes.len());
        for (a, b) in first.routes.iter().zip(second.routes.iter()) {
            assert_eq!(a.domains, b.domains);
            assert_eq!(a.upstreams, b.upstreams);
            assert_eq!(a.headers, b.headers);
            assert_eq!(a.provider, b.provider);
            assert_eq!(a.redirect_to_primary, b.redirect_to_primary);
        }
        assert_eq!(
            first.fallback.as_ref().map(|r| r.domains.clone()),
            second.fallback.as_ref().map(|r| r.domains.clone()),
        );
    }
}

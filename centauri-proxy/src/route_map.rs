use arc_swap::ArcSwap;
use centauri_core::route::Route;
use centauri_core::{is_domain_name, CentauriError};
use std::collections::HashMap;
use std::sync::Arc;

/// Copy-on-write lookup structure from lowercased domain to route.
///
/// Readers load the current map or slice through a single atomic pointer and
/// never block; `update` builds a complete replacement and swaps it in, so
/// any reader sees either the whole old set or the whole new set. Concurrent
/// updates are last-writer-wins, which is fine because reconfigurations are
/// serialised by the supervisor.
pub struct RouteMap {
    domains: ArcSwap<HashMap<String, Arc<Route>>>,
    routes: ArcSwap<Vec<Arc<Route>>>,
}

impl RouteMap {
    pub fn new() -> Self {
        RouteMap {
            domains: ArcSwap::from_pointee(HashMap::new()),
            routes: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Validates every domain in the new routes and, if all are legal,
    /// publishes the new map and slice. On failure nothing is published and
    /// the previous set remains visible.
    pub fn update(&self, new_routes: Vec<Arc<Route>>) -> Result<(), CentauriError> {
        let mut domains = HashMap::new();
        for route in &new_routes {
            for domain in &route.domains {
                if !is_domain_name(domain) {
                    return Err(CentauriError::InvalidDomain(domain.clone()));
                }
                domains.insert(domain.to_ascii_lowercase(), Arc::clone(route));
            }
        }

        self.domains.store(Arc::new(domains));
        self.routes.store(Arc::new(new_routes));
        Ok(())
    }

    /// Returns the route registered for the given domain, if any. The lookup
    /// is case-insensitive.
    pub fn get(&self, domain: &str) -> Option<Arc<Route>> {
        self.domains
            .load()
            .get(&domain.to_ascii_lowercase())
            .cloned()
    }

    /// Returns a snapshot of the current routes.
    pub fn routes(&self) -> Arc<Vec<Arc<Route>>> {
        self.routes.load_full()
    }
}

impl Default for RouteMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(domains: &[&str]) -> Arc<Route> {
        Arc::new(Route::new(domains.iter().map(|s| s.to_string()).collect()))
    }

    #[test]
    fn lookup_is_case_insensitive_both_ways() {
        let map = RouteMap::new();
        map.update(vec![route(&["Example.COM"])]).unwrap();

        assert!(map.get("example.com").is_some());
        assert!(map.get("EXAMPLE.com").is_some());
        assert!(map.get("other.com").is_none());
    }

    #[test]
    fn update_rejects_invalid_domains_without_publishing() {
        let map = RouteMap::new();
        map.update(vec![route(&["example.com"])]).unwrap();

        let err = map
            .update(vec![route(&["ok.com"]), route(&["invalid..domain"])])
            .unwrap_err();
        assert!(matches!(err, CentauriError::InvalidDomain(_)));

        // The old set is still served.
        assert!(map.get("example.com").is_some());
        assert!(map.get("ok.com").is_none());
        assert_eq!(map.routes().len(), 1);
    }

    #[test]
    fn later_routes_win_domain_collisions() {
        let map = RouteMap::new();
        let first = route(&["example.com"]);
        let second = route(&["EXAMPLE.COM", "other.com"]);
        map.update(vec![Arc::clone(&first), Arc::clone(&second)])
            .unwrap();

        let found = map.get("example.com").unwrap();
        assert!(Arc::ptr_eq(&found, &second));
    }

    #[test]
    fn routes_snapshot_tracks_updates() {
        let map = RouteMap::new();
        assert!(map.routes().is_empty());

        map.update(vec![route(&["a.com"]), route(&["b.com"])]).unwrap();
        let snapshot = map.routes();
        assert_eq!(snapshot.len(), 2);

        // A snapshot taken before an update is unaffected by it.
        map.update(vec![route(&["c.com"])]).unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(map.routes().len(), 1);
    }
}

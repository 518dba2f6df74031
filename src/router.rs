//! In-memory routing table from subdomain to live container endpoint.
//!
//! Registration is a single map write, so the supersession swap in the
//! deployment pipeline is atomic: readers observe either the old endpoint
//! or the new one, never a missing entry.

use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Route {
    pub endpoint: String,
    pub deployment_id: i64,
}

#[derive(Default)]
pub struct SubdomainRouter {
    routes: DashMap<String, Route>,
}

impl SubdomainRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or overwrite the route for a subdomain.
    pub fn register(&self, subdomain: &str, endpoint: &str, deployment_id: i64) {
        self.routes.insert(
            subdomain.to_string(),
            Route {
                endpoint: endpoint.to_string(),
                deployment_id,
            },
        );
    }

    /// Remove a subdomain's route unconditionally.
    pub fn unregister(&self, subdomain: &str) {
        self.routes.remove(subdomain);
    }

    /// Remove the route only if it still belongs to the given deployment.
    /// Tearing down a superseded deployment must not evict its successor's
    /// freshly installed route.
    pub fn unregister_deployment(&self, subdomain: &str, deployment_id: i64) {
        self.routes
            .remove_if(subdomain, |_, route| route.deployment_id == deployment_id);
    }

    pub fn resolve(&self, subdomain: &str) -> Option<Route> {
        self.routes.get(subdomain).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_resolve() {
        let router = SubdomainRouter::new();
        router.register("demo", "berth-demo-1:8080", 1);
        let route = router.resolve("demo").unwrap();
        assert_eq!(route.endpoint, "berth-demo-1:8080");
        assert_eq!(route.deployment_id, 1);
        assert!(router.resolve("missing").is_none());
    }

    #[test]
    fn register_overwrites_prior_entry() {
        let router = SubdomainRouter::new();
        router.register("demo", "berth-demo-1:8080", 1);
        router.register("demo", "berth-demo-2:8080", 2);
        let route = router.resolve("demo").unwrap();
        assert_eq!(route.deployment_id, 2);
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn unregister_deployment_is_conditional() {
        let router = SubdomainRouter::new();
        router.register("demo", "berth-demo-2:8080", 2);
        // Predecessor teardown after supersession: its id no longer matches.
        router.unregister_deployment("demo", 1);
        assert_eq!(router.resolve("demo").unwrap().deployment_id, 2);
        // The owning deployment can remove it.
        router.unregister_deployment("demo", 2);
        assert!(router.resolve("demo").is_none());
    }

    #[test]
    fn unregister_removes_unconditionally() {
        let router = SubdomainRouter::new();
        router.register("demo", "berth-demo-1:8080", 1);
        router.unregister("demo");
        assert!(router.is_empty());
    }
}

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

/// One upstream service behind the gateway. Immutable after config load.
#[derive(Debug, Clone)]
pub struct ServiceRoute {
    pub name: String,
    pub base_url: String,
    pub timeout: Duration,
    pub public: bool,
    pub required_scopes: HashSet<String>,
}

/// Resolution of `/api/<service>/<rest...>` against the route table.
#[derive(Debug)]
pub struct ResolvedRoute<'a> {
    pub route: &'a ServiceRoute,
    /// Remainder of the path, always starting with `/`.
    pub rest: String,
}

pub struct RouteTable {
    services: HashMap<String, ServiceRoute>,
    ordered: Vec<String>,
}

impl RouteTable {
    pub fn new(routes: Vec<ServiceRoute>) -> Self {
        let ordered = routes.iter().map(|r| r.name.clone()).collect();
        let services = routes.into_iter().map(|r| (r.name.clone(), r)).collect();
        Self { services, ordered }
    }

    pub fn get(&self, name: &str) -> Option<&ServiceRoute> {
        self.services.get(name)
    }

    /// Routes in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &ServiceRoute> {
        self.ordered.iter().filter_map(|name| self.services.get(name))
    }

    pub fn service_names(&self) -> Vec<String> {
        self.ordered.clone()
    }

    /// Split `/api/<service>/<rest...>` and look the service up.
    /// Query strings are not part of the path and survive untouched.
    pub fn resolve(&self, path: &str) -> Option<ResolvedRoute<'_>> {
        let remainder = path.strip_prefix("/api/")?;
        let (service, rest) = match remainder.split_once('/') {
            Some((service, rest)) => (service, format!("/{rest}")),
            None => (remainder, "/".to_string()),
        };
        if service.is_empty() {
            return None;
        }

        self.services.get(service).map(|route| ResolvedRoute {
            route,
            rest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        RouteTable::new(vec![
            ServiceRoute {
                name: "users".to_string(),
                base_url: "http://users:8001".to_string(),
                timeout: Duration::from_secs(10),
                public: false,
                required_scopes: HashSet::new(),
            },
            ServiceRoute {
                name: "orders".to_string(),
                base_url: "http://orders:8002".to_string(),
                timeout: Duration::from_secs(10),
                public: false,
                required_scopes: HashSet::from(["write".to_string()]),
            },
        ])
    }

    #[test]
    fn resolves_service_and_rest() {
        let table = table();

        let resolved = table.resolve("/api/users/123").unwrap();
        assert_eq!(resolved.route.name, "users");
        assert_eq!(resolved.rest, "/123");

        let resolved = table.resolve("/api/users/123/posts/4").unwrap();
        assert_eq!(resolved.rest, "/123/posts/4");

        let resolved = table.resolve("/api/orders").unwrap();
        assert_eq!(resolved.route.name, "orders");
        assert_eq!(resolved.rest, "/");
    }

    #[test]
    fn unknown_service_is_none() {
        let table = table();
        assert!(table.resolve("/api/nonexistent/x").is_none());
        assert!(table.resolve("/health").is_none());
        assert!(table.resolve("/api/").is_none());
    }
}

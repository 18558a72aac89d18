// Local-override redirection middleware: lets local clients steer
// routing with ?domain= and ?subdomain= query parameters.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;

use crate::http::handler::{Handler, Next};

use super::middleware::Middleware;

type LocalPredicate = Box<dyn Fn(IpAddr) -> bool + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct Selection {
    domain: Option<String>,
    subdomain: Option<String>,
}

/// Server-scope middleware for development setups: requests from a local
/// client may carry `?domain=` / `?subdomain=` overrides, and the chosen
/// pair sticks per remote address until changed.
pub struct LocalOverrideMiddleware {
    overrides: RwLock<HashMap<IpAddr, Selection>>,
    is_local: LocalPredicate,
}

impl LocalOverrideMiddleware {
    /// Default local rule: loopback addresses only.
    pub fn new() -> Self {
        Self {
            overrides: RwLock::new(HashMap::new()),
            is_local: Box::new(|ip| ip.is_loopback()),
        }
    }

    /// Caller-supplied rule for what counts as a local client.
    pub fn with_predicate<F>(predicate: F) -> Self
    where
        F: Fn(IpAddr) -> bool + Send + Sync + 'static,
    {
        Self {
            overrides: RwLock::new(HashMap::new()),
            is_local: Box::new(predicate),
        }
    }
}

impl Default for LocalOverrideMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for LocalOverrideMiddleware {
    async fn handle(&self, h: &mut Handler, next: Next<'_>) {
        let ip = h.remote().ip();
        if (self.is_local)(ip) {
            let domain = h.query_param("domain");
            let subdomain = h.query_param("subdomain");

            let selection = {
                let mut overrides = self.overrides.write();
                let entry = overrides.entry(ip).or_default();
                if let Some(d) = domain {
                    entry.domain = Some(d);
                }
                if let Some(s) = subdomain {
                    entry.subdomain = Some(s);
                }
                entry.clone()
            };

            if let Some(d) = &selection.domain {
                h.change_domain_name(d);
            }
            if let Some(s) = &selection.subdomain {
                h.change_subdomain_name(s);
            }
        }

        next.run(h).await;
    }
}

// Alias rewriting middleware: maps alias routing keys onto a canonical
// name at server or domain scope.

use async_trait::async_trait;

use crate::http::handler::{Handler, Next};

use super::middleware::Middleware;

type AliasPredicate = Box<dyn Fn(&Handler) -> bool + Send + Sync>;

/// Which routing key the aliases apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasScope {
    Domain,
    Subdomain,
}

/// Rewrites any of the configured alias names to the canonical one, as
/// long as the corresponding stage has not resolved yet.
pub struct AliasMiddleware {
    scope: AliasScope,
    aliases: Vec<String>,
    canonical: String,
    predicate: Option<AliasPredicate>,
}

impl AliasMiddleware {
    pub fn domains(aliases: Vec<String>, canonical: impl Into<String>) -> Self {
        Self {
            scope: AliasScope::Domain,
            aliases,
            canonical: canonical.into(),
            predicate: None,
        }
    }

    pub fn subdomains(aliases: Vec<String>, canonical: impl Into<String>) -> Self {
        use crate::http::host::normalize_subdomain_name;
        Self {
            scope: AliasScope::Subdomain,
            aliases: aliases
                .iter()
                .map(|a| normalize_subdomain_name(a))
                .collect(),
            canonical: canonical.into(),
            predicate: None,
        }
    }

    /// Restricts the rewrite to requests matching the predicate.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Handler) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Box::new(predicate));
        self
    }
}

#[async_trait]
impl Middleware for AliasMiddleware {
    async fn handle(&self, h: &mut Handler, next: Next<'_>) {
        let applies = self.predicate.as_ref().map(|p| p(h)).unwrap_or(true);
        if applies {
            match self.scope {
                AliasScope::Domain => {
                    if self.aliases.iter().any(|a| a == h.domain_name()) {
                        let canonical = self.canonical.clone();
                        h.change_domain_name(&canonical);
                    }
                }
                AliasScope::Subdomain => {
                    if self.aliases.iter().any(|a| a == h.subdomain_name()) {
                        let canonical = self.canonical.clone();
                        h.change_subdomain_name(&canonical);
                    }
                }
            }
        }

        next.run(h).await;
    }
}

// Routing tree: ServerHandler -> Domain -> Subdomain, with per-scope
// middlewares, error templates and website lifecycle hooks.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::lifecycle::Lifecycle;
use crate::logger::{LogLevel, Logger};
use crate::middleware::Middleware;
use crate::router::Router;
use crate::safe;

use super::handler::Handler;
use super::host::normalize_subdomain_name;
use super::template::ErrorTemplate;

/// Default number of minutes advertised through `Retry-After` while a
/// server or website is offline.
pub(crate) const DEFAULT_RETRY_AFTER_MINUTES: i64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("'{0}' already registered")]
    AlreadyRegistered(String),
    #[error("'{0}' not found")]
    NotFound(String),
}

/// Application entry point of a subdomain.
#[async_trait::async_trait]
pub trait HttpApp: Send + Sync {
    async fn serve(&self, h: &mut Handler);
}

struct AppFn<F>(F);

#[async_trait::async_trait]
impl<F> HttpApp for AppFn<F>
where
    F: for<'a> Fn(&'a mut Handler) -> BoxFuture<'a, ()> + Send + Sync,
{
    async fn serve(&self, h: &mut Handler) {
        (self.0)(h).await
    }
}

/// Adapts a closure into an [`HttpApp`].
pub fn app_fn<F>(f: F) -> Arc<dyn HttpApp>
where
    F: for<'a> Fn(&'a mut Handler) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    Arc::new(AppFn(f))
}

/// Init/close hook of a subdomain.
pub type SubdomainHook = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Everything needed to register a subdomain.
pub struct SubdomainConfig {
    pub app: Arc<dyn HttpApp>,
    pub init: Option<SubdomainHook>,
    pub close: Option<SubdomainHook>,
    pub err_template: Option<String>,
}

impl SubdomainConfig {
    pub fn new(app: Arc<dyn HttpApp>) -> Self {
        Self {
            app,
            init: None,
            close: None,
            err_template: None,
        }
    }
}

fn not_found_app() -> Arc<dyn HttpApp> {
    app_fn(|h| {
        Box::pin(async move {
            h.error(404, "Not Found");
        })
    })
}

/// Owner of the routing tree behind one or more listeners. Split from the
/// listener so TCP or QUIC servers can share the same tree.
pub struct ServerHandler {
    port: u16,
    router: Weak<Router>,
    domains: RwLock<HashMap<String, Arc<Domain>>>,
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
    err_template: RwLock<Arc<ErrorTemplate>>,
    lifecycle: Lifecycle,
    online: AtomicBool,
    online_time: Mutex<DateTime<Utc>>,
    logger: Logger,
}

impl ServerHandler {
    pub(crate) fn new(router: &Arc<Router>, port: u16, logger: Logger) -> Arc<Self> {
        let sh = Arc::new(Self {
            port,
            router: Arc::downgrade(router),
            domains: RwLock::new(HashMap::new()),
            middlewares: RwLock::new(Vec::new()),
            err_template: RwLock::new(Arc::new(ErrorTemplate::default())),
            lifecycle: Lifecycle::new(),
            online: AtomicBool::new(false),
            online_time: Mutex::new(Utc::now()),
            logger,
        });
        // Every handler carries exactly one default domain.
        let default = Domain::new("*".to_string(), &sh);
        sh.domains.write().insert("*".to_string(), default);
        sh
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn router(&self) -> Option<Arc<Router>> {
        self.router.upgrade()
    }

    pub(crate) fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Registers a domain. The wildcard name replaces the default entry;
    /// any other duplicate is rejected.
    pub fn register_domain(self: &Arc<Self>, name: impl Into<String>) -> Result<Arc<Domain>, RegistryError> {
        let name = name.into();
        let mut domains = self.domains.write();
        if name != "*" && domains.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        let domain = Domain::new(name.clone(), self);
        domains.insert(name, domain.clone());
        Ok(domain)
    }

    pub fn domain(&self, name: &str) -> Result<Arc<Domain>, RegistryError> {
        self.domains
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn default_domain(&self) -> Arc<Domain> {
        self.domains.read().get("*").cloned().expect("default domain")
    }

    pub fn domain_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.domains.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn resolve_exact_domain(&self, name: &str) -> Option<Arc<Domain>> {
        self.domains.read().get(name).cloned()
    }

    /// Exact match first, then the default entry.
    pub(crate) fn resolve_domain(&self, name: &str) -> Option<Arc<Domain>> {
        let domains = self.domains.read();
        domains.get(name).cloned().or_else(|| domains.get("*").cloned())
    }

    /// Appends a server-scope middleware; first registered runs outermost.
    pub fn add_middleware(&self, mw: Arc<dyn Middleware>) {
        self.middlewares.write().push(mw);
    }

    pub(crate) fn middlewares_snapshot(&self) -> Vec<Arc<dyn Middleware>> {
        self.middlewares.read().clone()
    }

    pub fn set_error_template(&self, raw: impl Into<String>) {
        *self.err_template.write() = Arc::new(ErrorTemplate::new(raw));
    }

    pub(crate) fn error_template(&self) -> Arc<ErrorTemplate> {
        self.err_template.read().clone()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn online_time(&self) -> DateTime<Utc> {
        *self.online_time.lock()
    }

    pub fn set_online(&self) {
        self.online.store(true, Ordering::Release);
        *self.online_time.lock() = Utc::now();
    }

    /// Takes the server offline for the given number of minutes.
    pub fn set_offline_for(&self, minutes: i64) {
        self.online.store(false, Ordering::Release);
        *self.online_time.lock() = Utc::now() + ChronoDuration::minutes(minutes);
    }

    /// Pushes the advertised comeback time further into the future.
    pub fn extend_offline(&self, minutes: i64) {
        let mut t = self.online_time.lock();
        let base = if *t > Utc::now() { *t } else { Utc::now() };
        *t = base + ChronoDuration::minutes(minutes);
    }

    /// Online check with automatic recovery once the comeback time has
    /// passed.
    pub(crate) fn check_online(&self) -> bool {
        if self.is_online() {
            return true;
        }
        if Utc::now() >= self.online_time() {
            self.online.store(true, Ordering::Release);
            return true;
        }
        false
    }

    /// The comeback time used by `Retry-After`, defaulting to thirty
    /// minutes from now.
    pub(crate) fn retry_after(&self) -> DateTime<Utc> {
        let t = self.online_time();
        if t > Utc::now() {
            t
        } else {
            Utc::now() + ChronoDuration::minutes(DEFAULT_RETRY_AFTER_MINUTES)
        }
    }

    /// Starts every subdomain: init hooks complete before the first
    /// request reaches an application.
    pub(crate) async fn start(&self) {
        if !self.lifecycle.begin_start() {
            return;
        }
        let domains: Vec<Arc<Domain>> = self.domains.read().values().cloned().collect();
        for domain in domains {
            let subs: Vec<Arc<Subdomain>> = domain.subdomains.read().values().cloned().collect();
            for sub in subs {
                sub.start(&self.logger).await;
            }
        }
        self.set_online();
        self.lifecycle.set_started();
    }

    /// Stops every subdomain. Callers drain in-flight requests first, so
    /// close hooks happen after the last request completed the chain.
    pub(crate) async fn stop(&self) {
        if !self.lifecycle.begin_stop() {
            return;
        }
        self.online.store(false, Ordering::Release);
        let domains: Vec<Arc<Domain>> = self.domains.read().values().cloned().collect();
        for domain in domains {
            let subs: Vec<Arc<Subdomain>> = domain.subdomains.read().values().cloned().collect();
            for sub in subs {
                sub.stop(&self.logger).await;
            }
        }
        self.lifecycle.set_stopped();
    }
}

/// One registered domain and its subdomain table.
pub struct Domain {
    name: String,
    server: Weak<ServerHandler>,
    subdomains: RwLock<HashMap<String, Arc<Subdomain>>>,
    err_template: RwLock<Option<Arc<ErrorTemplate>>>,
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl Domain {
    fn new(name: String, server: &Arc<ServerHandler>) -> Arc<Self> {
        let domain = Arc::new(Self {
            name,
            server: Arc::downgrade(server),
            subdomains: RwLock::new(HashMap::new()),
            err_template: RwLock::new(None),
            middlewares: RwLock::new(Vec::new()),
        });
        // Every domain carries exactly one default (wildcard) subdomain.
        let default = Subdomain::new("*".to_string(), SubdomainConfig::new(not_found_app()));
        domain.subdomains.write().insert("*".to_string(), default);
        domain
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn server(&self) -> Option<Arc<ServerHandler>> {
        self.server.upgrade()
    }

    /// Registers a subdomain under its normalized name. When the owning
    /// server is already started the website starts on the fly, so the
    /// init hook still completes before its first request.
    pub async fn register_subdomain(
        self: &Arc<Self>,
        name: &str,
        config: SubdomainConfig,
    ) -> Result<Arc<Subdomain>, RegistryError> {
        let key = normalize_subdomain_name(name);
        {
            let subdomains = self.subdomains.read();
            if key != "*" && subdomains.contains_key(&key) {
                return Err(RegistryError::AlreadyRegistered(key));
            }
        }
        let sub = Subdomain::new(key.clone(), config);
        self.subdomains.write().insert(key, sub.clone());

        if let Some(server) = self.server() {
            if server.lifecycle().is_started() {
                sub.start(server.logger()).await;
            }
        }
        Ok(sub)
    }

    pub fn subdomain(&self, name: &str) -> Result<Arc<Subdomain>, RegistryError> {
        let key = normalize_subdomain_name(name);
        self.subdomains
            .read()
            .get(&key)
            .cloned()
            .ok_or(RegistryError::NotFound(key))
    }

    pub fn default_subdomain(&self) -> Arc<Subdomain> {
        self.subdomains.read().get("*").cloned().expect("default subdomain")
    }

    pub fn subdomain_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.subdomains.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn resolve_subdomain(&self, name: &str) -> Option<Arc<Subdomain>> {
        let subdomains = self.subdomains.read();
        subdomains.get(name).cloned().or_else(|| subdomains.get("*").cloned())
    }

    pub fn add_middleware(&self, mw: Arc<dyn Middleware>) {
        self.middlewares.write().push(mw);
    }

    pub(crate) fn middlewares_snapshot(&self) -> Vec<Arc<dyn Middleware>> {
        self.middlewares.read().clone()
    }

    pub fn set_error_template(&self, raw: impl Into<String>) {
        *self.err_template.write() = Some(Arc::new(ErrorTemplate::new(raw)));
    }

    pub(crate) fn error_template(&self) -> Option<Arc<ErrorTemplate>> {
        self.err_template.read().clone()
    }
}

/// One website: an application handler plus its lifecycle hooks.
pub struct Subdomain {
    name: String,
    app: RwLock<Arc<dyn HttpApp>>,
    init: Option<SubdomainHook>,
    close: Option<SubdomainHook>,
    err_template: RwLock<Option<Arc<ErrorTemplate>>>,
    online: AtomicBool,
    lifecycle: Lifecycle,
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl Subdomain {
    fn new(name: String, config: SubdomainConfig) -> Arc<Self> {
        let err_template = config
            .err_template
            .map(|raw| Arc::new(ErrorTemplate::new(raw)));
        Arc::new(Self {
            name,
            app: RwLock::new(config.app),
            init: config.init,
            close: config.close,
            err_template: RwLock::new(err_template),
            online: AtomicBool::new(false),
            lifecycle: Lifecycle::new(),
            middlewares: RwLock::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Online only while the lifecycle is Started.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Flips the online flag. Ignored unless the website is Started.
    pub fn set_online(&self, online: bool) -> bool {
        if !self.lifecycle.is_started() {
            return false;
        }
        self.online.store(online, Ordering::Release);
        true
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn set_app(&self, app: Arc<dyn HttpApp>) {
        *self.app.write() = app;
    }

    pub(crate) fn app(&self) -> Arc<dyn HttpApp> {
        self.app.read().clone()
    }

    pub fn add_middleware(&self, mw: Arc<dyn Middleware>) {
        self.middlewares.write().push(mw);
    }

    pub(crate) fn middlewares_snapshot(&self) -> Vec<Arc<dyn Middleware>> {
        self.middlewares.read().clone()
    }

    pub fn set_error_template(&self, raw: impl Into<String>) {
        *self.err_template.write() = Some(Arc::new(ErrorTemplate::new(raw)));
    }

    pub(crate) fn error_template(&self) -> Option<Arc<ErrorTemplate>> {
        self.err_template.read().clone()
    }

    /// Runs the init hook under a panic guard. A failed init leaves the
    /// website stopped and offline.
    pub(crate) async fn start(&self, logger: &Logger) {
        if !self.lifecycle.begin_start() {
            return;
        }
        if let Some(init) = &self.init {
            match safe::catch((init)()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    logger.log(
                        LogLevel::Error,
                        format!("website '{}' init failed", self.display_name()),
                        e.to_string(),
                    );
                    self.lifecycle.set_stopped();
                    return;
                }
                Err(panic) => {
                    logger.log(
                        LogLevel::Fatal,
                        format!("website '{}' init panicked", self.display_name()),
                        panic.payload,
                    );
                    self.lifecycle.set_stopped();
                    return;
                }
            }
        }
        self.lifecycle.set_started();
        self.online.store(true, Ordering::Release);
    }

    /// Runs the close hook under a panic guard.
    pub(crate) async fn stop(&self, logger: &Logger) {
        if !self.lifecycle.begin_stop() {
            return;
        }
        self.online.store(false, Ordering::Release);
        if let Some(close) = &self.close {
            match safe::catch((close)()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    logger.log(
                        LogLevel::Error,
                        format!("website '{}' close failed", self.display_name()),
                        e.to_string(),
                    );
                }
                Err(panic) => {
                    logger.log(
                        LogLevel::Fatal,
                        format!("website '{}' close panicked", self.display_name()),
                        panic.payload,
                    );
                }
            }
        }
        self.lifecycle.set_stopped();
    }

    fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "(apex)"
        } else {
            &self.name
        }
    }
}

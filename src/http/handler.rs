// Per-request handler: stage driver, middleware chain, response buffer,
// error capture and the access log.

use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::logger::{LogLevel, Logger};
use crate::middleware::Middleware;
use crate::router::Router;

use super::body::BodyKind;
use super::host::{is_raw_ip, normalize_subdomain_name, parse_host, strip_port};
use super::registry::{Domain, ServerHandler, Subdomain};
use super::template::{looks_like_html, ErrorTemplate};

/// Value of the `Server` response header.
pub const SERVER_HEADER: &str = "NixPare";

/// Serving stage of a request. Monotonically advances, never repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServeStage {
    Domain,
    Subdomain,
    App,
}

#[derive(Clone, Copy)]
pub(crate) enum Terminal {
    EnterDomain,
    EnterSubdomain,
    EnterApp,
}

/// Remainder of a middleware chain. Calling [`Next::run`] hands the
/// request to the rest of the chain; not calling it short-circuits.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    terminal: Terminal,
}

impl<'a> Next<'a> {
    pub(crate) fn new(rest: &'a [Arc<dyn Middleware>], terminal: Terminal) -> Self {
        Self { rest, terminal }
    }

    pub async fn run(self, h: &mut Handler) {
        match self.rest.split_first() {
            Some((mw, rest)) => {
                mw.handle(
                    h,
                    Next {
                        rest,
                        terminal: self.terminal,
                    },
                )
                .await
            }
            None => match self.terminal {
                Terminal::EnterDomain => h.serve_domain().await,
                Terminal::EnterSubdomain => {
                    h.stage = ServeStage::Subdomain;
                    h.serve_subdomain().await
                }
                Terminal::EnterApp => {
                    h.stage = ServeStage::App;
                    h.serve_app().await
                }
            },
        }
    }
}

/// Per-request state. Buffers the response body and captures error output
/// so templates can replace it after the chain unwinds; never shared
/// across requests.
pub struct Handler {
    // Response side.
    status: u16,
    header: HeaderMap,
    body: Vec<u8>,
    caught_err: Vec<u8>,
    written: u64,
    disable_error_capture: bool,
    avoid_logging: bool,
    panicked: Option<String>,

    // Request side.
    req: Request<BodyKind>,
    remote: SocketAddr,
    proto: String,
    host: String,
    path: String,
    bad_url: Option<String>,
    arrival: Instant,

    // Routing.
    srv: Arc<ServerHandler>,
    domain: Option<Arc<Domain>>,
    subdomain: Option<Arc<Subdomain>>,
    domain_name: String,
    subdomain_name: String,
    redirected: bool,
    stage: ServeStage,
    logger: Logger,
    err_template: Arc<ErrorTemplate>,
    internal_message: String,
}

impl Handler {
    pub(crate) fn new(
        srv: Arc<ServerHandler>,
        req: Request<BodyKind>,
        remote: SocketAddr,
        proto: impl Into<String>,
    ) -> Self {
        let host_raw = req
            .uri()
            .authority()
            .map(|a| a.as_str().to_string())
            .or_else(|| {
                req.headers()
                    .get(http::header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_default();
        let host = strip_port(&host_raw).to_string();
        let keys = parse_host(&host_raw);

        let (path, bad_url) = match urlencoding::decode(req.uri().path()) {
            Ok(p) => (p.into_owned(), None),
            Err(e) => (req.uri().path().to_string(), Some(e.to_string())),
        };

        let mut header = HeaderMap::new();
        header.insert(http::header::SERVER, HeaderValue::from_static(SERVER_HEADER));

        let logger = srv.logger().clone();
        let err_template = srv.error_template();

        Self {
            status: 0,
            header,
            body: Vec::new(),
            caught_err: Vec::new(),
            written: 0,
            disable_error_capture: false,
            avoid_logging: false,
            panicked: None,
            req,
            remote,
            proto: proto.into(),
            host,
            path,
            bad_url,
            arrival: Instant::now(),
            srv,
            domain: None,
            subdomain: None,
            domain_name: keys.domain,
            subdomain_name: keys.subdomain,
            redirected: false,
            stage: ServeStage::Domain,
            logger,
            err_template,
            internal_message: String::new(),
        }
    }

    // ---- request accessors ----

    pub fn method(&self) -> &Method {
        self.req.method()
    }

    /// Percent-decoded request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn req(&self) -> &Request<BodyKind> {
        &self.req
    }

    pub fn req_mut(&mut self) -> &mut Request<BodyKind> {
        &mut self.req
    }

    /// Collects the request body, caching it for repeated reads.
    pub async fn read_body(&mut self) -> anyhow::Result<Bytes> {
        self.req.body_mut().collect().await
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn proto(&self) -> &str {
        &self.proto
    }

    /// Host header value with any port stripped.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Decoded value of one query parameter.
    pub fn query_param(&self, key: &str) -> Option<String> {
        let query = self.req.uri().query()?;
        for pair in query.split('&') {
            let (k, v) = match pair.split_once('=') {
                Some((k, v)) => (k, v),
                None => (pair, ""),
            };
            if k == key {
                return Some(
                    urlencoding::decode(v)
                        .map(|c| c.into_owned())
                        .unwrap_or_else(|_| v.to_string()),
                );
            }
        }
        None
    }

    // ---- routing accessors ----

    pub fn server(&self) -> &Arc<ServerHandler> {
        &self.srv
    }

    pub fn router(&self) -> Option<Arc<Router>> {
        self.srv.router()
    }

    pub fn domain(&self) -> Option<&Arc<Domain>> {
        self.domain.as_ref()
    }

    pub fn subdomain(&self) -> Option<&Arc<Subdomain>> {
        self.subdomain.as_ref()
    }

    pub fn domain_name(&self) -> &str {
        &self.domain_name
    }

    pub fn subdomain_name(&self) -> &str {
        &self.subdomain_name
    }

    pub fn redirected(&self) -> bool {
        self.redirected
    }

    pub fn stage(&self) -> ServeStage {
        self.stage
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Rewrites the domain routing key. Ignored once the domain stage has
    /// advanced past resolution.
    pub fn change_domain_name(&mut self, name: &str) -> bool {
        if self.stage > ServeStage::Domain {
            return false;
        }
        if self.domain_name != name {
            self.domain_name = name.to_string();
            self.redirected = true;
        }
        true
    }

    /// Rewrites the subdomain routing key, normalized with a trailing dot.
    pub fn change_subdomain_name(&mut self, name: &str) -> bool {
        if self.stage > ServeStage::Subdomain {
            return false;
        }
        let name = normalize_subdomain_name(name);
        if self.subdomain_name != name {
            self.subdomain_name = name;
            self.redirected = true;
        }
        true
    }

    // ---- response side ----

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Captures the response code. The first non-zero code wins; later
    /// calls, including zero, are ignored.
    pub fn set_status(&mut self, code: u16) {
        if self.status == 0 && code != 0 {
            self.status = code;
        }
    }

    pub fn header_mut(&mut self) -> &mut HeaderMap {
        &mut self.header
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name),
            HeaderValue::try_from(value),
        ) {
            self.header.insert(name, value);
        }
    }

    /// Buffered body write. While the response code is an error, output
    /// is diverted into the captured-error buffer for the template path,
    /// unless capture is disabled.
    pub fn write(&mut self, data: &[u8]) -> usize {
        if self.status == 0 {
            self.status = 200;
        }
        if self.status >= 400 && !self.disable_error_capture {
            self.caught_err.extend_from_slice(data);
        } else {
            self.body.extend_from_slice(data);
            self.written += data.len() as u64;
        }
        data.len()
    }

    pub fn write_str(&mut self, s: &str) -> usize {
        self.write(s.as_bytes())
    }

    /// Response-body bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Sets an error code and user-facing message. The message flows into
    /// the captured-error buffer, so the template path picks it up.
    pub fn error(&mut self, code: u16, message: &str) {
        self.error_with(code, message, String::new());
    }

    /// Like [`Handler::error`], with an internal message that only
    /// reaches the access log.
    pub fn error_with(&mut self, code: u16, message: &str, internal: impl Into<String>) {
        self.set_status(code);
        self.write_str(message);
        let internal = internal.into();
        if !internal.is_empty() {
            self.internal_message = internal;
        }
    }

    /// Disables the error-capture diversion, letting handlers stream
    /// their own error bodies.
    pub fn set_disable_error_capture(&mut self, disable: bool) {
        self.disable_error_capture = disable;
    }

    /// Suppresses the access-log line for this request.
    pub fn set_avoid_logging(&mut self, avoid: bool) {
        self.avoid_logging = avoid;
    }

    // ---- stage driver ----

    pub(crate) fn serve_domain<'a>(&'a mut self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let domain = {
                let exact = self.srv.resolve_exact_domain(&self.domain_name);
                match exact {
                    Some(d) => Some(d),
                    None if is_raw_ip(&self.domain_name) => {
                        self.error(404, "Invalid direct IP access");
                        return;
                    }
                    None => self.srv.resolve_domain(&self.domain_name),
                }
            };
            let Some(domain) = domain else {
                self.error(404, "Domain not found");
                return;
            };

            self.domain = Some(domain.clone());
            if !self.domain_name.is_empty() {
                self.logger = self.logger.scoped(self.domain_name.clone());
            }
            if let Some(t) = domain.error_template() {
                self.err_template = t;
            }

            let mws = domain.middlewares_snapshot();
            Next::new(&mws, Terminal::EnterSubdomain).run(self).await;
        })
    }

    pub(crate) fn serve_subdomain<'a>(&'a mut self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let domain = self.domain.clone().expect("domain stage completed");
            let Some(sub) = domain.resolve_subdomain(&self.subdomain_name) else {
                self.error(404, "Subdomain not found");
                return;
            };

            self.subdomain = Some(sub.clone());
            if !self.subdomain_name.is_empty() {
                self.logger = self.logger.scoped(self.subdomain_name.clone());
            }
            if let Some(t) = sub.error_template() {
                self.err_template = t;
            }

            let mws = sub.middlewares_snapshot();
            Next::new(&mws, Terminal::EnterApp).run(self).await;
        })
    }

    pub(crate) fn serve_app<'a>(&'a mut self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let sub = self.subdomain.clone().expect("subdomain stage completed");

            // Offline gates: the website is checked before the server.
            if !sub.is_online() {
                self.offline_response("Website Under Maintenance");
                return;
            }
            if !self.srv.check_online() {
                self.offline_response("Server Under Maintenance");
                return;
            }

            let app = sub.app();
            app.serve(self).await;
        })
    }

    fn offline_response(&mut self, message: &str) {
        let retry = self.srv.retry_after();
        self.set_header("retry-after", &retry.format("%a, %d %b %Y %H:%M:%S GMT").to_string());
        self.error(503, message);
    }

    // ---- completion ----

    pub(crate) fn register_panic(&mut self, payload: String) {
        if self.status < 400 {
            self.status = 500;
            self.caught_err = payload.clone().into_bytes();
        }
        self.internal_message = format!("panic: {}", payload);
        self.panicked = Some(payload);
    }

    fn render_error_body(&mut self) {
        let caught = std::mem::take(&mut self.caught_err);

        if looks_like_html(&caught) {
            self.body = caught;
            self.written = self.body.len() as u64;
            self.header.insert(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("text/html; charset=utf-8"),
            );
            return;
        }

        let message = if caught.is_empty() {
            StatusCode::from_u16(self.status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("Error")
                .to_string()
        } else {
            String::from_utf8_lossy(&caught).trim().to_string()
        };

        let method = self.req.method();
        if method == Method::GET || method == Method::HEAD {
            let rendered = self.err_template.render(self.status, &message);
            let content_type = if looks_like_html(rendered.as_bytes()) {
                "text/html; charset=utf-8"
            } else {
                "text/plain; charset=utf-8"
            };
            self.header.insert(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static(content_type),
            );
            self.body = rendered.into_bytes();
        } else {
            self.header.insert(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            self.body = message.into_bytes();
        }
        self.written = self.body.len() as u64;
    }

    fn access_log(&self) {
        if self.avoid_logging {
            return;
        }
        let millis = self.arrival.elapsed().as_millis();
        let target = if self.redirected {
            format!("{} ({}{})", self.host, self.subdomain_name, self.domain_name)
        } else {
            self.host.clone()
        };
        let message = format!(
            "{} {} {} {} - {} {}B - {}ms - {}",
            self.remote,
            self.req.method(),
            self.req.uri(),
            self.proto,
            self.status,
            self.written,
            millis,
            target,
        );

        let level = if self.panicked.is_some() {
            LogLevel::Fatal
        } else if self.status >= 500 {
            LogLevel::Error
        } else if self.status >= 400 {
            LogLevel::Warning
        } else {
            LogLevel::Info
        };
        self.logger.log(level, message, self.internal_message.clone());
    }

    /// Flushes the buffered response: default code, error rendering, one
    /// access-log line, HEAD body elision.
    pub(crate) fn finalize(mut self) -> Response<Full<Bytes>> {
        if self.status == 0 {
            self.status = 200;
        }
        if self.status >= 400 {
            self.render_error_body();
        }

        self.access_log();

        let body = if self.req.method() == Method::HEAD {
            Vec::new()
        } else {
            std::mem::take(&mut self.body)
        };

        let mut resp = Response::new(Full::new(Bytes::from(body)));
        *resp.status_mut() =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        *resp.headers_mut() = self.header;
        resp
    }
}

impl ServerHandler {
    /// Pipeline entry for one request: build the handler, run the
    /// server-scope chain (whose terminal enters the stage driver), then
    /// flush the buffered response. A panic anywhere in the chain is
    /// captured here and never reaches the accept loop.
    pub async fn serve(
        self: &Arc<Self>,
        req: Request<BodyKind>,
        remote: SocketAddr,
        proto: &str,
    ) -> Response<Full<Bytes>> {
        let mut h = Handler::new(self.clone(), req, remote, proto);
        let mws = self.middlewares_snapshot();

        let result = crate::safe::catch(async {
            if let Some(reason) = h.bad_url.take() {
                h.error_with(400, "Bad URL", reason);
                return;
            }
            Next::new(&mws, Terminal::EnterDomain).run(&mut h).await;
        })
        .await;

        if let Err(p) = result {
            h.register_panic(p.payload);
        }
        h.finalize()
    }
}


// HTTP front-end: host-based routing tree, per-request handler pipeline,
// listeners with TLS and the HTTP/3 side-car.

pub mod body;
pub mod handler;
pub mod host;
mod http3;
pub mod registry;
pub mod server;
pub mod template;
pub mod tls;

pub use body::BodyKind;
pub use handler::{Handler, Next, ServeStage, SERVER_HEADER};
pub use host::{parse_host, HostKeys};
pub use registry::{
    app_fn, Domain, HttpApp, RegistryError, ServerHandler, Subdomain, SubdomainConfig,
    SubdomainHook,
};
pub use server::{HttpServer, HttpServerOptions};
pub use template::ErrorTemplate;
pub use tls::CertificatePair;

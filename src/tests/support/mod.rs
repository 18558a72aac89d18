// Test harness helpers.

pub mod client;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::http::{HttpApp, HttpServer, HttpServerOptions, SubdomainConfig};
use crate::router::Router;

static UNIQUE: AtomicU32 = AtomicU32::new(0);

/// A path that will not collide across parallel tests in this binary.
pub fn unique_temp_path(prefix: &str) -> std::path::PathBuf {
    let n = UNIQUE.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("nixpare-test-{}-{}-{}", prefix, std::process::id(), n))
}

/// Router with one insecure HTTP server on an ephemeral port.
pub fn new_router_and_server() -> (Arc<Router>, Arc<HttpServer>) {
    let router = Router::new();
    router.set_pid_path(unique_temp_path("pid"));
    let server = router
        .register_http_server(HttpServerOptions::insecure("127.0.0.1", 0))
        .expect("register http server");
    (router, server)
}

/// Starts a router serving one site and returns its bound address.
pub async fn start_site(
    domain: &str,
    subdomain: &str,
    app: Arc<dyn HttpApp>,
) -> (Arc<Router>, Arc<HttpServer>, SocketAddr) {
    let (router, server) = new_router_and_server();
    let d = server.handler().register_domain(domain).expect("register domain");
    d.register_subdomain(subdomain, SubdomainConfig::new(app))
        .await
        .expect("register subdomain");
    router.start().await;
    let addr = server.local_addr().expect("bound address");
    (router, server, addr)
}

use std::sync::Arc;

use crate::http::{app_fn, HttpApp, SubdomainConfig};

use super::support::{self, client};

fn ok_app() -> Arc<dyn HttpApp> {
    app_fn(|h| {
        Box::pin(async move {
            h.write_str("up");
        })
    })
}

/// An offline website answers 503 with a Retry-After header; flipping it
/// back online restores service.
#[tokio::test]
async fn test_website_offline_gate() {
    let (router, server, addr) = support::start_site("example.com", "www", ok_app()).await;
    let sub = server
        .handler()
        .domain("example.com")
        .unwrap()
        .subdomain("www")
        .unwrap();

    assert!(sub.set_online(false));
    let offline = client::http_get(addr, "www.example.com", "/").await;
    assert_eq!(offline.status, 503);
    assert!(offline.body.contains("Website Under Maintenance"));
    assert!(offline.header("retry-after").is_some());

    assert!(sub.set_online(true));
    let online = client::http_get(addr, "www.example.com", "/").await;
    assert_eq!(online.status, 200);

    router.stop().await;
}

/// The subdomain gate is checked before the server gate.
#[tokio::test]
async fn test_website_offline_precedes_server_offline() {
    let (router, server, addr) = support::start_site("example.com", "www", ok_app()).await;
    let handler = server.handler().clone();
    let sub = handler.domain("example.com").unwrap().subdomain("www").unwrap();

    handler.set_offline_for(30);
    sub.set_online(false);

    let resp = client::http_get(addr, "www.example.com", "/").await;
    assert_eq!(resp.status, 503);
    assert!(resp.body.contains("Website Under Maintenance"));

    sub.set_online(true);
    let server_gate = client::http_get(addr, "www.example.com", "/").await;
    assert_eq!(server_gate.status, 503);
    assert!(server_gate.body.contains("Server Under Maintenance"));

    handler.set_online();
    let back = client::http_get(addr, "www.example.com", "/").await;
    assert_eq!(back.status, 200);

    router.stop().await;
}

/// A subdomain can only be online while its lifecycle is Started.
#[tokio::test]
async fn test_online_requires_started_lifecycle() {
    let (router, server) = support::new_router_and_server();
    let domain = server.handler().register_domain("example.com").unwrap();
    let sub = domain
        .register_subdomain("www", SubdomainConfig::new(ok_app()))
        .await
        .unwrap();

    // Not started yet: the flag cannot be raised.
    assert!(!sub.set_online(true));
    assert!(!sub.is_online());

    router.start().await;
    assert!(sub.is_online());

    router.stop().await;
    assert!(!sub.is_online());
}

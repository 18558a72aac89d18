use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::http::{app_fn, SubdomainConfig};
use crate::logger::LogLevel;
use crate::middleware::AliasMiddleware;

use super::support::{self, client};

fn hello_app() -> Arc<dyn crate::http::HttpApp> {
    app_fn(|h| {
        Box::pin(async move {
            h.write_str("hello");
        })
    })
}

/// S1: a server-scope alias middleware rewrites example.net onto
/// example.com; the request lands on the www. application and the access
/// log shows the raw host plus the rewritten pair.
#[tokio::test]
async fn test_alias_rewrite_routes_and_logs() {
    let (router, server, addr) = support::start_site("example.com", "www", hello_app()).await;
    server.handler().add_middleware(Arc::new(AliasMiddleware::domains(
        vec!["example.net".to_string()],
        "example.com",
    )));

    let resp = client::http_get(addr, "www.example.net", "/").await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, "hello");
    assert_eq!(resp.header("server"), Some("NixPare"));

    let logged = router
        .logger()
        .logs_at(&[LogLevel::Info])
        .iter()
        .any(|l| l.message.contains("(www.example.com)") && l.message.contains("www.example.net"));
    assert!(logged, "access log should carry the rewritten pair");

    router.stop().await;
}

#[tokio::test]
async fn test_exact_host_routing_and_default_fallback() {
    let (router, server, addr) = support::start_site("example.com", "www", hello_app()).await;
    let domain = server.handler().domain("example.com").unwrap();
    domain
        .register_subdomain(
            "",
            SubdomainConfig::new(app_fn(|h| {
                Box::pin(async move {
                    h.write_str("apex");
                })
            })),
        )
        .await
        .unwrap();

    let www = client::http_get(addr, "www.example.com", "/").await;
    assert_eq!(www.body, "hello");

    let apex = client::http_get(addr, "example.com", "/").await;
    assert_eq!(apex.body, "apex");

    // Unknown subdomain falls back to the domain's default entry.
    let other = client::http_get(addr, "ftp.example.com", "/").await;
    assert_eq!(other.status, 404);

    // Unknown domain falls back to the default domain, whose default
    // subdomain serves the not-found application.
    let unknown = client::http_get(addr, "nowhere.org", "/").await;
    assert_eq!(unknown.status, 404);
    assert_eq!(unknown.body, "404 Not Found");

    router.stop().await;
}

/// Alias rewriting also works on the subdomain key, at domain scope.
#[tokio::test]
async fn test_subdomain_alias_at_domain_scope() {
    let (router, server, addr) = support::start_site("example.com", "www", hello_app()).await;
    let domain = server.handler().domain("example.com").unwrap();
    domain.add_middleware(Arc::new(AliasMiddleware::subdomains(
        vec!["web".to_string(), "wwww".to_string()],
        "www",
    )));

    let resp = client::http_get(addr, "web.example.com", "/").await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, "hello");

    router.stop().await;
}

#[tokio::test]
async fn test_direct_ip_access_is_rejected() {
    let (router, _server, addr) = support::start_site("example.com", "www", hello_app()).await;

    let resp = client::http_get(addr, "8.8.8.8", "/").await;
    assert_eq!(resp.status, 404);
    assert!(resp.body.contains("Invalid direct IP access"));

    router.stop().await;
}

/// First-registered middleware runs outermost, at every scope.
#[tokio::test]
async fn test_middleware_ordering() {
    let order = Arc::new(parking_lot::Mutex::new(Vec::<&'static str>::new()));

    struct Marker {
        name_in: &'static str,
        name_out: &'static str,
        order: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    }

    #[async_trait::async_trait]
    impl crate::middleware::Middleware for Marker {
        async fn handle(&self, h: &mut crate::http::Handler, next: crate::http::Next<'_>) {
            self.order.lock().push(self.name_in);
            next.run(h).await;
            self.order.lock().push(self.name_out);
        }
    }

    let (router, server, addr) = support::start_site("example.com", "www", hello_app()).await;
    server.handler().add_middleware(Arc::new(Marker {
        name_in: "first-in",
        name_out: "first-out",
        order: order.clone(),
    }));
    server.handler().add_middleware(Arc::new(Marker {
        name_in: "second-in",
        name_out: "second-out",
        order: order.clone(),
    }));

    let resp = client::http_get(addr, "www.example.com", "/").await;
    assert_eq!(resp.status, 200);
    assert_eq!(
        *order.lock(),
        vec!["first-in", "second-in", "second-out", "first-out"]
    );

    router.stop().await;
}

/// Exactly one access-log entry per completed request, unless logging is
/// avoided.
#[tokio::test]
async fn test_one_access_log_line_per_request() {
    let count = Arc::new(AtomicUsize::new(0));
    let count_app = count.clone();
    let app = app_fn(move |h| {
        let count = count_app.clone();
        Box::pin(async move {
            count.fetch_add(1, Ordering::Relaxed);
            if h.path() == "/quiet" {
                h.set_avoid_logging(true);
            }
            h.write_str("ok");
        })
    });

    let (router, _server, addr) = support::start_site("example.com", "www", app).await;

    client::http_get(addr, "www.example.com", "/a").await;
    client::http_get(addr, "www.example.com", "/quiet").await;

    assert_eq!(count.load(Ordering::Relaxed), 2);
    let access_lines = router
        .logger()
        .logs()
        .iter()
        .filter(|l| l.message.contains("GET /"))
        .count();
    assert_eq!(access_lines, 1, "the /quiet request must not be logged");

    router.stop().await;
}

/// Loopback hosts collapse onto the localhost domain, so a stock HTTP
/// client talking to 127.0.0.1 lands on the site registered there.
#[tokio::test]
async fn test_loopback_routes_to_localhost_domain() {
    let app = app_fn(|h| {
        Box::pin(async move {
            h.write_str("local site");
        })
    });
    let (router, server, addr) = support::start_site("localhost", "", app).await;
    assert_eq!(crate::router::ServerInfo::port(server.as_ref()), 0);
    assert!(!crate::router::ServerInfo::secure(server.as_ref()));

    let body = reqwest::get(format!("http://{}/", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "local site");

    router.stop().await;
}

/// Subdomains registered while the server is running start on the fly.
#[tokio::test]
async fn test_dynamic_subdomain_registration() {
    let (router, server, addr) = support::start_site("example.com", "www", hello_app()).await;

    let inited = Arc::new(AtomicUsize::new(0));
    let inited_hook = inited.clone();
    let domain = server.handler().domain("example.com").unwrap();
    let mut cfg = SubdomainConfig::new(app_fn(|h| {
        Box::pin(async move {
            h.write_str("late");
        })
    }));
    cfg.init = Some(Arc::new(move || {
        let inited = inited_hook.clone();
        Box::pin(async move {
            inited.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }));
    domain.register_subdomain("late", cfg).await.unwrap();

    assert_eq!(inited.load(Ordering::Relaxed), 1, "init runs before first request");
    let resp = client::http_get(addr, "late.example.com", "/").await;
    assert_eq!(resp.body, "late");

    router.stop().await;
}

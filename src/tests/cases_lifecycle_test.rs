use crate::http::app_fn;
use crate::lifecycle::LifecycleState;

use super::support::{self, client};

/// S6 plus invariant 1: repeated Start/Stop collapses into no-ops, the
/// router terminates Stopped and the PID file is gone.
#[tokio::test]
async fn test_router_start_stop_idempotence() {
    let (router, server) = support::new_router_and_server();
    let pid_path = support::unique_temp_path("pidfile");
    router.set_pid_path(&pid_path);

    let domain = server.handler().register_domain("example.com").unwrap();
    domain
        .register_subdomain(
            "www",
            crate::http::SubdomainConfig::new(app_fn(|h| {
                Box::pin(async move {
                    h.write_str("alive");
                })
            })),
        )
        .await
        .unwrap();

    router.start().await;
    router.start().await;

    assert!(router.is_started());
    assert!(pid_path.exists(), "PID file written on start");
    let pid_contents = std::fs::read_to_string(&pid_path).unwrap();
    assert_eq!(pid_contents, format!("{}\n", std::process::id()));

    let addr = server.local_addr().unwrap();
    let resp = client::http_get(addr, "www.example.com", "/").await;
    assert_eq!(resp.status, 200);

    router.stop().await;
    router.stop().await;

    assert_eq!(router.lifecycle().state(), LifecycleState::Stopped);
    assert!(!pid_path.exists(), "PID file removed on stop");
}

/// Init hooks complete before the first request; close hooks run after
/// the drain, exactly once.
#[tokio::test]
async fn test_website_hooks_bracket_serving() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let inits = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));

    let (router, server) = support::new_router_and_server();
    let domain = server.handler().register_domain("example.com").unwrap();

    let inits_hook = inits.clone();
    let closes_hook = closes.clone();
    let mut cfg = crate::http::SubdomainConfig::new(app_fn(|h| {
        Box::pin(async move {
            h.write_str("ready");
        })
    }));
    cfg.init = Some(Arc::new(move || {
        let inits = inits_hook.clone();
        Box::pin(async move {
            inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }));
    cfg.close = Some(Arc::new(move || {
        let closes = closes_hook.clone();
        Box::pin(async move {
            closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }));
    domain.register_subdomain("www", cfg).await.unwrap();

    router.start().await;
    assert_eq!(inits.load(Ordering::SeqCst), 1);
    assert_eq!(closes.load(Ordering::SeqCst), 0);

    let addr = server.local_addr().unwrap();
    let resp = client::http_get(addr, "www.example.com", "/").await;
    assert_eq!(resp.body, "ready");

    router.stop().await;
    router.stop().await;
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

/// A failing init leaves the website stopped and offline; requests get
/// the offline gate instead of the application.
#[tokio::test]
async fn test_failed_init_keeps_website_offline() {
    use std::sync::Arc;

    let (router, server) = support::new_router_and_server();
    let domain = server.handler().register_domain("example.com").unwrap();

    let mut cfg = crate::http::SubdomainConfig::new(app_fn(|h| {
        Box::pin(async move {
            h.write_str("never");
        })
    }));
    cfg.init = Some(Arc::new(|| {
        Box::pin(async move { anyhow::bail!("migrations failed") })
    }));
    let sub = domain.register_subdomain("www", cfg).await.unwrap();

    router.start().await;
    assert!(!sub.is_online());
    assert_eq!(sub.lifecycle().state(), LifecycleState::Stopped);

    let addr = server.local_addr().unwrap();
    let resp = client::http_get(addr, "www.example.com", "/").await;
    assert_eq!(resp.status, 503);

    router.stop().await;
}

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::router::Router;
use crate::tcp::{proxy_handler, ConnHandler, TcpConn, TcpServerOptions};

use super::support;

struct EchoHandler;

#[async_trait::async_trait]
impl ConnHandler for EchoHandler {
    async fn handle(&self, mut conn: TcpConn) {
        let mut buf = [0u8; 1024];
        loop {
            match conn.stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if conn.stream.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[tokio::test]
async fn test_tcp_echo_roundtrip() {
    let router = Router::new();
    router.set_pid_path(support::unique_temp_path("pid"));
    let server = router
        .register_tcp_server(TcpServerOptions::insecure("127.0.0.1", 0))
        .unwrap();
    server.set_conn_handler(Arc::new(EchoHandler));
    router.start().await;
    let addr = server.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"ping over tcp").await.unwrap();
    stream.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    stream.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"ping over tcp");

    router.stop().await;
}

#[tokio::test]
async fn test_proxy_handler_pipes_both_ways() {
    // Upstream that greets and echoes one chunk back.
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    tokio::task::spawn(async move {
        if let Ok((mut stream, _)) = upstream.accept().await {
            let _ = stream.write_all(b"hello from upstream|").await;
            let mut buf = [0u8; 64];
            if let Ok(n) = stream.read(&mut buf).await {
                let _ = stream.write_all(&buf[..n]).await;
            }
        }
    });

    let router = Router::new();
    router.set_pid_path(support::unique_temp_path("pid"));
    let server = router
        .register_tcp_server(TcpServerOptions::insecure("127.0.0.1", 0))
        .unwrap();
    server.set_conn_handler(proxy_handler(upstream_addr.to_string()));
    router.start().await;
    let addr = server.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"echo me").await.unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 64];
    while received.len() < b"hello from upstream|echo me".len() {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => received.extend_from_slice(&buf[..n]),
        }
    }
    assert_eq!(received, b"hello from upstream|echo me");

    router.stop().await;
}

/// Ports are exclusive across server kinds.
#[tokio::test]
async fn test_port_taken_registration() {
    let router = Router::new();
    router.set_pid_path(support::unique_temp_path("pid"));
    router
        .register_tcp_server(TcpServerOptions::insecure("127.0.0.1", 39181))
        .unwrap();
    assert!(router
        .register_tcp_server(TcpServerOptions::insecure("127.0.0.1", 39181))
        .is_err());
    assert!(router
        .register_http_server(crate::http::HttpServerOptions::insecure("127.0.0.1", 39181))
        .is_err());
}

// Bidirectional piping and the proxy handler factory.

use std::sync::Arc;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::server::{ConnHandler, TcpConn};

/// Pipes two streams into each other until either side closes. Returns
/// the bytes copied in each direction.
pub async fn pipe<A, B>(a: &mut A, b: &mut B) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    copy_bidirectional(a, b).await
}

struct ProxyHandler {
    target: String,
}

#[async_trait::async_trait]
impl ConnHandler for ProxyHandler {
    async fn handle(&self, mut conn: TcpConn) {
        let mut upstream = match TcpStream::connect(&self.target).await {
            Ok(s) => s,
            Err(_) => return,
        };
        let _ = pipe(&mut conn.stream, &mut upstream).await;
    }
}

/// A connection handler that dials `target` and pipes both directions.
pub fn proxy_handler(target: impl Into<String>) -> Arc<dyn ConnHandler> {
    Arc::new(ProxyHandler {
        target: target.into(),
    })
}

// HTTP/3 side-car: a QUIC endpoint on the listener's port feeding the
// same routing tree as the TCP listeners.

use bytes::{Buf, Bytes};
use http::{Request, Response};
use http_body_util::BodyExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::logger::Logger;

use super::body::BodyKind;
use super::registry::ServerHandler;

/// Launches the QUIC endpoint and its accept loop.
pub(crate) fn start(
    handler: Arc<ServerHandler>,
    tls: Arc<rustls::ServerConfig>,
    addr: SocketAddr,
    token: CancellationToken,
    logger: Logger,
) -> anyhow::Result<quinn::Endpoint> {
    let mut tls = (*tls).clone();
    tls.alpn_protocols = vec![b"h3".to_vec()];
    let quic_tls = quinn::crypto::rustls::QuicServerConfig::try_from(tls)?;
    let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_tls));
    let endpoint = quinn::Endpoint::server(server_config, addr)?;

    let accept_endpoint = endpoint.clone();
    tokio::task::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    return;
                }
                incoming = accept_endpoint.accept() => {
                    let Some(incoming) = incoming else {
                        return;
                    };
                    let handler = handler.clone();
                    let logger = logger.clone();
                    tokio::task::spawn(async move {
                        handle_connection(incoming, handler, logger).await;
                    });
                }
            }
        }
    });

    Ok(endpoint)
}

async fn handle_connection(incoming: quinn::Incoming, handler: Arc<ServerHandler>, logger: Logger) {
    let conn = match incoming.await {
        Ok(c) => c,
        Err(e) => {
            logger.debug(format!("quic handshake failed: {}", e));
            return;
        }
    };
    let remote = conn.remote_address();

    let mut h3_conn = match h3::server::Connection::new(h3_quinn::Connection::new(conn)).await {
        Ok(c) => c,
        Err(e) => {
            logger.debug(format!("h3 connection setup with {} failed: {}", remote, e));
            return;
        }
    };

    loop {
        match h3_conn.accept().await {
            Ok(Some((req, stream))) => {
                let handler = handler.clone();
                let logger = logger.clone();
                tokio::task::spawn(async move {
                    if let Err(e) = handle_request(req, stream, handler, remote).await {
                        logger.debug(format!("h3 request from {} failed: {}", remote, e));
                    }
                });
            }
            Ok(None) => return,
            Err(e) => {
                logger.debug(format!("h3 connection with {} ended: {}", remote, e));
                return;
            }
        }
    }
}

async fn handle_request(
    req: Request<()>,
    mut stream: h3::server::RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>,
    handler: Arc<ServerHandler>,
    remote: SocketAddr,
) -> anyhow::Result<()> {
    // H3 requests are collected up front; the pipeline buffers responses
    // anyway, so streaming bodies gain nothing here.
    let mut body = Vec::new();
    while let Some(mut chunk) = stream.recv_data().await? {
        while chunk.has_remaining() {
            let piece = chunk.chunk();
            body.extend_from_slice(piece);
            let advance = piece.len();
            chunk.advance(advance);
        }
    }

    let (parts, ()) = req.into_parts();
    let req = Request::from_parts(parts, BodyKind::Buffered(Bytes::from(body)));

    let resp = handler.serve(req, remote, "HTTP/3.0").await;
    let (parts, full) = resp.into_parts();

    stream.send_response(Response::from_parts(parts, ())).await?;
    let bytes = full.collect().await.map(|c| c.to_bytes()).unwrap_or_default();
    if !bytes.is_empty() {
        stream.send_data(bytes).await?;
    }
    stream.finish().await?;
    Ok(())
}

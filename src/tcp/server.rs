// TCP server: accept loop feeding a per-connection handler with panic
// isolation.

use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::Lifecycle;
use crate::logger::Logger;
use crate::router::ServerError;
use crate::safe;
use crate::shutdown::Drain;

use crate::http::tls::{build_server_config, CertificatePair};

/// Listener configuration for a raw TCP server.
#[derive(Clone)]
pub struct TcpServerOptions {
    pub address: String,
    pub port: u16,
    pub secure: bool,
    pub certs: Vec<CertificatePair>,
}

impl TcpServerOptions {
    pub fn insecure(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            secure: false,
            certs: Vec::new(),
        }
    }

    pub fn secure(address: impl Into<String>, port: u16, certs: Vec<CertificatePair>) -> Self {
        Self {
            address: address.into(),
            port,
            secure: true,
            certs,
        }
    }
}

/// Accepted stream, plain or TLS-wrapped.
pub enum TcpStreamKind {
    Plain(TcpStream),
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
}

impl AsyncRead for TcpStreamKind {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TcpStreamKind::Plain(s) => Pin::new(s).poll_read(cx, buf),
            TcpStreamKind::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TcpStreamKind {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            TcpStreamKind::Plain(s) => Pin::new(s).poll_write(cx, buf),
            TcpStreamKind::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TcpStreamKind::Plain(s) => Pin::new(s).poll_flush(cx),
            TcpStreamKind::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            TcpStreamKind::Plain(s) => Pin::new(s).poll_shutdown(cx),
            TcpStreamKind::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// One accepted connection.
pub struct TcpConn {
    pub stream: TcpStreamKind,
    pub remote: SocketAddr,
}

/// Per-connection application logic of a [`TcpServer`].
#[async_trait::async_trait]
pub trait ConnHandler: Send + Sync {
    async fn handle(&self, conn: TcpConn);
}

/// Raw TCP listener with the same four-state lifecycle as the HTTP
/// servers. Each accepted connection runs on its own task under a panic
/// guard.
pub struct TcpServer {
    address: String,
    port: u16,
    secure: bool,
    tls: Option<Arc<rustls::ServerConfig>>,
    handler: RwLock<Option<Arc<dyn ConnHandler>>>,
    lifecycle: Lifecycle,
    logger: Logger,
    token: Mutex<CancellationToken>,
    drain: Mutex<Drain>,
    bound: Mutex<Option<SocketAddr>>,
}

impl TcpServer {
    pub(crate) fn new(opts: TcpServerOptions, logger: Logger) -> Result<Arc<Self>, ServerError> {
        let tls = if opts.secure {
            Some(Arc::new(build_server_config(&opts.certs)?))
        } else {
            None
        };
        Ok(Arc::new(Self {
            address: opts.address,
            port: opts.port,
            secure: opts.secure,
            tls,
            handler: RwLock::new(None),
            lifecycle: Lifecycle::new(),
            logger,
            token: Mutex::new(CancellationToken::new()),
            drain: Mutex::new(Drain::new()),
            bound: Mutex::new(None),
        }))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    /// Installs the per-connection handler. Connections accepted while no
    /// handler is installed are dropped.
    pub fn set_conn_handler(&self, handler: Arc<dyn ConnHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        if !self.lifecycle.begin_start() {
            return Ok(());
        }

        let listener = match TcpListener::bind((self.address.as_str(), self.port)).await {
            Ok(l) => l,
            Err(e) => {
                self.lifecycle.set_stopped();
                return Err(anyhow::Error::new(ServerError::PortTaken(self.port)).context(e));
            }
        };
        let local = listener.local_addr()?;
        *self.bound.lock() = Some(local);

        let token = CancellationToken::new();
        *self.token.lock() = token.clone();
        let drain = Drain::new();
        *self.drain.lock() = drain.clone();

        let server = self.clone();
        tokio::task::spawn(async move {
            server.accept_loop(listener, token, drain).await;
        });

        self.lifecycle.set_started();
        self.logger.info(format!(
            "tcp server started on port {}{}",
            local.port(),
            if self.secure { " (tls)" } else { "" }
        ));
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, token: CancellationToken, drain: Drain) {
        let acceptor = self.tls.clone().map(TlsAcceptor::from);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    return;
                }
                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            self.logger.log(
                                crate::logger::LogLevel::Error,
                                "accept failed".to_string(),
                                e.to_string(),
                            );
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            continue;
                        }
                    };

                    let Some(handler) = self.handler.read().clone() else {
                        continue;
                    };

                    drain.add();
                    let server = self.clone();
                    let conn_drain = drain.clone();
                    let conn_acceptor = acceptor.clone();
                    tokio::task::spawn(async move {
                        server.serve_conn(stream, remote, conn_acceptor, handler).await;
                        conn_drain.done();
                    });
                }
            }
        }
    }

    async fn serve_conn(
        self: Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
        acceptor: Option<TlsAcceptor>,
        handler: Arc<dyn ConnHandler>,
    ) {
        let stream = match acceptor {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls) => TcpStreamKind::Tls(tls),
                Err(e) => {
                    self.logger.debug(format!("tls handshake with {} failed: {}", remote, e));
                    return;
                }
            },
            None => TcpStreamKind::Plain(stream),
        };

        let conn = TcpConn { stream, remote };
        if let Err(panic) = safe::catch(handler.handle(conn)).await {
            self.logger.log(
                crate::logger::LogLevel::Fatal,
                format!("tcp connection handler for {} panicked", remote),
                panic.payload,
            );
        }
    }

    pub async fn stop(&self) {
        if !self.lifecycle.begin_stop() {
            return;
        }
        self.token.lock().clone().cancel();
        let drain = { self.drain.lock().clone() };
        drain.wait().await;
        self.lifecycle.set_stopped();
        self.logger.info(format!("tcp server stopped on port {}", self.port));
    }
}

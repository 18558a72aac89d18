// HTTP server: TCP listener, optional TLS, optional HTTP/3 side-car,
// graceful drain on shutdown.

use http::Request;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::Lifecycle;
use crate::logger::Logger;
use crate::router::{Router, ServerError};
use crate::shutdown::Drain;

use super::body::BodyKind;
use super::http3;
use super::registry::ServerHandler;
use super::tls::{build_server_config, CertificatePair};

/// Grace window granted to the HTTP/3 side-car on shutdown. HTTP/1-2
/// connections drain without a deadline.
const HTTP3_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Listener configuration handed to the router at registration.
#[derive(Clone)]
pub struct HttpServerOptions {
    pub address: String,
    pub port: u16,
    pub secure: bool,
    pub certs: Vec<CertificatePair>,
    pub http3: bool,
}

impl HttpServerOptions {
    pub fn insecure(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            secure: false,
            certs: Vec::new(),
            http3: false,
        }
    }

    pub fn secure(address: impl Into<String>, port: u16, certs: Vec<CertificatePair>) -> Self {
        Self {
            address: address.into(),
            port,
            secure: true,
            certs,
            http3: false,
        }
    }

    pub fn with_http3(mut self) -> Self {
        self.http3 = true;
        self
    }
}

/// One HTTP listener. Owns the sockets; the routing tree lives in the
/// [`ServerHandler`] so other listeners can share it.
pub struct HttpServer {
    address: String,
    port: u16,
    secure: bool,
    tls: Option<Arc<rustls::ServerConfig>>,
    http3: bool,
    handler: Arc<ServerHandler>,
    lifecycle: Lifecycle,
    logger: Logger,
    token: Mutex<CancellationToken>,
    drain: Mutex<Drain>,
    bound: Mutex<Option<SocketAddr>>,
    h3_endpoint: Mutex<Option<quinn::Endpoint>>,
}

impl HttpServer {
    pub(crate) fn new(
        router: &Arc<Router>,
        opts: HttpServerOptions,
        logger: Logger,
    ) -> Result<Arc<Self>, ServerError> {
        let tls = if opts.secure {
            let mut cfg = build_server_config(&opts.certs)?;
            cfg.alpn_protocols = if opts.http3 {
                vec![b"h3".to_vec(), b"h2".to_vec(), b"http/1.1".to_vec()]
            } else {
                vec![b"h2".to_vec(), b"http/1.1".to_vec()]
            };
            Some(Arc::new(cfg))
        } else {
            None
        };

        let handler = ServerHandler::new(router, opts.port, logger.clone());

        Ok(Arc::new(Self {
            address: opts.address,
            port: opts.port,
            secure: opts.secure,
            tls,
            http3: opts.http3,
            handler,
            lifecycle: Lifecycle::new(),
            logger,
            token: Mutex::new(CancellationToken::new()),
            drain: Mutex::new(Drain::new()),
            bound: Mutex::new(None),
            h3_endpoint: Mutex::new(None),
        }))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    /// Routing tree served by this listener.
    pub fn handler(&self) -> &Arc<ServerHandler> {
        &self.handler
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Actual bound address, available once started. Useful when the
    /// configured port is zero.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    /// Binds the listener and launches the accept loop; when enabled, the
    /// HTTP/3 side-car comes up on the same port over UDP.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        if !self.lifecycle.begin_start() {
            return Ok(());
        }

        // Website init hooks complete before the first request arrives.
        self.handler.start().await;

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

        let acceptor = self.tls.clone().map(TlsAcceptor::from);
        let server = self.clone();
        let loop_token = token.clone();
        tokio::task::spawn(async move {
            server.accept_loop(listener, loop_token, drain, acceptor).await;
        });

        if self.secure && self.http3 {
            let tls = self.tls.clone().expect("tls config for http3");
            match http3::start(self.handler.clone(), tls, local, token, self.logger.clone()) {
                Ok(endpoint) => {
                    *self.h3_endpoint.lock() = Some(endpoint);
                }
                Err(e) => {
                    self.logger.log(
                        crate::logger::LogLevel::Fatal,
                        format!("http3 side-car failed to start on port {}", local.port()),
                        e.to_string(),
                    );
                }
            }
        }

        self.lifecycle.set_started();
        self.logger.info(format!(
            "http server started on port {}{}",
            local.port(),
            if self.secure { " (tls)" } else { "" }
        ));
        Ok(())
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        token: CancellationToken,
        drain: Drain,
        acceptor: Option<TlsAcceptor>,
    ) {
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

                    drain.add();
                    let server = self.clone();
                    let conn_token = token.clone();
                    let conn_drain = drain.clone();
                    let conn_acceptor = acceptor.clone();
                    tokio::task::spawn(async move {
                        server
                            .serve_stream(stream, remote, conn_token, conn_acceptor)
                            .await;
                        conn_drain.done();
                    });
                }
            }
        }
    }

    async fn serve_stream(
        self: Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
        token: CancellationToken,
        acceptor: Option<TlsAcceptor>,
    ) {
        match acceptor {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => self.serve_connection(tls_stream, remote, token).await,
                Err(e) => {
                    self.logger.debug(format!("tls handshake with {} failed: {}", remote, e));
                }
            },
            None => self.serve_connection(stream, remote, token).await,
        }
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S, remote: SocketAddr, token: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = self.handler.clone();
        let svc = service_fn(move |req: Request<hyper::body::Incoming>| {
            let handler = handler.clone();
            let proto = format!("{:?}", req.version());
            async move {
                let resp = handler
                    .serve(req.map(BodyKind::Incoming), remote, &proto)
                    .await;
                Ok::<_, std::convert::Infallible>(resp)
            }
        });

        let builder = auto::Builder::new(TokioExecutor::new());
        let conn = builder.serve_connection(TokioIo::new(stream), svc);
        tokio::pin!(conn);

        tokio::select! {
            res = conn.as_mut() => {
                if let Err(e) = res {
                    self.logger.debug(format!("connection with {} ended: {}", remote, e));
                }
            }
            _ = token.cancelled() => {
                // Stop keep-alive and let in-flight exchanges finish.
                conn.as_mut().graceful_shutdown();
                let _ = conn.as_mut().await;
            }
        }
    }

    /// Drains and stops. The HTTP/3 side-car gets a bounded grace window,
    /// HTTP/1-2 connections drain without a deadline, then the websites
    /// run their close hooks.
    pub async fn stop(&self) {
        if !self.lifecycle.begin_stop() {
            return;
        }

        let token = self.token.lock().clone();
        token.cancel();

        let endpoint = { self.h3_endpoint.lock().take() };
        if let Some(endpoint) = endpoint {
            let _ = tokio::time::timeout(HTTP3_SHUTDOWN_GRACE, endpoint.wait_idle()).await;
            endpoint.close(0u32.into(), b"server closed");
        }

        let drain = { self.drain.lock().clone() };
        drain.wait().await;

        self.handler.stop().await;
        self.lifecycle.set_stopped();
        self.logger.info(format!("http server stopped on port {}", self.port));
    }
}

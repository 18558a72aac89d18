// Router: owner of every server and the task manager, boundary of
// configuration, and the global start/stop coordinator.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::http::{HttpServer, HttpServerOptions};
use crate::lifecycle::Lifecycle;
use crate::logger::{LogLevel, Logger};
use crate::tasks::TaskManager;
use crate::tcp::{TcpServer, TcpServerOptions};

/// Startup and runtime network failures surfaced by servers.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("port {0} already taken")]
    PortTaken(u16),
    #[error("TLS configuration failed: {0}")]
    TlsConfig(String),
    #[error("listener closed")]
    ListenerClosed,
}

/// Capability every registered server exposes.
pub trait ServerInfo {
    fn port(&self) -> u16;
    fn secure(&self) -> bool;
}

impl ServerInfo for HttpServer {
    fn port(&self) -> u16 {
        HttpServer::port(self)
    }
    fn secure(&self) -> bool {
        HttpServer::secure(self)
    }
}

impl ServerInfo for TcpServer {
    fn port(&self) -> u16 {
        TcpServer::port(self)
    }
    fn secure(&self) -> bool {
        TcpServer::secure(self)
    }
}

/// Owner of all servers plus the task manager. Created before any server
/// and destroyed only after everything it owns is stopped.
pub struct Router {
    http_servers: RwLock<HashMap<u16, Arc<HttpServer>>>,
    tcp_servers: RwLock<HashMap<u16, Arc<TcpServer>>>,
    task_manager: Arc<TaskManager>,
    logger: Logger,
    lifecycle: Lifecycle,
    pid_file: Mutex<Option<PathBuf>>,
    pid_path_override: Mutex<Option<PathBuf>>,
}

impl Router {
    pub fn new() -> Arc<Self> {
        Self::with_logger(Logger::new())
    }

    pub fn with_logger(logger: Logger) -> Arc<Self> {
        let logger = logger.scoped("router");
        Arc::new(Self {
            http_servers: RwLock::new(HashMap::new()),
            tcp_servers: RwLock::new(HashMap::new()),
            task_manager: TaskManager::new(logger.clone()),
            logger,
            lifecycle: Lifecycle::new(),
            pid_file: Mutex::new(None),
            pid_path_override: Mutex::new(None),
        })
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn task_manager(&self) -> &Arc<TaskManager> {
        &self.task_manager
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn is_started(&self) -> bool {
        self.lifecycle.is_started()
    }

    fn port_taken(&self, port: u16) -> bool {
        // A port backs at most one listener, regardless of protocol.
        self.http_servers.read().contains_key(&port) || self.tcp_servers.read().contains_key(&port)
    }

    /// Registers an HTTP server. Fails with `PortTaken` when the port
    /// already backs a listener and `TlsConfig` when the certificates do
    /// not assemble.
    pub fn register_http_server(
        self: &Arc<Self>,
        opts: HttpServerOptions,
    ) -> Result<Arc<HttpServer>, ServerError> {
        let port = opts.port;
        if port != 0 && self.port_taken(port) {
            return Err(ServerError::PortTaken(port));
        }
        let logger = self.logger.scoped("http").scoped(port.to_string());
        let server = HttpServer::new(self, opts, logger)?;
        self.http_servers.write().insert(port, server.clone());
        Ok(server)
    }

    /// Registers a raw TCP server.
    pub fn register_tcp_server(
        self: &Arc<Self>,
        opts: TcpServerOptions,
    ) -> Result<Arc<TcpServer>, ServerError> {
        let port = opts.port;
        if port != 0 && self.port_taken(port) {
            return Err(ServerError::PortTaken(port));
        }
        let logger = self.logger.scoped("tcp").scoped(port.to_string());
        let server = TcpServer::new(opts, logger)?;
        self.tcp_servers.write().insert(port, server.clone());
        Ok(server)
    }

    pub fn http_server(&self, port: u16) -> Option<Arc<HttpServer>> {
        self.http_servers.read().get(&port).cloned()
    }

    pub fn tcp_server(&self, port: u16) -> Option<Arc<TcpServer>> {
        self.tcp_servers.read().get(&port).cloned()
    }

    pub fn http_servers(&self) -> Vec<Arc<HttpServer>> {
        self.http_servers.read().values().cloned().collect()
    }

    pub fn tcp_servers(&self) -> Vec<Arc<TcpServer>> {
        self.tcp_servers.read().values().cloned().collect()
    }

    fn pid_file_path() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe) => {
                let stem = exe
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "nixpare".to_string());
                exe.with_file_name(format!("{}.pid", stem))
            }
            Err(_) => PathBuf::from("nixpare.pid"),
        }
    }

    /// Overrides the PID file location; by default it sits next to the
    /// executable.
    pub fn set_pid_path(&self, path: impl Into<PathBuf>) {
        *self.pid_path_override.lock() = Some(path.into());
    }

    fn write_pid_file(&self) {
        let path = self
            .pid_path_override
            .lock()
            .clone()
            .unwrap_or_else(Self::pid_file_path);
        match std::fs::write(&path, format!("{}\n", std::process::id())) {
            Ok(()) => {
                *self.pid_file.lock() = Some(path);
            }
            Err(e) => {
                self.logger.log(
                    LogLevel::Error,
                    format!("failed to write PID file at {}", path.display()),
                    e.to_string(),
                );
            }
        }
    }

    fn remove_pid_file(&self) {
        if let Some(path) = self.pid_file.lock().take() {
            if let Err(e) = std::fs::remove_file(&path) {
                self.logger.log(
                    LogLevel::Error,
                    format!("failed to remove PID file at {}", path.display()),
                    e.to_string(),
                );
            }
        }
    }

    /// Global start: PID file, TCP servers, HTTP servers, task manager,
    /// in that order. A server that fails to bind is logged fatal and the
    /// start continues; idempotent.
    pub async fn start(self: &Arc<Self>) {
        if !self.lifecycle.begin_start() {
            return;
        }

        self.write_pid_file();

        for server in self.tcp_servers() {
            if let Err(e) = server.start().await {
                self.logger.log(
                    LogLevel::Fatal,
                    format!("tcp server on port {} failed to start", server.port()),
                    e.to_string(),
                );
            }
        }
        for server in self.http_servers() {
            if let Err(e) = server.start().await {
                self.logger.log(
                    LogLevel::Fatal,
                    format!("http server on port {} failed to start", server.port()),
                    e.to_string(),
                );
            }
        }

        self.task_manager.start().await;

        self.lifecycle.set_started();
        self.logger.info("router started");
    }

    /// Global stop in reverse order: task manager first so tasks stop
    /// submitting work, then HTTP, then TCP; removes the PID file. Every
    /// component is attempted regardless of earlier errors; idempotent.
    pub async fn stop(self: &Arc<Self>) {
        if !self.lifecycle.begin_stop() {
            return;
        }

        self.task_manager.stop().await;

        for server in self.http_servers() {
            server.stop().await;
        }
        for server in self.tcp_servers() {
            server.stop().await;
        }

        self.remove_pid_file();

        self.lifecycle.set_stopped();
        self.logger.info("router stopped");
    }
}

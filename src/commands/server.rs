// Command server: accept loop, per-session line-JSON protocol, dispatch
// to built-in or user-registered handlers under a panic guard.

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::lifecycle::Lifecycle;
use crate::logger::{LogLevel, Logger};
use crate::router::Router;
use crate::safe;
use crate::shutdown::Drain;

use super::builtin;
use super::endpoint::{BoxedIpcStream, IpcListener};
use super::protocol::{ClientFrame, CommandError, ServerFrame, PANIC_EXIT_CODE};

/// A user-registered command handler. Returns the session exit code.
pub type CommandFunc = Arc<
    dyn for<'a> Fn(&'a mut ServerConn, &'a [String]) -> BoxFuture<'a, Result<i32, CommandError>>
        + Send
        + Sync,
>;

/// Wraps a closure into a [`CommandFunc`], pinning down the higher-ranked
/// lifetimes so plain closures infer cleanly.
pub fn command_fn<F>(f: F) -> CommandFunc
where
    F: for<'a> Fn(&'a mut ServerConn, &'a [String]) -> BoxFuture<'a, Result<i32, CommandError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// One command session, handed to handlers. Wraps the framed stream and
/// exposes the live router.
pub struct ServerConn {
    router: Arc<Router>,
    framed: Framed<BoxedIpcStream, LinesCodec>,
}

impl ServerConn {
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    async fn send(&mut self, frame: ServerFrame) -> Result<(), CommandError> {
        let encoded =
            serde_json::to_string(&frame).map_err(|e| CommandError::Decode(e.to_string()))?;
        self.framed
            .send(encoded)
            .await
            .map_err(|e| CommandError::Read(e.to_string()))
    }

    /// Writes one stdout line to the attached client.
    pub async fn write_out(&mut self, msg: impl Into<String>) -> Result<(), CommandError> {
        self.send(ServerFrame::out(msg)).await
    }

    /// Writes one stderr line to the attached client.
    pub async fn write_err(&mut self, msg: impl Into<String>) -> Result<(), CommandError> {
        self.send(ServerFrame::err(msg)).await
    }

    /// Reads one stdin line forwarded by the client. `None` means the
    /// client closed the connection.
    pub async fn read_line(&mut self) -> Result<Option<String>, CommandError> {
        match self.framed.next().await {
            Some(Ok(line)) => {
                let frame: ClientFrame = serde_json::from_str(&line)
                    .map_err(|e| CommandError::Decode(e.to_string()))?;
                Ok(Some(frame.msg))
            }
            Some(Err(e)) => Err(CommandError::Read(e.to_string())),
            None => Ok(None),
        }
    }

    pub(crate) async fn next_raw(&mut self) -> Option<Result<String, CommandError>> {
        match self.framed.next().await {
            Some(Ok(line)) => Some(Ok(line)),
            Some(Err(e)) => Some(Err(CommandError::Read(e.to_string()))),
            None => None,
        }
    }
}

/// Local command endpoint bound to a router.
pub struct CommandServer {
    router: Arc<Router>,
    path: String,
    handlers: DashMap<String, CommandFunc>,
    lifecycle: Lifecycle,
    logger: Logger,
    token: Mutex<CancellationToken>,
}

impl CommandServer {
    pub fn new(router: Arc<Router>, path: impl Into<String>) -> Arc<Self> {
        let logger = router.logger().scoped("commands");
        Arc::new(Self {
            router,
            path: path.into(),
            handlers: DashMap::new(),
            lifecycle: Lifecycle::new(),
            logger,
            token: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Registers a custom command under a unique name.
    pub fn register_command(
        &self,
        name: impl Into<String>,
        func: CommandFunc,
    ) -> Result<(), CommandError> {
        let name = name.into();
        if builtin::is_builtin(&name) || self.handlers.contains_key(&name) {
            return Err(CommandError::AlreadyRegistered(name));
        }
        self.handlers.insert(name, func);
        Ok(())
    }

    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|h| h.key().clone()).collect();
        names.sort();
        names
    }

    /// Binds the endpoint and launches the accept loop.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        if !self.lifecycle.begin_start() {
            return Ok(());
        }

        let mut listener = match IpcListener::bind(&self.path) {
            Ok(l) => l,
            Err(e) => {
                self.lifecycle.set_stopped();
                return Err(anyhow::Error::new(e).context("failed to bind command endpoint"));
            }
        };

        let token = CancellationToken::new();
        *self.token.lock() = token.clone();

        let server = self.clone();
        tokio::task::spawn(async move {
            let drain = Drain::new();
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        break;
                    }
                    accepted = listener.accept() => {
                        let stream = match accepted {
                            Ok(s) => s,
                            Err(e) => {
                                server.logger.log(
                                    LogLevel::Error,
                                    "command endpoint accept failed".to_string(),
                                    e.to_string(),
                                );
                                continue;
                            }
                        };
                        drain.add();
                        let session_server = server.clone();
                        let session_token = token.clone();
                        let session_drain = drain.clone();
                        tokio::task::spawn(async move {
                            tokio::select! {
                                _ = session_server.clone().session(stream) => {}
                                _ = session_token.cancelled() => {}
                            }
                            session_drain.done();
                        });
                    }
                }
            }
            // Sessions are closed with the endpoint.
            drain.wait().await;
            listener.cleanup();
        });

        self.lifecycle.set_started();
        self.logger.info(format!("command server started at {}", self.path));
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.lifecycle.begin_stop() {
            return;
        }
        self.token.lock().clone().cancel();
        self.lifecycle.set_stopped();
        self.logger.info("command server stopped");
    }

    async fn session(self: Arc<Self>, stream: BoxedIpcStream) {
        let mut conn = ServerConn {
            router: self.router.clone(),
            framed: Framed::new(stream, LinesCodec::new()),
        };

        // Exactly one command frame opens the session.
        let first = match conn.next_raw().await {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                self.logger.log(
                    LogLevel::Error,
                    "failed to read command frame".to_string(),
                    e.to_string(),
                );
                return;
            }
            None => return,
        };

        let args = match decode_command(&first) {
            Ok(args) => args,
            Err(e) => {
                let _ = conn.write_err(e.to_string()).await;
                let _ = conn.send(ServerFrame::exit(1)).await;
                return;
            }
        };
        if args.is_empty() {
            let _ = conn.write_err("empty command").await;
            let _ = conn.send(ServerFrame::exit(1)).await;
            return;
        }

        let (cmd, rest) = (args[0].clone(), &args[1..]);
        self.logger.debug(format!("command '{}' dispatched", cmd));

        let result = safe::catch(self.dispatch(&mut conn, &cmd, rest)).await;
        let code = match result {
            Ok(Ok(code)) => code,
            Ok(Err(CommandError::Exit { code, message })) => {
                if !message.is_empty() {
                    let _ = conn.write_err(message).await;
                }
                code
            }
            Ok(Err(CommandError::Standard(msg))) => {
                let _ = conn.write_err(msg).await;
                1
            }
            Ok(Err(other)) => {
                let _ = conn.write_err(other.to_string()).await;
                1
            }
            Err(panic) => {
                self.logger.log(
                    LogLevel::Fatal,
                    format!("command '{}' panicked", cmd),
                    panic.payload.clone(),
                );
                let _ = conn
                    .write_err(format!("command panicked: {}", panic.payload))
                    .await;
                PANIC_EXIT_CODE
            }
        };

        // The exit frame is always last.
        let _ = conn.send(ServerFrame::exit(code)).await;
    }

    async fn dispatch(
        self: &Arc<Self>,
        conn: &mut ServerConn,
        cmd: &str,
        args: &[String],
    ) -> Result<i32, CommandError> {
        if builtin::is_builtin(cmd) {
            return builtin::dispatch(self, conn, cmd, args).await;
        }
        let Some(handler) = self.handlers.get(cmd).map(|h| h.clone()) else {
            return Err(CommandError::standard(format!(
                "unknown command '{}', try 'help'",
                cmd
            )));
        };
        handler(conn, args).await
    }
}

fn decode_command(line: &str) -> Result<Vec<String>, CommandError> {
    let frame: ClientFrame =
        serde_json::from_str(line).map_err(|e| CommandError::Decode(e.to_string()))?;
    serde_json::from_str(&frame.msg).map_err(|e| CommandError::Decode(e.to_string()))
}

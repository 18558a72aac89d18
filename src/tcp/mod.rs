// Generic TCP serving: accept loop with per-connection handlers, a
// bidirectional pipe utility and a proxy handler factory.

pub mod pipe;
pub mod server;

pub use pipe::{pipe, proxy_handler};
pub use server::{ConnHandler, TcpConn, TcpServer, TcpServerOptions, TcpStreamKind};

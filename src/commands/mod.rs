// Administrative command channel over a local stream endpoint.

pub mod builtin;
pub mod client;
pub mod endpoint;
pub mod protocol;
pub mod server;

pub use client::send_command;
pub use protocol::{ClientFrame, CommandError, ServerFrame, PANIC_EXIT_CODE};
pub use server::{command_fn, CommandFunc, CommandServer, ServerConn};

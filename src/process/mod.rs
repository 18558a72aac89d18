// Supervised external processes with stdio routing.

pub mod process;

pub use process::{Process, ProcessError, ProcessExit, ProcessStdio, STDIO_INHERIT};

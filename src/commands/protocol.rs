// Wire protocol of the command channel: line-delimited JSON, one object
// per line.

use serde::{Deserialize, Serialize};

/// Frame type for stdout lines.
pub const RESP_TYPE_OUT: u8 = 0;
/// Frame type for stderr lines.
pub const RESP_TYPE_ERR: u8 = 1;
/// Frame type for the final exit message.
pub const RESP_TYPE_EXIT: u8 = 2;

/// Exit code reserved for a panicking command handler.
pub const PANIC_EXIT_CODE: i32 = 255;

/// Client to server. The first frame carries a JSON-encoded array of
/// strings `[cmd, arg1, ...]`; later frames are stdin lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    pub msg: String,
}

/// Server to client. `type` 0 is stdout, 1 is stderr, 2 is the exit
/// message carrying the code; the exit frame is always last.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerFrame {
    pub msg: String,
    #[serde(rename = "type")]
    pub kind: u8,
    pub code: i32,
}

impl ServerFrame {
    pub fn out(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            kind: RESP_TYPE_OUT,
            code: 0,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            msg: msg.into(),
            kind: RESP_TYPE_ERR,
            code: 0,
        }
    }

    pub fn exit(code: i32) -> Self {
        Self {
            msg: String::new(),
            kind: RESP_TYPE_EXIT,
            code,
        }
    }
}

/// Command-channel framing and control failures.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to read command frame: {0}")]
    Read(String),
    #[error("failed to decode command frame: {0}")]
    Decode(String),
    #[error("connection ended before the exit frame")]
    ExitCodeLost,
    #[error("invalid response type {0}")]
    InvalidRespType(u8),
    #[error("command '{0}' already registered")]
    AlreadyRegistered(String),
    #[error("{0}")]
    Standard(String),
    #[error("exit {code}: {message}")]
    Exit { code: i32, message: String },
}

impl CommandError {
    /// A plain failure: the message goes to stderr, exit code 1.
    pub fn standard(msg: impl Into<String>) -> Self {
        CommandError::Standard(msg.into())
    }

    /// A failure with an explicit exit code.
    pub fn exit(code: i32, msg: impl Into<String>) -> Self {
        CommandError::Exit {
            code,
            message: msg.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_frame_round_trip() {
        let frame = ServerFrame::out("hello");
        let encoded = serde_json::to_string(&frame).unwrap();
        assert!(encoded.contains("\"type\":0"));
        let decoded: ServerFrame = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.msg, "hello");
        assert_eq!(decoded.kind, RESP_TYPE_OUT);
        assert_eq!(decoded.code, 0);
    }

    #[test]
    fn test_exit_frame_shape() {
        let encoded = serde_json::to_string(&ServerFrame::exit(3)).unwrap();
        let decoded: ServerFrame = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.kind, RESP_TYPE_EXIT);
        assert_eq!(decoded.code, 3);
        assert!(decoded.msg.is_empty());
    }
}

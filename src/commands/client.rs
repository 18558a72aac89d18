// Piping client of the command channel.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Framed, LinesCodec};

use super::endpoint;
use super::protocol::{
    ClientFrame, CommandError, ServerFrame, RESP_TYPE_ERR, RESP_TYPE_EXIT, RESP_TYPE_OUT,
};

/// Connects to a command endpoint, sends `[cmd, args...]`, pipes server
/// frames into the given writers and forwards stdin lines to the server.
/// Returns the exit code carried by the final frame; a connection that
/// ends without one raises [`CommandError::ExitCodeLost`].
pub async fn send_command<I, O, E>(
    path: &str,
    args: &[&str],
    stdin: Option<I>,
    stdout: &mut O,
    stderr: &mut E,
) -> Result<i32, CommandError>
where
    I: AsyncBufRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let stream = endpoint::connect(path)
        .await
        .map_err(|e| CommandError::Read(e.to_string()))?;
    let framed = Framed::new(stream, LinesCodec::new());
    let (mut sink, mut frames) = framed.split();

    let command: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    let msg = serde_json::to_string(&command).map_err(|e| CommandError::Decode(e.to_string()))?;
    let first = serde_json::to_string(&ClientFrame { msg })
        .map_err(|e| CommandError::Decode(e.to_string()))?;
    sink.send(first)
        .await
        .map_err(|e| CommandError::Read(e.to_string()))?;

    // Forward caller stdin as {msg} frames until it runs dry.
    if let Some(stdin) = stdin {
        tokio::task::spawn(async move {
            let mut lines = stdin.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(encoded) = serde_json::to_string(&ClientFrame { msg: line }) else {
                    break;
                };
                if sink.send(encoded).await.is_err() {
                    break;
                }
            }
        });
    }

    loop {
        match frames.next().await {
            Some(Ok(line)) => {
                let frame: ServerFrame = serde_json::from_str(&line)
                    .map_err(|e| CommandError::Decode(e.to_string()))?;
                match frame.kind {
                    RESP_TYPE_OUT => {
                        write_line(stdout, &frame.msg).await?;
                    }
                    RESP_TYPE_ERR => {
                        write_line(stderr, &frame.msg).await?;
                    }
                    RESP_TYPE_EXIT => return Ok(frame.code),
                    other => return Err(CommandError::InvalidRespType(other)),
                }
            }
            Some(Err(e)) => return Err(CommandError::Read(e.to_string())),
            None => return Err(CommandError::ExitCodeLost),
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(w: &mut W, msg: &str) -> Result<(), CommandError> {
    w.write_all(msg.as_bytes())
        .await
        .map_err(|e| CommandError::Read(e.to_string()))?;
    w.write_all(b"\n")
        .await
        .map_err(|e| CommandError::Read(e.to_string()))
}

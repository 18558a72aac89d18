// Local stream endpoint: UNIX socket on POSIX, named pipe on Windows.

use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Object-safe stream alias so the rest of the channel stays
/// platform-neutral.
pub trait IpcStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IpcStream for T {}

pub type BoxedIpcStream = Box<dyn IpcStream>;

/// Maps a bare endpoint name onto the platform path: untouched on POSIX,
/// prefixed with `\\.\pipe\` on Windows when not already a pipe path.
pub fn endpoint_path(name: &str) -> String {
    #[cfg(windows)]
    {
        if name.starts_with(r"\\.\pipe\") {
            name.to_string()
        } else {
            format!(r"\\.\pipe\{}", name)
        }
    }
    #[cfg(not(windows))]
    {
        name.to_string()
    }
}

#[cfg(unix)]
pub(crate) struct IpcListener {
    inner: tokio::net::UnixListener,
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl IpcListener {
    pub(crate) fn bind(path: &str) -> io::Result<Self> {
        let path = std::path::PathBuf::from(endpoint_path(path));
        // A previous run may have left the socket file behind.
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let inner = tokio::net::UnixListener::bind(&path)?;
        Ok(Self { inner, path })
    }

    pub(crate) async fn accept(&mut self) -> io::Result<BoxedIpcStream> {
        let (stream, _) = self.inner.accept().await?;
        Ok(Box::new(stream))
    }

    pub(crate) fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(windows)]
pub(crate) struct IpcListener {
    path: String,
    next: Option<tokio::net::windows::named_pipe::NamedPipeServer>,
}

#[cfg(windows)]
impl IpcListener {
    pub(crate) fn bind(path: &str) -> io::Result<Self> {
        use tokio::net::windows::named_pipe::ServerOptions;
        let path = endpoint_path(path);
        let first = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&path)?;
        Ok(Self {
            path,
            next: Some(first),
        })
    }

    pub(crate) async fn accept(&mut self) -> io::Result<BoxedIpcStream> {
        use tokio::net::windows::named_pipe::ServerOptions;
        let server = match self.next.take() {
            Some(s) => s,
            None => ServerOptions::new().create(&self.path)?,
        };
        server.connect().await?;
        self.next = Some(ServerOptions::new().create(&self.path)?);
        Ok(Box::new(server))
    }

    pub(crate) fn cleanup(&self) {}
}

/// Connects to a command endpoint.
pub async fn connect(path: &str) -> io::Result<BoxedIpcStream> {
    let path = endpoint_path(path);
    #[cfg(unix)]
    {
        let stream = tokio::net::UnixStream::connect(&path).await?;
        Ok(Box::new(stream))
    }
    #[cfg(windows)]
    {
        use tokio::net::windows::named_pipe::ClientOptions;
        let stream = ClientOptions::new().open(&path)?;
        Ok(Box::new(stream))
    }
}

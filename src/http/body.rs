// Request body abstraction shared by the HTTP/1-2 listeners and the
// HTTP/3 side-car.

use bytes::Bytes;
use http_body_util::BodyExt;

/// Incoming request body. HTTP/1-2 requests stream through hyper, the
/// HTTP/3 side-car delivers pre-collected bytes.
pub enum BodyKind {
    Incoming(hyper::body::Incoming),
    Buffered(Bytes),
    Empty,
}

impl BodyKind {
    /// Collects the whole body, caching it so repeated reads return the
    /// same bytes.
    pub async fn collect(&mut self) -> anyhow::Result<Bytes> {
        match self {
            BodyKind::Buffered(b) => Ok(b.clone()),
            BodyKind::Empty => Ok(Bytes::new()),
            BodyKind::Incoming(_) => {
                let BodyKind::Incoming(inner) = std::mem::replace(self, BodyKind::Empty) else {
                    unreachable!()
                };
                let collected = inner.collect().await?.to_bytes();
                *self = BodyKind::Buffered(collected.clone());
                Ok(collected)
            }
        }
    }
}

impl std::fmt::Debug for BodyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BodyKind::Incoming(_) => f.write_str("BodyKind::Incoming"),
            BodyKind::Buffered(b) => write!(f, "BodyKind::Buffered({}B)", b.len()),
            BodyKind::Empty => f.write_str("BodyKind::Empty"),
        }
    }
}

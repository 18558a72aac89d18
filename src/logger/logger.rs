// Logger sink: append-only in-memory ring, zero-or-one mirror stream,
// tag-scoped clones sharing the same ring.

use chrono::Utc;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::log::{Log, LogLevel};

struct Inner {
    logs: Mutex<Vec<Arc<Log>>>,
    next_id: AtomicU64,
    mirror: Option<Mutex<Box<dyn Write + Send>>>,
}

/// Structured log sink. Cloning with [`Logger::scoped`] adds a tag and
/// shares the underlying ring, so every component writes into the same
/// append-only history while carrying its own scope.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<Inner>,
    tags: Vec<String>,
}

impl Logger {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                logs: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                mirror: None,
            }),
            tags: Vec::new(),
        }
    }

    /// A logger mirroring every record, rendered as a line, into `w`.
    pub fn with_mirror(w: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Arc::new(Inner {
                logs: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                mirror: Some(Mutex::new(w)),
            }),
            tags: Vec::new(),
        }
    }

    /// Child logger with one more tag, same ring.
    pub fn scoped(&self, tag: impl Into<String>) -> Logger {
        let mut tags = self.tags.clone();
        tags.push(tag.into());
        Logger {
            inner: self.inner.clone(),
            tags,
        }
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Appends a record and emits it through `tracing` and the mirror.
    pub fn log(&self, level: LogLevel, message: impl Into<String>, extra: impl Into<String>) -> Arc<Log> {
        let record = Arc::new(Log {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            level,
            date: Utc::now(),
            tags: self.tags.clone(),
            message: message.into(),
            extra: extra.into(),
        });

        self.inner.logs.lock().push(record.clone());

        if let Some(mirror) = &self.inner.mirror {
            let mut w = mirror.lock();
            let _ = writeln!(w, "{}", record.line());
        }

        let tags = record.tags.join(" ");
        match level {
            LogLevel::Blank | LogLevel::Info => {
                info!(tags = %tags, extra = %record.extra, "{}", record.message)
            }
            LogLevel::Debug => debug!(tags = %tags, extra = %record.extra, "{}", record.message),
            LogLevel::Warning => warn!(tags = %tags, extra = %record.extra, "{}", record.message),
            LogLevel::Error => error!(tags = %tags, extra = %record.extra, "{}", record.message),
            LogLevel::Fatal => {
                error!(tags = %tags, extra = %record.extra, fatal = true, "{}", record.message)
            }
        }

        record
    }

    pub fn blank(&self, message: impl Into<String>) {
        self.log(LogLevel::Blank, message, "");
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message, "");
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message, "");
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message, "");
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message, "");
    }

    pub fn fatal(&self, message: impl Into<String>) {
        self.log(LogLevel::Fatal, message, "");
    }

    /// Snapshot of the whole ring, in append order.
    pub fn logs(&self) -> Vec<Arc<Log>> {
        self.inner.logs.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.inner.logs.lock().len()
    }

    /// Records whose level is one of `levels`.
    pub fn logs_at(&self, levels: &[LogLevel]) -> Vec<Arc<Log>> {
        self.inner
            .logs
            .lock()
            .iter()
            .filter(|l| levels.contains(&l.level))
            .cloned()
            .collect()
    }

    /// Records carrying every tag in `tags`.
    pub fn logs_tagged(&self, tags: &[&str]) -> Vec<Arc<Log>> {
        self.inner
            .logs
            .lock()
            .iter()
            .filter(|l| l.has_tags(tags))
            .cloned()
            .collect()
    }

    /// Records with `from <= id < to`.
    pub fn logs_in_range(&self, from: u64, to: u64) -> Vec<Arc<Log>> {
        self.inner
            .logs
            .lock()
            .iter()
            .filter(|l| l.id >= from && l.id < to)
            .cloned()
            .collect()
    }

    /// Records appended after the record with id `after` (exclusive).
    pub fn logs_after(&self, after: Option<u64>) -> Vec<Arc<Log>> {
        self.inner
            .logs
            .lock()
            .iter()
            .filter(|l| match after {
                Some(id) => l.id > id,
                None => true,
            })
            .cloned()
            .collect()
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("tags", &self.tags)
            .field("count", &self.count())
            .finish()
    }
}

// Log record model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a [`Log`] record. `Blank` is untagged output, the rest map
/// onto the usual tracing levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Blank,
    Info,
    Debug,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Blank => "blank",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        }
    }

    pub fn parse(s: &str) -> Option<LogLevel> {
        match s.to_ascii_lowercase().as_str() {
            "blank" => Some(LogLevel::Blank),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "warning" | "warn" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            "fatal" => Some(LogLevel::Fatal),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record stored by a `Logger`. Identifiers are unique within
/// the logger that produced the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    pub id: u64,
    pub level: LogLevel,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub message: String,
    #[serde(default)]
    pub extra: String,
}

impl Log {
    /// True when every given tag is carried by the record.
    pub fn has_tags(&self, tags: &[&str]) -> bool {
        tags.iter().all(|t| self.tags.iter().any(|own| own == t))
    }

    /// Single-line rendering used by the mirror stream and the command
    /// channel `log` dump.
    pub fn line(&self) -> String {
        let mut out = format!("[{}]", self.date.format("%Y-%m-%d %H:%M:%S"));
        if self.level != LogLevel::Blank {
            out.push_str(&format!(" [{}]", self.level.as_str().to_uppercase()));
        }
        if !self.tags.is_empty() {
            out.push_str(&format!(" [{}]", self.tags.join(" ")));
        }
        out.push(' ');
        out.push_str(&self.message);
        if !self.extra.is_empty() {
            out.push_str(" | ");
            out.push_str(&self.extra);
        }
        out
    }
}

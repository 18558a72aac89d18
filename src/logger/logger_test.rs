use std::io::Write;
use std::sync::{Arc, Mutex};

use super::{Log, LogLevel, Logger};

#[derive(Clone)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Ids are unique and monotonically assigned within one logger, including
/// across scoped clones sharing the ring.
#[test]
fn test_ids_unique_across_scopes() {
    let root = Logger::new();
    let child = root.scoped("http");

    root.info("one");
    child.warning("two");
    root.error("three");

    let logs = root.logs();
    assert_eq!(logs.len(), 3);
    assert_eq!(logs[0].id, 0);
    assert_eq!(logs[1].id, 1);
    assert_eq!(logs[2].id, 2);
    assert_eq!(logs[1].tags, vec!["http".to_string()]);
}

#[test]
fn test_filters() {
    let root = Logger::new();
    let http = root.scoped("http").scoped("example.com");

    root.info("a");
    http.error("b");
    http.warning("c");

    assert_eq!(root.logs_at(&[LogLevel::Error]).len(), 1);
    assert_eq!(root.logs_at(&[LogLevel::Error, LogLevel::Warning]).len(), 2);
    assert_eq!(root.logs_tagged(&["http"]).len(), 2);
    assert_eq!(root.logs_tagged(&["http", "example.com"]).len(), 2);
    assert_eq!(root.logs_tagged(&["tcp"]).len(), 0);
    assert_eq!(root.logs_in_range(1, 3).len(), 2);
    assert_eq!(root.logs_after(Some(1)).len(), 1);
}

#[test]
fn test_mirror_receives_lines() {
    let buf = SharedBuf(Arc::new(Mutex::new(Vec::new())));
    let logger = Logger::with_mirror(Box::new(buf.clone()));

    logger.scoped("router").info("server started");

    let out = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
    assert!(out.contains("[INFO]"));
    assert!(out.contains("[router]"));
    assert!(out.contains("server started"));
}

/// JSON round-trip preserves id, level, date, message and extra.
#[test]
fn test_log_json_round_trip() {
    let logger = Logger::new();
    let record = logger.log(LogLevel::Warning, "disk almost full", "93%");

    let encoded = serde_json::to_string(&*record).unwrap();
    let decoded: Log = serde_json::from_str(&encoded).unwrap();

    assert_eq!(decoded.id, record.id);
    assert_eq!(decoded.level, record.level);
    assert_eq!(decoded.date, record.date);
    assert_eq!(decoded.message, record.message);
    assert_eq!(decoded.extra, record.extra);
}

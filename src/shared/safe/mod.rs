// Panic containment helpers used at every component seam.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global panic counter.
static PANICS_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Gets the current panic counter value.
pub fn panics_counter() -> u64 {
    PANICS_COUNTER.load(Ordering::Relaxed)
}

/// Captured panic payload, stringified.
#[derive(Debug, Clone)]
pub struct Panic {
    pub payload: String,
}

impl std::fmt::Display for Panic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "panic: {}", self.payload)
    }
}

impl std::error::Error for Panic {}

fn payload_to_string(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown".to_string()
    }
}

/// Runs a future, converting an unwind into an error instead of letting it
/// cross the seam. The goroutine-boundary contract: a panic is captured,
/// counted, and reported, never propagated.
pub async fn catch<F, T>(fut: F) -> Result<T, Panic>
where
    F: Future<Output = T>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(v) => Ok(v),
        Err(payload) => {
            PANICS_COUNTER.fetch_add(1, Ordering::Relaxed);
            Err(Panic {
                payload: payload_to_string(payload),
            })
        }
    }
}

/// Synchronous flavor of [`catch`].
pub fn catch_sync<F, T>(f: F) -> Result<T, Panic>
where
    F: FnOnce() -> T,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(v) => Ok(v),
        Err(payload) => {
            PANICS_COUNTER.fetch_add(1, Ordering::Relaxed);
            Err(Panic {
                payload: payload_to_string(payload),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_catch_passes_value_through() {
        let v = catch(async { 41 + 1 }).await.unwrap();
        assert_eq!(v, 42);
    }

    #[tokio::test]
    async fn test_catch_captures_panic_payload() {
        let before = panics_counter();
        let err = catch(async { panic!("boom {}", 7) }).await.unwrap_err();
        assert_eq!(err.payload, "boom 7");
        assert_eq!(panics_counter(), before + 1);
    }

    #[test]
    fn test_catch_sync() {
        assert!(catch_sync(|| 1).is_ok());
        let err = catch_sync(|| -> i32 { panic!("bad") }).unwrap_err();
        assert_eq!(err.payload, "bad");
    }
}

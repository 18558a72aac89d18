use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::logger::{LogLevel, Logger};
use crate::tasks::{TaskFunc, TaskManager, TaskTimer};

fn counting_exec(
    active: Arc<AtomicI32>,
    max_active: Arc<AtomicI32>,
    completed: Arc<AtomicUsize>,
    busy: Duration,
) -> TaskFunc {
    Box::new(move |_task| {
        let active = active.clone();
        let max_active = max_active.clone();
        let completed = completed.clone();
        Box::pin(async move {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(busy).await;
            active.fetch_sub(1, Ordering::SeqCst);
            completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    })
}

/// S3: a one-minute task whose exec outlives the next tick is never run
/// twice at once; the overlapping tick is skipped, not queued.
#[tokio::test(start_paused = true)]
async fn test_timer_exec_single_flight() {
    let mgr = TaskManager::new(Logger::new());
    let active = Arc::new(AtomicI32::new(0));
    let max_active = Arc::new(AtomicI32::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let exec = counting_exec(
        active.clone(),
        max_active.clone(),
        completed.clone(),
        Duration::from_secs(90),
    );
    mgr.new_task("slow", move || (None, Some(exec), None), TaskTimer::OneMinute)
        .unwrap();
    mgr.start().await;

    // First tick at 1m starts the exec; the 2m tick lands mid-run.
    tokio::time::sleep(Duration::from_secs(125)).await;
    let task = mgr.get_task("slow").unwrap();
    assert!(task.is_running());
    assert_eq!(completed.load(Ordering::SeqCst), 0);
    assert_eq!(max_active.load(Ordering::SeqCst), 1);

    // The first exec winds down at 2m30s; the skipped tick never ran.
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert!(!task.is_running());
    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert_eq!(max_active.load(Ordering::SeqCst), 1);

    mgr.stop().await;
}

/// Invariant 2 without timers: concurrent manual dispatch collapses to
/// one in-flight exec.
#[tokio::test]
async fn test_manual_exec_single_flight() {
    let mgr = TaskManager::new(Logger::new());
    let active = Arc::new(AtomicI32::new(0));
    let max_active = Arc::new(AtomicI32::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let exec = counting_exec(
        active.clone(),
        max_active.clone(),
        completed.clone(),
        Duration::from_millis(200),
    );
    mgr.new_task("once", move || (None, Some(exec), None), TaskTimer::Inactive)
        .unwrap();
    mgr.start().await;

    mgr.exec_task("once").await.unwrap();
    mgr.exec_task("once").await.unwrap();
    mgr.wait_task("once").await.unwrap();
    // Allow the second dispatch, had it run, to be observed.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert_eq!(max_active.load(Ordering::SeqCst), 1);

    mgr.stop().await;
}

/// S4: an exec that ignores the exit signal is forcibly killed after the
/// grace window and its cleanup still runs exactly once.
#[tokio::test(start_paused = true)]
async fn test_shutdown_kill_deadline() {
    let logger = Logger::new();
    let mgr = TaskManager::new(logger.clone());
    let cleanups = Arc::new(AtomicUsize::new(0));

    let cleanups_fn = cleanups.clone();
    mgr.new_task(
        "stuck",
        move || {
            let exec: TaskFunc = Box::new(|_task| {
                Box::pin(async move {
                    std::future::pending::<()>().await;
                    Ok(())
                })
            });
            let cleanups = cleanups_fn.clone();
            let cleanup: TaskFunc = Box::new(move |_task| {
                let cleanups = cleanups.clone();
                Box::pin(async move {
                    cleanups.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            });
            (None, Some(exec), Some(cleanup))
        },
        TaskTimer::Inactive,
    )
    .unwrap();
    mgr.start().await;

    mgr.exec_task("stuck").await.unwrap();
    tokio::task::yield_now().await;
    assert!(mgr.get_task("stuck").unwrap().is_running());

    mgr.stop().await;

    assert!(!mgr.get_task("stuck").unwrap().is_running());
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    let killed = logger
        .logs_at(&[LogLevel::Fatal])
        .iter()
        .any(|l| l.message.contains("forcibly killed"));
    assert!(killed, "kill deadline must be logged fatal");
}

/// A failing exec demotes the task timer to Inactive and logs a warning.
#[tokio::test]
async fn test_exec_error_demotes_timer() {
    let logger = Logger::new();
    let mgr = TaskManager::new(logger.clone());

    mgr.new_task(
        "flaky",
        || {
            let exec: TaskFunc = Box::new(|_task| {
                Box::pin(async move { anyhow::bail!("backend unreachable") })
            });
            (None, Some(exec), None)
        },
        TaskTimer::TenSeconds,
    )
    .unwrap();
    mgr.start().await;

    mgr.exec_task("flaky").await.unwrap();
    mgr.wait_task("flaky").await.unwrap();

    assert_eq!(mgr.get_task("flaky").unwrap().timer(), TaskTimer::Inactive);
    let warned = logger
        .logs_at(&[LogLevel::Warning])
        .iter()
        .any(|l| l.extra.contains("backend unreachable"));
    assert!(warned);

    mgr.stop().await;
}

/// A panicking exec is contained, logged fatal and demoted.
#[tokio::test]
async fn test_exec_panic_is_contained() {
    let logger = Logger::new();
    let mgr = TaskManager::new(logger.clone());

    mgr.new_task(
        "explosive",
        || {
            let exec: TaskFunc = Box::new(|_task| {
                Box::pin(async move {
                    panic!("task exploded");
                })
            });
            (None, Some(exec), None)
        },
        TaskTimer::OneHour,
    )
    .unwrap();
    mgr.start().await;

    mgr.exec_task("explosive").await.unwrap();
    mgr.wait_task("explosive").await.unwrap();

    assert_eq!(mgr.get_task("explosive").unwrap().timer(), TaskTimer::Inactive);
    let fatal = logger
        .logs_at(&[LogLevel::Fatal])
        .iter()
        .any(|l| l.extra.contains("task exploded"));
    assert!(fatal);

    mgr.stop().await;
}

/// A failed startup keeps the task out of dispatch until an operator
/// retries it.
#[tokio::test]
async fn test_startup_failure_blocks_dispatch() {
    let mgr = TaskManager::new(Logger::new());

    mgr.new_task(
        "broken",
        || {
            let startup: TaskFunc = Box::new(|_task| {
                Box::pin(async move { anyhow::bail!("no database") })
            });
            let exec: TaskFunc = Box::new(|_task| Box::pin(async move { Ok(()) }));
            (Some(startup), Some(exec), None)
        },
        TaskTimer::TenSeconds,
    )
    .unwrap();
    mgr.start().await;

    assert!(!mgr.get_task("broken").unwrap().startup_done());
    assert!(mgr.exec_task("broken").await.is_err());

    mgr.stop().await;
}

/// Duplicate registration fails; cooperative stop runs cleanup once even
/// when the manager later shuts down.
#[tokio::test]
async fn test_registration_and_stop_task_cleanup() {
    let mgr = TaskManager::new(Logger::new());
    let cleanups = Arc::new(AtomicUsize::new(0));

    let cleanups_fn = cleanups.clone();
    let register = |mgr: &Arc<TaskManager>, name: &str| {
        let cleanups = cleanups_fn.clone();
        mgr.new_task(
            name,
            move || {
                let exec: TaskFunc = Box::new(|task| {
                    Box::pin(async move {
                        task.listen_for_exit().await;
                        Ok(())
                    })
                });
                let cleanup: TaskFunc = Box::new(move |_task| {
                    let cleanups = cleanups.clone();
                    Box::pin(async move {
                        cleanups.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                });
                (None, Some(exec), Some(cleanup))
            },
            TaskTimer::Inactive,
        )
    };

    register(&mgr, "worker").unwrap();
    assert!(register(&mgr, "worker").is_err());
    assert_eq!(mgr.task_names(), vec!["worker".to_string()]);

    mgr.start().await;
    mgr.exec_task("worker").await.unwrap();
    tokio::task::yield_now().await;

    // Cooperative stop: exit signal, wait, cleanup.
    mgr.stop_task("worker").await.unwrap();
    assert!(!mgr.get_task("worker").unwrap().is_running());
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);

    // Manager shutdown does not run the same cleanup twice.
    mgr.stop().await;
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);

    mgr.remove_task("worker").await.ok();
}

// Task model: lifecycle triple (startup, exec, cleanup), timer bucket,
// single-flight state and the exit/kill signal pair.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};

/// Timer buckets a task can subscribe to. `Inactive` tasks never fire on
/// their own; they only run through the operator surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskTimer {
    TenSeconds = 0,
    OneMinute = 1,
    TenMinutes = 2,
    ThirtyMinutes = 3,
    OneHour = 4,
    Inactive = 5,
}

impl TaskTimer {
    pub const ALL_ACTIVE: [TaskTimer; 5] = [
        TaskTimer::TenSeconds,
        TaskTimer::OneMinute,
        TaskTimer::TenMinutes,
        TaskTimer::ThirtyMinutes,
        TaskTimer::OneHour,
    ];

    pub fn period(&self) -> Option<std::time::Duration> {
        let secs = match self {
            TaskTimer::TenSeconds => 10,
            TaskTimer::OneMinute => 60,
            TaskTimer::TenMinutes => 600,
            TaskTimer::ThirtyMinutes => 1800,
            TaskTimer::OneHour => 3600,
            TaskTimer::Inactive => return None,
        };
        Some(std::time::Duration::from_secs(secs))
    }

    pub fn parse(s: &str) -> Option<TaskTimer> {
        match s {
            "10s" => Some(TaskTimer::TenSeconds),
            "1m" => Some(TaskTimer::OneMinute),
            "10m" => Some(TaskTimer::TenMinutes),
            "30m" => Some(TaskTimer::ThirtyMinutes),
            "1h" => Some(TaskTimer::OneHour),
            "inactive" => Some(TaskTimer::Inactive),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskTimer::TenSeconds => "10s",
            TaskTimer::OneMinute => "1m",
            TaskTimer::TenMinutes => "10m",
            TaskTimer::ThirtyMinutes => "30m",
            TaskTimer::OneHour => "1h",
            TaskTimer::Inactive => "inactive",
        }
    }

    fn from_u8(v: u8) -> TaskTimer {
        match v {
            0 => TaskTimer::TenSeconds,
            1 => TaskTimer::OneMinute,
            2 => TaskTimer::TenMinutes,
            3 => TaskTimer::ThirtyMinutes,
            4 => TaskTimer::OneHour,
            _ => TaskTimer::Inactive,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task '{0}' already registered")]
    AlreadyRegistered(String),
    #[error("task '{0}' not found")]
    NotFound(String),
}

/// One of the three lifecycle functions of a task. The function receives
/// the task itself so it can observe the exit signal through
/// [`Task::listen_for_exit`].
pub type TaskFunc = Box<dyn Fn(Arc<Task>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// What a task init function returns: optional startup, exec and cleanup.
pub type TaskInitResult = (Option<TaskFunc>, Option<TaskFunc>, Option<TaskFunc>);

/// Signal pair owned by a running exec. `exit` asks the task to wind down
/// cooperatively; `kill` tells the scheduler to abandon it.
pub(crate) struct ExecSignals {
    pub exit: Notify,
    pub kill: Notify,
}

/// A named background unit registered with the [`TaskManager`].
///
/// At most one exec instance is ever active: the `running` flag is claimed
/// with a compare-exchange before dispatch and a tick that loses the race
/// is skipped, not queued.
///
/// [`TaskManager`]: super::TaskManager
pub struct Task {
    name: String,
    pub(crate) startup: Option<TaskFunc>,
    pub(crate) exec: Option<TaskFunc>,
    pub(crate) cleanup: Option<TaskFunc>,
    timer: AtomicU8,
    startup_done: AtomicBool,
    pub(crate) cleanup_done: AtomicBool,
    running: AtomicBool,
    running_tx: watch::Sender<bool>,
    signals: Mutex<Option<Arc<ExecSignals>>>,
}

impl Task {
    pub(crate) fn new(
        name: String,
        startup: Option<TaskFunc>,
        exec: Option<TaskFunc>,
        cleanup: Option<TaskFunc>,
        timer: TaskTimer,
    ) -> Arc<Self> {
        let (running_tx, _) = watch::channel(false);
        Arc::new(Self {
            name,
            startup,
            exec,
            cleanup,
            timer: AtomicU8::new(timer as u8),
            startup_done: AtomicBool::new(false),
            cleanup_done: AtomicBool::new(false),
            running: AtomicBool::new(false),
            running_tx,
            signals: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timer(&self) -> TaskTimer {
        TaskTimer::from_u8(self.timer.load(Ordering::Acquire))
    }

    pub fn set_timer(&self, timer: TaskTimer) {
        self.timer.store(timer as u8, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn startup_done(&self) -> bool {
        self.startup_done.load(Ordering::Acquire)
    }

    pub(crate) fn set_startup_done(&self, done: bool) {
        self.startup_done.store(done, Ordering::Release);
    }

    /// Claims the single-flight slot. False means a previous exec is still
    /// active and this dispatch must be skipped.
    pub(crate) fn try_begin_exec(&self) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.signals.lock() = Some(Arc::new(ExecSignals {
            exit: Notify::new(),
            kill: Notify::new(),
        }));
        self.running_tx.send_replace(true);
        true
    }

    pub(crate) fn finish_exec(&self) {
        *self.signals.lock() = None;
        self.running.store(false, Ordering::Release);
        self.running_tx.send_replace(false);
    }

    pub(crate) fn current_signals(&self) -> Option<Arc<ExecSignals>> {
        self.signals.lock().clone()
    }

    /// Cooperative shutdown hook for exec bodies: resolves once the
    /// scheduler asks this task to stop. Outside a running exec it never
    /// resolves.
    pub async fn listen_for_exit(&self) {
        let signals = self.current_signals();
        match signals {
            Some(s) => s.exit.notified().await,
            None => std::future::pending().await,
        }
    }

    pub(crate) fn send_exit(&self) {
        if let Some(s) = self.current_signals() {
            s.exit.notify_one();
        }
    }

    pub(crate) fn send_kill(&self) {
        if let Some(s) = self.current_signals() {
            s.kill.notify_one();
        }
    }

    /// Resolves when the in-flight exec (if any) has finished.
    pub async fn wait(&self) {
        let mut rx = self.running_tx.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("timer", &self.timer())
            .field("running", &self.is_running())
            .field("startup_done", &self.startup_done())
            .finish()
    }
}

// Process model: a named long-running child with an exit observer.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{watch, Notify};

use crate::logger::{LogLevel, Logger};

/// Sentinel stdio descriptor: route the stream through the router log
/// stream. For stdin it falls back to the null device.
pub const STDIO_INHERIT: &str = "INHERIT";

const STDERR_TAIL_LINES: usize = 20;

/// stdio descriptors, one string per stream. Empty string means the null
/// device, [`STDIO_INHERIT`] means the log stream, anything else is a
/// filesystem path (truncate-create-write for stdout/stderr, read-only
/// for stdin).
#[derive(Debug, Clone, Default)]
pub struct ProcessStdio {
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
}

/// Exit status observed for a supervised process.
#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("process '{0}' already registered")]
    AlreadyRegistered(String),
    #[error("process '{0}' not found")]
    NotFound(String),
    #[error("process '{0}' already running")]
    AlreadyRunning(String),
    #[error("process '{0}' is not running")]
    NotRunning(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A named external process. Running iff the OS handle is live and no
/// exit status has been observed yet.
pub struct Process {
    name: String,
    dir: PathBuf,
    exec: String,
    args: Vec<String>,
    stdio: Mutex<ProcessStdio>,
    running: AtomicBool,
    pid: Mutex<Option<u32>>,
    kill_notify: Mutex<Option<Arc<Notify>>>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl Process {
    pub(crate) fn new(name: String, dir: PathBuf, exec: String, args: Vec<String>) -> Arc<Self> {
        let (exit_tx, _) = watch::channel(None);
        Arc::new(Self {
            name,
            dir,
            exec,
            args,
            stdio: Mutex::new(ProcessStdio::default()),
            running: AtomicBool::new(false),
            pid: Mutex::new(None),
            kill_notify: Mutex::new(None),
            exit_tx,
            stderr_tail: Arc::new(Mutex::new(VecDeque::new())),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock()
    }

    /// Replaces the stdio descriptors used by the next start.
    pub fn set_stdio(&self, stdio: ProcessStdio) {
        *self.stdio.lock() = stdio;
    }

    fn stdin_stdio(&self, desc: &str) -> std::io::Result<Stdio> {
        match desc {
            "" | STDIO_INHERIT => Ok(Stdio::null()),
            path => {
                let f = std::fs::File::open(path)?;
                Ok(Stdio::from(f))
            }
        }
    }

    fn output_stdio(&self, desc: &str) -> std::io::Result<Stdio> {
        match desc {
            "" => Ok(Stdio::null()),
            STDIO_INHERIT => Ok(Stdio::piped()),
            path => {
                let f = std::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(path)?;
                Ok(Stdio::from(f))
            }
        }
    }

    /// Spawns the process and its exit observer.
    pub fn start(self: &Arc<Self>, logger: &Logger) -> Result<(), ProcessError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ProcessError::AlreadyRunning(self.name.clone()));
        }

        let stdio = self.stdio.lock().clone();
        let spawned = (|| -> std::io::Result<tokio::process::Child> {
            let mut cmd = tokio::process::Command::new(&self.exec);
            cmd.args(&self.args)
                .stdin(self.stdin_stdio(&stdio.stdin)?)
                .stdout(self.output_stdio(&stdio.stdout)?)
                .stderr(self.output_stdio(&stdio.stderr)?);
            if !self.dir.as_os_str().is_empty() {
                cmd.current_dir(&self.dir);
            }
            cmd.spawn()
        })();

        let mut child = match spawned {
            Ok(c) => c,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                return Err(ProcessError::Io(e));
            }
        };

        self.exit_tx.send_replace(None);
        self.stderr_tail.lock().clear();
        *self.pid.lock() = child.id();

        let kill = Arc::new(Notify::new());
        *self.kill_notify.lock() = Some(kill.clone());

        let proc_logger = logger.scoped("proc").scoped(self.name.clone());
        let mut io_tasks = Vec::new();

        if stdio.stdout == STDIO_INHERIT {
            if let Some(out) = child.stdout.take() {
                let lg = proc_logger.clone();
                io_tasks.push(tokio::task::spawn(async move {
                    let mut lines = BufReader::new(out).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        lg.blank(line);
                    }
                }));
            }
        }
        if stdio.stderr == STDIO_INHERIT {
            if let Some(err) = child.stderr.take() {
                let lg = proc_logger.clone();
                let tail = self.stderr_tail.clone();
                io_tasks.push(tokio::task::spawn(async move {
                    let mut lines = BufReader::new(err).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        {
                            let mut t = tail.lock();
                            if t.len() == STDERR_TAIL_LINES {
                                t.pop_front();
                            }
                            t.push_back(line.clone());
                        }
                        lg.blank(line);
                    }
                }));
            }
        }

        let this = self.clone();
        tokio::task::spawn(async move {
            this.observe(child, kill, proc_logger, io_tasks).await;
        });

        Ok(())
    }

    async fn observe(
        self: Arc<Self>,
        mut child: tokio::process::Child,
        kill: Arc<Notify>,
        logger: Logger,
        io_tasks: Vec<tokio::task::JoinHandle<()>>,
    ) {
        let exit = loop {
            tokio::select! {
                status = child.wait() => {
                    break match status {
                        Ok(s) => ProcessExit {
                            code: s.code(),
                            success: s.success(),
                            error: None,
                        },
                        Err(e) => ProcessExit {
                            code: None,
                            success: false,
                            error: Some(e.to_string()),
                        },
                    };
                }
                _ = kill.notified() => {
                    let _ = child.start_kill();
                }
            }
        };

        // The stdio readers drain to EOF once the pipes close; wait for
        // them so the stderr tail is complete before it is reported.
        for task in io_tasks {
            let _ = task.await;
        }

        if !exit.success {
            let tail: Vec<String> = self.stderr_tail.lock().iter().cloned().collect();
            let mut extra = match (&exit.code, &exit.error) {
                (_, Some(e)) => e.clone(),
                (Some(c), None) => format!("exit code {}", c),
                (None, None) => "terminated by signal".to_string(),
            };
            if !tail.is_empty() {
                extra.push_str("; stderr: ");
                extra.push_str(&tail.join(" / "));
            }
            logger.log(
                LogLevel::Error,
                format!("process '{}' exited with failure", self.name),
                extra,
            );
        }

        *self.pid.lock() = None;
        *self.kill_notify.lock() = None;
        self.running.store(false, Ordering::Release);
        self.exit_tx.send_replace(Some(exit));
    }

    /// Cooperative stop. SIGTERM on unix; elsewhere this degrades to a
    /// forceful kill.
    pub fn stop(&self) -> Result<(), ProcessError> {
        if !self.is_running() {
            return Err(ProcessError::NotRunning(self.name.clone()));
        }
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid() {
                let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                if rc != 0 {
                    return Err(ProcessError::Io(std::io::Error::last_os_error()));
                }
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            self.kill()
        }
    }

    /// Forceful kill.
    pub fn kill(&self) -> Result<(), ProcessError> {
        if !self.is_running() {
            return Err(ProcessError::NotRunning(self.name.clone()));
        }
        if let Some(kill) = self.kill_notify.lock().clone() {
            kill.notify_one();
        }
        Ok(())
    }

    /// Stop (when running), wait, start again.
    pub async fn restart(self: &Arc<Self>, logger: &Logger) -> Result<(), ProcessError> {
        if self.is_running() {
            self.stop()?;
            self.wait().await;
        }
        self.start(logger)
    }

    /// Resolves once the process is no longer running.
    pub async fn wait(&self) {
        let mut rx = self.exit_tx.subscribe();
        while self.is_running() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Waits for and returns the exit status of the current (or most
    /// recent) run.
    pub async fn wait_exit(&self) -> Result<ProcessExit, ProcessError> {
        let mut rx = self.exit_tx.subscribe();
        loop {
            if let Some(exit) = rx.borrow_and_update().clone() {
                return Ok(exit);
            }
            if !self.is_running() {
                return Err(ProcessError::NotRunning(self.name.clone()));
            }
            if rx.changed().await.is_err() {
                return Err(ProcessError::NotRunning(self.name.clone()));
            }
        }
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("name", &self.name)
            .field("exec", &self.exec)
            .field("running", &self.is_running())
            .field("pid", &self.pid())
            .finish()
    }
}

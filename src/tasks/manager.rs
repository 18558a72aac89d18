// Task manager: registration, per-bucket tickers, dispatch with
// single-flight, shutdown with a kill deadline, and the supervised
// process registry.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::Lifecycle;
use crate::logger::Logger;
use crate::process::{Process, ProcessError, ProcessExit, ProcessStdio};
use crate::safe;

use super::task::{Task, TaskError, TaskInitResult, TaskTimer};

// Shutdown waits up to 100 polls of 100ms before sending the kill signal.
const EXIT_POLLS: u32 = 100;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Owner of every registered [`Task`] and supervised [`Process`].
///
/// Started and stopped by the router: tasks stop before the servers they
/// may submit work to, and supervised processes are stopped last, in
/// parallel.
pub struct TaskManager {
    tasks: DashMap<String, Arc<Task>>,
    processes: DashMap<String, Arc<Process>>,
    lifecycle: Lifecycle,
    logger: Logger,
    token: Mutex<CancellationToken>,
}

impl TaskManager {
    pub fn new(logger: Logger) -> Arc<Self> {
        Arc::new(Self {
            tasks: DashMap::new(),
            processes: DashMap::new(),
            lifecycle: Lifecycle::new(),
            logger: logger.scoped("tasks"),
            token: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn is_started(&self) -> bool {
        self.lifecycle.is_started()
    }

    /// Registers a task under a unique name. The init function is called
    /// once, here, and the three functions it returns are stored verbatim.
    /// If the manager is already started the startup function runs
    /// immediately.
    pub fn new_task<F>(
        self: &Arc<Self>,
        name: impl Into<String>,
        init: F,
        timer: TaskTimer,
    ) -> Result<(), TaskError>
    where
        F: FnOnce() -> TaskInitResult,
    {
        let name = name.into();
        if self.tasks.contains_key(&name) {
            return Err(TaskError::AlreadyRegistered(name));
        }

        // The init function is user code; run it outside any map lock.
        let (startup, exec, cleanup) = init();
        let task = Task::new(name.clone(), startup, exec, cleanup, timer);
        match self.tasks.entry(name) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                return Err(TaskError::AlreadyRegistered(e.key().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(task.clone());
            }
        }

        if self.lifecycle.is_started() {
            let mgr = self.clone();
            tokio::task::spawn(async move {
                mgr.run_startup(&task).await;
            });
        }
        Ok(())
    }

    pub fn get_task(&self, name: &str) -> Result<Arc<Task>, TaskError> {
        self.tasks
            .get(name)
            .map(|t| t.clone())
            .ok_or_else(|| TaskError::NotFound(name.to_string()))
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }

    /// Runs the startup function under a panic guard. A failed or panicked
    /// startup leaves the task out of timer dispatch until an operator
    /// retries it.
    pub(crate) async fn run_startup(&self, task: &Arc<Task>) {
        if task.startup_done() {
            return;
        }
        let Some(startup) = &task.startup else {
            task.set_startup_done(true);
            task.cleanup_done.store(false, std::sync::atomic::Ordering::Release);
            return;
        };

        match safe::catch((startup)(task.clone())).await {
            Ok(Ok(())) => {
                task.set_startup_done(true);
                task.cleanup_done.store(false, std::sync::atomic::Ordering::Release);
            }
            Ok(Err(e)) => {
                task.set_startup_done(false);
                self.logger.log(
                    crate::logger::LogLevel::Error,
                    format!("task '{}' startup failed", task.name()),
                    e.to_string(),
                );
            }
            Err(panic) => {
                task.set_startup_done(false);
                self.logger.log(
                    crate::logger::LogLevel::Fatal,
                    format!("task '{}' startup panicked", task.name()),
                    panic.payload,
                );
            }
        }
    }

    /// Manually runs the startup function of a task.
    pub async fn start_task(self: &Arc<Self>, name: &str) -> Result<(), TaskError> {
        let task = self.get_task(name)?;
        self.run_startup(&task).await;
        Ok(())
    }

    /// Manual one-shot execution, ignoring the timer. Runs the startup
    /// first when it has not completed yet.
    pub async fn exec_task(self: &Arc<Self>, name: &str) -> anyhow::Result<()> {
        let task = self.get_task(name)?;
        if !task.startup_done() {
            self.run_startup(&task).await;
            if !task.startup_done() {
                anyhow::bail!("task '{}' startup did not complete", name);
            }
        }
        self.dispatch(task);
        Ok(())
    }

    /// Cooperative stop: sends the exit signal, waits for the in-flight
    /// exec, then runs cleanup regardless of the exec outcome.
    pub async fn stop_task(self: &Arc<Self>, name: &str) -> Result<(), TaskError> {
        let task = self.get_task(name)?;
        task.send_exit();
        task.wait().await;
        self.run_cleanup(&task).await;
        Ok(())
    }

    /// Stop plus unregister.
    pub async fn remove_task(self: &Arc<Self>, name: &str) -> Result<(), TaskError> {
        self.stop_task(name).await?;
        self.tasks.remove(name);
        Ok(())
    }

    /// Sends the kill signal to a running exec. The scheduler abandons the
    /// exec; its eventual completion is still consumed.
    pub fn kill_task(&self, name: &str) -> Result<(), TaskError> {
        let task = self.get_task(name)?;
        task.send_kill();
        Ok(())
    }

    pub fn set_task_timer(&self, name: &str, timer: TaskTimer) -> Result<(), TaskError> {
        let task = self.get_task(name)?;
        task.set_timer(timer);
        Ok(())
    }

    /// Waits for the in-flight exec of a task, if any.
    pub async fn wait_task(&self, name: &str) -> Result<(), TaskError> {
        let task = self.get_task(name)?;
        task.wait().await;
        Ok(())
    }

    /// Starts the scheduler: runs pending startups, then launches one
    /// ticker per timer bucket.
    pub async fn start(self: &Arc<Self>) {
        if !self.lifecycle.begin_start() {
            return;
        }

        let token = CancellationToken::new();
        *self.token.lock() = token.clone();

        let tasks: Vec<Arc<Task>> = self.tasks.iter().map(|t| t.value().clone()).collect();
        for task in &tasks {
            self.run_startup(task).await;
        }

        for bucket in TaskTimer::ALL_ACTIVE {
            let mgr = self.clone();
            let token = token.clone();
            tokio::task::spawn(async move {
                mgr.run_ticker(bucket, token).await;
            });
        }

        self.lifecycle.set_started();
        self.logger.info("task manager started");
    }

    async fn run_ticker(self: Arc<Self>, bucket: TaskTimer, token: CancellationToken) {
        let period = bucket.period().expect("active bucket");
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    return;
                }
                _ = interval.tick() => {
                    let due: Vec<Arc<Task>> = self
                        .tasks
                        .iter()
                        .filter(|t| t.value().timer() == bucket && t.value().startup_done())
                        .map(|t| t.value().clone())
                        .collect();
                    for task in due {
                        self.dispatch(task);
                    }
                }
            }
        }
    }

    /// Fire-and-forget dispatch. A task whose previous exec has not
    /// finished is skipped for this tick.
    pub(crate) fn dispatch(self: &Arc<Self>, task: Arc<Task>) {
        if !task.try_begin_exec() {
            return;
        }
        let mgr = self.clone();
        tokio::task::spawn(async move {
            mgr.exec_once(task).await;
        });
    }

    async fn exec_once(&self, task: Arc<Task>) {
        let Some(exec) = &task.exec else {
            task.finish_exec();
            return;
        };

        let signals = match task.current_signals() {
            Some(s) => s,
            None => {
                task.finish_exec();
                return;
            }
        };

        let fut = (exec)(task.clone());
        let mut handle = tokio::task::spawn(safe::catch(fut));

        let outcome = tokio::select! {
            res = &mut handle => Some(res),
            _ = signals.kill.notified() => None,
        };

        let Some(res) = outcome else {
            // Abandon the exec but keep consuming its completion.
            self.logger.fatal(format!("task '{}' forcibly killed", task.name()));
            tokio::task::spawn(async move {
                let _ = handle.await;
            });
            task.finish_exec();
            return;
        };

        match res {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                task.set_timer(TaskTimer::Inactive);
                self.logger.log(
                    crate::logger::LogLevel::Warning,
                    format!("task '{}' exec failed, timer set inactive", task.name()),
                    e.to_string(),
                );
            }
            Ok(Err(panic)) => {
                task.set_timer(TaskTimer::Inactive);
                self.logger.log(
                    crate::logger::LogLevel::Fatal,
                    format!("task '{}' exec panicked, timer set inactive", task.name()),
                    panic.payload,
                );
            }
            Err(join_err) => {
                task.set_timer(TaskTimer::Inactive);
                self.logger.log(
                    crate::logger::LogLevel::Fatal,
                    format!("task '{}' exec aborted", task.name()),
                    join_err.to_string(),
                );
            }
        }
        task.finish_exec();
    }

    async fn run_cleanup(&self, task: &Arc<Task>) {
        if task
            .cleanup_done
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::AcqRel,
                std::sync::atomic::Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        let Some(cleanup) = &task.cleanup else {
            return;
        };
        match safe::catch((cleanup)(task.clone())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.logger.log(
                    crate::logger::LogLevel::Error,
                    format!("task '{}' cleanup failed", task.name()),
                    e.to_string(),
                );
            }
            Err(panic) => {
                self.logger.log(
                    crate::logger::LogLevel::Fatal,
                    format!("task '{}' cleanup panicked", task.name()),
                    panic.payload,
                );
            }
        }
    }

    /// Shutdown: exit signal to every running exec, a bounded grace
    /// window, then the kill signal, then every cleanup; finally all
    /// supervised processes are stopped in parallel.
    pub async fn stop(self: &Arc<Self>) {
        if !self.lifecycle.begin_stop() {
            return;
        }

        self.token.lock().cancel();

        let tasks: Vec<Arc<Task>> = self.tasks.iter().map(|t| t.value().clone()).collect();
        for task in &tasks {
            if task.is_running() {
                task.send_exit();
            }
        }

        for _ in 0..EXIT_POLLS {
            if !tasks.iter().any(|t| t.is_running()) {
                break;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }

        for task in &tasks {
            if task.is_running() {
                task.send_kill();
            }
        }
        // Let the kill branches run before cleanups start.
        tokio::task::yield_now().await;

        for task in &tasks {
            self.run_cleanup(task).await;
        }

        let procs: Vec<Arc<Process>> = self.processes.iter().map(|p| p.value().clone()).collect();
        let stops = procs.into_iter().filter(|p| p.is_running()).map(|p| {
            let logger = self.logger.clone();
            async move {
                if let Err(e) = p.stop() {
                    logger.log(
                        crate::logger::LogLevel::Error,
                        format!("process '{}' stop failed", p.name()),
                        e.to_string(),
                    );
                    return;
                }
                p.wait().await;
            }
        });
        futures::future::join_all(stops).await;

        self.lifecycle.set_stopped();
        self.logger.info("task manager stopped");
    }

    // ---- supervised processes ----

    /// Registers a named process. stdio starts out bound to the null
    /// device; adjust with [`Process::set_stdio`] before starting.
    pub fn new_process(
        &self,
        name: impl Into<String>,
        dir: impl Into<std::path::PathBuf>,
        exec: impl Into<String>,
        args: Vec<String>,
    ) -> Result<Arc<Process>, ProcessError> {
        let name = name.into();
        match self.processes.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ProcessError::AlreadyRegistered(name))
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let p = Process::new(name, dir.into(), exec.into(), args);
                v.insert(p.clone());
                Ok(p)
            }
        }
    }

    pub fn get_process(&self, name: &str) -> Result<Arc<Process>, ProcessError> {
        self.processes
            .get(name)
            .map(|p| p.clone())
            .ok_or_else(|| ProcessError::NotFound(name.to_string()))
    }

    pub fn process_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.processes.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }

    pub fn start_process(&self, name: &str) -> Result<(), ProcessError> {
        self.get_process(name)?.start(&self.logger)
    }

    pub fn stop_process(&self, name: &str) -> Result<(), ProcessError> {
        self.get_process(name)?.stop()
    }

    pub fn kill_process(&self, name: &str) -> Result<(), ProcessError> {
        self.get_process(name)?.kill()
    }

    pub async fn restart_process(&self, name: &str) -> Result<(), ProcessError> {
        self.get_process(name)?.restart(&self.logger).await
    }

    pub async fn wait_process(&self, name: &str) -> Result<ProcessExit, ProcessError> {
        self.get_process(name)?.wait_exit().await
    }

    pub fn is_process_running(&self, name: &str) -> Result<bool, ProcessError> {
        Ok(self.get_process(name)?.is_running())
    }

    pub fn process_pid(&self, name: &str) -> Result<Option<u32>, ProcessError> {
        Ok(self.get_process(name)?.pid())
    }

    pub async fn remove_process(&self, name: &str) -> Result<(), ProcessError> {
        let p = self.get_process(name)?;
        if p.is_running() {
            p.stop()?;
            p.wait().await;
        }
        self.processes.remove(name);
        Ok(())
    }

    /// Sets stdio descriptors for a registered process.
    pub fn set_process_stdio(&self, name: &str, stdio: ProcessStdio) -> Result<(), ProcessError> {
        self.get_process(name)?.set_stdio(stdio);
        Ok(())
    }
}

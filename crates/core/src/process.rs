//! Supervises the out-of-process ingestion run and owns the file-operations lock.

use crate::error::FileOpError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Success,
    Failed(Option<i32>),
}

/// Handle to a background process, observed by polling only.
pub trait SupervisedProcess: Send {
    fn id(&self) -> Option<u32>;

    /// `None` while the process is still running.
    fn try_wait(&mut self) -> io::Result<Option<ExitState>>;

    /// Asks the process to stop. Only unix gets a graceful signal; elsewhere
    /// this is the same as `kill`.
    fn terminate(&mut self) -> io::Result<()>;

    fn kill(&mut self) -> io::Result<()>;
}

pub trait ProcessLauncher: Send + Sync {
    fn launch(&self) -> io::Result<Box<dyn SupervisedProcess>>;
}

/// Launches a fixed command line with stdin detached.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl ProcessLauncher for CommandLauncher {
    fn launch(&self) -> io::Result<Box<dyn SupervisedProcess>> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .spawn()?;
        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

impl SupervisedProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitState>> {
        Ok(self.child.try_wait()?.map(|status| {
            if status.success() {
                ExitState::Success
            } else {
                ExitState::Failed(status.code())
            }
        }))
    }

    /// SIGTERM through `kill(1)`, so the child can finish its current batch.
    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        let status = Command::new("kill")
            .arg("-TERM")
            .arg(self.child.id().to_string())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("kill -TERM exited with {status}")))
        }
    }

    /// No portable graceful signal exists here, so stop kills outright.
    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()?;
        self.child.wait()?;
        Ok(())
    }
}

struct IngestionRun {
    status: RunStatus,
    run_id: Option<Uuid>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    error_message: Option<String>,
    file_operations_locked: bool,
    process: Option<Box<dyn SupervisedProcess>>,
    process_id: Option<u32>,
}

impl Default for IngestionRun {
    fn default() -> Self {
        Self {
            status: RunStatus::Idle,
            run_id: None,
            start_time: None,
            end_time: None,
            error_message: None,
            file_operations_locked: false,
            process: None,
            process_id: None,
        }
    }
}

impl IngestionRun {
    /// Observes process exit; the lock is released on every terminal transition.
    fn poll(&mut self) {
        if self.status != RunStatus::Running {
            return;
        }
        // A stop in progress has taken the handle and finishes the transition itself.
        let Some(process) = self.process.as_mut() else {
            return;
        };

        let exit = match process.try_wait() {
            Ok(None) => return,
            Ok(Some(exit)) => exit,
            Err(error) => {
                self.error_message = Some(format!("failed to check ingestion process: {error}"));
                ExitState::Failed(None)
            }
        };

        self.end_time = Some(Utc::now());
        self.file_operations_locked = false;
        self.process = None;
        match exit {
            ExitState::Success => {
                self.status = RunStatus::Completed;
                info!(pid = ?self.process_id, "ingestion process completed");
            }
            ExitState::Failed(code) => {
                self.status = RunStatus::Error;
                if self.error_message.is_none() {
                    self.error_message = Some(match code {
                        Some(code) => format!("ingestion process exited with code {code}"),
                        None => "ingestion process terminated by a signal".to_string(),
                    });
                }
                warn!(pid = ?self.process_id, code = ?code, "ingestion process failed");
            }
        }
    }

    fn snapshot(&self) -> RunSnapshot {
        let format = |time: &DateTime<Utc>| time.to_rfc3339_opts(SecondsFormat::Secs, false);
        let duration_secs = self.start_time.map(|start| {
            let end = self.end_time.unwrap_or_else(Utc::now);
            (end - start).num_milliseconds() as f64 / 1000.0
        });

        RunSnapshot {
            status: self.status,
            run_id: self.run_id,
            start_time: self.start_time.as_ref().map(format),
            end_time: self.end_time.as_ref().map(format),
            duration_secs,
            error_message: self.error_message.clone(),
            file_operations_locked: self.file_operations_locked,
            process_id: self.process_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub status: RunStatus,
    pub run_id: Option<Uuid>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub duration_secs: Option<f64>,
    pub error_message: Option<String>,
    pub file_operations_locked: bool,
    pub process_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlOutcome {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    pub status: RunSnapshot,
}

/// Single owner of the ingestion run state.
///
/// Every transition happens under one mutex; helpers take the already-locked
/// run so status reads inside start/stop never lock twice.
pub struct IngestionManager {
    run: Mutex<IngestionRun>,
    launcher: Box<dyn ProcessLauncher>,
    grace_period: Duration,
    stop_poll_interval: Duration,
}

impl IngestionManager {
    pub fn new(launcher: impl ProcessLauncher + 'static) -> Self {
        Self {
            run: Mutex::new(IngestionRun::default()),
            launcher: Box::new(launcher),
            grace_period: Duration::from_secs(5),
            stop_poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_stop_poll_interval(mut self, interval: Duration) -> Self {
        self.stop_poll_interval = interval;
        self
    }

    fn lock(&self) -> MutexGuard<'_, IngestionRun> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn start(&self) -> ControlOutcome {
        let mut run = self.lock();
        run.poll();
        if run.status == RunStatus::Running {
            return ControlOutcome {
                success: false,
                message: "Ingestion is already running".to_string(),
                process_id: run.process_id,
                status: run.snapshot(),
            };
        }

        *run = IngestionRun {
            status: RunStatus::Running,
            run_id: Some(Uuid::new_v4()),
            start_time: Some(Utc::now()),
            file_operations_locked: true,
            ..IngestionRun::default()
        };

        match self.launcher.launch() {
            Ok(process) => {
                run.process_id = process.id();
                run.process = Some(process);
                info!(pid = ?run.process_id, run_id = ?run.run_id, "ingestion started");
                ControlOutcome {
                    success: true,
                    message: "Ingestion started".to_string(),
                    process_id: run.process_id,
                    status: run.snapshot(),
                }
            }
            Err(launch_error) => {
                error!(error = %launch_error, "failed to launch ingestion process");
                run.status = RunStatus::Error;
                run.error_message = Some(launch_error.to_string());
                run.file_operations_locked = false;
                run.end_time = Some(Utc::now());
                ControlOutcome {
                    success: false,
                    message: format!("Failed to start ingestion: {launch_error}"),
                    process_id: None,
                    status: run.snapshot(),
                }
            }
        }
    }

    pub fn poll(&self) {
        self.lock().poll();
    }

    /// Current run state, after observing any process exit.
    pub fn status(&self) -> RunSnapshot {
        let mut run = self.lock();
        run.poll();
        run.snapshot()
    }

    pub fn file_operations_locked(&self) -> bool {
        let mut run = self.lock();
        run.poll();
        run.file_operations_locked
    }

    /// Runs `op` only while unlocked, holding the state mutex so a start cannot interleave.
    pub fn with_file_operations<T>(
        &self,
        op: impl FnOnce() -> Result<T, FileOpError>,
    ) -> Result<T, FileOpError> {
        let mut run = self.lock();
        run.poll();
        if run.file_operations_locked {
            return Err(FileOpError::Locked);
        }
        op()
    }

    /// Terminates the running process, escalating to kill after the grace period.
    ///
    /// A stop issued while another stop is still waiting is refused without
    /// touching the process.
    pub async fn stop(&self) -> ControlOutcome {
        let mut process = {
            let mut run = self.lock();
            run.poll();
            if run.status != RunStatus::Running {
                return Self::refused(&run, "No ingestion process is running", None);
            }
            match run.process.take() {
                Some(process) => process,
                None => {
                    return Self::refused(&run, "Ingestion is already stopping", run.process_id)
                }
            }
        };

        let pid = process.id();
        info!(pid = ?pid, "stopping ingestion process");
        if let Err(term_error) = process.terminate() {
            warn!(pid = ?pid, error = %term_error, "graceful termination failed");
        }

        let deadline = Instant::now() + self.grace_period;
        let mut exited = false;
        loop {
            match process.try_wait() {
                Ok(Some(_)) => {
                    exited = true;
                    break;
                }
                Ok(None) if Instant::now() < deadline => {
                    tokio::time::sleep(self.stop_poll_interval).await;
                }
                _ => break,
            }
        }

        if !exited {
            warn!(pid = ?pid, "grace period elapsed, killing ingestion process");
            if let Err(kill_error) = process.kill() {
                error!(pid = ?pid, error = %kill_error, "failed to kill ingestion process");
                let mut run = self.lock();
                run.process = Some(process);
                return ControlOutcome {
                    success: false,
                    message: format!("Failed to stop ingestion: {kill_error}"),
                    process_id: pid,
                    status: run.snapshot(),
                };
            }
        }

        let mut run = self.lock();
        run.status = RunStatus::Completed;
        run.end_time = Some(Utc::now());
        run.file_operations_locked = false;
        run.process = None;
        info!(pid = ?pid, "ingestion stopped");
        ControlOutcome {
            success: true,
            message: "Ingestion stopped".to_string(),
            process_id: pid,
            status: run.snapshot(),
        }
    }

    fn refused(run: &IngestionRun, message: &str, process_id: Option<u32>) -> ControlOutcome {
        ControlOutcome {
            success: false,
            message: message.to_string(),
            process_id,
            status: run.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Shared switches that let a test decide when the fake process exits.
    #[derive(Default)]
    struct Script {
        exit: Mutex<Option<ExitState>>,
        exit_on_terminate: AtomicBool,
        terminated: AtomicBool,
        killed: AtomicBool,
        launches: AtomicUsize,
        fail_launch: AtomicBool,
    }

    impl Script {
        fn finish(&self, state: ExitState) {
            *self.exit.lock().expect("test mutex") = Some(state);
        }
    }

    struct FakeProcess {
        script: Arc<Script>,
        pid: u32,
    }

    impl SupervisedProcess for FakeProcess {
        fn id(&self) -> Option<u32> {
            Some(self.pid)
        }

        fn try_wait(&mut self) -> io::Result<Option<ExitState>> {
            Ok(*self.script.exit.lock().expect("test mutex"))
        }

        fn terminate(&mut self) -> io::Result<()> {
            self.script.terminated.store(true, Ordering::SeqCst);
            if self.script.exit_on_terminate.load(Ordering::SeqCst) {
                self.script.finish(ExitState::Failed(Some(143)));
            }
            Ok(())
        }

        fn kill(&mut self) -> io::Result<()> {
            self.script.killed.store(true, Ordering::SeqCst);
            self.script.finish(ExitState::Failed(None));
            Ok(())
        }
    }

    struct FakeLauncher {
        script: Arc<Script>,
    }

    impl ProcessLauncher for FakeLauncher {
        fn launch(&self) -> io::Result<Box<dyn SupervisedProcess>> {
            if self.script.fail_launch.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "binary missing"));
            }
            let launches = self.script.launches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeProcess {
                script: Arc::clone(&self.script),
                pid: 4000 + launches as u32,
            }))
        }
    }

    fn manager() -> (IngestionManager, Arc<Script>) {
        let script = Arc::new(Script::default());
        let manager = IngestionManager::new(FakeLauncher {
            script: Arc::clone(&script),
        })
        .with_grace_period(Duration::from_millis(50))
        .with_stop_poll_interval(Duration::from_millis(5));
        (manager, script)
    }

    #[test]
    fn new_manager_is_idle_and_unlocked() {
        let (manager, _) = manager();
        let status = manager.status();
        assert_eq!(status.status, RunStatus::Idle);
        assert!(!status.file_operations_locked);
        assert!(status.start_time.is_none());
    }

    #[test]
    fn second_start_is_rejected_and_leaves_first_run_untouched() {
        let (manager, script) = manager();

        let first = manager.start();
        assert!(first.success);
        assert_eq!(first.process_id, Some(4000));
        assert!(first.status.file_operations_locked);

        let second = manager.start();
        assert!(!second.success);
        assert_eq!(second.status.run_id, first.status.run_id);
        assert_eq!(second.status.start_time, first.status.start_time);
        assert_eq!(second.status.process_id, Some(4000));
        assert_eq!(second.status.status, RunStatus::Running);
        assert_eq!(script.launches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clean_exit_completes_and_unlocks() {
        let (manager, script) = manager();
        manager.start();
        assert!(manager.file_operations_locked());

        script.finish(ExitState::Success);
        manager.poll();

        let status = manager.status();
        assert_eq!(status.status, RunStatus::Completed);
        assert!(!status.file_operations_locked);
        assert!(status.end_time.is_some());
        assert!(status.error_message.is_none());
    }

    #[test]
    fn failed_exit_records_error_and_still_unlocks() {
        let (manager, script) = manager();
        manager.start();

        script.finish(ExitState::Failed(Some(2)));

        let status = manager.status();
        assert_eq!(status.status, RunStatus::Error);
        assert!(!status.file_operations_locked);
        assert_eq!(
            status.error_message.as_deref(),
            Some("ingestion process exited with code 2")
        );
    }

    #[test]
    fn launch_failure_reverts_to_error_without_lock() {
        let (manager, script) = manager();
        script.fail_launch.store(true, Ordering::SeqCst);

        let outcome = manager.start();

        assert!(!outcome.success);
        assert_eq!(outcome.status.status, RunStatus::Error);
        assert!(!outcome.status.file_operations_locked);
        assert!(outcome
            .status
            .error_message
            .as_deref()
            .is_some_and(|message| message.contains("binary missing")));
    }

    #[test]
    fn restart_after_completion_resets_the_run() {
        let (manager, script) = manager();
        let first = manager.start();
        script.finish(ExitState::Failed(Some(1)));
        assert_eq!(manager.status().status, RunStatus::Error);

        *script.exit.lock().expect("test mutex") = None;
        let second = manager.start();

        assert!(second.success);
        assert_ne!(second.status.run_id, first.status.run_id);
        assert!(second.status.error_message.is_none());
        assert!(second.status.end_time.is_none());
    }

    #[test]
    fn file_operations_are_refused_while_running() {
        let (manager, script) = manager();
        let ran = AtomicBool::new(false);
        manager.start();

        let refused = manager.with_file_operations(|| {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        });
        assert!(matches!(refused, Err(FileOpError::Locked)));
        assert!(!ran.load(Ordering::SeqCst));

        script.finish(ExitState::Success);
        manager
            .with_file_operations(|| {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            })
            .expect("unlocked after exit");
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stop_terminates_gracefully() {
        let (manager, script) = manager();
        script.exit_on_terminate.store(true, Ordering::SeqCst);
        manager.start();

        let outcome = manager.stop().await;

        assert!(outcome.success);
        assert!(script.terminated.load(Ordering::SeqCst));
        assert!(!script.killed.load(Ordering::SeqCst));
        assert_eq!(outcome.status.status, RunStatus::Completed);
        assert!(!outcome.status.file_operations_locked);
    }

    #[tokio::test]
    async fn stop_escalates_to_kill_after_grace_period() {
        let (manager, script) = manager();
        manager.start();

        let outcome = manager.stop().await;

        assert!(outcome.success);
        assert!(script.terminated.load(Ordering::SeqCst));
        assert!(script.killed.load(Ordering::SeqCst));
        assert_eq!(manager.status().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn concurrent_stop_reports_already_stopping() {
        let (manager, script) = manager();
        manager.start();

        let (first, second) = tokio::join!(manager.stop(), manager.stop());

        assert!(first.success);
        assert!(!second.success);
        assert_eq!(second.message, "Ingestion is already stopping");
        assert_eq!(second.process_id, Some(4000));
        assert_eq!(second.status.status, RunStatus::Running);
        assert!(script.killed.load(Ordering::SeqCst));
        assert_eq!(manager.status().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn stop_without_a_run_is_rejected() {
        let (manager, _) = manager();
        let outcome = manager.stop().await;
        assert!(!outcome.success);
        assert_eq!(outcome.status.status, RunStatus::Idle);
    }
}

//! Starting download workers and owning their lifecycle.
//!
//! A worker is this same executable run with the hidden `worker` subcommand.
//! It gets its own process group so that killing it also takes down the
//! downloader it spawned.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::channel::{RecordReceiver, Recv, StatusSlot, pump};
use super::models::{JobStatus, RequestOptions};
use crate::config::DownloaderConfig;
use crate::logging::Level;

/// How long `join` waits for the worker's stdout to drain after it exited.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `join` waits for a worker that is still running before killing it.
const EXIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Failed to locate worker executable: {0}")]
    WorkerExe(#[source] io::Error),

    #[error("Failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("Worker stdout was not captured")]
    MissingStdout,
}

/// Builds and starts worker processes.
#[derive(Debug, Clone)]
pub struct Launcher {
    worker_exe: PathBuf,
    downloader: DownloaderConfig,
    log_level: Level,
}

impl Launcher {
    /// Launcher running workers from the current executable.
    pub fn new(downloader: DownloaderConfig, log_level: Level) -> Result<Self, JobError> {
        let worker_exe = std::env::current_exe().map_err(JobError::WorkerExe)?;
        Ok(Self::with_worker_exe(worker_exe, downloader, log_level))
    }

    pub fn with_worker_exe(
        worker_exe: impl Into<PathBuf>,
        downloader: DownloaderConfig,
        log_level: Level,
    ) -> Self {
        Self {
            worker_exe: worker_exe.into(),
            downloader,
            log_level,
        }
    }

    pub fn downloader(&self) -> &DownloaderConfig {
        &self.downloader
    }

    /// Spawn a worker for `url`. Returns as soon as the process exists.
    pub fn start(&self, url: &str, options: &RequestOptions) -> Result<JobHandle, JobError> {
        let mut cmd = Command::new(&self.worker_exe);
        cmd.arg("worker")
            .arg("--url")
            .arg(url)
            .arg("--mode")
            .arg(options.mode.as_str())
            .arg("--program")
            .arg(&self.downloader.program)
            .arg("--log-level")
            .arg(self.log_level.as_str());

        // `--flag=value` keeps values such as `-o` from being read as flags.
        for arg in &self.downloader.args {
            cmd.arg(format!("--arg={arg}"));
        }
        for arg in self.downloader.modes.args_for(options.mode) {
            cmd.arg(format!("--mode-arg={arg}"));
        }

        JobHandle::spawn(cmd)
    }
}

/// Handle to a running worker.
pub struct JobHandle {
    child: Child,
    pid: Option<u32>,
    records: RecordReceiver,
    status: StatusSlot,
    pump: Option<JoinHandle<()>>,
    exit: Option<ExitStatus>,
    killed: bool,
}

impl JobHandle {
    /// Spawn `cmd` as a worker speaking the frame protocol on stdout.
    pub(crate) fn spawn(mut cmd: Command) -> Result<Self, JobError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(JobError::Spawn)?;
        let stdout = child.stdout.take().ok_or(JobError::MissingStdout)?;

        let status = StatusSlot::default();
        let (records, pump) = pump(stdout, status.clone());

        Ok(Self {
            pid: child.id(),
            child,
            records,
            status,
            pump: Some(pump),
            exit: None,
            killed: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the worker process is still running.
    pub fn is_alive(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                debug!(pid = ?self.pid, error = %e, "Failed to poll worker");
                false
            }
        }
    }

    /// Kill the worker and everything in its process group.
    ///
    /// No-op when the worker already exited or was already killed.
    pub fn kill(&mut self) -> io::Result<()> {
        if self.killed || !self.is_alive() {
            return Ok(());
        }

        self.signal_group()?;
        self.killed = true;
        Ok(())
    }

    #[cfg(unix)]
    fn signal_group(&mut self) -> io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            return self.child.start_kill();
        };

        match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => {
                warn!(pid, error = %e, "Failed to signal worker process group");
                self.child.start_kill()
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    /// Wait up to `timeout` for the next record from the worker.
    pub async fn next_record(&mut self, timeout: Duration) -> Recv {
        self.records.get(timeout).await
    }

    /// Records received but not yet taken.
    pub fn has_pending(&self) -> bool {
        !self.records.is_empty()
    }

    /// Wait for the worker to exit and collect its final status.
    ///
    /// A worker that has not exited within a few seconds is killed, so a
    /// process that closed its stdout and then hung cannot stall the caller.
    pub async fn join(mut self) -> JobStatus {
        if self.exit.is_none() {
            self.exit = self.wait_or_kill().await;
        }

        // The status frame arrives on stdout; make sure it has been read.
        if let Some(pump) = self.pump.take() {
            if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, pump).await.is_err() {
                debug!(pid = ?self.pid, "Worker stdout did not close after exit");
            }
        }

        JobStatus {
            code: self
                .status
                .get()
                .or_else(|| self.exit.and_then(|status| status.code())),
            forced: self.killed,
        }
    }

    async fn wait_or_kill(&mut self) -> Option<ExitStatus> {
        match tokio::time::timeout(EXIT_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => return Some(status),
            Ok(Err(e)) => {
                warn!(pid = ?self.pid, error = %e, "Failed to wait for worker");
                return None;
            }
            Err(_) => {
                warn!(pid = ?self.pid, "Worker did not exit after closing its output, killing it");
            }
        }

        if let Err(e) = self.kill() {
            warn!(pid = ?self.pid, error = %e, "Failed to kill worker");
        }
        match self.child.wait().await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(pid = ?self.pid, error = %e, "Failed to wait for worker");
                None
            }
        }
    }
}

impl Drop for JobHandle {
    /// `kill_on_drop` only reaches the worker itself; take its group with it.
    fn drop(&mut self) {
        if !self.killed && self.is_alive() {
            debug!(pid = ?self.pid, "Killing worker left running");
            if let Err(e) = self.signal_group() {
                debug!(pid = ?self.pid, error = %e, "Failed to kill worker on drop");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn join_prefers_reported_status() {
        let handle =
            JobHandle::spawn(shell(r#"echo '{"kind":"status","code":3}'; exit 0"#)).unwrap();
        let status = handle.join().await;
        assert_eq!(status.code, Some(3));
        assert!(!status.forced);
    }

    #[tokio::test]
    async fn join_falls_back_to_exit_code() {
        let handle = JobHandle::spawn(shell("exit 7")).unwrap();
        assert_eq!(handle.join().await.code, Some(7));
    }

    #[tokio::test]
    async fn kill_is_forced_and_idempotent() {
        let mut handle = JobHandle::spawn(shell("sleep 30")).unwrap();
        assert!(handle.is_alive());
        assert!(handle.pid().is_some());

        handle.kill().unwrap();
        handle.kill().unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap();
        assert!(status.forced);
        assert!(!status.is_success());
    }

    #[tokio::test]
    async fn kill_after_exit_is_a_no_op() {
        let mut handle = JobHandle::spawn(shell("true")).unwrap();
        while handle.is_alive() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.kill().unwrap();

        let status = handle.join().await;
        assert!(!status.forced);
        assert!(status.is_success());
    }

    #[tokio::test]
    async fn kill_reaches_grandchildren() {
        // The grandchild keeps stdout open; it only closes if the group dies.
        let mut handle = JobHandle::spawn(shell("sleep 30 & wait")).unwrap();
        handle.kill().unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Recv::Closed = handle.next_record(Duration::from_millis(50)).await {
                    break;
                }
            }
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn join_kills_worker_that_hangs_after_closing_stdout() {
        let handle = JobHandle::spawn(shell("exec >&-; sleep 30")).unwrap();

        let status = tokio::time::timeout(EXIT_TIMEOUT + Duration::from_secs(5), handle.join())
            .await
            .expect("join should not wait for the full sleep");
        assert!(status.forced);
        assert!(!status.is_success());
    }

    #[tokio::test]
    async fn dropping_a_running_handle_kills_the_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let beat = dir.path().join("beat");
        let script = format!(
            "while true; do echo x >> '{}'; sleep 0.05; done & wait",
            beat.display()
        );

        let handle = JobHandle::spawn(shell(&script)).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !beat.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        drop(handle);
        tokio::time::sleep(Duration::from_millis(300)).await;
        let before = std::fs::metadata(&beat).unwrap().len();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(std::fs::metadata(&beat).unwrap().len(), before);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let result = JobHandle::spawn(Command::new("/nonexistent/gdl-worker"));
        assert!(matches!(result, Err(JobError::Spawn(_))));
    }
}

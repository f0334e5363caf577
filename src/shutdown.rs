//! Graceful shutdown on SIGINT/SIGTERM.
//!
//! The first signal cancels the shutdown token, which stops every live tail
//! and the HTTP server, then runs the registered hooks in order. Later
//! signals are ignored.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::logging::LogWriter;
use crate::web::registry::ConnectionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownState {
    Running = 0,
    ShuttingDown = 1,
    Drained = 2,
}

impl ShutdownState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::ShuttingDown,
            _ => Self::Drained,
        }
    }
}

/// One independent step run during shutdown.
#[async_trait]
pub trait ShutdownHook: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self) -> Result<()>;
}

pub struct ShutdownCoordinator {
    state: AtomicU8,
    token: CancellationToken,
    hooks: std::sync::Mutex<Vec<Arc<dyn ShutdownHook>>>,
    drained: Notify,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ShutdownState::Running as u8),
            token: CancellationToken::new(),
            hooks: std::sync::Mutex::new(Vec::new()),
            drained: Notify::new(),
        }
    }

    /// Hooks run in the order they were added.
    pub fn add_hook(&self, hook: impl ShutdownHook + 'static) {
        self.hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(hook));
    }

    /// Cancelled as soon as shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Start shutdown. Returns false if it had already started.
    pub async fn trigger(&self, reason: &str) -> bool {
        if self
            .state
            .compare_exchange(
                ShutdownState::Running as u8,
                ShutdownState::ShuttingDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!(reason, "Shutdown already in progress");
            return false;
        }

        info!(reason, "Shutting down");
        self.token.cancel();

        let hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for hook in hooks {
            match hook.run().await {
                Ok(()) => debug!(hook = hook.name(), "Shutdown hook finished"),
                Err(e) => warn!(hook = hook.name(), "Shutdown hook failed: {e:#}"),
            }
        }

        self.state
            .store(ShutdownState::Drained as u8, Ordering::Release);
        self.drained.notify_waiters();
        true
    }

    /// Wait until shutdown has finished running its hooks.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.state() == ShutdownState::Drained {
                return;
            }
            notified.await;
        }
    }

    /// Trigger shutdown on SIGINT or SIGTERM. Runs until shutdown starts.
    pub async fn listen_for_signals(self: Arc<Self>) -> Result<()> {
        let reason = wait_for_signal().await?;
        self.trigger(reason).await;
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    Ok(tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    })
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    Ok("ctrl-c")
}

/// Closes every live log subscriber.
pub struct DrainConnections {
    registry: ConnectionRegistry,
    grace: Duration,
}

impl DrainConnections {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self {
            registry,
            grace: Duration::from_secs(2),
        }
    }
}

#[async_trait]
impl ShutdownHook for DrainConnections {
    fn name(&self) -> &str {
        "drain-connections"
    }

    async fn run(&self) -> Result<()> {
        let count = self.registry.drain_all(self.grace).await;
        debug!(count, "Drained live log subscribers");
        Ok(())
    }
}

/// Copies a non-empty log file into an archive directory.
pub struct ArchiveLog {
    log_file: PathBuf,
    archive_dir: PathBuf,
    writer: LogWriter,
}

impl ArchiveLog {
    pub fn new(log_file: PathBuf, archive_dir: PathBuf, writer: LogWriter) -> Self {
        Self {
            log_file,
            archive_dir,
            writer,
        }
    }

    fn archive_path(&self) -> PathBuf {
        let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
        self.archive_dir.join(format!("app_{stamp}.log"))
    }
}

#[async_trait]
impl ShutdownHook for ArchiveLog {
    fn name(&self) -> &str {
        "archive-log"
    }

    async fn run(&self) -> Result<()> {
        self.writer.flush().await;

        let len = match tokio::fs::metadata(&self.log_file).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context("Failed to inspect log file"),
        };
        if len == 0 {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.archive_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.archive_dir.display()))?;

        let dest = self.archive_path();
        tokio::fs::copy(&self.log_file, &dest)
            .await
            .with_context(|| format!("Failed to copy log file to {}", dest.display()))?;

        info!(path = %dest.display(), "Archived log file");
        Ok(())
    }
}

/// Writes out queued log records and stops the log writer thread.
pub struct CloseLogWriter {
    writer: LogWriter,
}

impl CloseLogWriter {
    pub fn new(writer: LogWriter) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl ShutdownHook for CloseLogWriter {
    fn name(&self) -> &str {
        "close-log-writer"
    }

    async fn run(&self) -> Result<()> {
        self.writer.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{FileSink, Level, LogRecord, Sinks};
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct Recorder {
        name: &'static str,
        calls: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl ShutdownHook for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self) -> Result<()> {
            self.calls.lock().unwrap().push(self.name);
            if self.fail {
                anyhow::bail!("{} failed", self.name);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn runs_hooks_once_in_order_despite_failures() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let coordinator = ShutdownCoordinator::new();
        for (name, fail) in [("first", false), ("second", true), ("third", false)] {
            coordinator.add_hook(Recorder {
                name,
                calls: calls.clone(),
                fail,
            });
        }

        assert_eq!(coordinator.state(), ShutdownState::Running);
        assert!(coordinator.trigger("test").await);
        assert!(coordinator.token().is_cancelled());
        assert_eq!(coordinator.state(), ShutdownState::Drained);
        assert!(!coordinator.trigger("again").await);

        assert_eq!(*calls.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn wait_drained_returns_after_trigger() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let waiter = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.wait_drained().await }
        });

        coordinator.trigger("test").await;
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();

        // Already drained: returns immediately.
        coordinator.wait_drained().await;
    }

    #[tokio::test]
    async fn archive_copies_non_empty_log() {
        let dir = tempdir().unwrap();
        let log_file = dir.path().join("app.log");
        let archive_dir = dir.path().join("archive");
        let writer =
            LogWriter::spawn(Sinks::new().with_file(FileSink::open(&log_file).unwrap())).unwrap();

        writer.emit(LogRecord::new(Level::Info, "test", "keep me"));
        ArchiveLog::new(log_file, archive_dir.clone(), writer.clone())
            .run()
            .await
            .unwrap();

        let archived: Vec<_> = std::fs::read_dir(&archive_dir).unwrap().collect();
        assert_eq!(archived.len(), 1);
        let path = archived[0].as_ref().unwrap().path();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("app_"));
        assert!(std::fs::read_to_string(path).unwrap().contains("keep me"));

        writer.close().await;
    }

    #[tokio::test]
    async fn archive_skips_empty_log() {
        let dir = tempdir().unwrap();
        let log_file = dir.path().join("app.log");
        std::fs::write(&log_file, "").unwrap();
        let archive_dir = dir.path().join("archive");
        let writer = LogWriter::spawn(Sinks::new()).unwrap();

        ArchiveLog::new(log_file, archive_dir.clone(), writer)
            .run()
            .await
            .unwrap();
        assert!(!archive_dir.exists());
    }
}

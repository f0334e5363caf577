//! Dedicated writer thread owning the console and file sinks.
//!
//! Records are queued from async code and written on a plain OS thread so
//! that blocking file I/O (including in-place progress rewrites) never runs
//! on the runtime. The thread is the only owner of the file handle.

use std::io::{self, Write};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;

use tokio::sync::oneshot;
use tracing::debug;

use super::console::ConsoleSink;
use super::file::FileSink;
use super::format::render;
use super::record::LogRecord;
use super::{RecordSink, SINK_TARGET};

type BoxedConsole = ConsoleSink<Box<dyn Write + Send>>;

/// Destinations written by the log writer thread.
#[derive(Default)]
pub struct Sinks {
    pub console: Option<BoxedConsole>,
    pub file: Option<FileSink>,
}

impl Sinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_console(mut self, out: impl Write + Send + 'static) -> Self {
        self.console = Some(ConsoleSink::new(Box::new(out)));
        self
    }

    pub fn with_file(mut self, file: FileSink) -> Self {
        self.file = Some(file);
        self
    }

    fn write(&mut self, record: &LogRecord) {
        let line = render(record);
        let progress = record.is_progress();

        if let Some(console) = self.console.as_mut() {
            if let Err(e) = console.write_line(&line, progress) {
                debug!(target: SINK_TARGET, error = %e, "Failed to write log line to console");
            }
        }
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_line(&line, progress) {
                debug!(
                    target: SINK_TARGET,
                    path = %file.path().display(),
                    error = %e,
                    "Failed to append log line"
                );
            }
        }
    }

    fn clear_file(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.clear(),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no log file configured",
            )),
        }
    }
}

enum Command {
    Record(Box<LogRecord>),
    Flush(oneshot::Sender<()>),
    Clear(oneshot::Sender<io::Result<()>>),
}

/// Cloneable handle to the log writer thread.
#[derive(Clone)]
pub struct LogWriter {
    tx: Arc<Mutex<Option<mpsc::Sender<Command>>>>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl LogWriter {
    /// Start the writer thread.
    pub fn spawn(sinks: Sinks) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Command>();

        let thread = std::thread::Builder::new()
            .name("log-writer".to_string())
            .spawn(move || run(sinks, rx))?;

        Ok(Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            thread: Arc::new(Mutex::new(Some(thread))),
        })
    }

    /// Queue a record. Records sent after `close()` are discarded.
    pub fn emit(&self, record: LogRecord) {
        self.send(Command::Record(Box::new(record)));
    }

    /// Wait until every record queued before this call has been written.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.send(Command::Flush(done_tx)) {
            let _ = done_rx.await;
        }
    }

    /// Truncate the log file after writing everything queued before it.
    pub async fn clear(&self) -> io::Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        if !self.send(Command::Clear(done_tx)) {
            return Err(io::Error::other("log writer is closed"));
        }
        done_rx
            .await
            .unwrap_or_else(|_| Err(io::Error::other("log writer stopped")))
    }

    /// Stop accepting records, write what is queued, and join the thread.
    ///
    /// Calling this more than once is harmless.
    pub async fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();

        let thread = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(thread) = thread {
            if let Err(e) = tokio::task::spawn_blocking(move || thread.join()).await {
                debug!(target: SINK_TARGET, error = %e, "Failed to join log writer thread");
            }
        }
    }

    fn send(&self, command: Command) -> bool {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }
}

impl RecordSink for LogWriter {
    fn send_record(&self, record: LogRecord) {
        self.emit(record);
    }
}

fn run(mut sinks: Sinks, rx: mpsc::Receiver<Command>) {
    while let Ok(command) = rx.recv() {
        match command {
            Command::Record(record) => sinks.write(&record),
            Command::Flush(done) => {
                let _ = done.send(());
            }
            Command::Clear(done) => {
                let _ = done.send(sinks.clear_file());
            }
        }
    }
}

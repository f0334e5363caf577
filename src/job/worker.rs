//! The worker side of a download job.
//!
//! Runs in its own process (the hidden `worker` subcommand). It starts the
//! downloader, turns everything the downloader prints into log records, and
//! sends those records plus its final status to the server over stdout.

use std::process::Stdio;
use std::sync::{Arc, LazyLock};

use clap::Args;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{error, info};

use super::models::{DownloadMode, RequestOptions};
use crate::logging::{Level, LogRecord, RecordSink};

/// Logger name for lines the downloader printed without one.
pub const DOWNLOADER_LOGGER: &str = "downloader";

/// Status reported when the downloader could not run or was killed by a signal.
pub const FAILED_STATUS: i32 = -1;

/// `[logger][level] message`, the downloader's stderr log format.
static STDERR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[([^\]]+)\]\[(\w+)\]\s?(.*)$").expect("stderr line pattern is valid")
});

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    #[arg(long)]
    pub url: String,

    #[arg(long, default_value = "none-selected")]
    pub mode: DownloadMode,

    #[arg(long)]
    pub program: String,

    /// Argument passed to the downloader for every job.
    #[arg(long = "arg")]
    pub args: Vec<String>,

    /// Argument added because of the requested mode.
    #[arg(long = "mode-arg")]
    pub mode_args: Vec<String>,

    #[arg(long, default_value = "info")]
    pub log_level: Level,
}

/// Run the downloader to completion and return the status to report.
pub async fn run(args: &WorkerArgs, sink: Arc<dyn RecordSink>) -> i32 {
    let options = RequestOptions { mode: args.mode };
    info!("Requested download with the following options: {options}");

    if !args.mode_args.is_empty() {
        info!(
            "Added downloader arguments for {}: {:?}",
            args.mode, args.mode_args
        );
    }

    let mut cmd = Command::new(&args.program);
    cmd.args(&args.args)
        .args(&args.mode_args)
        .arg(&args.url)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!("Exception: failed to start {}: {e}", args.program);
            return FAILED_STATUS;
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_sink = sink.clone();
    let stdout_task = tokio::spawn(async move {
        if let Some(stdout) = stdout {
            read_lines(stdout, |line| {
                if let Some(record) = translate_stdout(line) {
                    stdout_sink.send_record(record);
                }
            })
            .await;
        }
    });

    let stderr_task = tokio::spawn(async move {
        if let Some(stderr) = stderr {
            read_lines(stderr, |line| {
                if let Some(record) = parse_stderr(line) {
                    sink.send_record(record);
                }
            })
            .await;
        }
    });

    let status = match child.wait().await {
        Ok(status) => status.code().unwrap_or(FAILED_STATUS),
        Err(e) => {
            error!("Exception: failed to wait for {}: {e}", args.program);
            FAILED_STATUS
        }
    };

    let _ = tokio::join!(stdout_task, stderr_task);
    status
}

/// Read `reader` to the end, calling `on_line` for every segment ended by a
/// carriage return or a newline.
///
/// Progress bars redraw with `\r`, so each redraw becomes its own line.
pub async fn read_lines<R, F>(mut reader: R, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut pending = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "Downloader output read error");
                break;
            }
        };

        for &byte in &buf[..n] {
            if byte == b'\r' || byte == b'\n' {
                if !pending.is_empty() {
                    on_line(&String::from_utf8_lossy(&pending));
                    pending.clear();
                }
            } else {
                pending.push(byte);
            }
        }
    }

    if !pending.is_empty() {
        on_line(&String::from_utf8_lossy(&pending));
    }
}

/// Turn one line of downloader stdout into a record.
///
/// The downloader prints `* <path>` for a finished file and `# <path>` for one
/// it skipped.
pub fn translate_stdout(line: &str) -> Option<LogRecord> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let record = if let Some(path) = line.strip_prefix("* ") {
        LogRecord::new(
            Level::Info,
            DOWNLOADER_LOGGER,
            format!("Download successful: {path}"),
        )
    } else if let Some(path) = line.strip_prefix("# ") {
        LogRecord::new(
            Level::Warning,
            DOWNLOADER_LOGGER,
            format!("File already exists or is in download archive: {path}"),
        )
    } else {
        LogRecord::new(Level::Info, DOWNLOADER_LOGGER, line)
    };

    Some(record.with_extra("stream", "stdout"))
}

/// Turn one line of downloader stderr into a record, keeping the logger name
/// and level when the line is in the downloader's log format.
pub fn parse_stderr(line: &str) -> Option<LogRecord> {
    let line = line.trim_end();
    if line.trim().is_empty() {
        return None;
    }

    let record = match STDERR_LINE.captures(line) {
        Some(caps) => {
            let level = caps[2].parse().unwrap_or(Level::Info);
            LogRecord::new(level, &caps[1], &caps[3])
        }
        None => LogRecord::new(Level::Info, DOWNLOADER_LOGGER, line),
    };

    Some(record.with_extra("stream", "stderr"))
}

//! Reading the log file for viewers: whole-file snapshots and streams, and
//! live tails that follow the file as it grows.
//!
//! The file sink rewrites the last line in place while a download reports
//! progress, so a live tail cannot just read appended bytes. Each poll
//! re-reads from the start of the last line it knows about: a changed
//! progress line is sent again, and complete lines after it are new.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::logging::file::locate_last_line_start;
use crate::logging::is_progress_line;

pub const LOG_NOT_FOUND: &str = "Log file not found.";
pub const NO_LOGS: &str = "No logs to display.";

/// Read size for [`stream`].
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Text shown to a viewer instead of the log when it cannot be read.
pub fn placeholder(err: &io::Error) -> String {
    if err.kind() == io::ErrorKind::NotFound {
        LOG_NOT_FOUND.to_string()
    } else {
        format!("An error occurred: {err}")
    }
}

/// The whole log file, or a short placeholder.
pub async fn snapshot(path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => NO_LOGS.to_string(),
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Failed to read log file");
            placeholder(&e)
        }
    }
}

enum StreamState {
    Start(PathBuf),
    Reading { file: File, carry: Vec<u8> },
    Done,
}

/// Stream the whole log file in chunks.
///
/// Chunks never end inside a multi-byte character. On Windows, line endings
/// are converted to `\r\n`.
pub fn stream(path: impl Into<PathBuf>) -> impl Stream<Item = io::Result<Bytes>> + Send {
    futures::stream::unfold(StreamState::Start(path.into()), |state| async move {
        match state {
            StreamState::Start(path) => match File::open(&path).await {
                Ok(file) => next_chunk(file, Vec::new()).await,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Failed to open log file");
                    Some((Ok(Bytes::from(placeholder(&e))), StreamState::Done))
                }
            },
            StreamState::Reading { file, carry } => next_chunk(file, carry).await,
            StreamState::Done => None,
        }
    })
}

async fn next_chunk(
    mut file: File,
    mut carry: Vec<u8>,
) -> Option<(io::Result<Bytes>, StreamState)> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match file.read(&mut buf).await {
            Ok(0) => {
                if carry.is_empty() {
                    return None;
                }
                return Some((Ok(text_chunk(&carry)), StreamState::Done));
            }
            Ok(n) => {
                carry.extend_from_slice(&buf[..n]);
                let split = carry.len() - incomplete_suffix(&carry);
                if split == 0 {
                    continue;
                }
                let rest = carry.split_off(split);
                return Some((Ok(text_chunk(&carry)), StreamState::Reading { file, carry: rest }));
            }
            Err(e) => return Some((Err(e), StreamState::Done)),
        }
    }
}

fn text_chunk(bytes: &[u8]) -> Bytes {
    let text = String::from_utf8_lossy(bytes);
    if cfg!(windows) {
        Bytes::from(text.replace('\n', "\r\n"))
    } else {
        Bytes::from(text.into_owned())
    }
}

/// Length of a trailing, not yet complete UTF-8 sequence.
fn incomplete_suffix(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        let needed = match bytes[i] {
            0x80..=0xBF => continue,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        let have = bytes.len() - i;
        return if have < needed { have } else { 0 };
    }
    0
}

/// A viewer's position in the log file.
#[derive(Debug)]
pub struct TailCursor {
    path: PathBuf,
    /// End of the complete lines seen so far.
    position: u64,
    /// Start of the last complete line seen.
    last_line_start: u64,
    /// That line as it was last seen, trailing padding removed.
    last_line: String,
}

impl TailCursor {
    /// Start following `path` from its current end.
    pub async fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let mut file = File::open(&path).await?;
        let len = file.metadata().await?.len();

        let scan_path = path.clone();
        let last_line_start = tokio::task::spawn_blocking(move || {
            let mut file = std::fs::File::open(&scan_path)?;
            locate_last_line_start(&mut file, len)
        })
        .await
        .map_err(io::Error::other)??;

        let mut tail = Vec::new();
        file.seek(SeekFrom::Start(last_line_start)).await?;
        (&mut file).take(len - last_line_start).read_to_end(&mut tail).await?;

        Ok(Self {
            path,
            position: len,
            last_line_start,
            last_line: String::from_utf8_lossy(&tail).trim_end().to_string(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Text to send since the last poll, if any.
    pub async fn poll(&mut self) -> io::Result<Option<String>> {
        let mut file = File::open(&self.path).await?;
        let len = file.metadata().await?.len();

        if len < self.position {
            debug!(path = %self.path.display(), "Log file was truncated; following from the start");
            self.reset();
        }

        let mut data = Vec::new();
        file.seek(SeekFrom::Start(self.last_line_start)).await?;
        (&mut file)
            .take(len - self.last_line_start)
            .read_to_end(&mut data)
            .await?;

        let Some(end) = data.iter().rposition(|&b| b == b'\n') else {
            return Ok(None);
        };
        let complete = &data[..=end];

        let mut out = String::new();
        let mut offset = 0usize;
        let mut last_start = 0usize;
        let mut last_text = String::new();

        for (index, raw) in complete.split_inclusive(|&b| b == b'\n').enumerate() {
            let text = String::from_utf8_lossy(raw).trim_end().to_string();

            let known = index == 0 && self.position > self.last_line_start;
            if !known {
                out.push_str(&text);
                out.push('\n');
            } else if text != self.last_line && is_progress_line(&text) {
                out.push_str(&text);
                out.push('\n');
            }

            last_start = offset;
            last_text = text;
            offset += raw.len();
        }

        self.last_line_start += last_start as u64;
        self.position = self.last_line_start + (complete.len() - last_start) as u64;
        self.last_line = last_text;

        Ok((!out.is_empty()).then_some(out))
    }

    fn reset(&mut self) {
        self.position = 0;
        self.last_line_start = 0;
        self.last_line.clear();
    }
}

/// Follow the log file, sending every update to `sink`, until cancelled or
/// the sink fails.
///
/// Read errors are logged and retried on the next tick.
pub async fn live_tail<S>(
    mut cursor: TailCursor,
    interval: Duration,
    cancel: CancellationToken,
    sink: &mut S,
) where
    S: Sink<String> + Unpin,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match cursor.poll().await {
            Ok(Some(text)) => {
                if sink.send(text).await.is_err() {
                    debug!("Live tail receiver went away");
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!(
                    path = %cursor.path().display(),
                    error = %e,
                    "Failed to poll log file"
                );
            }
        }
    }
}

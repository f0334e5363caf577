//! Append-only log file with in-place progress updates.
//!
//! Files are not terminals, so collapsing consecutive progress lines is done
//! by rewriting the bytes of the last line. The replacement is padded with
//! spaces so it never leaves stale bytes of a longer previous line behind,
//! and the file only grows when the new line is longer than the old one.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::SINK_TARGET;

/// Window size for backward scans looking for the start of the last line.
const SCAN_BLOCK: u64 = 4096;

/// Find where the last line of `window` starts, ignoring one trailing newline.
///
/// Returns `None` when the window holds no other newline, meaning the line
/// starts at or before the beginning of the window.
pub fn find_last_line_start(window: &[u8]) -> Option<usize> {
    let body = window.strip_suffix(b"\n").unwrap_or(window);
    body.iter().rposition(|&b| b == b'\n').map(|idx| idx + 1)
}

/// Locate the byte offset of the last line in a file of length `len`.
pub fn locate_last_line_start<R: Read + Seek>(reader: &mut R, len: u64) -> io::Result<u64> {
    let mut window_start = len;
    let mut window = Vec::new();

    while window_start > 0 {
        let step = SCAN_BLOCK.min(window_start);
        window_start -= step;

        let mut block = vec![0u8; step as usize];
        reader.seek(SeekFrom::Start(window_start))?;
        reader.read_exact(&mut block)?;
        block.extend_from_slice(&window);
        window = block;

        if let Some(idx) = find_last_line_start(&window) {
            return Ok(window_start + idx as u64);
        }
    }

    Ok(0)
}

/// Log file writer supporting "replace last line".
pub struct FileSink {
    path: PathBuf,
    file: File,
    last_was_progress: bool,
    /// Start of the last line, once a rewrite has located it.
    rewrite_offset: Option<u64>,
}

impl FileSink {
    /// Open (or create) the log file, creating parent directories as needed.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        // Not opened in append mode: O_APPEND would ignore the seek before
        // an in-place rewrite.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        Ok(Self {
            path,
            file,
            last_was_progress: false,
            rewrite_offset: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a rendered line, collapsing it into the previous line if both are
    /// progress updates.
    ///
    /// A failed rewrite is logged and dropped: losing one progress update is
    /// preferable to breaking the log pipeline.
    pub fn write_line(&mut self, line: &str, progress: bool) -> io::Result<()> {
        if progress && self.last_was_progress {
            if let Err(e) = self.replace_last_line(line) {
                debug!(
                    target: SINK_TARGET,
                    path = %self.path.display(),
                    error = %e,
                    "Failed to rewrite progress line"
                );
                self.rewrite_offset = None;
            }
            return Ok(());
        }

        self.append(line)?;
        self.last_was_progress = progress;
        Ok(())
    }

    /// Truncate the file and forget any tracked line offsets.
    pub fn clear(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.last_was_progress = false;
        self.rewrite_offset = None;
        Ok(())
    }

    fn append(&mut self, line: &str) -> io::Result<()> {
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        self.rewrite_offset = None;
        Ok(())
    }

    fn replace_last_line(&mut self, line: &str) -> io::Result<()> {
        let len = self.file.metadata()?.len();
        let start = match self.rewrite_offset {
            Some(offset) if offset < len => offset,
            _ => locate_last_line_start(&mut self.file, len)?,
        };

        let mut replaced = (len - start) as usize;
        if replaced > 0 {
            let mut last = [0u8; 1];
            self.file.seek(SeekFrom::Start(len - 1))?;
            self.file.read_exact(&mut last)?;
            if last[0] == b'\n' {
                replaced -= 1;
            }
        }

        let mut bytes = Vec::with_capacity(line.len().max(replaced) + 1);
        bytes.extend_from_slice(line.as_bytes());
        if bytes.len() < replaced {
            bytes.resize(replaced, b' ');
        }
        bytes.push(b'\n');

        self.file.seek(SeekFrom::Start(start))?;
        self.file.write_all(&bytes)?;
        self.file.flush()?;

        self.rewrite_offset = Some(start);
        Ok(())
    }
}

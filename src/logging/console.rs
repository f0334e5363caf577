//! Console output with in-place progress updates.

use std::io::{self, Write};

/// Moves the cursor up one line and clears it.
const REWRITE_PREFIX: &str = "\x1b[A\x1b[K";

/// Writes rendered lines to a terminal stream.
///
/// Consecutive progress lines replace each other instead of scrolling the
/// terminal. A replacement is padded to the width of the line it covers.
pub struct ConsoleSink<W: Write> {
    out: W,
    last_progress_width: Option<usize>,
}

impl<W: Write> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            last_progress_width: None,
        }
    }

    pub fn write_line(&mut self, line: &str, progress: bool) -> io::Result<()> {
        let width = line.chars().count();

        match (progress, self.last_progress_width) {
            (true, Some(previous)) => {
                let padding = previous.saturating_sub(width);
                writeln!(self.out, "{REWRITE_PREFIX}{line}{:padding$}", "")?;
            }
            _ => writeln!(self.out, "{line}")?,
        }
        self.out.flush()?;

        self.last_progress_width = progress.then_some(width);
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

//! Rendering of log records into log file lines.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

use super::record::LogRecord;

/// Timestamp format used for every rendered line.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("escape pattern is valid")
});

/// Remove terminal escape sequences from text.
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    ANSI_ESCAPE.replace_all(text, "")
}

/// Render a record as `YYYY-MM-DD HH:MM:SS [level] message`.
pub fn render(record: &LogRecord) -> String {
    let mut line = format!(
        "{} [{}] {}",
        record.timestamp.format(TIMESTAMP_FORMAT),
        record.level,
        strip_ansi(&record.message)
    );
    line.truncate(line.trim_end().len());
    line
}

//! Log records shared by the worker and the serving process.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Local};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::format::strip_ansi;

/// Matches a transfer rate such as `1.2MB/s`, `512 KiB/s` or `Unknown B/s`.
static TRANSFER_RATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\d|Unknown)\s*[kKMGTP]?i?B/s").expect("transfer rate pattern is valid")
});

/// Attribute names taken by the record itself on the worker wire format.
pub const RESERVED_KEYS: &[&str] = &["kind", "timestamp", "level", "logger_name", "message"];

/// Returns true if `key` cannot be used for an extra attribute.
pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Returns true if the text reports a transfer rate.
pub fn is_progress_line(text: &str) -> bool {
    TRANSFER_RATE.is_match(text)
}

/// Severity of a log record, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl Level {
    /// Numeric severity used on the worker wire format.
    pub fn severity(self) -> u8 {
        match self {
            Self::Debug => 10,
            Self::Info => 20,
            Self::Warning => 30,
            Self::Error => 40,
            Self::Critical => 50,
        }
    }

    /// Map a numeric severity to a level, rounding down to the nearest known one.
    pub fn from_severity(severity: u8) -> Self {
        match severity {
            50.. => Self::Critical,
            40..=49 => Self::Error,
            30..=39 => Self::Warning,
            20..=29 => Self::Info,
            _ => Self::Debug,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter_directive(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error | Self::Critical => "error",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown log level: {0}")]
pub struct ParseLevelError(String);

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trace" | "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" | "fatal" => Ok(Self::Critical),
            other => other
                .parse::<u8>()
                .map(Self::from_severity)
                .map_err(|_| ParseLevelError(s.to_string())),
        }
    }
}

impl From<&tracing::Level> for Level {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE | tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warning,
            tracing::Level::ERROR => Self::Error,
        }
    }
}

/// One log event.
///
/// The message never contains terminal control sequences. Extra attributes
/// are carried on a best-effort basis: anything that cannot survive a JSON
/// round-trip is left out rather than failing the record.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: DateTime<Local>,
    pub level: Level,
    pub logger_name: String,
    pub message: String,
    pub extra: BTreeMap<String, Value>,
}

impl LogRecord {
    pub fn new(level: Level, logger_name: impl Into<String>, message: impl AsRef<str>) -> Self {
        Self {
            timestamp: Local::now(),
            level,
            logger_name: logger_name.into(),
            message: strip_ansi(message.as_ref()).into_owned(),
            extra: BTreeMap::new(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Local>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach an extra attribute if it survives a JSON round-trip and does
    /// not shadow a core field.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let key = key.into();
        if is_reserved_key(&key) {
            tracing::debug!(key = %key, "Dropped log attribute with a reserved name");
            return self;
        }
        match encode_extra(&value) {
            Some(value) => {
                self.extra.insert(key, value);
            }
            None => tracing::debug!(key = %key, "Dropped unserialisable log attribute"),
        }
        self
    }

    pub fn is_progress(&self) -> bool {
        is_progress_line(&self.message)
    }
}

/// Encode a value and check that decoding it yields the same value.
pub(crate) fn encode_extra(value: &impl Serialize) -> Option<Value> {
    let encoded = serde_json::to_value(value).ok()?;
    let text = serde_json::to_string(&encoded).ok()?;
    let decoded: Value = serde_json::from_str(&text).ok()?;
    (decoded == encoded).then_some(encoded)
}

//! Record channel between a worker and the server.
//!
//! The worker writes one JSON frame per line to its stdout:
//!
//! ```json
//! {"kind": "record", "timestamp": "2024-03-09T07:05:01+01:00", "level": 20, "logger_name": "downloader", "message": "Downloading a.jpg"}
//! {"kind": "status", "code": 0}
//! ```
//!
//! Record frames may carry additional top-level attributes; they are decoded
//! into [`LogRecord::extra`]. Attributes that cannot be encoded, or whose name
//! collides with a core field, are dropped before transport, never the record
//! itself.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

use crate::logging::record::{encode_extra, is_reserved_key};
use crate::logging::{Level, LogRecord, RecordSink};

/// Logger name for worker output that is not a valid frame.
pub const RAW_OUTPUT_LOGGER: &str = "worker";

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Frame is not a JSON object")]
    NotAnObject,

    #[error("Missing or invalid 'kind' field")]
    InvalidKind,

    #[error("Status frame without an integer 'code'")]
    InvalidStatus,

    #[error("Unknown frame kind: {0}")]
    UnknownKind(String),
}

/// One line on the worker's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Record(LogRecord),
    Status(i32),
}

/// Flat wire representation of a record.
#[derive(Serialize, Deserialize)]
struct WireRecord {
    #[serde(default = "Local::now")]
    timestamp: DateTime<Local>,
    #[serde(with = "severity")]
    level: Level,
    #[serde(default)]
    logger_name: String,
    message: String,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

mod severity {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::logging::Level;

    pub fn serialize<S: Serializer>(level: &Level, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(level.severity())
    }

    /// Out-of-range severities clamp to the nearest known level.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
        let severity = i64::deserialize(deserializer)?;
        Ok(Level::from_severity(severity.clamp(0, u8::MAX.into()) as u8))
    }
}

/// Encode a frame as a single JSON line (without the trailing newline).
pub fn encode(frame: &Frame) -> String {
    let value = match frame {
        Frame::Record(record) => {
            let mut extra = BTreeMap::new();
            for (key, value) in &record.extra {
                if is_reserved_key(key) {
                    debug!(key = %key, "Dropped log attribute with a reserved name");
                    continue;
                }
                match encode_extra(value) {
                    Some(value) => {
                        extra.insert(key.clone(), value);
                    }
                    None => debug!(key = %key, "Dropped log attribute from frame"),
                }
            }
            let wire = WireRecord {
                timestamp: record.timestamp,
                level: record.level,
                logger_name: record.logger_name.clone(),
                message: record.message.clone(),
                extra,
            };
            let mut object = match serde_json::to_value(wire) {
                Ok(Value::Object(object)) => object,
                _ => Map::new(),
            };
            object.insert("kind".to_string(), Value::from("record"));
            Value::Object(object)
        }
        Frame::Status(code) => serde_json::json!({"kind": "status", "code": code}),
    };
    value.to_string()
}

/// Decode a single protocol line.
pub fn decode(line: &str) -> Result<Frame, ChannelError> {
    let Value::Object(mut object) = serde_json::from_str::<Value>(line)? else {
        return Err(ChannelError::NotAnObject);
    };

    let kind = match object.remove("kind") {
        Some(Value::String(kind)) => kind,
        _ => return Err(ChannelError::InvalidKind),
    };

    match kind.as_str() {
        "record" => {
            let wire: WireRecord = serde_json::from_value(Value::Object(object))?;
            let mut record = LogRecord::new(wire.level, wire.logger_name, wire.message)
                .at(wire.timestamp);
            record.extra = wire.extra;
            Ok(Frame::Record(record))
        }
        "status" => {
            let code = object
                .get("code")
                .and_then(Value::as_i64)
                .and_then(|code| i32::try_from(code).ok())
                .ok_or(ChannelError::InvalidStatus)?;
            Ok(Frame::Status(code))
        }
        other => Err(ChannelError::UnknownKind(other.to_string())),
    }
}

/// Outcome of [`RecordReceiver::get`].
#[derive(Debug)]
pub enum Recv {
    Record(LogRecord),
    /// Nothing arrived before the timeout.
    Empty,
    /// The worker closed its end of the channel.
    Closed,
}

/// Consumer end of the record channel.
pub struct RecordReceiver {
    rx: mpsc::UnboundedReceiver<LogRecord>,
}

impl RecordReceiver {
    /// Wait up to `timeout` for the next record.
    pub async fn get(&mut self, timeout: Duration) -> Recv {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(record)) => Recv::Record(record),
            Ok(None) => Recv::Closed,
            Err(_) => Recv::Empty,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// One-shot slot for the worker's final status. Only the first write sticks.
#[derive(Debug, Clone, Default)]
pub struct StatusSlot(Arc<OnceLock<i32>>);

impl StatusSlot {
    pub fn set(&self, code: i32) -> bool {
        self.0.set(code).is_ok()
    }

    pub fn get(&self) -> Option<i32> {
        self.0.get().copied()
    }
}

/// Read frames from a worker's stdout until it closes.
///
/// Records go to the returned receiver in the order they were written, the
/// status goes to `status`. Lines that are not valid frames are kept as plain
/// records so that stray output from a worker is never lost or fatal.
pub fn pump<R>(reader: R, status: StatusSlot) -> (RecordReceiver, tokio::task::JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Worker channel read error");
                    break;
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let record = match decode(trimmed) {
                Ok(Frame::Record(record)) => record,
                Ok(Frame::Status(code)) => {
                    if !status.set(code) {
                        debug!(code, "Ignoring repeated worker status");
                    }
                    continue;
                }
                Err(e) => {
                    debug!(error = %e, "Worker wrote a line that is not a frame");
                    LogRecord::new(Level::Info, RAW_OUTPUT_LOGGER, trimmed)
                }
            };

            if tx.send(record).is_err() {
                break;
            }
        }
    });

    (RecordReceiver { rx }, task)
}

/// Producer end used inside the worker: writes frames to a stream.
pub struct FrameWriter<W: Write + Send> {
    out: Mutex<W>,
}

impl FrameWriter<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> FrameWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn write_frame(&self, frame: &Frame) -> std::io::Result<()> {
        let mut line = encode(frame);
        line.push('\n');

        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        out.write_all(line.as_bytes())?;
        out.flush()
    }

    pub fn send_status(&self, code: i32) -> std::io::Result<()> {
        self.write_frame(&Frame::Status(code))
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl<W: Write + Send + 'static> RecordSink for FrameWriter<W> {
    fn send_record(&self, record: LogRecord) {
        // The parent is gone if stdout is closed; nothing left to report to.
        let _ = self.write_frame(&Frame::Record(record));
    }
}

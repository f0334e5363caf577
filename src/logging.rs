//! Logging for the server and its download workers.
//!
//! Every log line, whether it comes from this process through `tracing` or
//! from a worker through the record channel, ends up as a [`LogRecord`] handed
//! to a [`RecordSink`]:
//!
//! - in the server, the sink is the [`LogWriter`] thread writing the console
//!   and the log file, with progress lines collapsed in place;
//! - in a worker, the sink is the frame writer on stdout, read back by the
//!   job supervisor.

pub mod console;
pub mod file;
pub mod format;
pub mod record;
pub mod writer;

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer};

pub use console::ConsoleSink;
pub use file::FileSink;
pub use format::{render, strip_ansi};
pub use record::{Level, LogRecord, is_progress_line, is_reserved_key};
pub use writer::{LogWriter, Sinks};

/// Target used by the sinks for their own diagnostics.
///
/// Events with this target bypass the sinks and go to stderr, so a failing
/// log file cannot feed its own error messages back into itself.
pub const SINK_TARGET: &str = "gdl_server::sink";

/// Anything that accepts finished log records.
pub trait RecordSink: Send + Sync + 'static {
    fn send_record(&self, record: LogRecord);
}

impl<T: RecordSink + ?Sized> RecordSink for Arc<T> {
    fn send_record(&self, record: LogRecord) {
        (**self).send_record(record);
    }
}

/// Configuration for the logging system.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// Minimum level for this crate's own events.
    pub level: Level,
}

/// Initialize the tracing subscriber, routing events into `sink`.
///
/// The level can be overridden at runtime via the `RUST_LOG` environment variable.
///
/// # Examples
///
/// ```ignore
/// let writer = LogWriter::spawn(Sinks::new().with_console(std::io::stdout()))?;
/// gdl_server::logging::init(LogConfig::default(), writer.clone())?;
/// ```
pub fn init(config: LogConfig, sink: impl RecordSink) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "gdl_server={}",
            config.level.as_filter_directive()
        ))
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(SinkLayer::new(sink))
        .try_init()
}

/// Layer converting tracing events into log records.
pub struct SinkLayer<K> {
    sink: K,
}

impl<K: RecordSink> SinkLayer<K> {
    pub fn new(sink: K) -> Self {
        Self { sink }
    }
}

impl<S, K> Layer<S> for SinkLayer<K>
where
    S: Subscriber,
    K: RecordSink,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();

        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let level = Level::from(metadata.level());
        let message = visitor.rendered_message();

        if metadata.target() == SINK_TARGET {
            eprintln!("[{level}] {message}");
            return;
        }

        let mut record = LogRecord::new(level, metadata.target(), message);
        // Fields named like a core field stay in the rendered message only.
        for (key, value) in visitor.fields {
            if !is_reserved_key(key) {
                record = record.with_extra(key, value);
            }
        }
        self.sink.send_record(record);
    }
}

/// Collects the message and structured fields of an event.
#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields: Vec<(&'static str, String)>,
}

impl RecordVisitor {
    /// The message followed by `key=value` pairs, as the fmt layer prints them.
    fn rendered_message(&self) -> String {
        let mut out = self.message.clone();
        for (key, value) in &self.fields {
            if !out.is_empty() {
                out.push(' ');
            }
            let _ = write!(out, "{key}={value}");
        }
        out
    }
}

impl Visit for RecordVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push((field.name(), format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name(), value.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<LogRecord>>);

    impl RecordSink for Collect {
        fn send_record(&self, record: LogRecord) {
            self.0.lock().unwrap().push(record);
        }
    }

    #[test]
    fn layer_turns_events_into_records() {
        let sink = Arc::new(Collect::default());
        let subscriber = tracing_subscriber::registry().with(SinkLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(url = %"https://example.com/a", "Queued download");
            tracing::info!("plain message");
        });

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].level, Level::Warning);
        assert_eq!(records[0].message, "Queued download url=https://example.com/a");
        assert_eq!(records[0].extra["url"], "https://example.com/a");
        assert_eq!(records[0].logger_name, module_path!());
        assert_eq!(records[1].message, "plain message");
    }

    #[test]
    fn fields_named_like_core_fields_stay_in_the_message() {
        let sink = Arc::new(Collect::default());
        let subscriber = tracing_subscriber::registry().with(SinkLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(level = 3, logger_name = "x", "Worker failed");
        });

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, Level::Error);
        assert_eq!(records[0].message, "Worker failed level=3 logger_name=x");
        assert!(records[0].extra.is_empty());
    }

    #[test]
    fn sink_diagnostics_bypass_the_sink() {
        let sink = Arc::new(Collect::default());
        let subscriber = tracing_subscriber::registry().with(SinkLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::debug!(target: SINK_TARGET, "rewrite failed");
        });

        assert!(sink.0.lock().unwrap().is_empty());
    }
}

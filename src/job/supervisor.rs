//! Draining a worker's records into the server's log.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::channel::Recv;
use super::models::{DownloadJob, JobStatus};
use crate::logging::{Level, LogRecord, RecordSink};

/// Logger name used for the supervisor's own records about a job.
pub const SUPERVISOR_LOGGER: &str = "gdl_server::job";

/// Message the downloader prints when it is stuck waiting on a live stream.
pub const VIDEO_UNAVAILABLE_MARKER: &str = "Video should already be available";

/// Decides whether a record means the worker will never finish on its own.
pub trait FatalPredicate: Send + Sync {
    fn is_fatal(&self, record: &LogRecord) -> bool;
}

impl<F> FatalPredicate for F
where
    F: Fn(&LogRecord) -> bool + Send + Sync,
{
    fn is_fatal(&self, record: &LogRecord) -> bool {
        self(record)
    }
}

/// Matches records whose message contains any of the configured markers.
#[derive(Debug, Clone)]
pub struct MarkerPredicate {
    markers: Vec<String>,
}

impl MarkerPredicate {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(Into::<String>::into)
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }
}

impl Default for MarkerPredicate {
    fn default() -> Self {
        Self::new([VIDEO_UNAVAILABLE_MARKER])
    }
}

impl FatalPredicate for MarkerPredicate {
    fn is_fatal(&self, record: &LogRecord) -> bool {
        self.markers.iter().any(|m| record.message.contains(m.as_str()))
    }
}

pub struct Supervisor {
    sink: Arc<dyn RecordSink>,
    min_level: Level,
    predicate: Box<dyn FatalPredicate>,
    poll_interval: Duration,
}

impl Supervisor {
    pub fn new(sink: Arc<dyn RecordSink>, min_level: Level) -> Self {
        Self {
            sink,
            min_level,
            predicate: Box::new(MarkerPredicate::default()),
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_predicate(mut self, predicate: impl FatalPredicate + 'static) -> Self {
        self.predicate = Box::new(predicate);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Forward the job's records until the worker is done, then report how
    /// it ended.
    pub async fn run(&self, mut job: DownloadJob) -> JobStatus {
        debug!(
            job_id = %job.id,
            pid = ?job.handle.pid(),
            url = %job.url,
            "Supervising download"
        );

        loop {
            match job.handle.next_record(self.poll_interval).await {
                Recv::Record(record) => {
                    let fatal = self.predicate.is_fatal(&record);
                    if record.level >= self.min_level {
                        self.sink.send_record(record);
                    }
                    if fatal {
                        self.report(
                            Level::Warning,
                            "Terminating process as video is not available",
                        );
                        if let Err(e) = job.handle.kill() {
                            debug!(job_id = %job.id, error = %e, "Failed to kill worker");
                        }
                    }
                }
                Recv::Empty => {
                    if !job.handle.is_alive() && !job.handle.has_pending() {
                        break;
                    }
                }
                Recv::Closed => break,
            }
        }

        let status = job.handle.join().await;
        info!(job_id = %job.id, code = ?status.code, forced = status.forced, "Download finished");

        if status.is_success() {
            self.report(Level::Info, "Download process exited successfully");
        } else if status.forced {
            self.report(Level::Error, "Download process was terminated before completion");
        } else {
            let code = status
                .code
                .map_or_else(|| "unknown".to_string(), |code| code.to_string());
            self.report(Level::Error, &format!("Download failed with exit code: {code}"));
        }

        status
    }

    fn report(&self, level: Level, message: &str) {
        self.sink
            .send_record(LogRecord::new(level, SUPERVISOR_LOGGER, message));
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::job::launcher::JobHandle;
    use crate::job::models::RequestOptions;
    use std::sync::Mutex;
    use tokio::process::Command;

    #[derive(Default)]
    struct Collect(Mutex<Vec<LogRecord>>);

    impl RecordSink for Collect {
        fn send_record(&self, record: LogRecord) {
            self.0.lock().unwrap().push(record);
        }
    }

    impl Collect {
        fn messages(&self) -> Vec<String> {
            self.0.lock().unwrap().iter().map(|r| r.message.clone()).collect()
        }
    }

    fn frame(level: u8, message: &str) -> String {
        format!(
            r#"echo '{{"kind":"record","level":{level},"logger_name":"test","message":"{message}"}}'"#
        )
    }

    fn job(script: &str) -> DownloadJob {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        DownloadJob::new(
            "https://example.com/a",
            RequestOptions::default(),
            JobHandle::spawn(cmd).unwrap(),
        )
    }

    fn supervisor(sink: &Arc<Collect>, min_level: Level) -> Supervisor {
        Supervisor::new(sink.clone(), min_level).with_poll_interval(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn forwards_records_in_order_and_reports_success() {
        let sink = Arc::new(Collect::default());
        let script = [
            frame(20, "Downloading a.jpg"),
            frame(20, "[100%] 1.2MB/s"),
            frame(20, "[100%] 1.2MB/s"),
            frame(20, "[100%] 1.2MB/s"),
            r#"echo '{"kind":"status","code":0}'"#.to_string(),
        ]
        .join("; ");

        let status = supervisor(&sink, Level::Info).run(job(&script)).await;

        assert!(status.is_success());
        assert_eq!(
            sink.messages(),
            vec![
                "Downloading a.jpg",
                "[100%] 1.2MB/s",
                "[100%] 1.2MB/s",
                "[100%] 1.2MB/s",
                "Download process exited successfully",
            ]
        );
    }

    #[tokio::test]
    async fn drops_records_below_threshold() {
        let sink = Arc::new(Collect::default());
        let script = [frame(10, "noise"), frame(30, "careful")].join("; ");

        supervisor(&sink, Level::Warning).run(job(&script)).await;

        let messages = sink.messages();
        assert_eq!(messages[0], "careful");
        assert!(!messages.iter().any(|m| m == "noise"));
    }

    #[tokio::test]
    async fn reports_failure_exit_code() {
        let sink = Arc::new(Collect::default());
        let status = supervisor(&sink, Level::Info).run(job("exit 3")).await;

        assert_eq!(status.code, Some(3));
        let records = sink.0.lock().unwrap();
        let last = records.last().unwrap();
        assert_eq!(last.level, Level::Error);
        assert_eq!(last.message, "Download failed with exit code: 3");
    }

    #[tokio::test]
    async fn fatal_marker_kills_worker() {
        let sink = Arc::new(Collect::default());
        let script = format!(
            "{}; sleep 30; {}",
            frame(40, "ERROR: Video should already be available"),
            frame(20, "never")
        );

        let status = tokio::time::timeout(
            Duration::from_secs(10),
            supervisor(&sink, Level::Info).run(job(&script)),
        )
        .await
        .unwrap();

        assert!(status.forced);
        let messages = sink.messages();
        assert!(messages.contains(&"Terminating process as video is not available".to_string()));
        assert_eq!(
            messages.last().unwrap(),
            "Download process was terminated before completion"
        );
        assert!(!messages.contains(&"never".to_string()));
    }

    #[tokio::test]
    async fn custom_predicate_is_used() {
        let sink = Arc::new(Collect::default());
        let script = format!("{}; sleep 30", frame(20, "stuck forever"));

        let status = supervisor(&sink, Level::Info)
            .with_predicate(|r: &LogRecord| r.message.contains("stuck"))
            .run(job(&script))
            .await;

        assert!(status.forced);
    }

    #[test]
    fn marker_predicate_ignores_empty_markers() {
        let predicate = MarkerPredicate::new(["", "boom"]);
        assert!(!predicate.is_fatal(&LogRecord::new(Level::Info, "t", "all fine")));
        assert!(predicate.is_fatal(&LogRecord::new(Level::Info, "t", "went boom")));
    }
}

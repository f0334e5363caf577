//! Download jobs: one isolated worker process per submitted URL.

pub mod channel;
pub mod launcher;
pub mod models;
pub mod supervisor;
pub mod worker;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info};

pub use launcher::{JobError, JobHandle, Launcher};
pub use models::{DownloadJob, DownloadMode, JobStatus, RequestOptions};
pub use supervisor::{FatalPredicate, MarkerPredicate, Supervisor};

/// Starts jobs and supervises each one in its own task.
pub struct JobRunner {
    launcher: Launcher,
    supervisor: Arc<Supervisor>,
}

impl JobRunner {
    pub fn new(launcher: Launcher, supervisor: Supervisor) -> Self {
        Self {
            launcher,
            supervisor: Arc::new(supervisor),
        }
    }

    /// Run a download in the background. Returns immediately.
    pub fn submit(&self, url: String, options: RequestOptions) -> JoinHandle<Option<JobStatus>> {
        let launcher = self.launcher.clone();
        let supervisor = self.supervisor.clone();

        tokio::spawn(async move {
            let handle = match launcher.start(&url, &options) {
                Ok(handle) => handle,
                Err(e) => {
                    error!(url = %url, "Failed to start download: {e}");
                    return None;
                }
            };

            let job = DownloadJob::new(url, options, handle);
            info!(job_id = %job.id, url = %job.url, mode = %job.options.mode, "Started download");
            Some(supervisor.run(job).await)
        })
    }
}

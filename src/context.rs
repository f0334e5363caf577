use std::sync::Arc;

use crate::config::AppConfig;
use crate::job::JobRunner;
use crate::logging::LogWriter;
use crate::shutdown::ShutdownCoordinator;
use crate::web::registry::ConnectionRegistry;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub log_writer: LogWriter,
    pub registry: ConnectionRegistry,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub jobs: Arc<JobRunner>,
}

impl AppContext {
    pub fn new(config: AppConfig, log_writer: LogWriter, jobs: JobRunner) -> Self {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let registry = ConnectionRegistry::new(shutdown.token());

        Self {
            config: Arc::new(config),
            log_writer,
            registry,
            shutdown,
            jobs: Arc::new(jobs),
        }
    }
}

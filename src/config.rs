use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::job::DownloadMode;
use crate::job::supervisor::VIDEO_UNAVAILABLE_MARKER;
use crate::logging::Level;

/// Config file read from the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "gdl-server.toml";

/// Prefix for environment overrides, e.g. `GDL_SERVER_DOWNLOADER__PROGRAM`.
pub const ENV_PREFIX: &str = "GDL_SERVER_";

pub const LOG_FILE_NAME: &str = "app.log";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: Level,
    /// How often live tails check the log file for changes.
    pub tail_interval_ms: u64,
    /// Where to copy the log file on shutdown. Disabled when unset.
    pub archive_dir: Option<PathBuf>,
    pub downloader: DownloaderConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9080,
            log_dir: PathBuf::from("logs"),
            log_level: Level::Info,
            tail_interval_ms: 100,
            archive_dir: None,
            downloader: DownloaderConfig::default(),
        }
    }
}

impl AppConfig {
    /// Layer defaults, the config file, the environment and CLI overrides,
    /// later layers winning.
    pub fn new<T: Serialize>(
        overrides: Option<&T>,
        config_file: Option<&Path>,
    ) -> Result<Self, figment::Error> {
        let file = config_file.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment.extract()
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join(LOG_FILE_NAME)
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address {addr}: {e}"))
    }

    pub fn tail_interval(&self) -> Duration {
        Duration::from_millis(self.tail_interval_ms.max(10))
    }
}

/// The external program doing the actual downloading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    pub program: String,
    /// Passed before the URL on every run.
    pub args: Vec<String>,
    /// Output that means the download will never finish on its own.
    pub fatal_markers: Vec<String>,
    pub modes: ModeArgs,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            program: "gallery-dl".to_string(),
            args: Vec::new(),
            fatal_markers: vec![VIDEO_UNAVAILABLE_MARKER.to_string()],
            modes: ModeArgs::default(),
        }
    }
}

/// Extra downloader arguments for each request mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeArgs {
    pub download_video: Vec<String>,
    pub extract_audio: Vec<String>,
}

impl Default for ModeArgs {
    fn default() -> Self {
        Self {
            download_video: Vec::new(),
            extract_audio: vec![
                "-o".to_string(),
                r#"extractor.ytdl.cmdline-args=["--extract-audio"]"#.to_string(),
            ],
        }
    }
}

impl ModeArgs {
    pub fn args_for(&self, mode: DownloadMode) -> &[String] {
        match mode {
            DownloadMode::NoneSelected => &[],
            DownloadMode::DownloadVideo => &self.download_video,
            DownloadMode::ExtractAudio => &self.extract_audio,
        }
    }
}

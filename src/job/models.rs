use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::launcher::JobHandle;

/// Media handling requested for a download.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadMode {
    #[default]
    NoneSelected,
    DownloadVideo,
    ExtractAudio,
}

impl DownloadMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoneSelected => "none-selected",
            Self::DownloadVideo => "download-video",
            Self::ExtractAudio => "extract-audio",
        }
    }
}

impl fmt::Display for DownloadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown download mode: {0}")]
pub struct ParseModeError(String);

impl FromStr for DownloadMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "none-selected" => Ok(Self::NoneSelected),
            "download-video" => Ok(Self::DownloadVideo),
            "extract-audio" => Ok(Self::ExtractAudio),
            other => Err(ParseModeError(other.to_string())),
        }
    }
}

/// Options submitted alongside a URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOptions {
    #[serde(rename = "video-options", default)]
    pub mode: DownloadMode,
}

impl fmt::Display for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{'video-options': '{}'}}", self.mode)
    }
}

/// Final outcome of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStatus {
    /// Reported status, or the process exit code if none was reported.
    pub code: Option<i32>,
    /// The worker was killed before it finished on its own.
    pub forced: bool,
}

impl JobStatus {
    pub fn is_success(&self) -> bool {
        !self.forced && self.code == Some(0)
    }
}

/// One submitted download and the worker running it.
pub struct DownloadJob {
    pub id: Uuid,
    pub url: String,
    pub options: RequestOptions,
    pub handle: JobHandle,
}

impl DownloadJob {
    pub fn new(url: impl Into<String>, options: RequestOptions, handle: JobHandle) -> Self {
        Self {
            id: Uuid::now_v7(),
            url: url.into(),
            options,
            handle,
        }
    }
}

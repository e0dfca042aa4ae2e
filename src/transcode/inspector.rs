//! Source metadata extraction.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use transcoder_av::{MediaInfo, MediaSummary};

use super::identity::SourceDescriptor;
use crate::error::{Result, TranscodeError};

/// Reads metadata from a source file without modifying it.
pub trait MediaInspector: Send + Sync {
    /// Name identifying this implementation in logs.
    fn name(&self) -> &'static str;

    /// Probe `path`.
    ///
    /// # Errors
    ///
    /// [`TranscodeError::SourceUnavailable`] if the file cannot be read,
    /// [`TranscodeError::ProbeError`] if it cannot be interpreted.
    fn inspect(&self, path: &Path) -> Result<MediaInfo>;

    /// Full metadata, or the reduced summary when `summary` is set.
    fn file_info(&self, path: &Path, summary: bool) -> Result<FileInfo> {
        let info = self.inspect(path)?;
        Ok(if summary {
            FileInfo::Summary(info.summary())
        } else {
            FileInfo::Full(info)
        })
    }
}

/// Result of [`MediaInspector::file_info`].
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum FileInfo {
    Full(MediaInfo),
    Summary(MediaSummary),
}

/// [`MediaInspector`] backed by an `ffprobe` executable.
#[derive(Debug, Clone)]
pub struct FfprobeInspector {
    ffprobe: PathBuf,
    timeout: Option<Duration>,
}

impl FfprobeInspector {
    pub fn new(ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
            timeout: None,
        }
    }

    /// Kill ffprobe once it has run for `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn ffprobe(&self) -> &Path {
        &self.ffprobe
    }
}

impl MediaInspector for FfprobeInspector {
    fn name(&self) -> &'static str {
        "ffprobe"
    }

    fn inspect(&self, path: &Path) -> Result<MediaInfo> {
        let source = SourceDescriptor::resolve(path)?;

        transcoder_av::probe::probe_with_ffprobe(&self.ffprobe, source.path(), self.timeout)
            .map_err(|e| match e {
                transcoder_av::Error::FileNotFound { .. } => TranscodeError::source_unavailable(
                    path,
                    std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()),
                ),
                other => TranscodeError::ProbeError {
                    path: path.to_path_buf(),
                    message: other.to_string(),
                },
            })
    }
}

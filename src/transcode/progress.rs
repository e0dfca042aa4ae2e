//! Progress records of in-flight generations.
//!
//! One JSON sidecar per digest under the progress directory, replaced
//! atomically on every write so concurrent readers in other processes always
//! see a whole record. Terminal records are kept after the run so a finished
//! key can be told apart from an unknown one; the next attempt overwrites them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::identity::ArtifactKey;
use crate::error::{Result, TranscodeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    /// Claimed, codec not started yet.
    Pending,
    Running,
    Complete,
    Failed,
}

impl ProgressStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Artifact digest.
    pub key: String,
    /// Artifact file name.
    pub artifact: String,
    pub status: ProgressStatus,
    /// 0..=100
    pub percent: u8,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProgressTracker {
    dir: PathBuf,
}

impl ProgressTracker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, digest: &str) -> PathBuf {
        self.dir.join(format!("{}.json", digest))
    }

    /// Open a new attempt for `key`, replacing any earlier record.
    pub fn start(&self, key: &ArtifactKey) -> Result<()> {
        self.write(key, ProgressStatus::Pending, 0)
    }

    /// Record `percent` (clamped to 100) for a running attempt.
    pub fn update(&self, key: &ArtifactKey, percent: u8) -> Result<()> {
        self.write(key, ProgressStatus::Running, percent.min(100))
    }

    /// Close the attempt. A failed attempt keeps its last percentage.
    pub fn finish(&self, key: &ArtifactKey, success: bool) -> Result<()> {
        if success {
            return self.write(key, ProgressStatus::Complete, 100);
        }
        let percent = self.read(key)?.map(|r| r.percent).unwrap_or(0);
        self.write(key, ProgressStatus::Failed, percent)
    }

    /// Current record of `key`; `None` if no attempt was ever recorded.
    pub fn read(&self, key: &ArtifactKey) -> Result<Option<ProgressRecord>> {
        self.read_digest(key.digest())
    }

    /// Current record by digest.
    pub fn read_digest(&self, digest: &str) -> Result<Option<ProgressRecord>> {
        let data = match fs::read(self.record_path(digest)) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = serde_json::from_slice(&data)
            .map_err(|e| TranscodeError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        Ok(Some(record))
    }

    fn write(&self, key: &ArtifactKey, status: ProgressStatus, percent: u8) -> Result<()> {
        let record = ProgressRecord {
            key: key.digest().to_string(),
            artifact: key.file_name(),
            status,
            percent,
            updated_at: Utc::now(),
        };
        let json = serde_json::to_vec(&record).map_err(io::Error::from)?;

        fs::create_dir_all(&self.dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&json)?;
        tmp.persist(self.record_path(key.digest()))
            .map_err(|e| TranscodeError::Io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcode::{KeyBuilder, OptionNormalizer, OutputKind, RawOptions, SourceDescriptor};

    fn key_for(dir: &Path) -> ArtifactKey {
        let source = dir.join("song.wav");
        fs::write(&source, b"pcm").unwrap();
        let opts = OptionNormalizer::new()
            .normalize(OutputKind::Audio, &RawOptions::new())
            .unwrap();
        KeyBuilder::default().derive(&SourceDescriptor::resolve(&source).unwrap(), &opts)
    }

    #[test]
    fn test_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let key = key_for(dir.path());
        let tracker = ProgressTracker::new(dir.path().join(".progress"));

        assert_eq!(tracker.read(&key).unwrap(), None);

        tracker.start(&key).unwrap();
        let record = tracker.read(&key).unwrap().unwrap();
        assert_eq!(record.status, ProgressStatus::Pending);
        assert_eq!(record.percent, 0);
        assert_eq!(record.key, key.digest());
        assert_eq!(record.artifact, key.file_name());

        tracker.update(&key, 45).unwrap();
        let record = tracker.read_digest(key.digest()).unwrap().unwrap();
        assert_eq!(record.status, ProgressStatus::Running);
        assert_eq!(record.percent, 45);

        tracker.finish(&key, true).unwrap();
        let record = tracker.read(&key).unwrap().unwrap();
        assert_eq!(record.status, ProgressStatus::Complete);
        assert_eq!(record.percent, 100);
        assert!(record.status.is_terminal());
    }

    #[test]
    fn test_failure_keeps_percent_and_retry_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let key = key_for(dir.path());
        let tracker = ProgressTracker::new(dir.path().join(".progress"));

        tracker.start(&key).unwrap();
        tracker.update(&key, 150).unwrap();
        assert_eq!(tracker.read(&key).unwrap().unwrap().percent, 100);
        tracker.update(&key, 30).unwrap();
        tracker.finish(&key, false).unwrap();

        let record = tracker.read(&key).unwrap().unwrap();
        assert_eq!(record.status, ProgressStatus::Failed);
        assert_eq!(record.percent, 30);

        tracker.start(&key).unwrap();
        assert_eq!(
            tracker.read(&key).unwrap().unwrap().status,
            ProgressStatus::Pending
        );
    }

    #[test]
    fn test_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = ProgressTracker::new(dir.path());
        fs::write(dir.path().join("abcdef0123456789.json"), b"{not json").unwrap();
        assert!(tracker.read_digest("abcdef0123456789").is_err());
    }

    #[test]
    fn test_record_json_shape() {
        let record = ProgressRecord {
            key: "ab".into(),
            artifact: "clip_mp4_ab.mp4".into(),
            status: ProgressStatus::Running,
            percent: 45,
            updated_at: Utc::now(),
        };
        let json: serde_json::Value = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["percent"], 45);
    }
}

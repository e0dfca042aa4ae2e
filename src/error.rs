//! Error taxonomy of the transcoding engine.
//!
//! Only caller-input errors ([`TranscodeError::InvalidOptions`],
//! [`TranscodeError::SourceUnavailable`]) escape the URL operations. Generation
//! time failures are logged and degrade to the empty "not available yet" result.

use std::path::PathBuf;

/// Result type alias using the engine error.
pub type Result<T> = std::result::Result<T, TranscodeError>;

/// Errors produced by the transcoding engine.
#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    /// Options are missing, malformed or out of range.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// The source file does not exist or cannot be read.
    #[error("source unavailable: {}: {source}", path.display())]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Metadata extraction failed.
    #[error("probe failed for {}: {message}", path.display())]
    ProbeError { path: PathBuf, message: String },

    /// The codec process failed, timed out or produced no output.
    #[error("generation of {artifact} failed: {reason}")]
    GenerationFailure { artifact: String, reason: String },

    /// Publishing a finished artifact into the store failed.
    #[error("failed to publish {artifact}: {source}")]
    StoreWriteError {
        artifact: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Filesystem failure in the engine's own bookkeeping.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TranscodeError {
    /// Create an InvalidOptions error.
    pub fn invalid_options(msg: impl Into<String>) -> Self {
        Self::InvalidOptions(msg.into())
    }

    /// Create a SourceUnavailable error.
    pub fn source_unavailable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::SourceUnavailable {
            path: path.into(),
            source,
        }
    }

    /// Create a GenerationFailure error.
    pub fn generation(artifact: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::GenerationFailure {
            artifact: artifact.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error is the caller's fault (bad request) rather than a
    /// transient generation problem.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidOptions(_) | Self::SourceUnavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TranscodeError::invalid_options("bitrate must be positive");
        assert_eq!(err.to_string(), "invalid options: bitrate must be positive");

        let err = TranscodeError::source_unavailable(
            "/media/missing.mp4",
            std::io::Error::new(std::io::ErrorKind::NotFound, "No such file"),
        );
        assert_eq!(
            err.to_string(),
            "source unavailable: /media/missing.mp4: No such file"
        );

        let err = TranscodeError::generation("clip_mp4_ab12.mp4", "exit status 1");
        assert_eq!(
            err.to_string(),
            "generation of clip_mp4_ab12.mp4 failed: exit status 1"
        );
    }

    #[test]
    fn test_client_errors() {
        assert!(TranscodeError::invalid_options("x").is_client_error());
        assert!(TranscodeError::source_unavailable(
            "/a",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone")
        )
        .is_client_error());
        assert!(!TranscodeError::generation("a", "b").is_client_error());
        assert!(!TranscodeError::ProbeError {
            path: "/a".into(),
            message: "corrupt".into()
        }
        .is_client_error());
        assert!(!TranscodeError::Io(std::io::Error::other("disk")).is_client_error());
    }
}

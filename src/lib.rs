//! Transcoder - on-demand, cached media transcoding
//!
//! Callers ask for the URL of a video, audio, GIF or thumbnail rendition of a
//! source file. A cached artifact is returned at once; a missing one is
//! generated with ffmpeg under a cross-process lease, with progress recorded
//! on disk for other callers to poll.
//!
//! This library crate exposes the engine for the CLI and integration tests.

pub mod config;
pub mod error;
pub mod transcode;

pub use error::{Result, TranscodeError};
pub use transcode::{Generate, OutputKind, TranscodeCoordinator};

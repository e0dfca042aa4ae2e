//! # transcoder-av
//!
//! External codec tool plumbing for the transcoder engine.
//!
//! This crate knows nothing about caching or artifact identity. It provides:
//! - Tool discovery for `ffmpeg`/`ffprobe`
//! - Probing media files with `ffprobe` into [`MediaInfo`]
//! - A builder for `ffmpeg` command lines ([`FfmpegCommand`])
//! - Parsing of `ffmpeg -progress` output ([`ProgressParser`])
//! - A supervised runner that streams progress, enforces a timeout and kills
//!   the process when it is exceeded ([`FfmpegRunner`])
//!
//! ## Features
//!
//! - `tracing` - Enable tracing support
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::time::Duration;
//! use transcoder_av::{get_tool_path, probe::probe_with_ffprobe};
//!
//! let ffprobe = get_tool_path("ffprobe", None)?;
//! let info = probe_with_ffprobe(&ffprobe, Path::new("/path/to/video.mp4"), Some(Duration::from_secs(30)))?;
//! println!("Container: {}", info.container);
//! if let Some(video) = info.primary_video() {
//!     println!("{}x{}", video.width, video.height);
//! }
//! # Ok::<(), transcoder_av::Error>(())
//! ```

pub mod command;
mod error;
pub mod probe;
pub mod progress;
pub mod runner;
pub mod tools;

// Re-exports
pub use command::FfmpegCommand;
pub use error::{Error, Result};
pub use probe::{AudioTrack, MediaInfo, MediaSummary, VideoTrack};
pub use progress::{FfmpegProgress, ProgressParser};
pub use runner::{FfmpegRunner, RunEvent};
pub use tools::{check_tool, check_tool_with_arg, get_tool_path, require_tool, ToolInfo};

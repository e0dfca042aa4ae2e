//! Media information types.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Information about a media file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    /// Path to the media file.
    pub file_path: PathBuf,
    /// File size in bytes.
    pub file_size: u64,
    /// Container format as reported by ffprobe (e.g., "mov,mp4,m4a,3gp,3g2,mj2").
    pub container: String,
    /// Duration of the media.
    pub duration: Option<Duration>,
    /// Overall bit rate in bits per second.
    pub bit_rate: Option<u64>,
    /// Video tracks in the file.
    pub video_tracks: Vec<VideoTrack>,
    /// Audio tracks in the file.
    pub audio_tracks: Vec<AudioTrack>,
}

/// Information about a video track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoTrack {
    /// Track index among video tracks.
    pub index: u32,
    /// Video codec (e.g., "h264", "vp8").
    pub codec: String,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Frame rate in FPS.
    pub frame_rate: Option<f64>,
    /// Bit rate in bits per second.
    pub bit_rate: Option<u64>,
}

/// Information about an audio track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioTrack {
    /// Track index among audio tracks.
    pub index: u32,
    /// Audio codec (e.g., "aac", "mp3").
    pub codec: String,
    /// Number of channels.
    pub channels: u32,
    /// Sample rate in Hz.
    pub sample_rate: Option<u32>,
    /// Bit rate in bits per second.
    pub bit_rate: Option<u64>,
    /// Language code (e.g., "eng", "spa").
    pub language: Option<String>,
}

/// Reduced view of a [`MediaInfo`]: the primary streams only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSummary {
    pub file_name: String,
    pub container: String,
    pub file_size: u64,
    pub duration_secs: Option<f64>,
    pub bit_rate: Option<u64>,
    pub video: Option<VideoSummary>,
    pub audio: Option<AudioSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSummary {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Option<f64>,
    pub bit_rate: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSummary {
    pub codec: String,
    pub channels: u32,
    pub sample_rate: Option<u32>,
    pub bit_rate: Option<u64>,
}

impl MediaInfo {
    /// Get the primary (first) video track.
    pub fn primary_video(&self) -> Option<&VideoTrack> {
        self.video_tracks.first()
    }

    /// Get the primary (first) audio track.
    pub fn primary_audio(&self) -> Option<&AudioTrack> {
        self.audio_tracks.first()
    }

    /// Source dimensions of the primary video track, if it has any.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.primary_video()
            .filter(|v| v.width > 0 && v.height > 0)
            .map(|v| (v.width, v.height))
    }

    /// Build the reduced summary view.
    pub fn summary(&self) -> MediaSummary {
        MediaSummary {
            file_name: self
                .file_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            container: self.container.clone(),
            file_size: self.file_size,
            duration_secs: self.duration.map(|d| d.as_secs_f64()),
            bit_rate: self.bit_rate,
            video: self.primary_video().map(|v| VideoSummary {
                codec: v.codec.clone(),
                width: v.width,
                height: v.height,
                frame_rate: v.frame_rate,
                bit_rate: v.bit_rate,
            }),
            audio: self.primary_audio().map(|a| AudioSummary {
                codec: a.codec.clone(),
                channels: a.channels,
                sample_rate: a.sample_rate,
                bit_rate: a.bit_rate,
            }),
        }
    }
}

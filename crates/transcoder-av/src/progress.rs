//! FFmpeg `-progress` output parsing.
//!
//! With `-progress pipe:1` ffmpeg prints blocks of `key=value` lines, each
//! block terminated by a `progress=continue` or `progress=end` line.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Progress snapshot from FFmpeg.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FfmpegProgress {
    /// Current frame number
    pub frame: u64,
    /// Current FPS
    pub fps: f64,
    /// Output position in microseconds
    pub out_time_us: u64,
    /// Encoding speed (e.g., 1.5 = 1.5x realtime)
    pub speed: f64,
    /// Whether encoding is complete
    pub is_complete: bool,
}

impl FfmpegProgress {
    /// Output position.
    pub fn out_time(&self) -> Duration {
        Duration::from_micros(self.out_time_us)
    }

    /// Calculate whole-number percent complete given the total duration.
    ///
    /// Returns `None` when the total is unknown or zero; the result never
    /// exceeds 100.
    pub fn percent_of(&self, total: Option<Duration>) -> Option<u8> {
        let total = total?.as_micros();
        if total == 0 {
            return None;
        }
        let pct = (u128::from(self.out_time_us) * 100 / total).min(100);
        Some(pct as u8)
    }
}

/// Incremental parser for ffmpeg progress lines.
#[derive(Debug, Default)]
pub struct ProgressParser {
    current: FfmpegProgress,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns a snapshot when the line closes a block.
    pub fn feed(&mut self, line: &str) -> Option<FfmpegProgress> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();

        match key.trim() {
            "frame" => self.current.frame = value.parse().unwrap_or(self.current.frame),
            "fps" => self.current.fps = value.parse().unwrap_or(self.current.fps),
            "out_time_us" => {
                if let Ok(us) = value.parse() {
                    self.current.out_time_us = us;
                }
            }
            // Despite its name ffmpeg reports microseconds here too
            "out_time_ms" => {
                if let Ok(us) = value.parse() {
                    self.current.out_time_us = us;
                }
            }
            "out_time" => {
                if let Some(us) = parse_timestamp_us(value) {
                    self.current.out_time_us = us;
                }
            }
            "speed" => {
                if let Ok(speed) = value.trim_end_matches('x').trim().parse() {
                    self.current.speed = speed;
                }
            }
            "progress" => {
                self.current.is_complete = value == "end";
                return Some(self.current.clone());
            }
            _ => {}
        }

        None
    }
}

/// Parse `HH:MM:SS.micro` into microseconds.
fn parse_timestamp_us(value: &str) -> Option<u64> {
    let mut parts = value.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !(0.0..60.0).contains(&seconds) {
        return None;
    }
    Some((hours * 3600 + minutes * 60) * 1_000_000 + (seconds * 1_000_000.0).round() as u64)
}

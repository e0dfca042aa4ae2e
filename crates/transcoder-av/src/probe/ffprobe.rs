//! FFprobe-based media probing.

use super::types::*;
use crate::{Error, Result};
use serde::Deserialize;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const WAIT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: String,
    duration: Option<String>,
    size: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    bit_rate: Option<String>,
    channels: Option<u32>,
    sample_rate: Option<String>,
    #[serde(default)]
    tags: FfprobeTags,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeTags {
    language: Option<String>,
}

/// Probe a media file using the ffprobe executable at `ffprobe`.
///
/// With a `timeout`, an ffprobe that has not exited by then is killed and
/// [`Error::Timeout`] is returned.
pub fn probe_with_ffprobe(
    ffprobe: &Path,
    path: &Path,
    timeout: Option<Duration>,
) -> Result<MediaInfo> {
    if !path.exists() {
        return Err(Error::file_not_found(path));
    }

    let mut child = Command::new(ffprobe)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::tool_not_found(ffprobe.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;

    let stdout = child.stdout.take().map(read_to_end);
    let stderr = child.stderr.take().map(read_to_end);

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if let Some(timeout) = timeout {
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::Timeout {
                    tool: "ffprobe".to_string(),
                    elapsed,
                });
            }
        }
        thread::sleep(WAIT_POLL);
    };

    let collect = |reader: Option<JoinHandle<Vec<u8>>>| {
        reader.and_then(|h| h.join().ok()).unwrap_or_default()
    };
    let stdout = collect(stdout);
    let stderr = collect(stderr);

    if !status.success() {
        let stderr = String::from_utf8_lossy(&stderr);
        return Err(Error::tool_failed("ffprobe", stderr.trim().to_string()));
    }

    let json_str = String::from_utf8(stdout)
        .map_err(|e| Error::parse_error("ffprobe", format!("Invalid UTF-8: {}", e)))?;

    parse_ffprobe_json(path, &json_str)
}

fn read_to_end(mut pipe: impl Read + Send + 'static) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

/// Parse the JSON document printed by `ffprobe -show_format -show_streams`.
pub fn parse_ffprobe_json(path: &Path, json: &str) -> Result<MediaInfo> {
    let output: FfprobeOutput = serde_json::from_str(json)?;
    Ok(parse_ffprobe_output(path, output))
}

fn parse_ffprobe_output(path: &Path, output: FfprobeOutput) -> MediaInfo {
    let duration = output
        .format
        .duration
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64);

    let mut info = MediaInfo {
        file_path: path.to_path_buf(),
        file_size: output.format.size.and_then(|s| s.parse().ok()).unwrap_or(0),
        container: output.format.format_name,
        duration,
        bit_rate: output.format.bit_rate.and_then(|s| s.parse().ok()),
        video_tracks: Vec::new(),
        audio_tracks: Vec::new(),
    };

    let mut video_index = 0u32;
    let mut audio_index = 0u32;

    for stream in output.streams {
        match stream.codec_type.as_str() {
            "video" => {
                info.video_tracks.push(VideoTrack {
                    index: video_index,
                    codec: stream.codec_name.unwrap_or_default(),
                    width: stream.width.unwrap_or(0),
                    height: stream.height.unwrap_or(0),
                    frame_rate: stream.r_frame_rate.and_then(|s| parse_frame_rate(&s)),
                    bit_rate: stream.bit_rate.and_then(|s| s.parse().ok()),
                });
                video_index += 1;
            }
            "audio" => {
                info.audio_tracks.push(AudioTrack {
                    index: audio_index,
                    codec: stream.codec_name.unwrap_or_default(),
                    channels: stream.channels.unwrap_or(2),
                    sample_rate: stream.sample_rate.and_then(|s| s.parse().ok()),
                    bit_rate: stream.bit_rate.and_then(|s| s.parse().ok()),
                    language: stream.tags.language,
                });
                audio_index += 1;
            }
            _ => {}
        }
    }

    info
}

fn parse_frame_rate(rate_str: &str) -> Option<f64> {
    let parts: Vec<&str> = rate_str.split('/').collect();
    if parts.len() == 2 {
        let num: f64 = parts[0].parse().ok()?;
        let den: f64 = parts[1].parse().ok()?;
        if den != 0.0 {
            return Some(num / den);
        }
        return None;
    }
    rate_str.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {
                "index": 0,
                "codec_name": "h264",
                "codec_type": "video",
                "width": 1920,
                "height": 1080,
                "r_frame_rate": "30000/1001",
                "bit_rate": "4500000"
            },
            {
                "index": 1,
                "codec_name": "aac",
                "codec_type": "audio",
                "sample_rate": "48000",
                "channels": 2,
                "bit_rate": "128000",
                "tags": { "language": "eng" }
            },
            {
                "index": 2,
                "codec_name": "mov_text",
                "codec_type": "subtitle"
            }
        ],
        "format": {
            "filename": "/media/clip.mp4",
            "format_name": "mov,mp4,m4a,3gp,3g2,mj2",
            "duration": "62.500000",
            "size": "36000000",
            "bit_rate": "4608000"
        }
    }"#;

    #[test]
    fn test_parse_ffprobe_json() {
        let info = parse_ffprobe_json(Path::new("/media/clip.mp4"), SAMPLE).unwrap();
        assert_eq!(info.container, "mov,mp4,m4a,3gp,3g2,mj2");
        assert_eq!(info.duration, Some(Duration::from_millis(62_500)));
        assert_eq!(info.file_size, 36_000_000);
        assert_eq!(info.bit_rate, Some(4_608_000));
        assert_eq!(info.video_tracks.len(), 1);
        assert_eq!(info.audio_tracks.len(), 1);

        let video = info.primary_video().unwrap();
        assert_eq!((video.width, video.height), (1920, 1080));
        assert!((video.frame_rate.unwrap() - 29.97).abs() < 0.01);

        let audio = info.primary_audio().unwrap();
        assert_eq!(audio.sample_rate, Some(48_000));
        assert_eq!(audio.language.as_deref(), Some("eng"));
    }

    #[test]
    fn test_parse_audio_only() {
        let json = r#"{
            "streams": [{ "codec_name": "mp3", "codec_type": "audio", "channels": 1 }],
            "format": { "format_name": "mp3", "duration": "N/A" }
        }"#;
        let info = parse_ffprobe_json(Path::new("/media/voice.mp3"), json).unwrap();
        assert!(info.duration.is_none());
        assert!(info.primary_video().is_none());
        assert_eq!(info.primary_audio().unwrap().channels, 1);
    }

    #[test]
    fn test_parse_garbage_is_error() {
        let err = parse_ffprobe_json(Path::new("/media/x"), "not json").unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_missing_media_file() {
        let err = probe_with_ffprobe(Path::new("ffprobe"), Path::new("/nonexistent/clip.mp4"), None)
            .unwrap_err();
        assert!(matches!(err, Error::FileNotFound { .. }));
    }

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("24000/1001"), Some(23.976023976023978));
        assert_eq!(parse_frame_rate("30/1"), Some(30.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("invalid"), None);
    }

    #[cfg(unix)]
    #[test]
    #[serial_test::serial]
    fn test_hanging_ffprobe_is_killed() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let ffprobe = dir.path().join("ffprobe");
        std::fs::write(&ffprobe, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&ffprobe, std::fs::Permissions::from_mode(0o755)).unwrap();
        let media = dir.path().join("clip.mp4");
        std::fs::write(&media, b"frames").unwrap();

        let started = Instant::now();
        let err = probe_with_ffprobe(&ffprobe, &media, Some(Duration::from_millis(300))).unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}

//! Output kinds and their codec-argument strategies.
//!
//! Every kind shares the coordinator's cache/lock/progress algorithm and only
//! differs in its option schema, file extension and ffmpeg arguments.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use transcoder_av::{FfmpegCommand, MediaInfo};

use super::options::{Choice, DefaultValue, NormalizedOptions, OptionSpec, OptionType};
use crate::error::TranscodeError;

/// Kind of artifact produced from a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Video,
    Audio,
    Gif,
    Thumbnail,
}

const MAX_EDGE: u64 = 7680;
const SHARPEN_FILTER: &str = "unsharp=5:5:1.0:5:5:0.0";

const VIDEO_ENCODERS: &[Choice] = &[
    Choice {
        token: "h264",
        aliases: &["H.264", "avc", "x264", "libx264", "mp4"],
    },
    Choice {
        token: "webm",
        aliases: &["vp8", "libvpx"],
    },
];

const AUDIO_ENCODERS: &[Choice] = &[
    Choice {
        token: "mp3",
        aliases: &["mpeg3", "libmp3lame"],
    },
    Choice {
        token: "aac",
        aliases: &["m4a", "libfdk_aac"],
    },
    Choice {
        token: "ogg",
        aliases: &["vorbis", "libvorbis"],
    },
];

const ASPECT_MODES: &[Choice] = &[
    Choice {
        token: "none",
        aliases: &["stretch"],
    },
    Choice {
        token: "crop",
        aliases: &[],
    },
    Choice {
        token: "letterbox",
        aliases: &["pad"],
    },
];

const IMAGE_FORMATS: &[Choice] = &[
    Choice {
        token: "jpg",
        aliases: &["jpeg"],
    },
    Choice {
        token: "png",
        aliases: &[],
    },
];

const WIDTH: OptionSpec = OptionSpec {
    name: "width",
    aliases: &[],
    ty: OptionType::Dimension { max: MAX_EDGE },
    default: DefaultValue::Auto,
};

const HEIGHT: OptionSpec = OptionSpec {
    name: "height",
    aliases: &[],
    ty: OptionType::Dimension { max: MAX_EDGE },
    default: DefaultValue::Auto,
};

const FRAME_RATE: OptionSpec = OptionSpec {
    name: "frame_rate",
    aliases: &["fps"],
    ty: OptionType::Number { min: 1, max: 120 },
    default: DefaultValue::Number(15),
};

const ASPECT_RATIO: OptionSpec = OptionSpec {
    name: "aspect_ratio",
    aliases: &["aspect"],
    ty: OptionType::Choice(ASPECT_MODES),
    default: DefaultValue::Token("letterbox"),
};

const LETTERBOX_COLOR: OptionSpec = OptionSpec {
    name: "letterbox_color",
    aliases: &["letterboxcolour", "padcolor", "padcolour"],
    ty: OptionType::Color,
    default: DefaultValue::Token("black"),
};

const SHARPEN: OptionSpec = OptionSpec {
    name: "sharpen",
    aliases: &[],
    ty: OptionType::Flag,
    default: DefaultValue::Flag(true),
};

const SAMPLE_RATE: OptionType = OptionType::Number {
    min: 8000,
    max: 192_000,
};
const CHANNELS: OptionType = OptionType::Number { min: 1, max: 8 };

static VIDEO_SCHEMA: &[OptionSpec] = &[
    OptionSpec {
        name: "encoder",
        aliases: &["videoencoder", "format", "fileformat", "codec"],
        ty: OptionType::Choice(VIDEO_ENCODERS),
        default: DefaultValue::Token("h264"),
    },
    WIDTH,
    HEIGHT,
    OptionSpec {
        name: "bitrate",
        aliases: &["videobitrate"],
        ty: OptionType::Bitrate { max: 100_000 },
        default: DefaultValue::Number(800),
    },
    FRAME_RATE,
    ASPECT_RATIO,
    LETTERBOX_COLOR,
    SHARPEN,
    OptionSpec {
        name: "audio_bitrate",
        aliases: &[],
        ty: OptionType::Bitrate { max: 1000 },
        default: DefaultValue::Number(128),
    },
    OptionSpec {
        name: "audio_sample_rate",
        aliases: &[],
        ty: SAMPLE_RATE,
        default: DefaultValue::Number(44_100),
    },
    OptionSpec {
        name: "audio_channels",
        aliases: &[],
        ty: CHANNELS,
        default: DefaultValue::Number(2),
    },
];

static AUDIO_SCHEMA: &[OptionSpec] = &[
    OptionSpec {
        name: "encoder",
        aliases: &["audioencoder", "format", "fileformat", "codec"],
        ty: OptionType::Choice(AUDIO_ENCODERS),
        default: DefaultValue::Token("mp3"),
    },
    OptionSpec {
        name: "bitrate",
        aliases: &["audiobitrate"],
        ty: OptionType::Bitrate { max: 1000 },
        default: DefaultValue::Number(128),
    },
    OptionSpec {
        name: "sample_rate",
        aliases: &["audiosamplerate"],
        ty: SAMPLE_RATE,
        default: DefaultValue::Number(44_100),
    },
    OptionSpec {
        name: "channels",
        aliases: &["audiochannels"],
        ty: CHANNELS,
        default: DefaultValue::Number(2),
    },
    OptionSpec {
        name: "strip_metadata",
        aliases: &[],
        ty: OptionType::Flag,
        default: DefaultValue::Flag(false),
    },
];

static GIF_SCHEMA: &[OptionSpec] = &[WIDTH, HEIGHT, FRAME_RATE, ASPECT_RATIO, LETTERBOX_COLOR];

static THUMBNAIL_SCHEMA: &[OptionSpec] = &[
    OptionSpec {
        name: "time",
        aliases: &["timeinsecs", "seconds", "offset"],
        ty: OptionType::Number { min: 0, max: 86_400 },
        default: DefaultValue::Number(10),
    },
    OptionSpec {
        name: "width",
        aliases: &[],
        ty: OptionType::Dimension { max: MAX_EDGE },
        default: DefaultValue::Number(200),
    },
    OptionSpec {
        name: "height",
        aliases: &[],
        ty: OptionType::Dimension { max: MAX_EDGE },
        default: DefaultValue::Number(100),
    },
    ASPECT_RATIO,
    LETTERBOX_COLOR,
    SHARPEN,
    OptionSpec {
        name: "format",
        aliases: &["fileformat", "imageformat"],
        ty: OptionType::Choice(IMAGE_FORMATS),
        default: DefaultValue::Token("jpg"),
    },
];

impl OutputKind {
    pub const ALL: [OutputKind; 4] = [Self::Video, Self::Audio, Self::Gif, Self::Thumbnail];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Gif => "gif",
            Self::Thumbnail => "thumbnail",
        }
    }

    pub(crate) fn option_schema(self) -> &'static [OptionSpec] {
        match self {
            Self::Video => VIDEO_SCHEMA,
            Self::Audio => AUDIO_SCHEMA,
            Self::Gif => GIF_SCHEMA,
            Self::Thumbnail => THUMBNAIL_SCHEMA,
        }
    }

    /// File extension of the artifact, which doubles as its container token.
    pub fn extension(self, opts: &NormalizedOptions) -> &'static str {
        match self {
            Self::Video => match opts.token("encoder") {
                Some("webm") => "webm",
                _ => "mp4",
            },
            Self::Audio => match opts.token("encoder") {
                Some("aac") => "m4a",
                Some("ogg") => "ogg",
                _ => "mp3",
            },
            Self::Gif => "gif",
            Self::Thumbnail => match opts.token("format") {
                Some("png") => "png",
                _ => "jpg",
            },
        }
    }

    /// Requested geometry for artifact labels: `640x360`, `640`, `x360`.
    pub fn geometry_label(self, opts: &NormalizedOptions) -> Option<String> {
        match (opts.number("width"), opts.number("height")) {
            (Some(w), Some(h)) => Some(format!("{}x{}", w, h)),
            (Some(w), None) => Some(w.to_string()),
            (None, Some(h)) => Some(format!("x{}", h)),
            (None, None) => None,
        }
    }

    /// Build the ffmpeg invocation writing this kind of artifact to `output`.
    ///
    /// `source` carries the probed source metadata when it is available; it
    /// resolves edges left on `auto` and clamps thumbnail times.
    pub fn build_command(
        self,
        opts: &NormalizedOptions,
        input: &Path,
        output: &Path,
        source: Option<&MediaInfo>,
    ) -> FfmpegCommand {
        let cmd = FfmpegCommand::new(input, output);
        let dims = source.and_then(MediaInfo::dimensions);

        match self {
            Self::Video => {
                let cmd = cmd.video_filters(scale_filters(opts, dims));
                let cmd = match opts.token("encoder") {
                    Some("webm") => cmd
                        .video_codec("libvpx")
                        .output_args(["-quality", "good", "-cpu-used", "0"])
                        .audio_codec("libvorbis"),
                    _ => cmd
                        .video_codec("libx264")
                        .output_args(["-profile:v", "high", "-preset", "slow", "-crf", "22"])
                        .output_args(["-pix_fmt", "yuv420p"])
                        .audio_codec("aac"),
                };
                let cmd = cmd
                    .video_bitrate_kbps(opts.number("bitrate").unwrap_or(800))
                    .frame_rate(opts.number("frame_rate").unwrap_or(15))
                    .audio_bitrate_kbps(opts.number("audio_bitrate").unwrap_or(128))
                    .audio_format(
                        opts.number("audio_sample_rate").unwrap_or(44_100),
                        opts.number("audio_channels").unwrap_or(2),
                    );
                match opts.token("encoder") {
                    Some("webm") => cmd.format("webm"),
                    _ => cmd.output_args(["-movflags", "+faststart"]).format("mp4"),
                }
            }
            Self::Audio => {
                let cmd = cmd.no_video();
                let (codec, format) = match opts.token("encoder") {
                    Some("aac") => ("aac", "ipod"),
                    Some("ogg") => ("libvorbis", "ogg"),
                    _ => ("libmp3lame", "mp3"),
                };
                let cmd = cmd
                    .audio_codec(codec)
                    .audio_bitrate_kbps(opts.number("bitrate").unwrap_or(128))
                    .audio_format(
                        opts.number("sample_rate").unwrap_or(44_100),
                        opts.number("channels").unwrap_or(2),
                    );
                let cmd = if opts.flag("strip_metadata") {
                    cmd.output_args(["-map_metadata", "-1"])
                } else {
                    cmd
                };
                cmd.format(format)
            }
            Self::Gif => cmd
                .video_filter(format!("fps={}", opts.number("frame_rate").unwrap_or(15)))
                .video_filters(scale_filters(opts, dims))
                .output_args(["-loop", "0"])
                .format("gif"),
            Self::Thumbnail => {
                let duration = source.and_then(|s| s.duration);
                let cmd = cmd
                    .seek(thumbnail_time(opts.number("time").unwrap_or(10), duration))
                    .video_filters(scale_filters(opts, dims))
                    .single_frame()
                    .output_args(["-update", "1"]);
                match opts.token("format") {
                    Some("png") => cmd.format("image2"),
                    _ => cmd.output_args(["-q:v", "2"]).format("image2"),
                }
            }
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputKind {
    type Err = TranscodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "gif" => Ok(Self::Gif),
            "thumbnail" | "thumbnails" | "thumb" => Ok(Self::Thumbnail),
            other => Err(TranscodeError::invalid_options(format!(
                "unknown output kind {:?}",
                other
            ))),
        }
    }
}

/// Seek position for a thumbnail; times past the end fall back to the middle.
fn thumbnail_time(requested: u64, duration: Option<Duration>) -> f64 {
    let requested = requested as f64;
    match duration {
        Some(d) if d.as_secs_f64() > 0.0 && requested >= d.as_secs_f64() => d.as_secs_f64() / 2.0,
        _ => requested,
    }
}

/// Nearest even value, at least 2.
fn even(value: f64) -> u64 {
    ((value / 2.0).round() as u64).max(1) * 2
}

/// Scaling (and sharpening) filters for the requested geometry.
fn scale_filters(opts: &NormalizedOptions, source: Option<(u32, u32)>) -> Vec<String> {
    let mut filters = Vec::new();

    match (opts.number("width"), opts.number("height")) {
        (None, None) => {}
        (Some(w), None) => {
            let h = source
                .map(|(sw, sh)| even(w as f64 * sh as f64 / sw as f64).to_string())
                .unwrap_or_else(|| "-2".to_string());
            filters.push(format!("scale={}:{}", w, h));
        }
        (None, Some(h)) => {
            let w = source
                .map(|(sw, sh)| even(h as f64 * sw as f64 / sh as f64).to_string())
                .unwrap_or_else(|| "-2".to_string());
            filters.push(format!("scale={}:{}", w, h));
        }
        (Some(w), Some(h)) => match opts.token("aspect_ratio") {
            Some("none") => filters.push(format!("scale={}:{}", w, h)),
            Some("crop") => {
                filters.push(format!("scale={}:{}:force_original_aspect_ratio=increase", w, h));
                filters.push(format!("crop={}:{}", w, h));
            }
            _ => {
                let color = opts.token("letterbox_color").unwrap_or("black");
                filters.push(format!("scale={}:{}:force_original_aspect_ratio=decrease", w, h));
                filters.push(format!("pad={}:{}:(ow-iw)/2:(oh-ih)/2:{}", w, h, color));
            }
        },
    }

    if opts.flag("sharpen") {
        filters.push(SHARPEN_FILTER.to_string());
    }

    filters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcode::{OptionNormalizer, RawOptions};
    use serde_json::json;
    use std::path::PathBuf;
    use transcoder_av::VideoTrack;

    fn normalize(kind: OutputKind, value: serde_json::Value) -> NormalizedOptions {
        let raw: RawOptions = serde_json::from_value(value).unwrap();
        OptionNormalizer::new().normalize(kind, &raw).unwrap()
    }

    fn source(width: u32, height: u32, secs: u64) -> MediaInfo {
        MediaInfo {
            file_path: PathBuf::from("/media/in.mov"),
            file_size: 1024,
            container: "mov,mp4,m4a,3gp,3g2,mj2".into(),
            duration: Some(Duration::from_secs(secs)),
            bit_rate: None,
            video_tracks: vec![VideoTrack {
                index: 0,
                codec: "h264".into(),
                width,
                height,
                frame_rate: Some(25.0),
                bit_rate: None,
            }],
            audio_tracks: vec![],
        }
    }

    fn args(kind: OutputKind, opts: &NormalizedOptions, src: Option<&MediaInfo>) -> Vec<String> {
        kind.build_command(opts, Path::new("/in.mov"), Path::new("/out.tmp"), src)
            .build_args()
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("Video".parse::<OutputKind>().unwrap(), OutputKind::Video);
        assert_eq!("thumbnails".parse::<OutputKind>().unwrap(), OutputKind::Thumbnail);
        assert!("poster".parse::<OutputKind>().is_err());
    }

    #[test]
    fn test_extensions() {
        let video = normalize(OutputKind::Video, json!({"encoder": "vp8"}));
        assert_eq!(OutputKind::Video.extension(&video), "webm");
        let audio = normalize(OutputKind::Audio, json!({"encoder": "m4a"}));
        assert_eq!(OutputKind::Audio.extension(&audio), "m4a");
        let thumb = normalize(OutputKind::Thumbnail, json!({}));
        assert_eq!(OutputKind::Thumbnail.extension(&thumb), "jpg");
    }

    #[test]
    fn test_h264_arguments() {
        let opts = normalize(OutputKind::Video, json!({"width": 640, "bitrate": "1M"}));
        let args = args(OutputKind::Video, &opts, Some(&source(1920, 1080, 60)));

        assert_eq!(value_after(&args, "-c:v"), Some("libx264"));
        assert_eq!(value_after(&args, "-b:v"), Some("1000k"));
        assert_eq!(value_after(&args, "-r"), Some("15"));
        assert_eq!(value_after(&args, "-c:a"), Some("aac"));
        assert_eq!(value_after(&args, "-f"), Some("mp4"));
        assert_eq!(value_after(&args, "-vf"), Some("scale=640:360,unsharp=5:5:1.0:5:5:0.0"));
        assert_eq!(args.last().map(String::as_str), Some("/out.tmp"));
    }

    #[test]
    fn test_relative_geometry_without_source() {
        let opts = normalize(OutputKind::Gif, json!({"height": 240}));
        let args = args(OutputKind::Gif, &opts, None);
        assert_eq!(value_after(&args, "-vf"), Some("fps=15,scale=-2:240"));
        assert_eq!(value_after(&args, "-loop"), Some("0"));
    }

    #[test]
    fn test_aspect_modes() {
        let letterbox = normalize(
            OutputKind::Video,
            json!({"width": 640, "height": 480, "letterbox_color": "#fff", "sharpen": false}),
        );
        assert_eq!(
            value_after(&args(OutputKind::Video, &letterbox, None), "-vf"),
            Some("scale=640:480:force_original_aspect_ratio=decrease,pad=640:480:(ow-iw)/2:(oh-ih)/2:#ffffff")
        );

        let crop = normalize(
            OutputKind::Video,
            json!({"width": 640, "height": 480, "aspect_ratio": "crop", "sharpen": false}),
        );
        assert_eq!(
            value_after(&args(OutputKind::Video, &crop, None), "-vf"),
            Some("scale=640:480:force_original_aspect_ratio=increase,crop=640:480")
        );
    }

    #[test]
    fn test_audio_arguments() {
        let opts = normalize(OutputKind::Audio, json!({"encoder": "aac", "stripMetadata": true}));
        let args = args(OutputKind::Audio, &opts, None);
        assert!(args.contains(&"-vn".to_string()));
        assert_eq!(value_after(&args, "-c:a"), Some("aac"));
        assert_eq!(value_after(&args, "-map_metadata"), Some("-1"));
        assert_eq!(value_after(&args, "-f"), Some("ipod"));
        assert_eq!(value_after(&args, "-vf"), None);
    }

    #[test]
    fn test_thumbnail_time_clamped() {
        let opts = normalize(OutputKind::Thumbnail, json!({"time": 30}));
        let args = args(OutputKind::Thumbnail, &opts, Some(&source(1280, 720, 20)));
        assert_eq!(value_after(&args, "-ss"), Some("10.000"));
        assert_eq!(value_after(&args, "-frames:v"), Some("1"));

        let args = self::args(OutputKind::Thumbnail, &opts, None);
        assert_eq!(value_after(&args, "-ss"), Some("30.000"));
    }

    #[test]
    fn test_geometry_label() {
        let opts = normalize(OutputKind::Video, json!({"width": 640}));
        assert_eq!(OutputKind::Video.geometry_label(&opts).as_deref(), Some("640"));
        let opts = normalize(OutputKind::Video, json!({"height": 360}));
        assert_eq!(OutputKind::Video.geometry_label(&opts).as_deref(), Some("x360"));
        let opts = normalize(OutputKind::Audio, json!({}));
        assert_eq!(OutputKind::Audio.geometry_label(&opts), None);
    }
}

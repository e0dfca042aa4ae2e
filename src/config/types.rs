use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::transcode::RawOptions;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub formats: FormatsConfig,

    /// Named option sets, referenced from a request with `preset = "<name>"`
    #[serde(default)]
    pub presets: BTreeMap<String, RawOptions>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Directory that receives every generated artifact
    #[serde(default = "default_output_root")]
    pub root: PathBuf,

    /// Public URL prefix that maps onto `root`
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_video_dir")]
    pub video_dir: String,

    #[serde(default = "default_audio_dir")]
    pub audio_dir: String,

    #[serde(default = "default_gif_dir")]
    pub gif_dir: String,

    #[serde(default = "default_thumbnail_dir")]
    pub thumbnail_dir: String,
}

fn default_output_root() -> PathBuf {
    PathBuf::from("./transcoded")
}

fn default_base_url() -> String {
    "/transcoded".to_string()
}

fn default_video_dir() -> String {
    "video".to_string()
}

fn default_audio_dir() -> String {
    "audio".to_string()
}

fn default_gif_dir() -> String {
    "gif".to_string()
}

fn default_thumbnail_dir() -> String {
    "thumbnails".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: default_output_root(),
            base_url: default_base_url(),
            video_dir: default_video_dir(),
            audio_dir: default_audio_dir(),
            gif_dir: default_gif_dir(),
            thumbnail_dir: default_thumbnail_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    #[serde(default)]
    pub ffprobe_path: Option<PathBuf>,
}

/// What a caller does when another caller is already generating the artifact.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContentionPolicy {
    /// Poll until the artifact appears or `lock_wait_secs` elapses
    #[default]
    Wait,
    /// Return the empty result at once and let the caller poll progress
    ReturnEmpty,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerationConfig {
    /// Maximum codec run time before the process is killed (default: 1800)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Lease length of a generation lock; holders renew it while running (default: 60)
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// How long a contending caller waits (default: same as `timeout_secs`)
    #[serde(default)]
    pub lock_wait_secs: Option<u64>,

    #[serde(default)]
    pub on_contention: ContentionPolicy,

    /// Poll interval for lock waits and codec supervision (default: 250)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_timeout_secs() -> u64 {
    1800
}

fn default_lease_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    250
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            lease_secs: default_lease_secs(),
            lock_wait_secs: None,
            on_contention: ContentionPolicy::default(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs.unwrap_or(self.timeout_secs))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Hex characters of the artifact digest, 16..=64 (default: 32)
    #[serde(default = "default_key_length")]
    pub key_length: usize,
}

fn default_key_length() -> usize {
    32
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_length: default_key_length(),
        }
    }
}

/// Allow-lists of encoder/format tokens. Empty means every supported token.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FormatsConfig {
    #[serde(default)]
    pub video: Vec<String>,

    #[serde(default)]
    pub audio: Vec<String>,

    #[serde(default)]
    pub thumbnail: Vec<String>,
}

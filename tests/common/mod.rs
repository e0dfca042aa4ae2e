//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which lays out a scratch output root, source
//! files, and shell-script stand-ins for `ffmpeg` and `ffprobe`. The fake
//! ffmpeg appends one line to a count file per invocation, reports progress
//! in `-progress` format and writes its last argument (the output path).
//! Both fakes answer `-version` without side effects.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use transcoder::config::{Config, ContentionPolicy};
use transcoder::transcode::TranscodeCoordinator;

/// Duration reported by the fake ffprobe, in seconds.
pub const SOURCE_DURATION_SECS: u64 = 10;

/// Behaviour of the fake ffmpeg.
#[derive(Debug, Clone)]
pub struct FakeFfmpeg {
    /// Seconds to wait before reporting 45% progress.
    pub warmup_secs: f64,
    /// Seconds to hold at 45% before finishing.
    pub hold_secs: f64,
    pub exit_code: i32,
    /// Whether anything is written to the output file.
    pub write_output: bool,
}

impl Default for FakeFfmpeg {
    fn default() -> Self {
        Self {
            warmup_secs: 0.0,
            hold_secs: 0.2,
            exit_code: 0,
            write_output: true,
        }
    }
}

impl FakeFfmpeg {
    pub fn failing() -> Self {
        Self {
            exit_code: 1,
            write_output: false,
            ..Self::default()
        }
    }

    pub fn slow(hold_secs: f64) -> Self {
        Self {
            hold_secs,
            ..Self::default()
        }
    }

    fn script(&self, count_file: &Path) -> String {
        format!(
            r#"#!/bin/sh
if [ "$1" = "-version" ]; then
    echo "ffmpeg version 6.1-test"
    exit 0
fi
echo run >> "{count}"
for last; do :; done
printf 'frame=0\nout_time_us=0\nprogress=continue\n'
sleep {warmup}
printf 'frame=112\nout_time_us=4500000\nspeed=1.5x\nprogress=continue\n'
sleep {hold}
if [ "{write}" = "yes" ]; then
    printf 'artifact' > "$last"
else
    echo "Conversion failed!" >&2
fi
printf 'frame=250\nout_time_us={end_us}\nprogress=end\n'
exit {code}
"#,
            count = count_file.display(),
            warmup = self.warmup_secs,
            hold = self.hold_secs,
            write = if self.write_output { "yes" } else { "no" },
            end_us = SOURCE_DURATION_SECS * 1_000_000,
            code = self.exit_code,
        )
    }
}

const FFPROBE_SCRIPT: &str = r#"#!/bin/sh
if [ "$1" = "-version" ]; then
    echo "ffprobe version 6.1-test"
    exit 0
fi
cat <<'EOF'
{
  "streams": [
    {"codec_type": "video", "codec_name": "h264", "width": 1280, "height": 720, "r_frame_rate": "25/1"},
    {"codec_type": "audio", "codec_name": "aac", "channels": 2, "sample_rate": "48000"}
  ],
  "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "10.000000", "size": "6", "bit_rate": "4800"}
}
EOF
"#;

const HANGING_FFPROBE_SCRIPT: &str = r#"#!/bin/sh
if [ "$1" = "-version" ]; then
    echo "ffprobe version 6.1-test"
    exit 0
fi
exec sleep 30
"#;

/// Scratch environment with fake codec tools.
pub struct TestHarness {
    pub dir: TempDir,
    pub config: Config,
    pub count_file: PathBuf,
}

impl TestHarness {
    /// Harness whose ffmpeg succeeds after a short run.
    pub fn new() -> Self {
        Self::with_ffmpeg(FakeFfmpeg::default())
    }

    pub fn with_ffmpeg(ffmpeg: FakeFfmpeg) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let count_file = dir.path().join("ffmpeg-invocations");
        let bin = dir.path().join("bin");
        fs::create_dir_all(&bin).unwrap();

        let mut config = Config::default();
        config.output.root = dir.path().join("transcoded");
        config.output.base_url = "/transcoded".to_string();
        config.tools.ffmpeg_path = Some(bin.join("ffmpeg"));
        config.tools.ffprobe_path = Some(bin.join("ffprobe"));
        config.generation.timeout_secs = 30;
        config.generation.lease_secs = 60;
        config.generation.poll_interval_ms = 20;

        let harness = Self {
            dir,
            config,
            count_file,
        };
        harness.set_ffmpeg(ffmpeg);
        write_executable(&bin.join("ffprobe"), FFPROBE_SCRIPT);
        harness
    }

    /// Replace the fake ffmpeg's behaviour.
    pub fn set_ffmpeg(&self, ffmpeg: FakeFfmpeg) {
        let path = self.dir.path().join("bin").join("ffmpeg");
        write_executable(&path, &ffmpeg.script(&self.count_file));
    }

    /// Make the fake ffprobe hang instead of answering.
    pub fn hang_ffprobe(&self) {
        let path = self.dir.path().join("bin").join("ffprobe");
        write_executable(&path, HANGING_FFPROBE_SCRIPT);
    }

    pub fn set_lease(&mut self, secs: u64) {
        self.config.generation.lease_secs = secs;
    }

    pub fn set_timeout(&mut self, secs: u64) {
        self.config.generation.timeout_secs = secs;
    }

    pub fn set_contention(&mut self, policy: ContentionPolicy, wait_secs: u64) {
        self.config.generation.on_contention = policy;
        self.config.generation.lock_wait_secs = Some(wait_secs);
    }

    /// Write a source file into the scratch directory.
    pub fn source(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.dir.path().join("media").join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    pub fn root(&self) -> PathBuf {
        self.config.output.root.clone()
    }

    pub fn coordinator(&self) -> TranscodeCoordinator {
        TranscodeCoordinator::from_config(&self.config).expect("valid test config")
    }

    /// Number of times the fake ffmpeg has been started.
    pub fn invocations(&self) -> usize {
        fs::read_to_string(&self.count_file)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    /// Serialise the configuration for CLI tests.
    pub fn write_config(&self) -> PathBuf {
        let path = self.dir.path().join("transcoder.toml");
        fs::write(&path, toml::to_string(&self.config).unwrap()).unwrap();
        path
    }

    /// Files under `kind_dir` of the output root (hidden ones included).
    pub fn artifact_files(&self, kind_dir: &str) -> Vec<String> {
        match fs::read_dir(self.root().join(kind_dir)) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

fn write_executable(path: &Path, contents: &str) {
    // Write to a fresh inode so a still-running copy of the old script never
    // blocks execution with ETXTBSY
    let tmp = path.with_extension("new");
    fs::write(&tmp, contents).unwrap();
    fs::set_permissions(&tmp, fs::Permissions::from_mode(0o755)).unwrap();
    fs::rename(&tmp, path).unwrap();
}

/// Poll `check` until it returns true or `timeout` passes.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

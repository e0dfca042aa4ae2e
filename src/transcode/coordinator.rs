//! Transcode coordination.
//!
//! [`TranscodeCoordinator`] answers "where is the artifact for this source and
//! these options?" and generates it on demand. Cache hits never touch a lock.
//! Misses inspect the source, take the per-key lease, re-check the store, run
//! ffmpeg into a temporary file while streaming progress and renewing the
//! lease, and publish the result by rename. Losing the lease kills ffmpeg and
//! discards the attempt.
//! Generation failures are logged and reported as the empty URL; only bad
//! requests surface as errors.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fs;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use transcoder_av::{FfmpegRunner, MediaInfo, RunEvent};

use super::identity::{digest_from_file_name, is_digest, ArtifactKey, KeyBuilder, SourceDescriptor};
use super::inspector::{FfprobeInspector, FileInfo, MediaInspector};
use super::kind::OutputKind;
use super::lease::{Lease, LeaseRegistry};
use super::options::{NormalizedOptions, OptionNormalizer, RawOptions};
use super::progress::{ProgressRecord, ProgressStatus, ProgressTracker};
use super::store::ArtifactStore;
use crate::config::{Config, ContentionPolicy};
use crate::error::{Result, TranscodeError};

/// Directory below the output root holding progress records.
pub const PROGRESS_DIR: &str = ".progress";
/// Directory below the output root holding generation locks.
pub const LOCKS_DIR: &str = ".locks";

/// What to do when the requested artifact does not exist yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Generate {
    /// Return the empty result.
    Never,
    /// Generate before returning.
    #[default]
    Blocking,
    /// Start generating on a worker thread and return the empty result.
    Background,
}

impl From<bool> for Generate {
    fn from(generate: bool) -> Self {
        if generate {
            Self::Blocking
        } else {
            Self::Never
        }
    }
}

enum Claim {
    Acquired(Lease),
    /// Another holder published the artifact while we waited.
    Published,
    /// Busy, timed out waiting, or the holder we waited on failed.
    Unavailable,
}

/// Resolves artifact URLs and generates missing artifacts.
#[derive(Clone)]
pub struct TranscodeCoordinator {
    normalizer: OptionNormalizer,
    keys: KeyBuilder,
    store: ArtifactStore,
    progress: ProgressTracker,
    leases: LeaseRegistry,
    inspector: Arc<dyn MediaInspector>,
    runner: FfmpegRunner,
    on_contention: ContentionPolicy,
    lock_wait: Duration,
    poll_interval: Duration,
    background: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TranscodeCoordinator {
    /// Assemble a coordinator from its collaborators.
    ///
    /// Starts with an option normaliser without presets or allow-lists,
    /// 32-character keys, and waiting up to ten minutes on contention.
    pub fn new(
        store: ArtifactStore,
        progress: ProgressTracker,
        leases: LeaseRegistry,
        inspector: Arc<dyn MediaInspector>,
        runner: FfmpegRunner,
    ) -> Self {
        Self {
            normalizer: OptionNormalizer::new(),
            keys: KeyBuilder::default(),
            store,
            progress,
            leases,
            inspector,
            runner,
            on_contention: ContentionPolicy::Wait,
            lock_wait: Duration::from_secs(600),
            poll_interval: Duration::from_millis(250),
            background: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Build every collaborator from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let generation = &config.generation;
        let ffmpeg = resolve_tool("ffmpeg", config.tools.ffmpeg_path.as_deref());
        let ffprobe = resolve_tool("ffprobe", config.tools.ffprobe_path.as_deref());

        let store = ArtifactStore::from_config(&config.output);
        let progress = ProgressTracker::new(store.root().join(PROGRESS_DIR));
        let leases = LeaseRegistry::new(store.root().join(LOCKS_DIR), generation.lease());
        // Each progress tick is a chance to renew the lease
        let runner = FfmpegRunner::new(ffmpeg)
            .timeout(generation.timeout())
            .poll_interval(generation.poll_interval().min(generation.lease() / 3));
        let inspector = FfprobeInspector::new(ffprobe).timeout(generation.timeout());

        Ok(
            Self::new(store, progress, leases, Arc::new(inspector), runner)
                .with_normalizer(OptionNormalizer::from_config(config)?)
                .with_key_builder(KeyBuilder::new(config.cache.key_length)?)
                .with_contention(generation.on_contention, generation.lock_wait())
                .with_poll_interval(generation.poll_interval()),
        )
    }

    pub fn with_normalizer(mut self, normalizer: OptionNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_key_builder(mut self, keys: KeyBuilder) -> Self {
        self.keys = keys;
        self
    }

    /// Behaviour when another caller holds the lock, and how long to wait.
    pub fn with_contention(mut self, policy: ContentionPolicy, lock_wait: Duration) -> Self {
        self.on_contention = policy;
        self.lock_wait = lock_wait;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(10));
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn progress_tracker(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn inspector(&self) -> &dyn MediaInspector {
        self.inspector.as_ref()
    }

    pub fn video_url(
        &self,
        path: impl AsRef<Path>,
        options: &RawOptions,
        generate: impl Into<Generate>,
    ) -> Result<String> {
        self.get_url(OutputKind::Video, path.as_ref(), options, generate.into())
    }

    pub fn audio_url(
        &self,
        path: impl AsRef<Path>,
        options: &RawOptions,
        generate: impl Into<Generate>,
    ) -> Result<String> {
        self.get_url(OutputKind::Audio, path.as_ref(), options, generate.into())
    }

    pub fn gif_url(
        &self,
        path: impl AsRef<Path>,
        options: &RawOptions,
        generate: impl Into<Generate>,
    ) -> Result<String> {
        self.get_url(OutputKind::Gif, path.as_ref(), options, generate.into())
    }

    pub fn thumbnail_url(
        &self,
        path: impl AsRef<Path>,
        options: &RawOptions,
        generate: impl Into<Generate>,
    ) -> Result<String> {
        self.get_url(OutputKind::Thumbnail, path.as_ref(), options, generate.into())
    }

    /// URL of the `kind` artifact for `path` and `options`.
    ///
    /// Returns the empty string when the artifact is not available (not
    /// generated, still generating elsewhere, or generation failed).
    ///
    /// # Errors
    ///
    /// Only [`TranscodeError::InvalidOptions`] and
    /// [`TranscodeError::SourceUnavailable`].
    pub fn get_url(
        &self,
        kind: OutputKind,
        path: &Path,
        options: &RawOptions,
        generate: Generate,
    ) -> Result<String> {
        let requested_at = Utc::now();
        let (source, opts, key) = self.resolve(kind, path, options)?;
        let url = self.store.url_for(&key);

        if self.store.exists(&key) {
            debug!("Cache hit for {}", key);
            return Ok(url);
        }

        match generate {
            Generate::Never => Ok(String::new()),
            Generate::Blocking => {
                let ready = self.generate(&key, &source, &opts, self.on_contention, requested_at);
                Ok(if ready { url } else { String::new() })
            }
            Generate::Background => {
                let this = self.clone();
                let name = format!("transcode-{}", &key.digest()[..8]);
                let spawned = thread::Builder::new().name(name).spawn(move || {
                    this.generate(&key, &source, &opts, ContentionPolicy::ReturnEmpty, requested_at);
                });
                match spawned {
                    Ok(handle) => {
                        let mut handles = self.background.lock();
                        handles.retain(|h| !h.is_finished());
                        handles.push(handle);
                    }
                    Err(e) => warn!("Could not start background generation: {}", e),
                }
                Ok(String::new())
            }
        }
    }

    /// Block until every background generation started by this coordinator
    /// (or its clones) has finished.
    pub fn wait_for_background(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.background.lock());
        for handle in handles {
            if handle.join().is_err() {
                warn!("A background generation panicked");
            }
        }
    }

    /// Artifact file name for a request, as used for progress polling.
    pub fn artifact_file_name(
        &self,
        kind: OutputKind,
        path: impl AsRef<Path>,
        options: &RawOptions,
    ) -> Result<String> {
        let (_, _, key) = self.resolve(kind, path.as_ref(), options)?;
        Ok(key.file_name())
    }

    /// Progress of the artifact named `name` (a file name, URL or bare digest).
    ///
    /// `None` when no attempt was ever recorded. An unfinished record whose
    /// generator no longer holds the lease is reported as failed.
    pub fn progress(&self, name: &str) -> Result<Option<ProgressRecord>> {
        let name = name.trim();
        let Some(digest) = digest_from_file_name(name).or(is_digest(name).then_some(name)) else {
            return Ok(None);
        };
        let Some(mut record) = self.progress.read_digest(digest)? else {
            return Ok(None);
        };

        if !record.status.is_terminal() && !self.leases.is_held(digest) {
            // The holder may have closed the record between the two reads
            match self.progress.read_digest(digest)? {
                Some(latest) if latest.status.is_terminal() => return Ok(Some(latest)),
                _ => record.status = ProgressStatus::Failed,
            }
        }

        Ok(Some(record))
    }

    /// Source metadata, full or summarised.
    pub fn file_info(&self, path: impl AsRef<Path>, summary: bool) -> Result<FileInfo> {
        self.inspector.file_info(path.as_ref(), summary)
    }

    /// File behind a public artifact URL, if it exists inside the output root.
    pub fn download_path(&self, url: &str) -> Option<PathBuf> {
        self.store.download_path(url)
    }

    fn resolve(
        &self,
        kind: OutputKind,
        path: &Path,
        options: &RawOptions,
    ) -> Result<(SourceDescriptor, NormalizedOptions, ArtifactKey)> {
        let opts = self.normalizer.normalize(kind, options)?;
        let source = SourceDescriptor::resolve(path)?;
        let key = self.keys.derive(&source, &opts);
        Ok((source, opts, key))
    }

    /// Produce the artifact unless someone else is; true once it exists.
    fn generate(
        &self,
        key: &ArtifactKey,
        source: &SourceDescriptor,
        opts: &NormalizedOptions,
        policy: ContentionPolicy,
        requested_at: DateTime<Utc>,
    ) -> bool {
        if policy == ContentionPolicy::ReturnEmpty && self.leases.is_held(key.digest()) {
            debug!("{} is being generated elsewhere", key);
            return false;
        }

        // Inspected before locking so a slow ffprobe never holds the lease
        let media = self.probe(source.path());

        let lease = match self.claim(key, policy, requested_at) {
            Claim::Acquired(lease) => lease,
            Claim::Published => return true,
            Claim::Unavailable => return false,
        };

        if self.store.exists(key) {
            debug!("{} was published while acquiring the lock", key);
            return true;
        }

        let started = Instant::now();
        info!("Generating {} from {}", key, source.path().display());
        match self.run_generation(key, source, opts, media.as_ref(), lease) {
            Ok(()) => {
                info!("Generated {} in {:.1}s", key, started.elapsed().as_secs_f64());
                true
            }
            Err(e) => {
                warn!("Generation of {} failed: {}", key, e);
                false
            }
        }
    }

    /// Take the lock on `key`, waiting on the current holder if `policy` says so.
    ///
    /// A caller that had to wait does not retry an attempt that failed after
    /// `requested_at`.
    fn claim(&self, key: &ArtifactKey, policy: ContentionPolicy, requested_at: DateTime<Utc>) -> Claim {
        let deadline = Instant::now() + self.lock_wait;
        let mut waited = false;

        loop {
            match self.leases.try_acquire(key.digest()) {
                Ok(Some(lease)) => {
                    if waited && self.failed_since(key, requested_at) {
                        debug!("Attempt on {} we waited for failed", key);
                        return Claim::Unavailable;
                    }
                    return Claim::Acquired(lease);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Could not take the lock on {}: {}", key, e);
                    return Claim::Unavailable;
                }
            }

            if policy == ContentionPolicy::ReturnEmpty {
                debug!("{} is being generated elsewhere", key);
                return Claim::Unavailable;
            }
            if self.store.exists(key) {
                return Claim::Published;
            }
            if Instant::now() >= deadline {
                debug!("Gave up waiting for {}", key);
                return Claim::Unavailable;
            }

            waited = true;
            thread::sleep(self.poll_interval);
        }
    }

    /// Whether an attempt on `key` failed after `since`.
    fn failed_since(&self, key: &ArtifactKey, since: DateTime<Utc>) -> bool {
        matches!(
            self.progress.read(key),
            Ok(Some(record)) if record.status == ProgressStatus::Failed && record.updated_at >= since
        )
    }

    fn run_generation(
        &self,
        key: &ArtifactKey,
        source: &SourceDescriptor,
        opts: &NormalizedOptions,
        media: Option<&MediaInfo>,
        mut lease: Lease,
    ) -> Result<()> {
        self.progress.start(key)?;
        let result = self.transcode(key, source, opts, media, &mut lease);

        // After losing the lease the record belongs to the new holder
        if lease.is_owned() {
            if let Err(e) = self.progress.finish(key, result.is_ok()) {
                warn!("Could not close progress record of {}: {}", key, e);
            }
        }
        if let Err(e) = lease.release() {
            warn!("Could not release lock on {}: {}", key, e);
        }
        result
    }

    fn transcode(
        &self,
        key: &ArtifactKey,
        source: &SourceDescriptor,
        opts: &NormalizedOptions,
        media: Option<&MediaInfo>,
        lease: &mut Lease,
    ) -> Result<()> {
        let duration = media.and_then(|m| m.duration);

        let temp = self.store.temp_output(key)?;
        let cmd = key.kind().build_command(opts, source.path(), &temp, media);
        debug!("ffmpeg {}", cmd.build_args().join(" "));

        self.progress.update(key, 0)?;
        let mut last_percent = 0u8;
        let run = self.runner.run(&cmd, |event| {
            if let RunEvent::Progress(p) = event {
                if let Some(percent) = p.percent_of(duration) {
                    if percent > last_percent {
                        last_percent = percent;
                        if let Err(e) = self.progress.update(key, percent) {
                            debug!("Progress update for {} failed: {}", key, e);
                        }
                    }
                }
            }
            match lease.renew_if_due() {
                Ok(_) => ControlFlow::Continue(()),
                Err(e) => ControlFlow::Break(format!("lost the lock: {}", e)),
            }
        });
        run.map_err(|e| TranscodeError::generation(key.file_name(), e.to_string()))?;

        let size = fs::metadata(&temp).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(TranscodeError::generation(
                key.file_name(),
                "codec produced no output",
            ));
        }
        if !lease.is_owned() {
            return Err(TranscodeError::generation(
                key.file_name(),
                "lost the lock before publishing",
            ));
        }

        self.store.publish(key, temp)
    }

    /// Source metadata for geometry and progress; generation goes on without it.
    fn probe(&self, path: &Path) -> Option<MediaInfo> {
        match self.inspector.inspect(path) {
            Ok(info) => Some(info),
            Err(e) => {
                warn!("{} could not inspect {}: {}", self.inspector.name(), path.display(), e);
                None
            }
        }
    }
}

/// Configured path if it exists, else PATH lookup, else the bare name.
fn resolve_tool(name: &str, configured: Option<&Path>) -> PathBuf {
    transcoder_av::get_tool_path(name, configured).unwrap_or_else(|e| {
        debug!("{}; generation will fail until it is installed", e);
        configured
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(name))
    })
}

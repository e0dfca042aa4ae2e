//! Filesystem artifact cache.
//!
//! Artifacts live at `{root}/{kind_dir}/{file_name}` and are published by
//! renaming a finished temporary file from the same directory, so readers never
//! observe a partial artifact.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempPath;

use super::identity::ArtifactKey;
use super::kind::OutputKind;
use crate::config::OutputConfig;
use crate::error::{Result, TranscodeError};

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    base_url: String,
    dirs: BTreeMap<OutputKind, String>,
}

impl ArtifactStore {
    /// Store under `root` with the default per-kind directories.
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self::from_config(&OutputConfig {
            root: root.into(),
            base_url: base_url.into(),
            ..OutputConfig::default()
        })
    }

    pub fn from_config(config: &OutputConfig) -> Self {
        let dirs = BTreeMap::from([
            (OutputKind::Video, config.video_dir.clone()),
            (OutputKind::Audio, config.audio_dir.clone()),
            (OutputKind::Gif, config.gif_dir.clone()),
            (OutputKind::Thumbnail, config.thumbnail_dir.clone()),
        ]);
        Self {
            root: config.root.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            dirs,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory name of `kind` below the root.
    pub fn kind_dir(&self, kind: OutputKind) -> &str {
        self.dirs.get(&kind).map(String::as_str).unwrap_or(kind.as_str())
    }

    /// Location of the artifact for `key`, whether or not it exists.
    pub fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        self.root.join(self.kind_dir(key.kind())).join(key.file_name())
    }

    /// Public URL of the artifact for `key`; does not imply existence.
    pub fn url_for(&self, key: &ArtifactKey) -> String {
        format!("{}/{}/{}", self.base_url, self.kind_dir(key.kind()), key.file_name())
    }

    /// Whether a non-empty artifact exists for `key`.
    ///
    /// A zero-byte file is an incomplete write, not a hit.
    pub fn exists(&self, key: &ArtifactKey) -> bool {
        fs::metadata(self.path_for(key))
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
    }

    /// Reserve a temporary output file next to the final location of `key`.
    ///
    /// The file is deleted when the returned path is dropped unless it is
    /// handed to [`publish`](Self::publish).
    pub fn temp_output(&self, key: &ArtifactKey) -> Result<TempPath> {
        let dir = self.root.join(self.kind_dir(key.kind()));
        let write_error = |source| TranscodeError::StoreWriteError {
            artifact: key.file_name(),
            source,
        };

        fs::create_dir_all(&dir).map_err(write_error)?;
        let file = tempfile::Builder::new()
            .prefix(&format!(".{}.", key.digest()))
            .suffix(&format!(".{}", key.extension()))
            .tempfile_in(&dir)
            .map_err(write_error)?;
        Ok(file.into_temp_path())
    }

    /// Atomically move a finished temporary output into place.
    ///
    /// Never replaces a published artifact: if one already exists the
    /// temporary output is discarded and the existing file is kept.
    pub fn publish(&self, key: &ArtifactKey, temp: TempPath) -> Result<()> {
        let target = self.path_for(key);
        match temp.persist_noclobber(&target) {
            Ok(()) => {
                tracing::debug!("Published {}", target.display());
                Ok(())
            }
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists && self.exists(key) => {
                tracing::debug!("{} was already published, keeping it", target.display());
                Ok(())
            }
            Err(e) => Err(TranscodeError::StoreWriteError {
                artifact: key.file_name(),
                source: e.error,
            }),
        }
    }

    /// Resolve a public URL (or bare path) to a file inside the root.
    ///
    /// Returns `None` unless the URL lies under the base URL and names an
    /// existing regular file that stays inside the root after symlinks and
    /// `..` components are resolved.
    pub fn download_path(&self, url: &str) -> Option<PathBuf> {
        let path = url_path(url);
        let base = url_path(&self.base_url);
        let relative = if base.is_empty() {
            path.trim_start_matches('/')
        } else {
            path.strip_prefix(base)?.strip_prefix('/')?
        };
        if relative.is_empty() {
            return None;
        }

        let root = self.root.canonicalize().ok()?;
        let resolved = root.join(relative).canonicalize().ok()?;
        if !resolved.starts_with(&root) || !resolved.is_file() {
            return None;
        }
        // Engine bookkeeping (locks, progress, temp outputs) is not downloadable
        let hidden = resolved
            .strip_prefix(&root)
            .ok()?
            .components()
            .any(|c| c.as_os_str().to_string_lossy().starts_with('.'));
        (!hidden).then_some(resolved)
    }
}

/// Path part of a URL: no scheme, host, query or fragment, no trailing `/`.
fn url_path(url: &str) -> &str {
    let url = url.trim();
    let url = url.split(['?', '#']).next().unwrap_or_default();
    let path = match url.split_once("://") {
        Some((_scheme, rest)) => rest.find('/').map(|i| &rest[i..]).unwrap_or_default(),
        None => url,
    };
    path.trim_end_matches('/')
}

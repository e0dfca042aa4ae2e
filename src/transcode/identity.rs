//! Artifact identity.
//!
//! A key is the SHA-256 of a versioned canonical serialisation of the source
//! snapshot, the output kind and the normalised options, truncated to the
//! configured number of hex characters.

use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use super::kind::OutputKind;
use super::options::NormalizedOptions;
use crate::error::{Result, TranscodeError};

/// Bumped whenever the canonical serialisation changes.
const KEY_VERSION: &str = "v1";
const MIN_KEY_LENGTH: usize = 16;
const MAX_KEY_LENGTH: usize = 64;
const DEFAULT_KEY_LENGTH: usize = 32;
const MAX_STEM_LENGTH: usize = 48;

/// Snapshot of a source file taken at request time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    path: PathBuf,
    modified: SystemTime,
    size: u64,
}

impl SourceDescriptor {
    /// Stat `path`.
    ///
    /// # Errors
    ///
    /// [`TranscodeError::SourceUnavailable`] if the file does not exist, is not
    /// a regular file or cannot be opened for reading.
    pub fn resolve(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let unavailable = |e| TranscodeError::source_unavailable(path, e);

        let absolute = path.canonicalize().map_err(unavailable)?;
        let metadata = absolute.metadata().map_err(unavailable)?;
        if !metadata.is_file() {
            return Err(unavailable(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "not a regular file",
            )));
        }
        File::open(&absolute).map_err(unavailable)?;

        Ok(Self {
            path: absolute,
            modified: metadata.modified().map_err(unavailable)?,
            size: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn modified(&self) -> SystemTime {
        self.modified
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Modification time in nanoseconds relative to the Unix epoch.
    fn modified_nanos(&self) -> i128 {
        match self.modified.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_nanos() as i128,
            Err(e) => -(e.duration().as_nanos() as i128),
        }
    }
}

/// Identifier of one artifact, shared by the store, progress records and locks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    kind: OutputKind,
    digest: String,
    label: String,
    extension: &'static str,
}

impl ArtifactKey {
    pub fn kind(&self) -> OutputKind {
        self.kind
    }

    /// Fixed-length hex digest; the part of the key that carries identity.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn extension(&self) -> &'static str {
        self.extension
    }

    /// Artifact file name, `{label}_{digest}.{ext}`.
    pub fn file_name(&self) -> String {
        format!("{}_{}.{}", self.label, self.digest, self.extension)
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.file_name())
    }
}

/// Recover the digest from an artifact file name (or a path/URL ending in one).
pub fn digest_from_file_name(name: &str) -> Option<&str> {
    let name = name.rsplit(['/', '\\']).next()?;
    let (stem, _ext) = name.rsplit_once('.')?;
    let (_label, digest) = stem.rsplit_once('_')?;
    is_digest(digest).then_some(digest)
}

/// Whether `s` has the shape of a key digest (lowercase hex, valid length).
pub fn is_digest(s: &str) -> bool {
    (MIN_KEY_LENGTH..=MAX_KEY_LENGTH).contains(&s.len())
        && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Derives [`ArtifactKey`]s.
#[derive(Debug, Clone, Copy)]
pub struct KeyBuilder {
    length: usize,
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self {
            length: DEFAULT_KEY_LENGTH,
        }
    }
}

impl KeyBuilder {
    /// Builder producing digests of `length` hex characters.
    pub fn new(length: usize) -> Result<Self> {
        if !(MIN_KEY_LENGTH..=MAX_KEY_LENGTH).contains(&length) {
            return Err(TranscodeError::Config(format!(
                "key_length must be between {} and {}, got {}",
                MIN_KEY_LENGTH, MAX_KEY_LENGTH, length
            )));
        }
        Ok(Self { length })
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Derive the key of `opts` applied to `source`.
    pub fn derive(&self, source: &SourceDescriptor, opts: &NormalizedOptions) -> ArtifactKey {
        let kind = opts.kind();

        let mut hasher = Sha256::new();
        for field in [
            KEY_VERSION.to_string(),
            kind.as_str().to_string(),
            source.path.to_string_lossy().into_owned(),
            source.modified_nanos().to_string(),
            source.size.to_string(),
        ] {
            hasher.update(field.as_bytes());
            hasher.update([0u8]);
        }
        for (name, value) in opts.iter() {
            hasher.update(format!("{}={}", name, value).as_bytes());
            hasher.update([0u8]);
        }

        let mut digest = hex::encode(hasher.finalize());
        digest.truncate(self.length);

        let extension = kind.extension(opts);
        let mut label = format!("{}_{}", sanitize_stem(&source.path), extension);
        if let Some(geometry) = kind.geometry_label(opts) {
            label.push('_');
            label.push_str(&geometry);
        }

        ArtifactKey {
            kind,
            digest,
            label,
            extension,
        }
    }
}

/// File stem reduced to `[A-Za-z0-9-]`, for readable artifact names.
fn sanitize_stem(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut out = String::with_capacity(stem.len());
    for c in stem.chars() {
        let c = if c.is_ascii_alphanumeric() { c } else { '-' };
        if c == '-' && (out.is_empty() || out.ends_with('-')) {
            continue;
        }
        out.push(c);
        if out.len() >= MAX_STEM_LENGTH {
            break;
        }
    }
    let out = out.trim_end_matches('-');

    if out.is_empty() {
        "source".to_string()
    } else {
        out.to_string()
    }
}

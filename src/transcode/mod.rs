//! The transcoding engine.
//!
//! Leaf-first: [`options`] normalises requests, [`identity`] derives artifact
//! keys, [`store`] maps keys to files and URLs, [`progress`] and [`lease`] keep
//! per-key state on disk, [`kind`] builds codec arguments per output kind,
//! [`inspector`] reads source metadata, and [`coordinator`] ties them together.

pub mod coordinator;
pub mod identity;
pub mod inspector;
pub mod kind;
pub mod lease;
pub mod options;
pub mod progress;
pub mod store;

pub use coordinator::{Generate, TranscodeCoordinator, LOCKS_DIR, PROGRESS_DIR};
pub use identity::{digest_from_file_name, ArtifactKey, KeyBuilder, SourceDescriptor};
pub use inspector::{FfprobeInspector, FileInfo, MediaInspector};
pub use kind::OutputKind;
pub use lease::{Lease, LeaseRegistry};
pub use options::{NormalizedOptions, OptionNormalizer, OptionValue, RawOptions};
pub use progress::{ProgressRecord, ProgressStatus, ProgressTracker};
pub use store::ArtifactStore;

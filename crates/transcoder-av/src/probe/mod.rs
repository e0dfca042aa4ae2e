//! Media file probing module.
//!
//! Metadata is extracted by running `ffprobe` and parsing its JSON output.

mod ffprobe;
mod types;

pub use ffprobe::{parse_ffprobe_json, probe_with_ffprobe};
pub use types::*;

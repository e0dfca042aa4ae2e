use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use transcoder::transcode::{Generate, OutputKind, RawOptions};

#[derive(Parser)]
#[command(name = "transcoder")]
#[command(author, version, about = "On-demand cached media transcoding")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the URL of a video rendition, generating it if needed
    VideoUrl(UrlArgs),

    /// Print the URL of an audio rendition, generating it if needed
    AudioUrl(UrlArgs),

    /// Print the URL of an animated GIF, generating it if needed
    GifUrl(UrlArgs),

    /// Print the URL of a video thumbnail, generating it if needed
    ThumbnailUrl(UrlArgs),

    /// Print the artifact file name for a request (used to poll progress)
    FileName {
        /// Output kind: video, audio, gif or thumbnail
        kind: OutputKind,

        /// Source media file
        file: PathBuf,

        /// Transcode option as KEY=VALUE (repeatable)
        #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,
    },

    /// Show generation progress of an artifact
    Progress {
        /// Artifact file name, URL or digest
        file_name: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show metadata of a media file as JSON
    Info {
        /// File to inspect
        file: PathBuf,

        /// Only the primary streams
        #[arg(long)]
        summary: bool,
    },

    /// Resolve an artifact URL to its file under the output root
    Download {
        /// Public artifact URL
        url: String,
    },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses --config or defaults if not specified)
        #[arg(value_name = "CONFIG")]
        file: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

#[derive(Args)]
pub struct UrlArgs {
    /// Source media file
    pub file: PathBuf,

    /// Transcode option as KEY=VALUE (repeatable)
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
    pub options: Vec<String>,

    /// Only look up the cache; never generate
    #[arg(long, conflicts_with = "background")]
    pub no_generate: bool,

    /// Print the (empty) result at once and generate before exiting
    #[arg(long)]
    pub background: bool,
}

impl UrlArgs {
    pub fn generate(&self) -> Generate {
        if self.no_generate {
            Generate::Never
        } else if self.background {
            Generate::Background
        } else {
            Generate::Blocking
        }
    }
}

/// Parse `KEY=VALUE` pairs. Values are read as JSON scalars when they parse
/// as one (`640`, `true`, `null`), otherwise kept as strings.
pub fn parse_options(pairs: &[String]) -> Result<RawOptions> {
    let mut options = RawOptions::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Invalid option {:?}, expected KEY=VALUE", pair);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("Invalid option {:?}, missing key", pair);
        }
        let value = match serde_json::from_str::<Value>(value) {
            Ok(v) if !v.is_object() && !v.is_array() => v,
            _ => Value::String(value.to_string()),
        };
        options.insert(key.to_string(), value);
    }
    Ok(options)
}

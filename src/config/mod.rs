mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

use crate::transcode::{KeyBuilder, OptionNormalizer};

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = [
        "./transcoder.toml",
        "./config.toml",
        "~/.config/transcoder/config.toml",
        "/etc/transcoder/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    Ok(Config::default())
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.output.base_url.trim().is_empty() {
        anyhow::bail!("output.base_url cannot be empty");
    }

    for (name, dir) in [
        ("video_dir", &config.output.video_dir),
        ("audio_dir", &config.output.audio_dir),
        ("gif_dir", &config.output.gif_dir),
        ("thumbnail_dir", &config.output.thumbnail_dir),
    ] {
        if dir.is_empty() || dir.contains('/') || dir.contains('\\') || dir.starts_with('.') {
            anyhow::bail!("output.{} must be a plain directory name, got {:?}", name, dir);
        }
    }

    if config.generation.timeout_secs == 0 {
        anyhow::bail!("generation.timeout_secs must be positive");
    }
    if config.generation.lease_secs == 0 {
        anyhow::bail!("generation.lease_secs must be positive");
    }
    if config.generation.poll_interval_ms == 0 {
        anyhow::bail!("generation.poll_interval_ms must be positive");
    }
    // The lease is renewed between codec progress ticks
    if config.generation.poll_interval_ms.saturating_mul(3)
        > config.generation.lease_secs.saturating_mul(1000)
    {
        anyhow::bail!(
            "generation.poll_interval_ms = {} is too slow to renew a {}s lease; use at most a third of it",
            config.generation.poll_interval_ms,
            config.generation.lease_secs
        );
    }
    if config.generation.lease_secs < 3 {
        tracing::warn!(
            "generation.lease_secs = {} leaves little room for lease renewal",
            config.generation.lease_secs
        );
    }

    KeyBuilder::new(config.cache.key_length).context("Invalid [cache] section")?;
    OptionNormalizer::from_config(config).context("Invalid [formats] or [presets] section")?;

    Ok(())
}

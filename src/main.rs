mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands, UrlArgs};
use std::path::{Path, PathBuf};
use transcoder::{
    config,
    transcode::{FileInfo, OutputKind, TranscodeCoordinator},
};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "transcoder=trace,transcoder_av=debug".to_string()
        } else {
            "transcoder=info,transcoder_av=info".to_string()
        }
    });

    // stdout carries command results only
    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::VideoUrl(args) => print_url(OutputKind::Video, &args, config_path),
        Commands::AudioUrl(args) => print_url(OutputKind::Audio, &args, config_path),
        Commands::GifUrl(args) => print_url(OutputKind::Gif, &args, config_path),
        Commands::ThumbnailUrl(args) => print_url(OutputKind::Thumbnail, &args, config_path),
        Commands::FileName {
            kind,
            file,
            options,
        } => print_file_name(kind, &file, &options, config_path),
        Commands::Progress { file_name, json } => print_progress(&file_name, json, config_path),
        Commands::Info { file, summary } => print_info(&file, summary, config_path),
        Commands::Download { url } => print_download(&url, config_path),
        Commands::CheckTools => check_tools(config_path),
        Commands::Validate { file } => {
            let path = file.or_else(|| config_path.map(Path::to_path_buf));
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("transcoder {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn coordinator(config_path: Option<&Path>) -> Result<TranscodeCoordinator> {
    let config = config::load_config_or_default(config_path)?;
    TranscodeCoordinator::from_config(&config).context("Failed to set up the transcoder")
}

fn print_url(kind: OutputKind, args: &UrlArgs, config_path: Option<&Path>) -> Result<()> {
    let coordinator = coordinator(config_path)?;
    let options = cli::parse_options(&args.options)?;

    let url = coordinator.get_url(kind, &args.file, &options, args.generate())?;
    println!("{}", url);

    // Keep the process alive until the detached generation is done
    coordinator.wait_for_background();
    Ok(())
}

fn print_file_name(
    kind: OutputKind,
    file: &Path,
    options: &[String],
    config_path: Option<&Path>,
) -> Result<()> {
    let coordinator = coordinator(config_path)?;
    let options = cli::parse_options(options)?;
    println!("{}", coordinator.artifact_file_name(kind, file, &options)?);
    Ok(())
}

fn print_progress(file_name: &str, json: bool, config_path: Option<&Path>) -> Result<()> {
    let coordinator = coordinator(config_path)?;
    let Some(record) = coordinator.progress(file_name)? else {
        anyhow::bail!("No generation recorded for {}", file_name);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        println!("{} {}%", record.status, record.percent);
    }
    Ok(())
}

fn print_info(file: &Path, summary: bool, config_path: Option<&Path>) -> Result<()> {
    let coordinator = coordinator(config_path)?;
    let info = coordinator.file_info(file, summary)?;
    if let FileInfo::Full(ref media) = info {
        tracing::debug!("{} video / {} audio tracks", media.video_tracks.len(), media.audio_tracks.len());
    }
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

fn print_download(url: &str, config_path: Option<&Path>) -> Result<()> {
    let coordinator = coordinator(config_path)?;
    match coordinator.download_path(url) {
        Some(path) => {
            println!("{}", path.display());
            Ok(())
        }
        None => anyhow::bail!("Not found: {}", url),
    }
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = config::load_config_or_default(config_path)?;
    let tools = [
        ("ffmpeg", config.tools.ffmpeg_path.clone()),
        ("ffprobe", config.tools.ffprobe_path.clone()),
    ];
    let mut all_ok = true;

    for (name, configured) in tools {
        let program = configured.unwrap_or_else(|| PathBuf::from(name));
        let tool = transcoder_av::check_tool_with_arg(&program, "-version");
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Artifacts cannot be generated until they are installed.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            config::Config::default()
        }
    };

    println!("  Output root: {}", config.output.root.display());
    println!("  Base URL: {}", config.output.base_url);
    println!(
        "  Generation timeout: {}s (lease {}s, on contention: {:?})",
        config.generation.timeout_secs, config.generation.lease_secs, config.generation.on_contention
    );
    println!("  Key length: {}", config.cache.key_length);
    println!("  Presets: {}", config.presets.len());
    for name in config.presets.keys() {
        println!("    {}", name);
    }

    Ok(())
}

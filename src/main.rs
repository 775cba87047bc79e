use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::process::ExitCode;

use media_downloader::commands::{self, DownloadOptions};
use media_downloader::config::AppConfig;
use media_downloader::downloader::CustomQuality;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download one or more videos or playlists concurrently
    Download {
        /// Video or playlist URLs
        #[arg(required = true)]
        urls: Vec<String>,

        /// best, normal or custom
        #[arg(short, long)]
        quality: Option<String>,

        /// Highest acceptable video height for custom quality
        #[arg(long)]
        max_height: Option<u32>,

        /// Lowest acceptable video height for custom quality
        #[arg(long)]
        min_height: Option<u32>,

        /// Container extension for custom quality, e.g. mp4
        #[arg(long)]
        ext: Option<String>,

        /// Exact yt-dlp format id for custom quality
        #[arg(long)]
        format_id: Option<String>,

        /// Destination directory, defaults to the configured download path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print events as JSON lines instead of progress bars
        #[arg(long)]
        json: bool,
    },
    /// Inspect or edit the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the configuration file location
    Path,
    /// Set a value, e.g. `network.chunk_timeout_secs 30`
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    let config = AppConfig::load().context("Failed to load configuration")?;
    info!("Configuration loaded");

    match cli.command {
        Command::Download {
            urls,
            quality,
            max_height,
            min_height,
            ext,
            format_id,
            output,
            json,
        } => {
            let filter = CustomQuality {
                max_height,
                min_height,
                extension: ext,
                format_id,
            };
            let quality =
                commands::resolve_quality(quality.as_deref(), filter, &config.preferred_quality)?;
            let options = DownloadOptions {
                urls,
                quality: Some(quality),
                output,
                json,
            };

            let report = commands::download(&config, options).await?;
            if report.is_success() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Config { action } => {
            match action {
                ConfigAction::Show => println!("{}", commands::show_config(&config)?),
                ConfigAction::Path => println!("{}", AppConfig::get_config_path()?.display()),
                ConfigAction::Set { key, value } => {
                    let stored = AppConfig::load_file().context("Failed to read configuration")?;
                    let updated = commands::set_config_value(&stored, &key, &value)?;
                    updated.save().context("Failed to save configuration")?;
                    println!("{} updated", key);
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

mod commands;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use mirrorline_engine::config::types::ChannelMode;
use mirrorline_engine::exit_code;
use mirrorline_types::state::RunStatus;

#[derive(Parser)]
#[command(
    name = "mirrorline",
    version,
    about = "Resilient mirroring of CMS sites and message channels"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config YAML (default: config/mirrorline.yml, optional)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror WordPress-style CMS sites into storage
    Cms {
        #[command(subcommand)]
        command: CmsCommand,
    },
    /// Export message channel history with media
    Channel {
        #[command(subcommand)]
        command: ChannelCommand,
    },
}

#[derive(Subcommand)]
enum CmsCommand {
    /// Sync every configured site, or only one
    Sync {
        /// Site id from the config file
        #[arg(long)]
        site: Option<String>,
    },
    /// List configured sites
    ListSites,
}

#[derive(Subcommand)]
enum ChannelCommand {
    /// Parse one source into an export directory
    Parse {
        /// Source handle, @handle or a public link to it
        source: String,
        /// Directory holding the local history dump
        #[arg(long)]
        feed: PathBuf,
        /// Earliest message date to keep (YYYY-MM-DD)
        #[arg(long)]
        date_from: Option<NaiveDate>,
        /// Latest message date to keep, inclusive (YYYY-MM-DD)
        #[arg(long)]
        date_to: Option<NaiveDate>,
        /// Keep only messages containing one of these keywords (repeatable)
        #[arg(long = "keyword")]
        keywords: Vec<String>,
        /// Skip media larger than this many megabytes
        #[arg(long)]
        max_media_size: Option<u64>,
        /// Count what would be exported without writing anything
        #[arg(long)]
        dry_run: bool,
        /// Export root (default: channel.output_dir from config)
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Pacing preset: safe or normal (default: channel.mode from config)
        #[arg(long)]
        mode: Option<ChannelMode>,
        /// Keep the temporary download directory after the run
        #[arg(long)]
        keep_temp: bool,
    },
    /// Resolve a handle or link to the source it names
    Resolve {
        /// Source handle, @handle or a public link to it
        source: String,
        /// Directory holding the local history dump
        #[arg(long)]
        feed: PathBuf,
    },
    /// List sources present in a history dump
    ListSources {
        /// Directory holding the local history dump
        #[arg(long)]
        feed: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    let result = match commands::load_config(cli.config.as_deref()) {
        Ok(config) => match cli.command {
            Commands::Cms { command } => match command {
                CmsCommand::Sync { site } => commands::cms::sync(&config, site.as_deref()).await,
                CmsCommand::ListSites => commands::cms::list_sites(&config),
            },
            Commands::Channel { command } => match command {
                ChannelCommand::Parse {
                    source,
                    feed,
                    date_from,
                    date_to,
                    keywords,
                    max_media_size,
                    dry_run,
                    output_dir,
                    mode,
                    keep_temp,
                } => {
                    let args = commands::channel::ParseArgs {
                        source,
                        feed,
                        date_from,
                        date_to,
                        keywords,
                        max_media_size,
                        dry_run,
                        output_dir,
                        mode,
                        keep_temp,
                    };
                    commands::channel::parse(&config, args).await
                }
                ChannelCommand::Resolve { source, feed } => {
                    commands::channel::resolve(&feed, &source).await
                }
                ChannelCommand::ListSources { feed } => commands::channel::list_sources(&feed).await,
            },
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(status) => ExitCode::from(exit_code(status)),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(exit_code(RunStatus::Failed))
        }
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use mirrorline_engine::channel::filter::{normalize_source_ref, DateRange, KeywordFilter};
use mirrorline_engine::channel::{parse_channel, ChannelOptions};
use mirrorline_engine::clients::channel::MessageChannelClient;
use mirrorline_engine::clients::feed::FeedChannelClient;
use mirrorline_engine::config::types::{ChannelMode, MirrorConfig};
use mirrorline_engine::context::new_run_id;
use mirrorline_engine::resolve::{close_storage, open_storage_blocking};
use mirrorline_state::{SqliteBackend, StorageBackend};
use mirrorline_types::item::SourceInfo;
use mirrorline_types::state::RunStatus;

use super::print_summaries;

/// Arguments of `channel parse` after clap.
pub struct ParseArgs {
    pub source: String,
    pub feed: PathBuf,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub keywords: Vec<String>,
    pub max_media_size: Option<u64>,
    pub dry_run: bool,
    pub output_dir: Option<PathBuf>,
    pub mode: Option<ChannelMode>,
    pub keep_temp: bool,
}

impl ParseArgs {
    fn into_options(self, config: &MirrorConfig) -> Result<ChannelOptions> {
        if let (Some(from), Some(to)) = (self.date_from, self.date_to) {
            if from > to {
                bail!("--date-from {from} is after --date-to {to}");
            }
        }

        let mut options = ChannelOptions::new(
            self.source,
            self.output_dir
                .unwrap_or_else(|| config.channel.output_dir.clone()),
            config.channel.session_file.clone(),
            self.mode.unwrap_or(config.channel.mode),
            config.retry.policy(),
        );
        options.page_size = config.channel.page_size;
        options.requests_per_second = config.channel.requests_per_second;
        options.date_range = DateRange {
            from: self.date_from,
            to: self.date_to,
        };
        options.keywords = KeywordFilter::new(&self.keywords);
        options.max_media_size_mb = self.max_media_size;
        options.dry_run = self.dry_run;
        options.keep_temp = self.keep_temp;
        Ok(options)
    }
}

/// Execute `channel parse`: export one source from a history dump.
pub async fn parse(config: &MirrorConfig, args: ParseArgs) -> Result<RunStatus> {
    // 1. Build run options
    let feed = args.feed.clone();
    let options = args.into_options(config)?;

    // 2. Open storage; a dry run touches nothing on disk
    let storage: Arc<dyn StorageBackend> = if options.dry_run {
        Arc::new(SqliteBackend::in_memory().context("Failed to open scratch storage")?)
    } else {
        open_storage_blocking(config.storage.clone())
            .await
            .context("Failed to open storage")?
    };

    // 3. Run the pipeline
    let client = FeedChannelClient::new(feed);
    let result = parse_channel(&client, &storage, &new_run_id(), &options).await;
    close_storage(storage).await;
    let summary = result.with_context(|| format!("Cannot parse '{}'", options.source))?;

    // 4. Report
    print_summaries(std::slice::from_ref(&summary))?;
    if summary.status != RunStatus::Success {
        eprintln!(
            "{} {}: {}",
            summary.source_id,
            summary.status.as_str(),
            summary
                .error_message
                .as_deref()
                .or(summary.error_code.as_deref())
                .unwrap_or("see logs/errors.log in the export directory")
        );
    }
    Ok(summary.status)
}

/// Execute `channel list-sources`.
pub async fn list_sources(feed: &Path) -> Result<RunStatus> {
    let client = FeedChannelClient::new(feed);
    client
        .connect()
        .await
        .with_context(|| format!("Cannot open feed {}", feed.display()))?;
    let sources = client.list_sources().await.context("Failed to list sources")?;
    println!("{}", serde_json::to_string_pretty(&sources)?);
    Ok(RunStatus::Success)
}

/// Execute `channel resolve`: show which source a handle or link names.
pub async fn resolve(feed: &Path, source: &str) -> Result<RunStatus> {
    let info = resolve_info(feed, source).await?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(RunStatus::Success)
}

async fn resolve_info(feed: &Path, source: &str) -> Result<SourceInfo> {
    let reference = normalize_source_ref(source);
    let client = FeedChannelClient::new(feed);
    client
        .connect()
        .await
        .with_context(|| format!("Cannot open feed {}", feed.display()))?;
    client
        .resolve_source(&reference.handle)
        .await
        .with_context(|| format!("Cannot resolve '{source}'"))
}

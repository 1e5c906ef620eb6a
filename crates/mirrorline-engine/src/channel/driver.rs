//! Resumable parse of one message channel into an export directory.
//!
//! History is paged newest-first. After every page the new items are upserted
//! into storage and the export, cursor, and media registry are persisted.
//!
//! The cursor is the highest id ever committed and later runs stop paging
//! once they reach it. An interrupted first run therefore keeps what it
//! committed, but the older pages it never reached are not revisited.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mirrorline_state::StorageBackend;
use mirrorline_types::item::{MediaError, MediaRef, NormalizedItem, SourceInfo};
use mirrorline_types::state::{RunCompletion, RunCounts, RunId, RunStatus, SourceId};
use mirrorline_types::{ErrorKind, SyncError};
use rand::Rng;
use serde_json::{json, Map};

use crate::aggregate::{classify, SubSyncOutcome};
use crate::channel::filter::{normalize_source_ref, DatePosition, DateRange, KeywordFilter};
use crate::clients::{MessageChannelClient, RemoteMedia, RemoteMessage};
use crate::config::types::{ChannelMode, ModeSettings};
use crate::context::RunContext;
use crate::dedup::DedupStore;
use crate::event_log::EventLog;
use crate::fetch::ResilientFetcher;
use crate::incremental::{write_json_atomic, IncrementalStore};
use crate::lock::{AcquireOutcome, SessionLock};
use crate::media::{classify_media, media_file_name, sanitize_name};
use crate::rate_limit::RateLimiter;
use crate::result::ChannelSummary;
use crate::retry::RetryPolicy;
use crate::store::with_storage;

pub const TEMP_DIR: &str = ".tmp";
pub const LOG_DIR: &str = "logs";
pub const SUMMARY_FILE: &str = "summary.json";

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Everything one parse needs. Build with [`ChannelOptions::new`] and adjust
/// the public fields.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Handle, `@handle`, or public link.
    pub source: String,
    pub output_dir: PathBuf,
    /// Session resource guarded by the cross-process lock.
    pub session_file: PathBuf,
    pub mode: ChannelMode,
    pub settings: ModeSettings,
    pub page_size: u32,
    pub date_range: DateRange,
    pub keywords: KeywordFilter,
    pub max_media_size_mb: Option<u64>,
    pub dry_run: bool,
    pub keep_temp: bool,
    pub requests_per_second: f64,
    pub retry: RetryPolicy,
}

impl ChannelOptions {
    /// Options with the mode preset applied on top of `base` retry settings.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        session_file: impl Into<PathBuf>,
        mode: ChannelMode,
        base: RetryPolicy,
    ) -> Self {
        let settings = mode.settings();
        Self {
            source: source.into(),
            output_dir: output_dir.into(),
            session_file: session_file.into(),
            mode,
            settings,
            page_size: 100,
            date_range: DateRange::default(),
            keywords: KeywordFilter::default(),
            max_media_size_mb: None,
            dry_run: false,
            keep_temp: false,
            requests_per_second: 1.0,
            retry: RetryPolicy {
                max_retries: settings.max_retries,
                throttle_extra: settings.throttle_extra,
                ..base
            },
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    items_scanned: u64,
    items_new: u64,
    media_saved: u64,
    media_dedup_hits: u64,
    media_skipped_by_size: u64,
    media_failed: u64,
    known_size_bytes: u64,
    unknown_size_count: u64,
    throttle_events: u64,
}

impl Tally {
    fn media_stored(&self) -> u64 {
        self.media_saved + self.media_dedup_hits
    }

    fn known_size_mb(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let mb = self.known_size_bytes as f64 / BYTES_PER_MB as f64;
        (mb * 1000.0).round() / 1000.0
    }
}

/// Parse one source under the session lock.
///
/// Failures after the lock is taken are folded into the summary (failed or
/// partial); the ledger row is finalized either way.
///
/// # Errors
///
/// Returns `SessionLocked` when another live process holds the session, or
/// a storage error when the ledger row cannot be created.
pub async fn parse_channel(
    client: &dyn MessageChannelClient,
    storage: &Arc<dyn StorageBackend>,
    run_id: &RunId,
    options: &ChannelOptions,
) -> Result<ChannelSummary, SyncError> {
    let lock = acquire_session(&options.session_file).await?;

    let reference = normalize_source_ref(&options.source);
    if let Some(post_id) = reference.post_id {
        tracing::info!(post_id, handle = %reference.handle, "Post link given, parsing the whole source");
    }
    let ctx = RunContext::new(run_id.clone(), SourceId::new(reference.handle.as_str()));
    let started_at = Utc::now();

    if !options.dry_run {
        let (run, source) = (ctx.run_id.clone(), ctx.source_id.clone());
        with_storage(storage, "insert_run", move |s| s.insert_run(&run, &source, started_at)).await?;
    }

    let mut run = ChannelRun {
        client,
        storage,
        options,
        ctx: &ctx,
        tally: Tally::default(),
        export_dir: None,
    };
    let outcome = run.execute(&reference.handle).await;
    let ChannelRun {
        tally, export_dir, ..
    } = run;

    let mut outcomes = vec![SubSyncOutcome {
        succeeded: outcome.is_ok(),
        progress: tally.items_new,
    }];
    if tally.media_failed > 0 {
        outcomes.push(SubSyncOutcome::failed(tally.media_stored()));
    }
    let status = classify(&outcomes);
    let (error_code, error_message) = match &outcome {
        Err(err) => (Some(err.taxonomy_code().to_string()), Some(err.to_string())),
        Ok(()) if tally.media_failed > 0 => (
            Some(ErrorKind::PartialFailure.code().to_string()),
            Some(format!("{} media downloads failed", tally.media_failed)),
        ),
        Ok(()) => (None, None),
    };
    if let Err(err) = &outcome {
        tracing::error!(source = %ctx.source_id, kind = %err.kind, code = %err.code, error = %err, "Channel parse failed");
    }

    if !options.dry_run {
        finish_run(storage, &ctx, status, error_code.clone(), &tally).await;
    }

    let summary = ChannelSummary {
        run_id: ctx.run_id.clone(),
        source_id: ctx.source_id.to_string(),
        status,
        run_at: started_at,
        error_code,
        partial_failure: status == RunStatus::Partial,
        dry_run: options.dry_run,
        mode: options.mode.as_str().to_string(),
        items_scanned: tally.items_scanned,
        items_new: tally.items_new,
        media_saved: tally.media_saved,
        media_dedup_hits: tally.media_dedup_hits,
        media_skipped_by_size: tally.media_skipped_by_size,
        media_failed: tally.media_failed,
        throttle_events: tally.throttle_events,
        known_size_mb: tally.known_size_mb(),
        unknown_size_count: tally.unknown_size_count,
        export_dir,
        error_message,
    };

    if !options.dry_run {
        if let Some(dir) = summary.export_dir.as_deref().filter(|d| d.is_dir()) {
            if let Err(e) = write_json_atomic(&dir.join(SUMMARY_FILE), &summary) {
                tracing::warn!(path = %dir.display(), error = %e, "Could not write summary");
            }
        }
    }

    if let Err(e) = lock.release() {
        tracing::warn!(error = %e, "Could not remove session lock");
    }
    Ok(summary)
}

async fn acquire_session(session_file: &Path) -> Result<SessionLock, SyncError> {
    let resource = session_file.to_path_buf();
    let outcome = tokio::task::spawn_blocking(move || SessionLock::try_acquire(&resource))
        .await
        .map_err(|e| SyncError::storage("TASK_PANICKED", format!("session lock task panicked: {e}")))?
        .map_err(|e| {
            SyncError::config("LOCK_IO", format!("{}: {e}", session_file.display()))
        })?;
    match outcome {
        AcquireOutcome::Acquired(lock) => Ok(lock),
        AcquireOutcome::Busy { holder_pid } => {
            tracing::warn!(session = %session_file.display(), holder_pid = ?holder_pid, "Session busy");
            Err(SyncError::session_locked(session_file.display(), holder_pid))
        }
    }
}

async fn finish_run(
    storage: &Arc<dyn StorageBackend>,
    ctx: &RunContext,
    status: RunStatus,
    error_code: Option<String>,
    tally: &Tally,
) {
    let completion = RunCompletion {
        status,
        finished_at: Utc::now(),
        error_code,
        counts: RunCounts {
            items: tally.items_new,
            media: tally.media_stored(),
            ..RunCounts::default()
        },
    };
    let (run, source) = (ctx.run_id.clone(), ctx.source_id.clone());
    match with_storage(storage, "finish_run", move |s| s.finish_run(&run, &source, &completion)).await {
        Ok(0) => tracing::warn!(run_id = %ctx.run_id, source = %ctx.source_id, "No running ledger row matched on finish"),
        Ok(_) => {}
        Err(e) => tracing::error!(source = %ctx.source_id, error = %e, "Could not finalize run"),
    }
}

struct ChannelRun<'a> {
    client: &'a dyn MessageChannelClient,
    storage: &'a Arc<dyn StorageBackend>,
    options: &'a ChannelOptions,
    ctx: &'a RunContext,
    tally: Tally,
    export_dir: Option<PathBuf>,
}

impl ChannelRun<'_> {
    async fn execute(&mut self, handle: &str) -> Result<(), SyncError> {
        let client = self.client;
        let rps = self.options.requests_per_second;

        let bootstrap = ResilientFetcher::new(
            self.options.retry.clone(),
            RateLimiter::per_second(rps),
            Arc::new(EventLog::disabled()),
        );
        let resolved = async {
            bootstrap.call(self.ctx, "connect", move || client.connect()).await?;
            bootstrap
                .call(self.ctx, "resolve_source", move || client.resolve_source(handle))
                .await
        }
        .await;
        self.tally.throttle_events += bootstrap.stats().throttle_events();
        let source = resolved?;

        let export_dir = self.options.output_dir.join(sanitize_name(&source.handle()));
        self.export_dir = Some(export_dir.clone());
        let events = if self.options.dry_run {
            EventLog::disabled()
        } else {
            prepare_export_dir(&export_dir).map_err(|e| {
                SyncError::storage("EXPORT_DIR", format!("{}: {e}", export_dir.display()))
            })?;
            EventLog::open(export_dir.join(LOG_DIR)).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Event log unavailable, continuing without it");
                EventLog::disabled()
            })
        };
        let events = Arc::new(events);
        events.info(
            "run_started",
            self.ctx.event_with(json!({
                "source": self.options.source,
                "mode": self.options.mode.as_str(),
                "dry_run": self.options.dry_run,
            })),
        );

        let fetcher = ResilientFetcher::new(
            self.options.retry.clone(),
            RateLimiter::per_second(rps),
            Arc::clone(&events),
        );
        let result = self.ingest(&fetcher, &source, &export_dir).await;
        self.tally.throttle_events += fetcher.stats().throttle_events();

        if !self.options.dry_run && !self.options.keep_temp {
            match fs::remove_dir_all(export_dir.join(TEMP_DIR)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(error = %e, "Could not remove temp directory"),
            }
        }

        let finished = self.ctx.event_with(json!({
            "items_scanned": self.tally.items_scanned,
            "items_new": self.tally.items_new,
            "media_saved": self.tally.media_saved,
            "media_failed": self.tally.media_failed,
        }));
        match &result {
            Ok(()) => events.info("run_finished", finished),
            Err(_) => events.error("run_failed", finished),
        }
        result
    }

    async fn ingest(
        &mut self,
        fetcher: &ResilientFetcher,
        source: &SourceInfo,
        export_dir: &Path,
    ) -> Result<(), SyncError> {
        let (mut store, index) = IncrementalStore::load(export_dir, source);
        let mut dedup = DedupStore::new(export_dir, index);
        let temp_dir = export_dir.join(TEMP_DIR);
        let resume_from = store.resume_from();
        if resume_from > 0 {
            tracing::info!(source = %source.handle(), resume_from, "Resuming after cursor");
        }

        let client = self.client;
        let page_size = self.options.page_size;
        let mut before_id = 0i64;

        loop {
            let page = match fetcher
                .call(self.ctx, "list_history", move || {
                    client.list_history(source, before_id, page_size)
                })
                .await
            {
                Ok(page) => page,
                Err(err) if err.kind == ErrorKind::DataFormat => {
                    tracing::warn!(before_id, code = %err.code, error = %err, "Unreadable history page, treating as end of data");
                    fetcher.events().warn(
                        "page_skipped",
                        self.ctx.event_with(json!({"before_id": before_id, "code": err.code})),
                    );
                    break;
                }
                Err(err) => return Err(err),
            };
            if page.is_empty() {
                break;
            }

            let mut batch = Vec::new();
            let mut media_added = 0u64;
            let mut reached_lower_bound = false;
            for msg in &page {
                self.tally.items_scanned += 1;
                if store.should_skip(msg.id) || matches!(msg.media, Some(RemoteMedia::Poll)) {
                    continue;
                }
                match self.options.date_range.check(msg.date) {
                    DatePosition::Older => {
                        reached_lower_bound = true;
                        break;
                    }
                    DatePosition::Newer => continue,
                    DatePosition::Within => {}
                }
                if !self.options.keywords.matches(&msg.text) {
                    continue;
                }

                let media = match &msg.media {
                    Some(media) => {
                        self.collect_media(fetcher, source, msg.id, media, &mut dedup, &temp_dir)
                            .await
                    }
                    None => Vec::new(),
                };
                media_added += media.iter().filter(|m| m.path.is_some()).count() as u64;
                batch.push(normalize(source, msg, media));
            }

            let new_items = batch.len() as u64;
            if !self.options.dry_run && !batch.is_empty() {
                self.commit(&mut store, &dedup, batch, media_added).await?;
            }
            self.tally.items_new += new_items;

            let reached_cursor = resume_from > 0 && page.iter().any(|m| m.id <= resume_from);
            if reached_lower_bound || reached_cursor || page.len() < page_size as usize {
                break;
            }
            let oldest = page.iter().map(|m| m.id).min().unwrap_or(0);
            if oldest <= 1 || (before_id != 0 && oldest >= before_id) {
                break;
            }
            before_id = oldest;
            tokio::time::sleep(batch_pause(&self.options.settings)).await;
        }
        Ok(())
    }

    async fn commit(
        &self,
        store: &mut IncrementalStore,
        dedup: &DedupStore,
        batch: Vec<NormalizedItem>,
        media_added: u64,
    ) -> Result<(), SyncError> {
        let now = Utc::now();
        let items = batch.clone();
        with_storage(self.storage, "upsert_items", move |s| s.upsert_items(&items, now)).await?;
        store
            .commit_batch(&batch, media_added, dedup.index(), now)
            .map_err(|e| SyncError::storage("EXPORT_WRITE", format!("persisting export state: {e}")))?;
        tracing::debug!(items = batch.len(), cursor = store.cursor().last_processed_id, "Batch committed");
        Ok(())
    }

    /// Download and store one attachment. Returns at most one media entry;
    /// none when the attachment is skipped by size or has no payload.
    async fn collect_media(
        &mut self,
        fetcher: &ResilientFetcher,
        source: &SourceInfo,
        msg_id: i64,
        media: &RemoteMedia,
        dedup: &mut DedupStore,
        temp_dir: &Path,
    ) -> Vec<MediaRef> {
        let Some(shape) = classify_media(media) else {
            return Vec::new();
        };
        match shape.size.filter(|s| *s > 0) {
            Some(size) => self.tally.known_size_bytes += size,
            None => self.tally.unknown_size_count += 1,
        }
        let empty = MediaRef {
            kind: shape.kind,
            path: None,
            filename: None,
            size: shape.size,
            sha256: None,
            error: None,
        };
        if self.options.dry_run {
            return vec![empty];
        }
        if let (Some(limit_mb), Some(size)) = (self.options.max_media_size_mb, shape.size) {
            if size > limit_mb.saturating_mul(BYTES_PER_MB) {
                self.tally.media_skipped_by_size += 1;
                tracing::debug!(message_id = msg_id, size, limit_mb, "Media over size limit, skipped");
                return Vec::new();
            }
        }

        let file_name = media_file_name(msg_id, &shape);
        let temp = temp_dir.join(format!(
            "tmp_{msg_id}_{}",
            rand::thread_rng().gen_range(1000..10000)
        ));

        let downloaded = self.download(fetcher, source, msg_id, media, &temp).await;
        let failure = match downloaded {
            Ok(()) => match dedup.ingest(&temp, shape.kind, &file_name) {
                Ok(ingested) => {
                    if ingested.dedup_hit {
                        self.tally.media_dedup_hits += 1;
                    } else {
                        self.tally.media_saved += 1;
                    }
                    let record = ingested.record;
                    return vec![MediaRef {
                        filename: record.storage_path.rsplit('/').next().map(str::to_string),
                        path: Some(record.storage_path),
                        size: Some(record.size),
                        sha256: Some(record.content_hash),
                        ..empty
                    }];
                }
                Err(e) => {
                    tracing::warn!(message_id = msg_id, error = %e, "Could not store downloaded media");
                    MediaError::DownloadFailed
                }
            },
            Err(kind) => kind,
        };

        discard(&temp);
        self.tally.media_failed += 1;
        fetcher.events().error(
            "media_failed",
            self.ctx.event_with(json!({"message_id": msg_id, "error": failure})),
        );
        vec![MediaRef {
            error: Some(failure),
            ..empty
        }]
    }

    /// Download with one refetch of the parent message on an expired reference.
    async fn download(
        &self,
        fetcher: &ResilientFetcher,
        source: &SourceInfo,
        msg_id: i64,
        media: &RemoteMedia,
        temp: &Path,
    ) -> Result<(), MediaError> {
        let client = self.client;
        let err = match fetcher
            .call(self.ctx, "download_media", move || client.download_media(media, temp))
            .await
        {
            Ok(_) => return Ok(()),
            Err(err) => err,
        };
        if !err.is_reference_expired() {
            return Err(media_error_for(&err));
        }

        fetcher.events().warn(
            "file_reference_expired",
            self.ctx.event_with(json!({"message_id": msg_id})),
        );
        let fresh = fetcher
            .call(self.ctx, "refetch_message", move || client.refetch_message(source, msg_id))
            .await;
        let Some(fresh_media) = fresh.ok().flatten().and_then(|m| m.media) else {
            return Err(MediaError::FileReferenceExpired);
        };
        let fresh_media = &fresh_media;
        match fetcher
            .call(self.ctx, "download_media", move || client.download_media(fresh_media, temp))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                fetcher.events().error(
                    "file_reference_retry_failed",
                    self.ctx.event_with(json!({"message_id": msg_id, "code": e.code})),
                );
                Err(MediaError::FileReferenceExpired)
            }
        }
    }
}

fn media_error_for(err: &SyncError) -> MediaError {
    if err.is_reference_expired() {
        MediaError::FileReferenceExpired
    } else if err.kind == ErrorKind::RetryExhausted {
        if err.is_timeout() {
            MediaError::DownloadTimeout
        } else {
            MediaError::RetryExhausted
        }
    } else {
        MediaError::DownloadFailed
    }
}

fn normalize(source: &SourceInfo, msg: &RemoteMessage, media: Vec<MediaRef>) -> NormalizedItem {
    let mut metadata = Map::new();
    metadata.insert("forwarded".into(), json!(msg.forwarded));
    metadata.insert("reply_to_msg_id".into(), json!(msg.reply_to));
    metadata.insert("views".into(), json!(msg.views));
    metadata.insert("forwards".into(), json!(msg.forwards));
    NormalizedItem {
        source_id: source.handle(),
        external_id: msg.id.to_string(),
        published_at: msg.date,
        text: msg.text.clone(),
        media,
        metadata,
    }
}

fn prepare_export_dir(dir: &Path) -> io::Result<()> {
    for kind in ["photos", "videos", "documents"] {
        fs::create_dir_all(dir.join("media").join(kind))?;
    }
    fs::create_dir_all(dir.join(TEMP_DIR))
}

fn discard(temp: &Path) {
    match fs::remove_file(temp) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %temp.display(), error = %e, "Could not remove temp file"),
    }
}

fn batch_pause(settings: &ModeSettings) -> Duration {
    let (min, max) = (settings.batch_pause_min, settings.batch_pause_max);
    if max <= min {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mirrorline_types::error::codes;
    use rstest::rstest;

    #[rstest]
    #[case(SyncError::reference_expired("stale"), MediaError::FileReferenceExpired)]
    #[case(SyncError::retry_exhausted(4, SyncError::timeout("slow")), MediaError::DownloadTimeout)]
    #[case(
        SyncError::retry_exhausted(4, SyncError::network("CONNECT", "reset")),
        MediaError::RetryExhausted
    )]
    #[case(SyncError::terminal_network(codes::NOT_FOUND, "gone"), MediaError::DownloadFailed)]
    fn download_errors_map_to_media_errors(#[case] err: SyncError, #[case] expected: MediaError) {
        assert_eq!(media_error_for(&err), expected);
    }

    #[test]
    fn options_apply_mode_preset() {
        let opts = ChannelOptions::new("news", "out", "s.session", ChannelMode::Safe, RetryPolicy::default());
        assert_eq!(opts.retry.max_retries, 5);
        assert_eq!(opts.retry.throttle_extra, Duration::from_secs(5));
        let normal = ChannelOptions::new("news", "out", "s.session", ChannelMode::Normal, RetryPolicy::default());
        assert_eq!(normal.retry.max_retries, 3);
        assert_eq!(normal.retry.call_timeout, RetryPolicy::default().call_timeout);
    }

    #[test]
    fn batch_pause_stays_in_preset() {
        let settings = ChannelMode::Normal.settings();
        for _ in 0..50 {
            let pause = batch_pause(&settings);
            assert!(pause >= settings.batch_pause_min && pause <= settings.batch_pause_max);
        }
    }

    #[test]
    fn normalized_item_carries_metadata() {
        let source = SourceInfo {
            id: 1,
            username: Some("news".into()),
            title: None,
        };
        let msg = RemoteMessage {
            id: 42,
            date: Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()),
            text: "hello".into(),
            media: None,
            forwarded: true,
            reply_to: Some(41),
            views: Some(100),
            forwards: None,
        };
        let item = normalize(&source, &msg, Vec::new());
        assert_eq!(item.source_id, "news");
        assert_eq!(item.external_id, "42");
        assert_eq!(item.metadata["forwarded"], true);
        assert_eq!(item.metadata["reply_to_msg_id"], 41);
        assert!(item.metadata["forwards"].is_null());
    }

    #[test]
    fn known_size_is_rounded_to_kilobytes() {
        let tally = Tally {
            known_size_bytes: 1_572_864 + 500,
            ..Tally::default()
        };
        assert!((tally.known_size_mb() - 1.5).abs() < 1e-9);
    }
}

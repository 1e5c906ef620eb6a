//! End-to-end message-channel parses against file-backed and scripted clients.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use mirrorline_engine::channel::filter::DateRange;
use mirrorline_engine::channel::{parse_channel, ChannelOptions};
use mirrorline_engine::clients::{FeedChannelClient, MessageChannelClient, RemoteMedia, RemoteMessage};
use mirrorline_engine::config::types::ChannelMode;
use mirrorline_engine::incremental::{ExportDocument, EXPORT_FILE};
use mirrorline_engine::RetryPolicy;
use mirrorline_state::{SqliteBackend, StorageBackend};
use mirrorline_types::error::codes;
use mirrorline_types::item::{MediaError, SourceInfo};
use mirrorline_types::state::{RunId, RunStatus, SourceId};
use mirrorline_types::{ErrorKind, SyncError};
use serde_json::json;

fn memory_storage() -> Arc<dyn StorageBackend> {
    Arc::new(SqliteBackend::in_memory().unwrap())
}

fn options(work: &Path, source: &str) -> ChannelOptions {
    let mut opts = ChannelOptions::new(
        source,
        work.join("exports"),
        work.join("session"),
        ChannelMode::Normal,
        RetryPolicy::default(),
    );
    opts.requests_per_second = 0.0;
    opts
}

fn write_feed(root: &Path, messages: &[serde_json::Value]) {
    let dir = root.join("news");
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("source.json"),
        json!({"id": 100, "username": "news", "title": "News"}).to_string(),
    )
    .unwrap();
    fs::write(dir.join("messages.json"), serde_json::to_string(messages).unwrap()).unwrap();
}

fn text_messages(ids: std::ops::RangeInclusive<i64>) -> Vec<serde_json::Value> {
    ids.map(|id| json!({"id": id, "text": format!("message {id}")}))
        .collect()
}

fn read_export(work: &Path) -> ExportDocument {
    let raw = fs::read_to_string(work.join("exports/news").join(EXPORT_FILE)).unwrap();
    serde_json::from_str(&raw).unwrap()
}

#[tokio::test(start_paused = true)]
async fn second_run_ingests_only_new_messages() {
    let work = tempfile::tempdir().unwrap();
    let feed = work.path().join("feed");
    let storage = memory_storage();
    let client = FeedChannelClient::new(&feed);
    let mut opts = options(work.path(), "@news");
    opts.page_size = 20;

    write_feed(&feed, &text_messages(1..=50));
    let first = parse_channel(&client, &storage, &RunId::new("run00001"), &opts)
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Success);
    assert_eq!(first.items_new, 50);

    write_feed(&feed, &text_messages(1..=80));
    let second = parse_channel(&client, &storage, &RunId::new("run00002"), &opts)
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.items_new, 30);

    let export = read_export(work.path());
    assert_eq!(export.total_items, 80);
    assert_eq!(export.items.first().unwrap().external_id, "1");
    assert_eq!(export.items.last().unwrap().external_id, "80");
    assert_eq!(storage.item_count("news").unwrap(), 80);

    let run = storage
        .get_run(&RunId::new("run00002"), &SourceId::new("news"))
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.counts.items, 30);

    let summary: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(work.path().join("exports/news/summary.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(summary["items_new"], 30);
    assert!(!work.path().join("exports/news/.tmp").exists());
    assert!(work.path().join("exports/news/logs/run.log").is_file());
}

#[tokio::test(start_paused = true)]
async fn first_run_walks_every_page_until_date_bound() {
    let work = tempfile::tempdir().unwrap();
    let feed = work.path().join("feed");
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
    let messages: Vec<_> = (1..=30)
        .map(|id| json!({"id": id, "date": base + chrono::Duration::days(id), "text": "post"}))
        .collect();
    write_feed(&feed, &messages);

    let mut opts = options(work.path(), "news");
    opts.page_size = 5;
    // Message 14 is dated 2024-01-15; message 13 is the first older one.
    opts.date_range = DateRange {
        from: NaiveDate::from_ymd_opt(2024, 1, 15),
        to: None,
    };

    let summary = parse_channel(
        &FeedChannelClient::new(&feed),
        &memory_storage(),
        &RunId::new("run00010"),
        &opts,
    )
    .await
    .unwrap();

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.items_new, 17);
    assert_eq!(summary.items_scanned, 18, "paging stops inside the fourth page");
    let ids: Vec<i64> = read_export(work.path())
        .items
        .iter()
        .map(|i| i.external_id.parse().unwrap())
        .collect();
    assert_eq!(ids, (14..=30).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn malformed_message_is_skipped_not_fatal() {
    let work = tempfile::tempdir().unwrap();
    let feed = work.path().join("feed");
    let mut messages = text_messages(1..=5);
    messages.push(json!({"id": "not-a-number", "text": "broken"}));
    write_feed(&feed, &messages);

    let summary = parse_channel(
        &FeedChannelClient::new(&feed),
        &memory_storage(),
        &RunId::new("run00011"),
        &options(work.path(), "news"),
    )
    .await
    .unwrap();

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.items_new, 5);
    assert_eq!(summary.error_code, None);
}

/// Feed whose pages past the first fail to decode.
struct UnreadableTail(FeedChannelClient);

#[async_trait]
impl MessageChannelClient for UnreadableTail {
    async fn connect(&self) -> Result<(), SyncError> {
        self.0.connect().await
    }

    async fn resolve_source(&self, identifier: &str) -> Result<SourceInfo, SyncError> {
        self.0.resolve_source(identifier).await
    }

    async fn list_history(
        &self,
        source: &SourceInfo,
        before_id: i64,
        page_size: u32,
    ) -> Result<Vec<RemoteMessage>, SyncError> {
        if before_id != 0 {
            return Err(SyncError::data_format(codes::INVALID_JSON, "truncated page"));
        }
        self.0.list_history(source, before_id, page_size).await
    }

    async fn refetch_message(
        &self,
        source: &SourceInfo,
        id: i64,
    ) -> Result<Option<RemoteMessage>, SyncError> {
        self.0.refetch_message(source, id).await
    }

    async fn download_media(&self, media: &RemoteMedia, dest: &Path) -> Result<u64, SyncError> {
        self.0.download_media(media, dest).await
    }

    async fn list_sources(&self) -> Result<Vec<SourceInfo>, SyncError> {
        self.0.list_sources().await
    }
}

#[tokio::test(start_paused = true)]
async fn unreadable_page_ends_history_without_failing() {
    let work = tempfile::tempdir().unwrap();
    let feed = work.path().join("feed");
    write_feed(&feed, &text_messages(1..=10));
    let mut opts = options(work.path(), "news");
    opts.page_size = 5;

    let summary = parse_channel(
        &UnreadableTail(FeedChannelClient::new(&feed)),
        &memory_storage(),
        &RunId::new("run00012"),
        &opts,
    )
    .await
    .unwrap();

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.items_new, 5);
    let log = fs::read_to_string(work.path().join("exports/news/logs/run.log")).unwrap();
    assert!(log.contains("page_skipped"));
}

#[tokio::test(start_paused = true)]
async fn identical_media_is_stored_once() {
    let work = tempfile::tempdir().unwrap();
    let feed = work.path().join("feed");
    write_feed(
        &feed,
        &[
            json!({"id": 1, "text": "a", "media": {"type": "photo", "reference": "news/cat.bin"}}),
            json!({"id": 2, "text": "b", "media": {"type": "photo", "reference": "news/cat-copy.bin"}}),
            json!({"id": 3, "text": "poll", "media": {"type": "poll"}}),
        ],
    );
    fs::write(feed.join("news/cat.bin"), b"same bytes").unwrap();
    fs::write(feed.join("news/cat-copy.bin"), b"same bytes").unwrap();

    let summary = parse_channel(
        &FeedChannelClient::new(&feed),
        &memory_storage(),
        &RunId::new("run00003"),
        &options(work.path(), "news"),
    )
    .await
    .unwrap();

    assert_eq!(summary.items_new, 2, "polls are skipped");
    assert_eq!(summary.media_saved, 1);
    assert_eq!(summary.media_dedup_hits, 1);
    let photos: Vec<_> = fs::read_dir(work.path().join("exports/news/media/photos"))
        .unwrap()
        .collect();
    assert_eq!(photos.len(), 1);

    let export = read_export(work.path());
    let paths: Vec<_> = export
        .items
        .iter()
        .map(|i| i.media[0].path.clone().unwrap())
        .collect();
    assert_eq!(paths[0], paths[1]);
    // Newest first: message 2 is stored, message 1 reuses its file.
    assert_eq!(paths[0], "media/photos/2.jpg");
}

#[tokio::test(start_paused = true)]
async fn date_window_and_keywords_select_messages() {
    let work = tempfile::tempdir().unwrap();
    let feed = work.path().join("feed");
    let messages: Vec<_> = (1..=10)
        .map(|day| {
            let date = Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap();
            let text = if day % 2 == 0 { "Rust news" } else { "other" };
            json!({"id": day, "date": date, "text": text})
        })
        .collect();
    write_feed(&feed, &messages);

    let mut opts = options(work.path(), "news");
    opts.date_range = DateRange {
        from: NaiveDate::from_ymd_opt(2024, 1, 5),
        to: NaiveDate::from_ymd_opt(2024, 1, 8),
    };
    opts.keywords = mirrorline_engine::channel::filter::KeywordFilter::new(["rust"]);

    let summary = parse_channel(
        &FeedChannelClient::new(&feed),
        &memory_storage(),
        &RunId::new("run00004"),
        &opts,
    )
    .await
    .unwrap();

    // Newest first: 10, 9 are too new; 8..5 in range; 4 is older and stops paging.
    assert_eq!(summary.items_scanned, 7);
    assert_eq!(summary.items_new, 2);
    let ids: Vec<_> = read_export(work.path())
        .items
        .into_iter()
        .map(|i| i.external_id)
        .collect();
    assert_eq!(ids, ["6", "8"]);
}

#[tokio::test(start_paused = true)]
async fn dry_run_writes_nothing() {
    let work = tempfile::tempdir().unwrap();
    let feed = work.path().join("feed");
    write_feed(
        &feed,
        &[
            json!({"id": 1, "media": {"type": "photo", "reference": "news/a.bin", "size": 2_097_152}}),
            json!({"id": 2, "media": {"type": "document", "reference": "news/b.bin"}}),
        ],
    );
    let storage = memory_storage();
    let mut opts = options(work.path(), "news");
    opts.dry_run = true;

    let summary = parse_channel(&FeedChannelClient::new(&feed), &storage, &RunId::new("run00005"), &opts)
        .await
        .unwrap();

    assert!(summary.dry_run);
    assert_eq!(summary.items_new, 2);
    assert!((summary.known_size_mb - 2.0).abs() < 1e-9);
    assert_eq!(summary.unknown_size_count, 1);
    assert!(!work.path().join("exports").exists());
    assert!(storage
        .get_run(&RunId::new("run00005"), &SourceId::new("news"))
        .unwrap()
        .is_none());
}

#[tokio::test(start_paused = true)]
async fn busy_session_is_reported_as_locked() {
    let work = tempfile::tempdir().unwrap();
    let opts = options(work.path(), "news");
    fs::write(work.path().join("session.lock"), std::process::id().to_string()).unwrap();

    let err = parse_channel(
        &FeedChannelClient::new(work.path().join("feed")),
        &memory_storage(),
        &RunId::new("run00006"),
        &opts,
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind, ErrorKind::SessionLocked);
    assert_eq!(err.taxonomy_code(), "SESSION_LOCKED");
    assert!(work.path().join("session.lock").exists(), "foreign lock left in place");
}

#[tokio::test(start_paused = true)]
async fn missing_source_fails_the_run() {
    let work = tempfile::tempdir().unwrap();
    let feed = work.path().join("feed");
    write_feed(&feed, &text_messages(1..=3));
    let storage = memory_storage();

    let summary = parse_channel(
        &FeedChannelClient::new(&feed),
        &storage,
        &RunId::new("run00007"),
        &options(work.path(), "nobody"),
    )
    .await
    .unwrap();

    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.error_code.as_deref(), Some("NETWORK_ERROR"));
    let run = storage
        .get_run(&RunId::new("run00007"), &SourceId::new("nobody"))
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(!work.path().join("session.lock").exists(), "lock released");
}

/// Channel whose downloads behave per media reference:
/// `slow` never finishes, `expired` reports a stale reference, anything
/// else writes `bytes-<reference>`.
struct ScriptedChannel {
    messages: Vec<RemoteMessage>,
    refreshed: HashMap<i64, RemoteMessage>,
    downloads: AtomicU32,
}

#[async_trait]
impl MessageChannelClient for ScriptedChannel {
    async fn connect(&self) -> Result<(), SyncError> {
        Ok(())
    }

    async fn resolve_source(&self, _identifier: &str) -> Result<SourceInfo, SyncError> {
        Ok(SourceInfo {
            id: 100,
            username: Some("news".into()),
            title: None,
        })
    }

    async fn list_history(
        &self,
        _source: &SourceInfo,
        before_id: i64,
        page_size: u32,
    ) -> Result<Vec<RemoteMessage>, SyncError> {
        let mut page: Vec<_> = self
            .messages
            .iter()
            .filter(|m| before_id == 0 || m.id < before_id)
            .cloned()
            .collect();
        page.sort_by(|a, b| b.id.cmp(&a.id));
        page.truncate(page_size as usize);
        Ok(page)
    }

    async fn refetch_message(
        &self,
        _source: &SourceInfo,
        id: i64,
    ) -> Result<Option<RemoteMessage>, SyncError> {
        Ok(self.refreshed.get(&id).cloned())
    }

    async fn download_media(&self, media: &RemoteMedia, dest: &Path) -> Result<u64, SyncError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let RemoteMedia::Photo { reference, .. } = media else {
            return Err(SyncError::terminal_network(codes::NOT_FOUND, "unexpected media"));
        };
        match reference.as_str() {
            "slow" => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(0)
            }
            "expired" => Err(SyncError::reference_expired("stale reference")),
            other => {
                let bytes = format!("bytes-{other}");
                fs::write(dest, &bytes).map_err(|e| SyncError::network("IO", e.to_string()))?;
                Ok(bytes.len() as u64)
            }
        }
    }

    async fn list_sources(&self) -> Result<Vec<SourceInfo>, SyncError> {
        Ok(Vec::new())
    }
}

fn photo_message(id: i64, reference: &str) -> RemoteMessage {
    RemoteMessage {
        id,
        date: None,
        text: format!("text {id}"),
        media: Some(RemoteMedia::Photo {
            reference: reference.into(),
            size: None,
        }),
        forwarded: false,
        reply_to: None,
        views: None,
        forwards: None,
    }
}

#[tokio::test(start_paused = true)]
async fn timed_out_media_marks_run_partial_but_keeps_text() {
    let work = tempfile::tempdir().unwrap();
    let client = ScriptedChannel {
        messages: vec![
            photo_message(1, "fine"),
            photo_message(2, "slow"),
            photo_message(3, "expired"),
        ],
        refreshed: HashMap::from([(3, photo_message(3, "fresh"))]),
        downloads: AtomicU32::new(0),
    };
    let storage = memory_storage();
    let mut opts = options(work.path(), "news");
    opts.retry.max_retries = 2;
    opts.retry.call_timeout = Duration::from_secs(5);

    let summary = parse_channel(&client, &storage, &RunId::new("run00008"), &opts)
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Partial);
    assert!(summary.partial_failure);
    assert_eq!(summary.error_code.as_deref(), Some("PARTIAL_FAILURE"));
    assert_eq!(summary.items_new, 3);
    assert_eq!(summary.media_saved, 2, "fine and refreshed downloads");
    assert_eq!(summary.media_failed, 1);
    // 1 fine + 3 slow attempts + expired + fresh
    assert_eq!(client.downloads.load(Ordering::SeqCst), 6);

    let export = read_export(work.path());
    let slow = export.items.iter().find(|i| i.external_id == "2").unwrap();
    assert_eq!(slow.text, "text 2");
    assert_eq!(slow.media[0].error, Some(MediaError::DownloadTimeout));
    assert!(slow.media[0].path.is_none());
    let refreshed = export.items.iter().find(|i| i.external_id == "3").unwrap();
    assert!(slow.has_media_error());
    assert!(!refreshed.has_media_error());
    assert!(refreshed.media[0].path.is_some());

    let run = storage
        .get_run(&RunId::new("run00008"), &SourceId::new("news"))
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.error_code.as_deref(), Some("PARTIAL_FAILURE"));
}

#[tokio::test(start_paused = true)]
async fn oversized_media_is_skipped() {
    let work = tempfile::tempdir().unwrap();
    let mut big = photo_message(1, "fine");
    big.media = Some(RemoteMedia::Photo {
        reference: "fine".into(),
        size: Some(5 * 1024 * 1024),
    });
    let client = ScriptedChannel {
        messages: vec![big],
        refreshed: HashMap::new(),
        downloads: AtomicU32::new(0),
    };
    let mut opts = options(work.path(), "news");
    opts.max_media_size_mb = Some(1);

    let summary = parse_channel(&client, &memory_storage(), &RunId::new("run00009"), &opts)
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.media_skipped_by_size, 1);
    assert_eq!(client.downloads.load(Ordering::SeqCst), 0);
    assert!(read_export(work.path()).items[0].media.is_empty());
}

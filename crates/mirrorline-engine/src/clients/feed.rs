//! File-backed message channel that replays a local history dump.
//!
//! Layout:
//!
//! ```text
//! <root>/<handle>/source.json     SourceInfo
//! <root>/<handle>/messages.json   [RemoteMessage]
//! <root>/<reference>              media bytes, references are root-relative
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mirrorline_types::error::codes;
use mirrorline_types::item::SourceInfo;
use mirrorline_types::SyncError;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::clients::channel::{MessageChannelClient, RemoteMedia, RemoteMessage};

pub const SOURCE_FILE: &str = "source.json";
pub const MESSAGES_FILE: &str = "messages.json";

#[derive(Debug, Clone)]
pub struct FeedChannelClient {
    root: PathBuf,
}

impl FeedChannelClient {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn source_dir(&self, handle: &str) -> PathBuf {
        self.root.join(handle)
    }

    /// Decoded history. Entries that do not decode are skipped one by one.
    fn messages(&self, source: &SourceInfo) -> Result<Vec<RemoteMessage>, SyncError> {
        let path = self.source_dir(&source.handle()).join(MESSAGES_FILE);
        let raw = match read_json::<Vec<Value>>(&path) {
            Err(e) if e.code == codes::NOT_FOUND => return Ok(Vec::new()),
            other => other?,
        };
        let mut messages = Vec::with_capacity(raw.len());
        for (position, entry) in raw.into_iter().enumerate() {
            match serde_json::from_value::<RemoteMessage>(entry) {
                Ok(message) => messages.push(message),
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    position,
                    error = %e,
                    "Skipping malformed message"
                ),
            }
        }
        Ok(messages)
    }

    fn media_path(&self, media: &RemoteMedia) -> Option<PathBuf> {
        let reference = match media {
            RemoteMedia::Photo { reference, .. }
            | RemoteMedia::Document { reference, .. }
            | RemoteMedia::Binary { reference, .. } => reference,
            RemoteMedia::Poll | RemoteMedia::Unsupported => return None,
        };
        let relative = Path::new(reference);
        if relative.is_absolute() || relative.components().any(|c| c.as_os_str() == "..") {
            return None;
        }
        Some(self.root.join(relative))
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, SyncError> {
    let raw = fs::read_to_string(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            SyncError::terminal_network(codes::NOT_FOUND, format!("{} not found", path.display()))
        } else {
            SyncError::network("FEED_IO", format!("{}: {e}", path.display()))
        }
    })?;
    serde_json::from_str(&raw).map_err(|e| {
        SyncError::data_format(codes::INVALID_JSON, format!("{}: {e}", path.display()))
    })
}

#[async_trait]
impl MessageChannelClient for FeedChannelClient {
    async fn connect(&self) -> Result<(), SyncError> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(SyncError::config(
                "FEED_NOT_FOUND",
                format!("feed directory {} does not exist", self.root.display()),
            ))
        }
    }

    async fn resolve_source(&self, identifier: &str) -> Result<SourceInfo, SyncError> {
        read_json(&self.source_dir(identifier).join(SOURCE_FILE))
    }

    async fn list_history(
        &self,
        source: &SourceInfo,
        before_id: i64,
        page_size: u32,
    ) -> Result<Vec<RemoteMessage>, SyncError> {
        let mut messages: Vec<_> = self
            .messages(source)?
            .into_iter()
            .filter(|m| before_id == 0 || m.id < before_id)
            .collect();
        messages.sort_by(|a, b| b.id.cmp(&a.id));
        messages.truncate(page_size as usize);
        Ok(messages)
    }

    async fn refetch_message(
        &self,
        source: &SourceInfo,
        id: i64,
    ) -> Result<Option<RemoteMessage>, SyncError> {
        Ok(self.messages(source)?.into_iter().find(|m| m.id == id))
    }

    async fn download_media(&self, media: &RemoteMedia, dest: &Path) -> Result<u64, SyncError> {
        let Some(src) = self.media_path(media) else {
            return Err(SyncError::terminal_network(
                codes::NOT_FOUND,
                "media has no downloadable reference",
            ));
        };
        fs::copy(&src, dest).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                SyncError::terminal_network(codes::NOT_FOUND, format!("{} not found", src.display()))
            } else {
                SyncError::network("FEED_IO", format!("{}: {e}", src.display()))
            }
        })
    }

    async fn list_sources(&self) -> Result<Vec<SourceInfo>, SyncError> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| SyncError::config("FEED_NOT_FOUND", format!("{}: {e}", self.root.display())))?;
        let mut sources = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path().join(SOURCE_FILE);
            if !path.is_file() {
                continue;
            }
            match read_json::<SourceInfo>(&path) {
                Ok(info) => sources.push(info),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable source"),
            }
        }
        sources.sort_by_key(SourceInfo::handle);
        Ok(sources)
    }
}

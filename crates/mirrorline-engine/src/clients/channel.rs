//! Message-channel collaborator interface.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mirrorline_types::item::SourceInfo;
use mirrorline_types::SyncError;
use serde::{Deserialize, Serialize};

/// Media attached to a remote message, as the platform describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteMedia {
    Photo {
        reference: String,
        #[serde(default)]
        size: Option<u64>,
    },
    Document {
        reference: String,
        #[serde(default)]
        mime_type: Option<String>,
        #[serde(default)]
        file_name: Option<String>,
        #[serde(default)]
        size: Option<u64>,
    },
    /// Attachment of unknown shape, stored as opaque bytes.
    Binary {
        reference: String,
        #[serde(default)]
        size: Option<u64>,
    },
    Poll,
    /// Anything the platform sends that has no downloadable payload.
    #[serde(other)]
    Unsupported,
}

/// A remote message in platform shape, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub id: i64,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub media: Option<RemoteMedia>,
    #[serde(default)]
    pub forwarded: bool,
    #[serde(default)]
    pub reply_to: Option<i64>,
    #[serde(default)]
    pub views: Option<u64>,
    #[serde(default)]
    pub forwards: Option<u64>,
}

/// Authenticated client for an append-only message channel.
///
/// Implementations signal a mandatory pause with
/// [`SyncError::throttled`] and a stale download reference with
/// [`SyncError::reference_expired`].
#[async_trait]
pub trait MessageChannelClient: Send + Sync {
    /// Establish the session.
    async fn connect(&self) -> Result<(), SyncError>;

    /// Resolve a user-supplied identifier to a source.
    async fn resolve_source(&self, identifier: &str) -> Result<SourceInfo, SyncError>;

    /// Up to `page_size` messages older than `before_id`, newest first.
    /// `before_id == 0` starts from the newest message.
    async fn list_history(
        &self,
        source: &SourceInfo,
        before_id: i64,
        page_size: u32,
    ) -> Result<Vec<RemoteMessage>, SyncError>;

    /// Fetch one message again, refreshing its media reference.
    async fn refetch_message(
        &self,
        source: &SourceInfo,
        id: i64,
    ) -> Result<Option<RemoteMessage>, SyncError>;

    /// Download media bytes to `dest`; returns bytes written.
    async fn download_media(&self, media: &RemoteMedia, dest: &Path) -> Result<u64, SyncError>;

    /// Sources visible to the session.
    async fn list_sources(&self) -> Result<Vec<SourceInfo>, SyncError>;
}

//! Normalized message-domain items and their media references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a remote message source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

impl SourceInfo {
    /// Stable handle used for directory names and the `source_id` column:
    /// the username when present, the numeric id otherwise.
    #[must_use]
    pub fn handle(&self) -> String {
        match self.username.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.id.to_string(),
        }
    }
}

/// Logical media category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
}

impl MediaKind {
    /// Subdirectory (under `media/`) holding this kind.
    #[must_use]
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Photo => "photos",
            Self::Video => "videos",
            Self::Document => "documents",
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Document => "document",
        }
    }
}

/// Why a media download did not produce a stored file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaError {
    FileReferenceExpired,
    DownloadTimeout,
    RetryExhausted,
    DownloadFailed,
}

/// Content-addressed media registry entry. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub content_hash: String,
    /// Path relative to the export directory.
    pub storage_path: String,
    pub size: u64,
    pub logical_type: MediaKind,
}

/// Media attached to a normalized item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub path: Option<String>,
    pub filename: Option<String>,
    pub size: Option<u64>,
    pub sha256: Option<String>,
    pub error: Option<MediaError>,
}

/// One ingested remote item in source-independent shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedItem {
    pub source_id: String,
    /// Unique per `source_id`.
    pub external_id: String,
    pub published_at: Option<DateTime<Utc>>,
    pub text: String,
    #[serde(default)]
    pub media: Vec<MediaRef>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl NormalizedItem {
    /// Numeric form of the external id for message sources.
    #[must_use]
    pub fn numeric_id(&self) -> Option<i64> {
        self.external_id.parse().ok()
    }

    /// Whether any attached media failed to download.
    #[must_use]
    pub fn has_media_error(&self) -> bool {
        self.media.iter().any(|m| m.error.is_some())
    }
}

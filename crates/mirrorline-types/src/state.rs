//! Run ledger and cursor model types.
//!
//! Pure data types shared by the storage backends and the engine so neither
//! depends on the other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Opaque source identifier (a CMS site id or a channel handle).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    /// Create a new source identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for SourceId {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

/// Short identifier shared by every source processed in one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Run tracking
// ---------------------------------------------------------------------------

/// Lifecycle status of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    /// Return the lowercase string representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    /// Parse the stored representation. Unknown strings yield `None`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-entity counts recorded on a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    #[serde(rename = "authors_count")]
    pub authors: u64,
    #[serde(rename = "terms_count")]
    pub terms: u64,
    #[serde(rename = "posts_count")]
    pub posts: u64,
    #[serde(rename = "pages_count")]
    pub pages: u64,
    #[serde(rename = "items_count")]
    pub items: u64,
    #[serde(rename = "media_count")]
    pub media: u64,
}

impl RunCounts {
    /// Sum of every entity counter; zero means the run made no progress.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.authors + self.terms + self.posts + self.pages + self.items + self.media
    }
}

/// Values written when a run finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub finished_at: DateTime<Utc>,
    pub error_code: Option<String>,
    pub counts: RunCounts,
}

/// A row of the sync-run ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunRecord {
    pub run_id: String,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub error_code: Option<String>,
    #[serde(flatten)]
    pub counts: RunCounts,
}

// ---------------------------------------------------------------------------
// Incremental cursor
// ---------------------------------------------------------------------------

/// Durable resume marker for an append-only source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    #[serde(default)]
    pub source_id: String,
    #[serde(default)]
    pub last_processed_id: i64,
    #[serde(default)]
    pub last_update_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub items_total: u64,
    #[serde(default)]
    pub media_total: u64,
}

//! Durable per-source export state for resumable ingestion.
//!
//! Three JSON documents live in the export directory: the accumulated export
//! (`export.json`), the resume cursor (`state.json`), and the media registry
//! (`media-index.json`). Each is replaced atomically, and the in-memory
//! cursor only advances after all three are on disk.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use mirrorline_types::item::{NormalizedItem, SourceInfo};
use mirrorline_types::state::SyncCursor;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::dedup::MediaIndex;

pub const EXPORT_FILE: &str = "export.json";
pub const STATE_FILE: &str = "state.json";
pub const INDEX_FILE: &str = "media-index.json";

/// Accumulated export for one source, items ordered by numeric id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    #[serde(default)]
    pub source: SourceInfo,
    #[serde(default)]
    pub items: Vec<NormalizedItem>,
    #[serde(default)]
    pub total_items: u64,
    #[serde(default)]
    pub exported_at: Option<DateTime<Utc>>,
}

/// Loaded export state plus the ids already ingested.
#[derive(Debug)]
pub struct IncrementalStore {
    dir: PathBuf,
    export: ExportDocument,
    cursor: SyncCursor,
    /// Cursor as loaded. Items are skipped against this, not the live
    /// cursor, so older pages of the current run still get ingested.
    resume_from: i64,
    known_ids: HashSet<String>,
}

impl IncrementalStore {
    /// Load the documents under `dir`. Missing or corrupt files start from
    /// defaults with a warning; they never abort the run.
    #[must_use]
    pub fn load(dir: &Path, source: &SourceInfo) -> (Self, MediaIndex) {
        let mut export: ExportDocument = read_json_or_default(&dir.join(EXPORT_FILE));
        let mut cursor: SyncCursor = read_json_or_default(&dir.join(STATE_FILE));
        let index: MediaIndex = read_json_or_default(&dir.join(INDEX_FILE));

        export.source = source.clone();
        if cursor.source_id.is_empty() {
            cursor.source_id = source.handle();
        }
        let known_ids = export.items.iter().map(|i| i.external_id.clone()).collect();
        let resume_from = cursor.last_processed_id;

        (
            Self {
                dir: dir.to_path_buf(),
                export,
                cursor,
                resume_from,
                known_ids,
            },
            index,
        )
    }

    #[must_use]
    pub fn cursor(&self) -> &SyncCursor {
        &self.cursor
    }

    /// Last processed id when the store was loaded.
    #[must_use]
    pub fn resume_from(&self) -> i64 {
        self.resume_from
    }

    #[must_use]
    pub fn export(&self) -> &ExportDocument {
        &self.export
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether an item was already ingested: at or below the cursor this run
    /// resumed from, or present in the export.
    #[must_use]
    pub fn should_skip(&self, id: i64) -> bool {
        id <= self.resume_from || self.known_ids.contains(&id.to_string())
    }

    /// Merge `batch` into the export and persist export, cursor, and media
    /// registry, in that order.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if any document fails to persist. In-memory state
    /// is left untouched in that case.
    pub fn commit_batch(
        &mut self,
        batch: &[NormalizedItem],
        media_added: u64,
        index: &MediaIndex,
        now: DateTime<Utc>,
    ) -> io::Result<()> {
        let mut export = self.export.clone();
        let mut positions: Option<HashMap<String, usize>> = None;
        for item in batch {
            if !self.known_ids.contains(&item.external_id) {
                export.items.push(item.clone());
                continue;
            }
            let positions = positions.get_or_insert_with(|| {
                export
                    .items
                    .iter()
                    .enumerate()
                    .map(|(pos, i)| (i.external_id.clone(), pos))
                    .collect()
            });
            match positions.get(&item.external_id) {
                Some(&pos) => export.items[pos] = item.clone(),
                None => export.items.push(item.clone()),
            }
        }
        export.items.sort_by_key(|i| i.numeric_id().unwrap_or(0));
        export.total_items = export.items.len() as u64;
        export.exported_at = Some(now);

        let mut cursor = self.cursor.clone();
        let batch_max = batch.iter().filter_map(NormalizedItem::numeric_id).max();
        if let Some(max_id) = batch_max {
            cursor.last_processed_id = cursor.last_processed_id.max(max_id);
        }
        cursor.last_update_at = Some(now);
        cursor.items_total = export.total_items;
        cursor.media_total += media_added;

        fs::create_dir_all(&self.dir)?;
        write_json_atomic(&self.dir.join(EXPORT_FILE), &export)?;
        write_json_atomic(&self.dir.join(STATE_FILE), &cursor)?;
        write_json_atomic(&self.dir.join(INDEX_FILE), index)?;

        self.known_ids
            .extend(batch.iter().map(|i| i.external_id.clone()));
        self.export = export;
        self.cursor = cursor;
        Ok(())
    }
}

/// Write `value` as pretty JSON through a sibling temp file and rename, so a
/// reader never observes a partially written document.
///
/// # Errors
///
/// Returns an I/O error on encode, write, or rename failure.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return T::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Unreadable state file, starting fresh");
            return T::default();
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Corrupt state file, starting fresh");
            T::default()
        }
    }
}

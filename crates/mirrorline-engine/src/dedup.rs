//! Content-addressed media store.
//!
//! Identical bytes are stored once: a downloaded temp file whose SHA-256 is
//! already registered is discarded and the existing path reused.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use mirrorline_types::item::{MediaKind, MediaRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::media::{short_hash, with_suffix};

/// Streaming hash chunk size.
pub const HASH_CHUNK_SIZE: usize = 1024 * 1024;

/// Persisted `content hash -> relative path` registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaIndex {
    #[serde(default)]
    pub sha256_to_path: BTreeMap<String, String>,
}

impl MediaIndex {
    #[must_use]
    pub fn len(&self) -> usize {
        self.sha256_to_path.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sha256_to_path.is_empty()
    }
}

/// Outcome of [`DedupStore::ingest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingested {
    pub record: MediaRecord,
    /// `true` when the bytes were already stored and the temp file dropped.
    pub dedup_hit: bool,
}

/// Media store rooted at one export directory.
#[derive(Debug)]
pub struct DedupStore {
    root: PathBuf,
    index: MediaIndex,
}

impl DedupStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, index: MediaIndex) -> Self {
        Self {
            root: root.into(),
            index,
        }
    }

    #[must_use]
    pub fn index(&self) -> &MediaIndex {
        &self.index
    }

    /// Hash `temp`, then either discard it (known content) or move it to
    /// `media/<kind>/<file_name>`, suffixing the name on a collision.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when hashing or moving fails. The temp file is
    /// left in place in that case.
    pub fn ingest(&mut self, temp: &Path, kind: MediaKind, file_name: &str) -> io::Result<Ingested> {
        let size = fs::metadata(temp)?.len();
        let hash = hash_file(temp)?;

        if let Some(existing) = self.index.sha256_to_path.get(&hash) {
            if self.root.join(existing).is_file() {
                let record = MediaRecord {
                    content_hash: hash.clone(),
                    storage_path: existing.clone(),
                    size,
                    logical_type: kind,
                };
                fs::remove_file(temp)?;
                tracing::debug!(sha256 = %hash, path = %record.storage_path, "Media deduplicated");
                return Ok(Ingested {
                    record,
                    dedup_hit: true,
                });
            }
            tracing::warn!(sha256 = %hash, path = %existing, "Indexed media missing on disk, storing again");
        }

        let rel_dir = Path::new("media").join(kind.dir_name());
        fs::create_dir_all(self.root.join(&rel_dir))?;
        let mut rel = rel_dir.join(file_name);
        if self.root.join(&rel).exists() {
            rel = rel_dir.join(with_suffix(file_name, &short_hash(&hash)));
        }
        move_file(temp, &self.root.join(&rel))?;

        let storage_path = rel.to_string_lossy().replace('\\', "/");
        self.index
            .sha256_to_path
            .insert(hash.clone(), storage_path.clone());
        Ok(Ingested {
            record: MediaRecord {
                content_hash: hash,
                storage_path,
                size,
                logical_type: kind,
            },
            dedup_hit: false,
        })
    }
}

/// SHA-256 of a file, hex encoded, read in [`HASH_CHUNK_SIZE`] chunks.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            // rename fails across filesystems
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}

//! Media classification and on-disk naming.

use std::path::Path;

use mirrorline_types::item::MediaKind;
use sha2::{Digest, Sha256};

use crate::clients::RemoteMedia;

/// Longest filename stem produced by [`limit_filename_base`].
pub const MAX_FILENAME_BASE: usize = 120;

const UNSAFE_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// What the pipeline needs to know about a downloadable attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaShape {
    pub kind: MediaKind,
    /// Extension including the leading dot.
    pub extension: String,
    pub size: Option<u64>,
    pub original_name: Option<String>,
}

/// Classify an attachment. `None` means there is nothing to download.
#[must_use]
pub fn classify_media(media: &RemoteMedia) -> Option<MediaShape> {
    match media {
        RemoteMedia::Photo { size, .. } => Some(MediaShape {
            kind: MediaKind::Photo,
            extension: ".jpg".to_string(),
            size: *size,
            original_name: None,
        }),
        RemoteMedia::Document {
            mime_type,
            file_name,
            size,
            ..
        } => {
            let mime = mime_type.as_deref().unwrap_or_default().to_ascii_lowercase();
            let kind = if mime.contains("video") {
                MediaKind::Video
            } else if mime.contains("image") {
                MediaKind::Photo
            } else {
                MediaKind::Document
            };
            let extension = file_name
                .as_deref()
                .and_then(extension_of)
                .unwrap_or_else(|| extension_for_mime(&mime).to_string());
            Some(MediaShape {
                kind,
                extension,
                size: *size,
                original_name: file_name.clone().filter(|n| !n.trim().is_empty()),
            })
        }
        RemoteMedia::Binary { size, .. } => Some(MediaShape {
            kind: MediaKind::Document,
            extension: ".bin".to_string(),
            size: *size,
            original_name: None,
        }),
        RemoteMedia::Poll | RemoteMedia::Unsupported => None,
    }
}

fn extension_for_mime(mime: &str) -> &'static str {
    if mime.contains("video") {
        ".mp4"
    } else if mime.contains("image") {
        ".jpg"
    } else {
        ".bin"
    }
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| format!(".{e}"))
}

/// Final on-disk name for a message's attachment: `<id>_<original stem><ext>`
/// or `<id><ext>` when the platform gave no name.
#[must_use]
pub fn media_file_name(message_id: i64, shape: &MediaShape) -> String {
    match shape.original_name.as_deref() {
        Some(original) => {
            let clean = sanitize_name(original);
            let path = Path::new(&clean);
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(&clean)
                .to_string();
            let ext = extension_of(&clean).unwrap_or_else(|| shape.extension.clone());
            format!("{}{ext}", limit_filename_base(&format!("{message_id}_{stem}")))
        }
        None => format!("{}{}", limit_filename_base(&message_id.to_string()), shape.extension),
    }
}

/// Replace path-hostile characters and whitespace runs with `_`.
/// Empty results become `unnamed`.
#[must_use]
pub fn sanitize_name(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.trim().chars() {
        let ch = if UNSAFE_CHARS.contains(&ch) || ch.is_whitespace() || ch.is_control() {
            '_'
        } else {
            ch
        };
        if ch == '_' && out.ends_with('_') {
            continue;
        }
        out.push(ch);
    }
    let trimmed = out.trim_matches(|c| c == '.' || c == '_' || c == ' ');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// First six hex chars of the SHA-256 of `text`.
#[must_use]
pub fn short_hash(text: &str) -> String {
    let mut hex = format!("{:x}", Sha256::digest(text.as_bytes()));
    hex.truncate(6);
    hex
}

/// Clamp a filename stem to [`MAX_FILENAME_BASE`] chars, appending a short
/// hash of the full stem so truncated names stay distinct.
#[must_use]
pub fn limit_filename_base(base: &str) -> String {
    if base.chars().count() <= MAX_FILENAME_BASE {
        return base.to_string();
    }
    let head: String = base.chars().take(MAX_FILENAME_BASE - 7).collect();
    format!("{head}_{}", short_hash(base))
}

/// Insert `_<suffix>` between the stem and the extension.
#[must_use]
pub fn with_suffix(file_name: &str, suffix: &str) -> String {
    let path = Path::new(file_name);
    match (path.file_stem().and_then(|s| s.to_str()), extension_of(file_name)) {
        (Some(stem), Some(ext)) => format!("{stem}_{suffix}{ext}"),
        _ => format!("{file_name}_{suffix}"),
    }
}

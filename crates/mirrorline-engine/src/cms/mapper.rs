//! Raw CMS JSON to entity rows.
//!
//! Every accessor tolerates missing or mistyped fields. Items without a
//! numeric `id` yield `None` and are skipped by the caller.

use chrono::{DateTime, NaiveDateTime, Utc};
use mirrorline_types::cms::{AuthorRow, ContentRow, ContentTermRow, TermRow};
use serde_json::Value;

pub const TAXONOMY_CATEGORY: &str = "category";
pub const TAXONOMY_TAG: &str = "post_tag";
pub const CONTENT_POST: &str = "post";
pub const CONTENT_PAGE: &str = "page";

/// Embedded term groups in order: group 0 holds categories, group 1 tags.
const EMBEDDED_TAXONOMIES: [&str; 2] = [TAXONOMY_CATEGORY, TAXONOMY_TAG];

fn id_of(raw: &Value) -> Option<i64> {
    match raw.get("id")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text(raw: &Value, key: &str) -> Option<String> {
    match raw.get(key)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `{"rendered": "..."}` objects, or plain strings.
fn rendered(raw: &Value, key: &str) -> Option<String> {
    match raw.get(key)? {
        Value::Object(obj) => obj
            .get("rendered")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        _ => text(raw, key),
    }
}

fn int(raw: &Value, key: &str) -> Option<i64> {
    match raw.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// CMS timestamps: RFC 3339, or a naive `YYYY-MM-DDTHH:MM:SS` read as UTC.
#[must_use]
pub fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let s = raw?.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn timestamp(raw: &Value, primary: &str, fallback: &str) -> Option<DateTime<Utc>> {
    let value = raw
        .get(primary)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .or_else(|| raw.get(fallback).and_then(Value::as_str));
    parse_timestamp(value)
}

#[must_use]
pub fn map_author(site_id: &str, raw: &Value) -> Option<AuthorRow> {
    let remote_user_id = id_of(raw)?;
    Some(AuthorRow {
        site_id: site_id.to_string(),
        remote_user_id,
        login: text(raw, "username").or_else(|| text(raw, "slug")),
        name: text(raw, "name"),
        slug: text(raw, "slug"),
        raw: raw.clone(),
    })
}

#[must_use]
pub fn map_term(site_id: &str, taxonomy: &str, raw: &Value) -> Option<TermRow> {
    let remote_term_id = id_of(raw)?;
    Some(TermRow {
        site_id: site_id.to_string(),
        taxonomy: taxonomy.to_string(),
        remote_term_id,
        name: text(raw, "name"),
        slug: text(raw, "slug"),
        parent_id: int(raw, "parent").filter(|p| *p != 0),
        raw: raw.clone(),
    })
}

#[must_use]
pub fn map_content(site_id: &str, content_type: &str, raw: &Value) -> Option<ContentRow> {
    let remote_id = id_of(raw)?;
    let seo = raw.get("yoast_head_json").filter(|v| v.is_object());
    Some(ContentRow {
        site_id: site_id.to_string(),
        content_type: content_type.to_string(),
        remote_id,
        title: rendered(raw, "title"),
        slug: text(raw, "slug").unwrap_or_else(|| remote_id.to_string()),
        body: raw
            .get("content")
            .filter(|v| v.is_object())
            .and_then(|_| rendered(raw, "content")),
        excerpt: raw
            .get("excerpt")
            .filter(|v| v.is_object())
            .and_then(|_| rendered(raw, "excerpt")),
        status: text(raw, "status").unwrap_or_else(|| "publish".to_string()),
        author_id: int(raw, "author"),
        published_at: timestamp(raw, "date_gmt", "date"),
        modified_at: timestamp(raw, "modified_gmt", "modified"),
        seo_title: seo.and_then(|s| text(s, "title")),
        seo_description: seo.and_then(|s| text(s, "og_description").or_else(|| text(s, "description"))),
        seo_json: seo.cloned(),
        raw: raw.clone(),
    })
}

/// Links from `_embedded["wp:term"]`.
#[must_use]
pub fn map_content_terms(
    site_id: &str,
    content_type: &str,
    remote_content_id: i64,
    raw: &Value,
) -> Vec<ContentTermRow> {
    let Some(groups) = raw
        .get("_embedded")
        .and_then(|e| e.get("wp:term"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    let mut links = Vec::new();
    for (taxonomy, group) in EMBEDDED_TAXONOMIES.iter().zip(groups) {
        let Some(terms) = group.as_array() else {
            continue;
        };
        for term in terms {
            if let Some(remote_term_id) = id_of(term) {
                links.push(ContentTermRow {
                    site_id: site_id.to_string(),
                    content_type: content_type.to_string(),
                    remote_content_id,
                    taxonomy: (*taxonomy).to_string(),
                    remote_term_id,
                });
            }
        }
    }
    links
}

//! CMS entity rows keyed by stable composite identities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A configured CMS site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteRecord {
    pub site_id: String,
    pub base_url: String,
    pub name: Option<String>,
}

/// Key: `(site_id, remote_user_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorRow {
    pub site_id: String,
    pub remote_user_id: i64,
    pub login: Option<String>,
    pub name: Option<String>,
    pub slug: Option<String>,
    pub raw: serde_json::Value,
}

/// Key: `(site_id, taxonomy, remote_term_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermRow {
    pub site_id: String,
    pub taxonomy: String,
    pub remote_term_id: i64,
    pub name: Option<String>,
    pub slug: Option<String>,
    pub parent_id: Option<i64>,
    pub raw: serde_json::Value,
}

/// Key: `(site_id, content_type, remote_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRow {
    pub site_id: String,
    pub content_type: String,
    pub remote_id: i64,
    pub title: Option<String>,
    pub slug: String,
    pub body: Option<String>,
    pub excerpt: Option<String>,
    pub status: String,
    pub author_id: Option<i64>,
    pub published_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub seo_title: Option<String>,
    pub seo_description: Option<String>,
    pub seo_json: Option<serde_json::Value>,
    pub raw: serde_json::Value,
}

/// Link between a content row and a term. Every column is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentTermRow {
    pub site_id: String,
    pub content_type: String,
    pub remote_content_id: i64,
    pub taxonomy: String,
    pub remote_term_id: i64,
}

/// Stored entity totals for one site.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub authors: u64,
    pub terms: u64,
    pub posts: u64,
    pub pages: u64,
    pub content_terms: u64,
}

//! Per-message selection: date window, keywords, and source identifiers.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;

/// Public link to a source or a single post.
static SOURCE_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:https?://)?(?:t\.me|telegram\.me|telegram\.dog)/([a-zA-Z0-9_]+)(?:/(\d+))?/?$")
        .expect("valid regex")
});

/// Where a message falls relative to a [`DateRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePosition {
    Within,
    /// After `to`; skip the message and keep paging.
    Newer,
    /// Before `from`; history is newest-first so nothing older can match.
    Older,
}

/// Inclusive calendar-day window in UTC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DateRange {
    /// Messages without a date are always within.
    #[must_use]
    pub fn check(&self, date: Option<DateTime<Utc>>) -> DatePosition {
        let Some(day) = date.map(|d| d.date_naive()) else {
            return DatePosition::Within;
        };
        if self.from.is_some_and(|from| day < from) {
            DatePosition::Older
        } else if self.to.is_some_and(|to| day > to) {
            DatePosition::Newer
        } else {
            DatePosition::Within
        }
    }
}

/// Case-insensitive substring match against any keyword. An empty filter
/// accepts everything.
#[derive(Debug, Clone, Default)]
pub struct KeywordFilter {
    keywords: Vec<String>,
}

impl KeywordFilter {
    #[must_use]
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    #[must_use]
    pub fn matches(&self, text: &str) -> bool {
        if self.keywords.is_empty() {
            return true;
        }
        let text = text.to_lowercase();
        self.keywords.iter().any(|k| text.contains(k.as_str()))
    }
}

/// A user-supplied source identifier reduced to a bare handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    pub handle: String,
    /// Post number when the input linked a single post.
    pub post_id: Option<i64>,
}

/// Accepts `name`, `@name`, or a public link such as `https://t.me/name/36`.
#[must_use]
pub fn normalize_source_ref(input: &str) -> SourceRef {
    let trimmed = input.trim();
    if let Some(caps) = SOURCE_LINK_RE.captures(trimmed) {
        return SourceRef {
            handle: caps[1].to_string(),
            post_id: caps.get(2).and_then(|m| m.as_str().parse().ok()),
        };
    }
    SourceRef {
        handle: trimmed.trim_start_matches('@').to_string(),
        post_id: None,
    }
}

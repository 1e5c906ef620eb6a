//! Page-numbered collection driven by a total-pages hint.

use std::future::Future;

use mirrorline_types::{ErrorKind, SyncError};
use serde_json::Value;

/// Response header carrying the total page count (matched case-insensitively).
pub const TOTAL_PAGES_HEADER: &str = "x-wp-totalpages";

/// One fetched page: the decoded body plus the raw total-pages hint.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub body: Value,
    pub total_pages_hint: Option<String>,
}

/// Parse a total-pages hint. Missing, empty, non-numeric, zero, or negative
/// values all mean a single page.
#[must_use]
pub fn parse_total_pages(raw: Option<&str>) -> u32 {
    raw.and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|n| *n > 0)
        .map_or(1, |n| u32::try_from(n).unwrap_or(u32::MAX))
}

/// Fetch pages `1..` until the hint is reached, a short page arrives, or the
/// body stops being a list.
///
/// A malformed page (undecodable body or a non-list) ends collection with a
/// warning; the items gathered so far are kept.
///
/// # Errors
///
/// Any non-data-format error from `fetch_page` is returned as-is.
pub async fn collect_pages<F, Fut>(
    resource: &str,
    per_page: u32,
    mut fetch_page: F,
) -> Result<Vec<Value>, SyncError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Page, SyncError>>,
{
    let mut items = Vec::new();
    let mut page = 1u32;

    loop {
        let fetched = match fetch_page(page).await {
            Ok(fetched) => fetched,
            Err(err) if err.kind == ErrorKind::DataFormat => {
                tracing::warn!(resource, page, code = %err.code, "Malformed page, treating as end of data");
                break;
            }
            Err(err) => return Err(err),
        };
        let total_pages = parse_total_pages(fetched.total_pages_hint.as_deref());

        let Value::Array(batch) = fetched.body else {
            tracing::warn!(resource, page, "Response body is not a list, treating as end of data");
            break;
        };
        let batch_len = batch.len();
        items.extend(batch);

        if page >= total_pages || batch_len < per_page as usize {
            break;
        }
        page += 1;
    }

    tracing::debug!(resource, pages = page, items = items.len(), "Pagination complete");
    Ok(items)
}

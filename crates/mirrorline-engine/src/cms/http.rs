//! HTTP status classification and paginated REST access for one site.

use mirrorline_types::error::codes;
use mirrorline_types::SyncError;
use serde_json::Value;

use crate::clients::cms::{CmsHttpClient, HttpResponse};
use crate::context::RunContext;
use crate::fetch::ResilientFetcher;
use crate::pagination::{collect_pages, Page, TOTAL_PAGES_HEADER};

/// Map a response to a decoded page or a classified error.
///
/// # Errors
///
/// Auth for 401/403, terminal network for 404/400 and other non-2xx codes,
/// rate limit (with `Retry-After` hint) for 429, retryable network for 5xx,
/// and data format for an undecodable 2xx body.
pub fn classify_response(resp: HttpResponse) -> Result<Page, SyncError> {
    let status = resp.status;
    match status {
        200..=299 => {
            let body: Value = serde_json::from_str(&resp.body).map_err(|e| {
                SyncError::data_format(codes::INVALID_JSON, format!("response is not JSON: {e}"))
                    .with_status(status)
            })?;
            Ok(Page {
                body,
                total_pages_hint: resp.header(TOTAL_PAGES_HEADER).map(str::to_string),
            })
        }
        401 | 403 => Err(SyncError::auth(
            format!("HTTP_{status}"),
            format!("authentication rejected with status {status}"),
        )
        .with_status(status)),
        404 => Err(SyncError::terminal_network(codes::NOT_FOUND, "resource not found").with_status(status)),
        400 => Err(SyncError::terminal_network(codes::BAD_REQUEST, "request rejected").with_status(status)),
        429 => Err(SyncError::rate_limit(
            "HTTP_429",
            "rate limited by server",
            parse_retry_after(resp.header("retry-after")),
        )
        .with_status(status)),
        500..=599 => Err(SyncError::network(
            format!("HTTP_{status}"),
            format!("server error {status}"),
        )
        .with_status(status)),
        _ => Err(SyncError::terminal_network(
            codes::HTTP_STATUS,
            format!("unexpected status {status}"),
        )
        .with_status(status)),
    }
}

/// Integer-seconds `Retry-After`. Dates and garbage are ignored.
#[must_use]
pub fn parse_retry_after(raw: Option<&str>) -> Option<u64> {
    raw?.trim().parse::<u64>().ok().filter(|s| *s > 0)
}

/// One site's REST API seen through the resilient fetcher.
pub struct SiteApi<'a> {
    client: &'a dyn CmsHttpClient,
    fetcher: &'a ResilientFetcher,
    ctx: &'a RunContext,
    per_page: u32,
}

impl<'a> SiteApi<'a> {
    #[must_use]
    pub fn new(
        client: &'a dyn CmsHttpClient,
        fetcher: &'a ResilientFetcher,
        ctx: &'a RunContext,
        per_page: u32,
    ) -> Self {
        Self {
            client,
            fetcher,
            ctx,
            per_page,
        }
    }

    async fn fetch_page(&self, path: &str, params: Vec<(String, String)>) -> Result<Page, SyncError> {
        let client = self.client;
        let params = &params;
        self.fetcher
            .call(self.ctx, path, move || async move {
                client.get(path, params).await.and_then(classify_response)
            })
            .await
    }

    /// Every item of a paginated collection.
    ///
    /// # Errors
    ///
    /// Returns the first non-data-format failure.
    pub async fn fetch_all(&self, path: &str, filters: &[(&str, &str)]) -> Result<Vec<Value>, SyncError> {
        let per_page = self.per_page;
        let api = self;
        collect_pages(path, per_page, move |page| {
            let mut params: Vec<(String, String)> = filters
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect();
            params.push(("per_page".to_string(), per_page.to_string()));
            params.push(("page".to_string(), page.to_string()));
            api.fetch_page(path, params)
        })
        .await
    }
}

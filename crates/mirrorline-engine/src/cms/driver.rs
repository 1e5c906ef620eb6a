//! Per-site CMS sync: authors, terms, posts, and pages in order.

use std::sync::Arc;

use chrono::Utc;
use mirrorline_state::StorageBackend;
use mirrorline_types::cms::{ContentRow, ContentTermRow, SiteRecord};
use mirrorline_types::state::{RunCompletion, RunCounts, RunId, RunStatus, SourceId};
use mirrorline_types::SyncError;
use serde_json::{json, Value};

use crate::aggregate::{classify, SubSyncOutcome};
use crate::clients::cms::CmsHttpClient;
use crate::cms::http::SiteApi;
use crate::cms::mapper::{
    map_author, map_content, map_content_terms, map_term, CONTENT_PAGE, CONTENT_POST,
    TAXONOMY_CATEGORY, TAXONOMY_TAG,
};
use crate::context::RunContext;
use crate::event_log::EventLog;
use crate::fetch::ResilientFetcher;
use crate::rate_limit::RateLimiter;
use crate::result::SiteSummary;
use crate::retry::RetryPolicy;
use crate::store::with_storage;

const PUBLISHED_EMBEDDED: [(&str, &str); 2] = [("status", "publish"), ("_embed", "1")];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Authors,
    Terms,
    Posts,
    Pages,
}

impl Step {
    const ORDER: [Step; 4] = [Step::Authors, Step::Terms, Step::Posts, Step::Pages];

    fn name(self) -> &'static str {
        match self {
            Self::Authors => "authors",
            Self::Terms => "terms",
            Self::Posts => "posts",
            Self::Pages => "pages",
        }
    }
}

/// Syncs configured sites into storage.
pub struct CmsPipeline {
    storage: Arc<dyn StorageBackend>,
    policy: RetryPolicy,
    requests_per_second: f64,
    per_page: u32,
    events: Arc<EventLog>,
}

impl CmsPipeline {
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        policy: RetryPolicy,
        requests_per_second: f64,
        per_page: u32,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            storage,
            policy,
            requests_per_second,
            per_page,
            events,
        }
    }

    /// Sync one site and record the run in the ledger.
    ///
    /// Never fails: every error is folded into the returned summary so a
    /// multi-site run can carry on with the next site.
    pub async fn sync_site(
        &self,
        run_id: &RunId,
        site: &SiteRecord,
        client: &dyn CmsHttpClient,
    ) -> SiteSummary {
        let started_at = Utc::now();
        let ctx = RunContext::new(run_id.clone(), SourceId::new(site.site_id.as_str()));
        let mut counts = RunCounts::default();

        tracing::info!(run_id = %run_id, site_id = %site.site_id, "Site sync started");
        self.events.info(
            "site_started",
            ctx.event_with(json!({"base_url": site.base_url})),
        );

        if let Err(err) = self.open_run(&ctx, site, started_at).await {
            tracing::error!(site_id = %site.site_id, error = %err, "Could not record run start");
            return summarize(&ctx, started_at, RunStatus::Failed, Some(&err), counts);
        }

        let fetcher = ResilientFetcher::new(
            self.policy.clone(),
            RateLimiter::per_second(self.requests_per_second),
            Arc::clone(&self.events),
        );
        let api = SiteApi::new(client, &fetcher, &ctx, self.per_page);

        let mut outcomes = Vec::with_capacity(Step::ORDER.len());
        let mut failure = None;
        for step in Step::ORDER {
            let before = counts.total();
            let result = self.run_step(step, &api, &site.site_id, &mut counts).await;
            let progress = counts.total() - before;
            match result {
                Ok(()) => {
                    tracing::info!(site_id = %site.site_id, step = step.name(), written = progress, "Step complete");
                    outcomes.push(SubSyncOutcome::succeeded(progress));
                }
                Err(err) => {
                    tracing::error!(
                        site_id = %site.site_id,
                        step = step.name(),
                        kind = %err.kind,
                        code = %err.code,
                        error = %err,
                        "Step failed, skipping remaining steps"
                    );
                    self.events.error(
                        "step_failed",
                        ctx.event_with(json!({
                            "step": step.name(),
                            "kind": err.kind.to_string(),
                            "code": err.code,
                            "message": err.message,
                        })),
                    );
                    outcomes.push(SubSyncOutcome::failed(progress));
                    failure = Some(err);
                    break;
                }
            }
        }

        let status = classify(&outcomes);
        self.close_run(&ctx, status, failure.as_ref(), counts).await;
        summarize(&ctx, started_at, status, failure.as_ref(), counts)
    }

    /// Record a site that cannot be synced at all, such as one without
    /// credentials, as a failed run. Sibling sites are unaffected.
    pub async fn reject_site(&self, run_id: &RunId, site: &SiteRecord, err: &SyncError) -> SiteSummary {
        let started_at = Utc::now();
        let ctx = RunContext::new(run_id.clone(), SourceId::new(site.site_id.as_str()));
        tracing::error!(site_id = %site.site_id, code = %err.code, error = %err, "Site rejected before sync");
        match self.open_run(&ctx, site, started_at).await {
            Ok(()) => {
                self.close_run(&ctx, RunStatus::Failed, Some(err), RunCounts::default())
                    .await;
            }
            Err(e) => tracing::error!(site_id = %site.site_id, error = %e, "Could not record run start"),
        }
        summarize(&ctx, started_at, RunStatus::Failed, Some(err), RunCounts::default())
    }

    async fn open_run(
        &self,
        ctx: &RunContext,
        site: &SiteRecord,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let site = site.clone();
        with_storage(&self.storage, "upsert_site", move |s| s.upsert_site(&site, started_at)).await?;
        let run_id = ctx.run_id.clone();
        let source_id = ctx.source_id.clone();
        with_storage(&self.storage, "insert_run", move |s| {
            s.insert_run(&run_id, &source_id, started_at)
        })
        .await
    }

    async fn close_run(
        &self,
        ctx: &RunContext,
        status: RunStatus,
        failure: Option<&SyncError>,
        counts: RunCounts,
    ) {
        let completion = RunCompletion {
            status,
            finished_at: Utc::now(),
            error_code: failure.map(|e| e.taxonomy_code().to_string()),
            counts,
        };
        let run_id = ctx.run_id.clone();
        let source_id = ctx.source_id.clone();
        match with_storage(&self.storage, "finish_run", move |s| {
            s.finish_run(&run_id, &source_id, &completion)
        })
        .await
        {
            Ok(0) => tracing::warn!(
                run_id = %ctx.run_id,
                site_id = %ctx.source_id,
                "No running ledger row matched on finish"
            ),
            Ok(_) => {}
            Err(e) => tracing::error!(site_id = %ctx.source_id, error = %e, "Could not finalize run"),
        }
        self.events.info(
            "site_finished",
            ctx.event_with(json!({"status": status.as_str(), "counts": counts})),
        );
    }

    async fn run_step(
        &self,
        step: Step,
        api: &SiteApi<'_>,
        site_id: &str,
        counts: &mut RunCounts,
    ) -> Result<(), SyncError> {
        match step {
            Step::Authors => {
                let raw = api.fetch_all("/users", &[]).await?;
                let rows = map_all("/users", &raw, |item| map_author(site_id, item));
                let now = Utc::now();
                counts.authors +=
                    with_storage(&self.storage, "upsert_authors", move |s| s.upsert_authors(&rows, now))
                        .await?;
            }
            Step::Terms => {
                for (path, taxonomy) in [("/categories", TAXONOMY_CATEGORY), ("/tags", TAXONOMY_TAG)] {
                    let raw = api.fetch_all(path, &[]).await?;
                    let rows = map_all(path, &raw, |item| map_term(site_id, taxonomy, item));
                    let now = Utc::now();
                    counts.terms +=
                        with_storage(&self.storage, "upsert_terms", move |s| s.upsert_terms(&rows, now))
                            .await?;
                }
            }
            Step::Posts => {
                counts.posts += self.sync_content(api, site_id, CONTENT_POST, "/posts").await?;
            }
            Step::Pages => {
                counts.pages += self.sync_content(api, site_id, CONTENT_PAGE, "/pages").await?;
            }
        }
        Ok(())
    }

    /// Content rows first, then their term links, each in its own transaction.
    async fn sync_content(
        &self,
        api: &SiteApi<'_>,
        site_id: &str,
        content_type: &str,
        path: &str,
    ) -> Result<u64, SyncError> {
        let raw = api.fetch_all(path, &PUBLISHED_EMBEDDED).await?;
        let mut rows: Vec<ContentRow> = Vec::with_capacity(raw.len());
        let mut links: Vec<ContentTermRow> = Vec::new();
        for item in &raw {
            if let Some(row) = map_content(site_id, content_type, item) {
                links.extend(map_content_terms(site_id, content_type, row.remote_id, item));
                rows.push(row);
            }
        }
        warn_skipped(path, raw.len(), rows.len());

        let now = Utc::now();
        let written =
            with_storage(&self.storage, "upsert_content", move |s| s.upsert_content(&rows, now)).await?;
        if !links.is_empty() {
            with_storage(&self.storage, "upsert_content_terms", move |s| {
                s.upsert_content_terms(&links, now)
            })
            .await?;
        }
        Ok(written)
    }
}

fn map_all<T>(resource: &str, raw: &[Value], map: impl Fn(&Value) -> Option<T>) -> Vec<T> {
    let rows: Vec<T> = raw.iter().filter_map(map).collect();
    warn_skipped(resource, raw.len(), rows.len());
    rows
}

fn warn_skipped(resource: &str, fetched: usize, mapped: usize) {
    if mapped < fetched {
        tracing::warn!(resource, skipped = fetched - mapped, "Skipping items without a numeric id");
    }
}

fn summarize(
    ctx: &RunContext,
    run_at: chrono::DateTime<Utc>,
    status: RunStatus,
    failure: Option<&SyncError>,
    counts: RunCounts,
) -> SiteSummary {
    SiteSummary {
        run_id: ctx.run_id.clone(),
        source_id: ctx.source_id.to_string(),
        status,
        run_at,
        error_code: failure.map(|e| e.taxonomy_code().to_string()),
        partial_failure: status == RunStatus::Partial,
        authors_count: counts.authors,
        terms_count: counts.terms,
        posts_count: counts.posts,
        pages_count: counts.pages,
        error_message: failure.map(ToString::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use mirrorline_state::SqliteBackend;

    use crate::clients::cms::HttpResponse;

    /// Serves canned bodies per path; unknown paths return `[]`.
    #[derive(Default)]
    struct CannedSite {
        bodies: HashMap<&'static str, (u16, String)>,
        requests: Mutex<Vec<(String, Vec<(String, String)>)>>,
    }

    impl CannedSite {
        fn with(mut self, path: &'static str, status: u16, body: Value) -> Self {
            self.bodies.insert(path, (status, body.to_string()));
            self
        }
    }

    #[async_trait]
    impl CmsHttpClient for CannedSite {
        async fn get(&self, path: &str, params: &[(String, String)]) -> Result<HttpResponse, SyncError> {
            self.requests
                .lock()
                .unwrap()
                .push((path.to_string(), params.to_vec()));
            let (status, body) = self
                .bodies
                .get(path)
                .cloned()
                .unwrap_or((200, "[]".to_string()));
            Ok(HttpResponse::new(status, std::iter::empty::<(&str, &str)>(), body))
        }
    }

    fn pipeline(storage: Arc<dyn StorageBackend>) -> CmsPipeline {
        CmsPipeline::new(
            storage,
            RetryPolicy::default(),
            0.0,
            100,
            Arc::new(EventLog::disabled()),
        )
    }

    fn site() -> SiteRecord {
        SiteRecord {
            site_id: "blog".into(),
            base_url: "https://blog.example".into(),
            name: Some("Blog".into()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_site_sync_writes_every_kind() {
        let storage: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::in_memory().unwrap());
        let client = CannedSite::default()
            .with("/users", 200, json!([{"id": 1, "slug": "ann"}, {"name": "no id"}]))
            .with("/categories", 200, json!([{"id": 5, "name": "News"}]))
            .with("/tags", 200, json!([{"id": 7}, {"id": 8}]))
            .with(
                "/posts",
                200,
                json!([{"id": 10, "title": {"rendered": "Hi"},
                        "_embedded": {"wp:term": [[{"id": 5}], [{"id": 7}]]}}]),
            )
            .with("/pages", 200, json!([{"id": 20}]));

        let run_id = RunId::new("run00001");
        let summary = pipeline(Arc::clone(&storage)).sync_site(&run_id, &site(), &client).await;

        assert_eq!(summary.status, RunStatus::Success);
        assert_eq!(summary.error_code, None);
        assert_eq!(
            (summary.authors_count, summary.terms_count, summary.posts_count, summary.pages_count),
            (1, 3, 1, 1)
        );
        let counts = storage.entity_counts("blog").unwrap();
        assert_eq!(counts.content_terms, 2);

        let run = storage.get_run(&run_id, &SourceId::new("blog")).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.counts.terms, 3);

        let requests = client.requests.lock().unwrap();
        let (_, post_params) = requests.iter().find(|(p, _)| p == "/posts").unwrap();
        assert!(post_params.contains(&("status".to_string(), "publish".to_string())));
        assert!(post_params.contains(&("_embed".to_string(), "1".to_string())));
        assert!(post_params.contains(&("per_page".to_string(), "100".to_string())));
    }

    #[tokio::test]
    async fn rejected_site_is_recorded_as_config_failure() {
        let storage: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::in_memory().unwrap());
        let run_id = RunId::new("run00009");
        let err = SyncError::config("MISSING_CREDENTIALS", "no credentials");
        let summary = pipeline(Arc::clone(&storage)).reject_site(&run_id, &site(), &err).await;

        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.error_code.as_deref(), Some("CONFIG_ERROR"));
        let run = storage.get_run(&run_id, &SourceId::new("blog")).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_code.as_deref(), Some("CONFIG_ERROR"));
        assert!(run.finished_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_on_first_step_fails_site() {
        let storage: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::in_memory().unwrap());
        let client = CannedSite::default().with("/users", 401, json!({"code": "rest_forbidden"}));
        let run_id = RunId::new("run00002");
        let summary = pipeline(Arc::clone(&storage)).sync_site(&run_id, &site(), &client).await;

        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.error_code.as_deref(), Some("AUTH_ERROR"));
        assert_eq!(client.requests.lock().unwrap().len(), 1, "auth errors are never retried");
        let run = storage.get_run(&run_id, &SourceId::new("blog")).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_code.as_deref(), Some("AUTH_ERROR"));
    }

    #[tokio::test(start_paused = true)]
    async fn later_step_failure_is_partial_and_stops_site() {
        let storage: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::in_memory().unwrap());
        let client = CannedSite::default()
            .with("/users", 200, json!([{"id": 1}]))
            .with("/categories", 404, json!({}));
        let summary = pipeline(storage)
            .sync_site(&RunId::new("run00003"), &site(), &client)
            .await;

        assert_eq!(summary.status, RunStatus::Partial);
        assert!(summary.partial_failure);
        assert_eq!(summary.authors_count, 1);
        assert_eq!(summary.error_code.as_deref(), Some("NETWORK_ERROR"));
        let paths: Vec<_> = client
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|(p, _)| p.clone())
            .collect();
        assert_eq!(paths, ["/users", "/categories"]);
    }
}

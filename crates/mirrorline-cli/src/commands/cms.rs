use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use mirrorline_engine::clients::cms::CmsHttpClient;
use mirrorline_engine::clients::http::ReqwestCmsClient;
use mirrorline_engine::cms::CmsPipeline;
use mirrorline_engine::config::types::{MirrorConfig, SiteConfig};
use mirrorline_engine::context::new_run_id;
use mirrorline_engine::event_log::EventLog;
use mirrorline_engine::resolve::{
    close_storage, open_storage_blocking, require_site_credentials, Credentials,
};
use mirrorline_engine::result::{overall_status, SiteSummary};
use mirrorline_state::StorageBackend;
use mirrorline_types::cms::SiteRecord;
use mirrorline_types::state::{RunId, RunStatus};
use mirrorline_types::SyncError;
use serde_json::json;

use super::print_summaries;

/// Execute `cms sync`: mirror one site or every configured site.
pub async fn sync(config: &MirrorConfig, site_filter: Option<&str>) -> Result<RunStatus> {
    // 1. Pick target sites
    let sites: Vec<&SiteConfig> = match site_filter {
        Some(id) => vec![config
            .cms
            .site(id)
            .ok_or_else(|| anyhow!("Unknown site '{id}' (see `mirrorline cms list-sites`)"))?],
        None => config.cms.sites.iter().collect(),
    };
    if sites.is_empty() {
        bail!("No CMS sites configured");
    }

    // 2. Open storage and the event log
    let storage = open_storage_blocking(config.storage.clone())
        .await
        .context("Failed to open storage")?;
    let events = EventLog::open(&config.cms.log_dir).unwrap_or_else(|e| {
        tracing::warn!(dir = %config.cms.log_dir.display(), error = %e, "Event log unavailable");
        EventLog::disabled()
    });

    let run_id = new_run_id();
    tracing::info!(run_id = %run_id, sites = sites.len(), "CMS sync started");
    let timeout = config.retry.policy().call_timeout;
    let summaries = sync_sites(config, &sites, &storage, &run_id, Arc::new(events), |site, credentials| {
        let client = ReqwestCmsClient::new(&site.base_url, Some(credentials), timeout)?;
        Ok(Box::new(client) as Box<dyn CmsHttpClient>)
    })
    .await;

    close_storage(storage).await;

    // 3. Report
    print_summaries(summaries.as_slice())?;
    for summary in summaries.iter().filter(|s| s.status != RunStatus::Success) {
        eprintln!(
            "{} {}: {}",
            summary.source_id,
            summary.status.as_str(),
            summary
                .error_message
                .as_deref()
                .or(summary.error_code.as_deref())
                .unwrap_or("see errors.log")
        );
    }
    Ok(overall_status(&summaries))
}

/// Sync sites one after another under a shared run id.
///
/// A site whose credentials are missing, or whose client cannot be built,
/// is recorded as a failed run and the remaining sites still sync.
async fn sync_sites<F>(
    config: &MirrorConfig,
    sites: &[&SiteConfig],
    storage: &Arc<dyn StorageBackend>,
    run_id: &RunId,
    events: Arc<EventLog>,
    connect: F,
) -> Vec<SiteSummary>
where
    F: Fn(&SiteConfig, Credentials) -> Result<Box<dyn CmsHttpClient>, SyncError>,
{
    let pipeline = CmsPipeline::new(
        Arc::clone(storage),
        config.retry.policy(),
        config.cms.effective_rps(),
        config.cms.per_page,
        events,
    );

    let mut summaries = Vec::with_capacity(sites.len());
    for &site in sites {
        let record = SiteRecord {
            site_id: site.site_id.clone(),
            base_url: site.base_url.clone(),
            name: site.name.clone(),
        };
        let client = require_site_credentials(&config.cms.credentials_env_prefix, &site.site_id)
            .and_then(|credentials| connect(site, credentials));
        let summary = match client {
            Ok(client) => pipeline.sync_site(run_id, &record, client.as_ref()).await,
            Err(err) => pipeline.reject_site(run_id, &record, &err).await,
        };
        summaries.push(summary);
    }
    summaries
}

/// Execute `cms list-sites`.
pub fn list_sites(config: &MirrorConfig) -> Result<RunStatus> {
    let sites: Vec<_> = config
        .cms
        .sites
        .iter()
        .map(|s| {
            json!({
                "site_id": s.site_id,
                "base_url": s.base_url,
                "name": s.name,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&sites)?);
    Ok(RunStatus::Success)
}

//! Per-source run summaries printed on stdout and written beside exports.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use mirrorline_types::state::{RunId, RunStatus};
use serde::Serialize;

use crate::aggregate::classify_sources;

/// Outcome of one CMS site sync.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteSummary {
    pub run_id: RunId,
    pub source_id: String,
    pub status: RunStatus,
    pub run_at: DateTime<Utc>,
    pub error_code: Option<String>,
    pub partial_failure: bool,
    pub authors_count: u64,
    pub terms_count: u64,
    pub posts_count: u64,
    pub pages_count: u64,
    /// Operator explanation for stderr; never serialized.
    #[serde(skip)]
    pub error_message: Option<String>,
}

/// Outcome of one message-channel parse.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSummary {
    pub run_id: RunId,
    pub source_id: String,
    pub status: RunStatus,
    pub run_at: DateTime<Utc>,
    pub error_code: Option<String>,
    pub partial_failure: bool,
    pub dry_run: bool,
    pub mode: String,
    pub items_scanned: u64,
    pub items_new: u64,
    pub media_saved: u64,
    pub media_dedup_hits: u64,
    pub media_skipped_by_size: u64,
    pub media_failed: u64,
    pub throttle_events: u64,
    pub known_size_mb: f64,
    pub unknown_size_count: u64,
    pub export_dir: Option<PathBuf>,
    #[serde(skip)]
    pub error_message: Option<String>,
}

/// Status across several site syncs in one invocation.
#[must_use]
pub fn overall_status(summaries: &[SiteSummary]) -> RunStatus {
    let statuses: Vec<_> = summaries.iter().map(|s| s.status).collect();
    classify_sources(&statuses)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(status: RunStatus) -> SiteSummary {
        SiteSummary {
            run_id: RunId::new("abcd1234"),
            source_id: "blog".into(),
            status,
            run_at: Utc::now(),
            error_code: None,
            partial_failure: status == RunStatus::Partial,
            authors_count: 1,
            terms_count: 2,
            posts_count: 3,
            pages_count: 4,
            error_message: Some("secret detail".into()),
        }
    }

    #[test]
    fn site_summary_json_shape() {
        let value = serde_json::to_value(site(RunStatus::Success)).unwrap();
        assert_eq!(value["run_id"], "abcd1234");
        assert_eq!(value["status"], "success");
        assert_eq!(value["posts_count"], 3);
        assert!(value["error_code"].is_null());
        assert!(value.get("error_message").is_none());
    }

    #[test]
    fn overall_status_folds_sites() {
        assert_eq!(
            overall_status(&[site(RunStatus::Success), site(RunStatus::Failed)]),
            RunStatus::Partial
        );
        assert_eq!(
            overall_status(&[site(RunStatus::Failed), site(RunStatus::Failed)]),
            RunStatus::Failed
        );
        assert_eq!(overall_status(&[site(RunStatus::Success)]), RunStatus::Success);
    }
}

//! Run outcome classification.

use mirrorline_types::state::RunStatus;

/// Result of one independent sub-sync (an entity kind, a message stream, or
/// a whole source when aggregating several).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubSyncOutcome {
    pub succeeded: bool,
    /// Entities committed before the outcome was decided.
    pub progress: u64,
}

impl SubSyncOutcome {
    #[must_use]
    pub fn succeeded(progress: u64) -> Self {
        Self {
            succeeded: true,
            progress,
        }
    }

    #[must_use]
    pub fn failed(progress: u64) -> Self {
        Self {
            succeeded: false,
            progress,
        }
    }

    /// Fold a finished source run back into an outcome for multi-source
    /// aggregation.
    #[must_use]
    pub fn from_status(status: RunStatus) -> Self {
        match status {
            RunStatus::Success => Self::succeeded(1),
            RunStatus::Partial => Self::failed(1),
            RunStatus::Failed | RunStatus::Running => Self::failed(0),
        }
    }
}

/// Classify a run from its sub-sync outcomes.
///
/// Failed when every sub-sync failed and none made progress; success when
/// all succeeded; partial otherwise. No sub-syncs counts as success.
#[must_use]
pub fn classify(outcomes: &[SubSyncOutcome]) -> RunStatus {
    if outcomes.iter().all(|o| o.succeeded) {
        return RunStatus::Success;
    }
    let any_succeeded = outcomes.iter().any(|o| o.succeeded);
    let progress: u64 = outcomes.iter().map(|o| o.progress).sum();
    if !any_succeeded && progress == 0 {
        RunStatus::Failed
    } else {
        RunStatus::Partial
    }
}

/// Overall status across several sources.
#[must_use]
pub fn classify_sources(statuses: &[RunStatus]) -> RunStatus {
    let outcomes: Vec<_> = statuses.iter().copied().map(SubSyncOutcome::from_status).collect();
    classify(&outcomes)
}

/// Process exit code: success 0, partial 2, failed 1.
#[must_use]
pub fn exit_code(status: RunStatus) -> u8 {
    match status {
        RunStatus::Success => 0,
        RunStatus::Partial => 2,
        RunStatus::Failed | RunStatus::Running => 1,
    }
}

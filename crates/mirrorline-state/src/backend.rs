//! Storage backend trait definition.
//!
//! [`StorageBackend`] defines the persistence contract for CMS entities,
//! normalized message items, and the sync-run ledger. Model types live in
//! [`mirrorline_types`].

use chrono::{DateTime, Utc};
use mirrorline_types::cms::{AuthorRow, ContentRow, ContentTermRow, EntityCounts, SiteRecord, TermRow};
use mirrorline_types::item::NormalizedItem;
use mirrorline_types::state::{RunCompletion, RunId, SourceId, SyncRunRecord};

use crate::error;

/// Which storage variant is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Network relational database.
    Postgres,
    /// Embedded local database file.
    Sqlite,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        }
    }
}

/// Persistence contract shared by both backends.
///
/// Every `upsert_*` inserts rows that are absent and, for rows already
/// present, overwrites mutable columns and refreshes `synced_at`. Uniqueness
/// is enforced by the table's primary key, never by a read-before-write, so
/// repeated or concurrent calls on distinct keys are safe. Each call runs in
/// its own short transaction.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn StorageBackend>`.
pub trait StorageBackend: Send + Sync {
    /// Variant behind this handle (diagnostics only).
    fn kind(&self) -> BackendKind;

    /// Register or refresh a CMS site row.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn upsert_site(&self, site: &SiteRecord, now: DateTime<Utc>) -> error::Result<()>;

    /// Record a new `running` ledger row. Commits before returning so a crash
    /// during the fetch phase still leaves an auditable record.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn insert_run(
        &self,
        run_id: &RunId,
        source_id: &SourceId,
        started_at: DateTime<Utc>,
    ) -> error::Result<()>;

    /// Finalize the `running` ledger row for `(run_id, source_id)`.
    ///
    /// Returns the number of rows updated: `0` when no running row matched.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn finish_run(
        &self,
        run_id: &RunId,
        source_id: &SourceId,
        completion: &RunCompletion,
    ) -> error::Result<u64>;

    /// Read back the most recent ledger row for `(run_id, source_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_run(&self, run_id: &RunId, source_id: &SourceId)
        -> error::Result<Option<SyncRunRecord>>;

    /// Upsert authors keyed by `(site_id, remote_user_id)`. Returns rows written.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn upsert_authors(&self, rows: &[AuthorRow], synced_at: DateTime<Utc>) -> error::Result<u64>;

    /// Upsert terms keyed by `(site_id, taxonomy, remote_term_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn upsert_terms(&self, rows: &[TermRow], synced_at: DateTime<Utc>) -> error::Result<u64>;

    /// Upsert posts/pages keyed by `(site_id, content_type, remote_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn upsert_content(&self, rows: &[ContentRow], synced_at: DateTime<Utc>) -> error::Result<u64>;

    /// Upsert content-term links; an existing link only has `synced_at` refreshed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn upsert_content_terms(
        &self,
        rows: &[ContentTermRow],
        synced_at: DateTime<Utc>,
    ) -> error::Result<u64>;

    /// Upsert normalized items keyed by `(source_id, external_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn upsert_items(&self, items: &[NormalizedItem], synced_at: DateTime<Utc>)
        -> error::Result<u64>;

    /// Stored CMS entity totals for one site.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn entity_counts(&self, site_id: &str) -> error::Result<EntityCounts>;

    /// Stored normalized item total for one source.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn item_count(&self, source_id: &str) -> error::Result<u64>;
}

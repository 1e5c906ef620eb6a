//! `PostgreSQL`-backed implementation of [`StorageBackend`].
//!
//! Uses the sync `postgres` crate with a single `Mutex<Client>` for
//! thread safety. The `postgres` crate manages its own internal tokio
//! runtime, so callers on an async runtime go through `spawn_blocking`.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use mirrorline_types::cms::{AuthorRow, ContentRow, ContentTermRow, EntityCounts, SiteRecord, TermRow};
use mirrorline_types::item::NormalizedItem;
use mirrorline_types::state::{RunCompletion, RunCounts, RunId, RunStatus, SourceId, SyncRunRecord};
use postgres::{Client, NoTls};

use crate::backend::{BackendKind, StorageBackend};
use crate::error::{self, StateError};

/// Idempotent DDL for all tables (`PostgreSQL` dialect).
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS sites (
    site_id TEXT PRIMARY KEY,
    base_url TEXT NOT NULL,
    name TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_runs (
    id BIGSERIAL PRIMARY KEY,
    run_id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    started_at TIMESTAMPTZ NOT NULL,
    finished_at TIMESTAMPTZ,
    status TEXT NOT NULL,
    error_code TEXT,
    authors_count BIGINT NOT NULL DEFAULT 0,
    terms_count BIGINT NOT NULL DEFAULT 0,
    posts_count BIGINT NOT NULL DEFAULT 0,
    pages_count BIGINT NOT NULL DEFAULT 0,
    items_count BIGINT NOT NULL DEFAULT 0,
    media_count BIGINT NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sync_runs_run_source ON sync_runs (run_id, source_id);

CREATE TABLE IF NOT EXISTS cms_authors (
    site_id TEXT NOT NULL REFERENCES sites(site_id),
    remote_user_id BIGINT NOT NULL,
    login TEXT,
    name TEXT,
    slug TEXT,
    raw_json JSONB NOT NULL,
    synced_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (site_id, remote_user_id)
);

CREATE TABLE IF NOT EXISTS cms_terms (
    site_id TEXT NOT NULL REFERENCES sites(site_id),
    taxonomy TEXT NOT NULL,
    remote_term_id BIGINT NOT NULL,
    name TEXT,
    slug TEXT,
    parent_id BIGINT,
    raw_json JSONB NOT NULL,
    synced_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (site_id, taxonomy, remote_term_id)
);

CREATE TABLE IF NOT EXISTS cms_content (
    site_id TEXT NOT NULL REFERENCES sites(site_id),
    content_type TEXT NOT NULL,
    remote_id BIGINT NOT NULL,
    title TEXT,
    slug TEXT NOT NULL,
    body TEXT,
    excerpt TEXT,
    status TEXT NOT NULL,
    author_id BIGINT,
    published_at TIMESTAMPTZ,
    modified_at TIMESTAMPTZ,
    seo_title TEXT,
    seo_description TEXT,
    seo_json JSONB,
    raw_json JSONB NOT NULL,
    synced_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (site_id, content_type, remote_id)
);

CREATE TABLE IF NOT EXISTS cms_content_terms (
    site_id TEXT NOT NULL,
    content_type TEXT NOT NULL,
    remote_content_id BIGINT NOT NULL,
    taxonomy TEXT NOT NULL,
    remote_term_id BIGINT NOT NULL,
    synced_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (site_id, content_type, remote_content_id, taxonomy, remote_term_id),
    FOREIGN KEY (site_id, content_type, remote_content_id)
        REFERENCES cms_content (site_id, content_type, remote_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS items (
    source_id TEXT NOT NULL,
    external_id TEXT NOT NULL,
    published_at TIMESTAMPTZ,
    text TEXT NOT NULL,
    media_json JSONB NOT NULL,
    metadata_json JSONB NOT NULL,
    synced_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (source_id, external_id)
);
";

/// `PostgreSQL`-backed storage.
///
/// Create with [`PostgresBackend::open`] providing a libpq-style
/// connection string (e.g. `"host=localhost dbname=mirrorline user=postgres"`).
pub struct PostgresBackend {
    client: Mutex<Client>,
}

impl PostgresBackend {
    /// Connect to a `PostgreSQL` database and initialize tables.
    ///
    /// `connstr` is a libpq-style connection string or `PostgreSQL` URI:
    /// - `"host=localhost port=5432 dbname=mirrorline user=postgres"`
    /// - `"postgresql://postgres@localhost/mirrorline"`
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Postgres`] if connection or DDL execution fails.
    pub fn open(connstr: &str) -> error::Result<Self> {
        let mut client =
            Client::connect(connstr, NoTls).map_err(|e| StateError::context("open: connect", e))?;
        client
            .batch_execute(CREATE_TABLES)
            .map_err(|e| StateError::context("open: create tables", e))?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    /// Acquire the client lock.
    fn lock_client(&self) -> error::Result<MutexGuard<'_, Client>> {
        self.client.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn count(client: &mut Client, sql: &str, key: &str) -> error::Result<u64> {
        let row = client.query_one(sql, &[&key])?;
        let n: i64 = row.get(0);
        Ok(u64::try_from(n).unwrap_or(0))
    }
}

impl StorageBackend for PostgresBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn upsert_site(&self, site: &SiteRecord, now: DateTime<Utc>) -> error::Result<()> {
        let mut client = self.lock_client()?;
        client
            .execute(
                "INSERT INTO sites (site_id, base_url, name, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $4) \
                 ON CONFLICT (site_id) \
                 DO UPDATE SET base_url = EXCLUDED.base_url, name = EXCLUDED.name, \
                 updated_at = EXCLUDED.updated_at",
                &[&site.site_id, &site.base_url, &site.name, &now],
            )
            .map_err(|e| StateError::context("upsert_site: execute", e))?;
        Ok(())
    }

    fn insert_run(
        &self,
        run_id: &RunId,
        source_id: &SourceId,
        started_at: DateTime<Utc>,
    ) -> error::Result<()> {
        let mut client = self.lock_client()?;
        client
            .execute(
                "INSERT INTO sync_runs (run_id, source_id, started_at, status) \
                 VALUES ($1, $2, $3, $4)",
                &[
                    &run_id.as_str(),
                    &source_id.as_str(),
                    &started_at,
                    &RunStatus::Running.as_str(),
                ],
            )
            .map_err(|e| StateError::context("insert_run: execute", e))?;
        Ok(())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn finish_run(
        &self,
        run_id: &RunId,
        source_id: &SourceId,
        completion: &RunCompletion,
    ) -> error::Result<u64> {
        let mut client = self.lock_client()?;
        let counts = &completion.counts;
        let updated = client
            .execute(
                "UPDATE sync_runs SET finished_at = $1, status = $2, error_code = $3, \
                 authors_count = $4, terms_count = $5, posts_count = $6, pages_count = $7, \
                 items_count = $8, media_count = $9 \
                 WHERE run_id = $10 AND source_id = $11 AND status = 'running'",
                &[
                    &completion.finished_at,
                    &completion.status.as_str(),
                    &completion.error_code,
                    &(counts.authors as i64),
                    &(counts.terms as i64),
                    &(counts.posts as i64),
                    &(counts.pages as i64),
                    &(counts.items as i64),
                    &(counts.media as i64),
                    &run_id.as_str(),
                    &source_id.as_str(),
                ],
            )
            .map_err(|e| StateError::context("finish_run: execute", e))?;
        Ok(updated)
    }

    #[allow(clippy::cast_sign_loss)]
    fn get_run(
        &self,
        run_id: &RunId,
        source_id: &SourceId,
    ) -> error::Result<Option<SyncRunRecord>> {
        let mut client = self.lock_client()?;
        let rows = client
            .query(
                "SELECT started_at, finished_at, status, error_code, authors_count, terms_count, \
                 posts_count, pages_count, items_count, media_count \
                 FROM sync_runs WHERE run_id = $1 AND source_id = $2 ORDER BY id DESC LIMIT 1",
                &[&run_id.as_str(), &source_id.as_str()],
            )
            .map_err(|e| StateError::context("get_run: query", e))?;

        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let status: String = row.get(2);
        let status = RunStatus::parse(&status)
            .ok_or_else(|| StateError::Corrupt(format!("run status '{status}'")))?;
        Ok(Some(SyncRunRecord {
            run_id: run_id.as_str().to_string(),
            source_id: source_id.as_str().to_string(),
            started_at: row.get(0),
            finished_at: row.get(1),
            status,
            error_code: row.get(3),
            counts: RunCounts {
                authors: row.get::<_, i64>(4) as u64,
                terms: row.get::<_, i64>(5) as u64,
                posts: row.get::<_, i64>(6) as u64,
                pages: row.get::<_, i64>(7) as u64,
                items: row.get::<_, i64>(8) as u64,
                media: row.get::<_, i64>(9) as u64,
            },
        }))
    }

    fn upsert_authors(&self, rows: &[AuthorRow], synced_at: DateTime<Utc>) -> error::Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut client = self.lock_client()?;
        let mut tx = client
            .transaction()
            .map_err(|e| StateError::context("upsert_authors: begin tx", e))?;
        let stmt = tx
            .prepare(
                "INSERT INTO cms_authors (site_id, remote_user_id, login, name, slug, raw_json, synced_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (site_id, remote_user_id) DO UPDATE SET \
                 login = EXCLUDED.login, name = EXCLUDED.name, slug = EXCLUDED.slug, \
                 raw_json = EXCLUDED.raw_json, synced_at = EXCLUDED.synced_at",
            )
            .map_err(|e| StateError::context("upsert_authors: prepare", e))?;

        let mut count = 0u64;
        for row in rows {
            tx.execute(
                &stmt,
                &[
                    &row.site_id,
                    &row.remote_user_id,
                    &row.login,
                    &row.name,
                    &row.slug,
                    &row.raw,
                    &synced_at,
                ],
            )
            .map_err(|e| StateError::context("upsert_authors: execute", e))?;
            count += 1;
        }
        tx.commit()
            .map_err(|e| StateError::context("upsert_authors: commit", e))?;
        Ok(count)
    }

    fn upsert_terms(&self, rows: &[TermRow], synced_at: DateTime<Utc>) -> error::Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut client = self.lock_client()?;
        let mut tx = client
            .transaction()
            .map_err(|e| StateError::context("upsert_terms: begin tx", e))?;
        let stmt = tx
            .prepare(
                "INSERT INTO cms_terms \
                 (site_id, taxonomy, remote_term_id, name, slug, parent_id, raw_json, synced_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT (site_id, taxonomy, remote_term_id) DO UPDATE SET \
                 name = EXCLUDED.name, slug = EXCLUDED.slug, parent_id = EXCLUDED.parent_id, \
                 raw_json = EXCLUDED.raw_json, synced_at = EXCLUDED.synced_at",
            )
            .map_err(|e| StateError::context("upsert_terms: prepare", e))?;

        let mut count = 0u64;
        for row in rows {
            tx.execute(
                &stmt,
                &[
                    &row.site_id,
                    &row.taxonomy,
                    &row.remote_term_id,
                    &row.name,
                    &row.slug,
                    &row.parent_id,
                    &row.raw,
                    &synced_at,
                ],
            )
            .map_err(|e| StateError::context("upsert_terms: execute", e))?;
            count += 1;
        }
        tx.commit()
            .map_err(|e| StateError::context("upsert_terms: commit", e))?;
        Ok(count)
    }

    fn upsert_content(&self, rows: &[ContentRow], synced_at: DateTime<Utc>) -> error::Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut client = self.lock_client()?;
        let mut tx = client
            .transaction()
            .map_err(|e| StateError::context("upsert_content: begin tx", e))?;
        let stmt = tx
            .prepare(
                "INSERT INTO cms_content \
                 (site_id, content_type, remote_id, title, slug, body, excerpt, status, author_id, \
                  published_at, modified_at, seo_title, seo_description, seo_json, raw_json, synced_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
                 ON CONFLICT (site_id, content_type, remote_id) DO UPDATE SET \
                 title = EXCLUDED.title, slug = EXCLUDED.slug, body = EXCLUDED.body, \
                 excerpt = EXCLUDED.excerpt, status = EXCLUDED.status, author_id = EXCLUDED.author_id, \
                 published_at = EXCLUDED.published_at, modified_at = EXCLUDED.modified_at, \
                 seo_title = EXCLUDED.seo_title, seo_description = EXCLUDED.seo_description, \
                 seo_json = EXCLUDED.seo_json, raw_json = EXCLUDED.raw_json, \
                 synced_at = EXCLUDED.synced_at",
            )
            .map_err(|e| StateError::context("upsert_content: prepare", e))?;

        let mut count = 0u64;
        for row in rows {
            tx.execute(
                &stmt,
                &[
                    &row.site_id,
                    &row.content_type,
                    &row.remote_id,
                    &row.title,
                    &row.slug,
                    &row.body,
                    &row.excerpt,
                    &row.status,
                    &row.author_id,
                    &row.published_at,
                    &row.modified_at,
                    &row.seo_title,
                    &row.seo_description,
                    &row.seo_json,
                    &row.raw,
                    &synced_at,
                ],
            )
            .map_err(|e| StateError::context("upsert_content: execute", e))?;
            count += 1;
        }
        tx.commit()
            .map_err(|e| StateError::context("upsert_content: commit", e))?;
        Ok(count)
    }

    fn upsert_content_terms(
        &self,
        rows: &[ContentTermRow],
        synced_at: DateTime<Utc>,
    ) -> error::Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut client = self.lock_client()?;
        let mut tx = client
            .transaction()
            .map_err(|e| StateError::context("upsert_content_terms: begin tx", e))?;
        let stmt = tx
            .prepare(
                "INSERT INTO cms_content_terms \
                 (site_id, content_type, remote_content_id, taxonomy, remote_term_id, synced_at) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (site_id, content_type, remote_content_id, taxonomy, remote_term_id) \
                 DO UPDATE SET synced_at = EXCLUDED.synced_at",
            )
            .map_err(|e| StateError::context("upsert_content_terms: prepare", e))?;

        let mut count = 0u64;
        for row in rows {
            tx.execute(
                &stmt,
                &[
                    &row.site_id,
                    &row.content_type,
                    &row.remote_content_id,
                    &row.taxonomy,
                    &row.remote_term_id,
                    &synced_at,
                ],
            )
            .map_err(|e| StateError::context("upsert_content_terms: execute", e))?;
            count += 1;
        }
        tx.commit()
            .map_err(|e| StateError::context("upsert_content_terms: commit", e))?;
        Ok(count)
    }

    fn upsert_items(&self, items: &[NormalizedItem], synced_at: DateTime<Utc>) -> error::Result<u64> {
        if items.is_empty() {
            return Ok(0);
        }
        let mut client = self.lock_client()?;
        let mut tx = client
            .transaction()
            .map_err(|e| StateError::context("upsert_items: begin tx", e))?;
        let stmt = tx
            .prepare(
                "INSERT INTO items \
                 (source_id, external_id, published_at, text, media_json, metadata_json, synced_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (source_id, external_id) DO UPDATE SET \
                 published_at = EXCLUDED.published_at, text = EXCLUDED.text, \
                 media_json = EXCLUDED.media_json, metadata_json = EXCLUDED.metadata_json, \
                 synced_at = EXCLUDED.synced_at",
            )
            .map_err(|e| StateError::context("upsert_items: prepare", e))?;

        let mut count = 0u64;
        for item in items {
            let media = serde_json::to_value(&item.media)?;
            let metadata = serde_json::Value::Object(item.metadata.clone());
            tx.execute(
                &stmt,
                &[
                    &item.source_id,
                    &item.external_id,
                    &item.published_at,
                    &item.text,
                    &media,
                    &metadata,
                    &synced_at,
                ],
            )
            .map_err(|e| StateError::context("upsert_items: execute", e))?;
            count += 1;
        }
        tx.commit()
            .map_err(|e| StateError::context("upsert_items: commit", e))?;
        Ok(count)
    }

    fn entity_counts(&self, site_id: &str) -> error::Result<EntityCounts> {
        let mut client = self.lock_client()?;
        Ok(EntityCounts {
            authors: Self::count(
                &mut client,
                "SELECT COUNT(*) FROM cms_authors WHERE site_id = $1",
                site_id,
            )?,
            terms: Self::count(
                &mut client,
                "SELECT COUNT(*) FROM cms_terms WHERE site_id = $1",
                site_id,
            )?,
            posts: Self::count(
                &mut client,
                "SELECT COUNT(*) FROM cms_content WHERE site_id = $1 AND content_type = 'post'",
                site_id,
            )?,
            pages: Self::count(
                &mut client,
                "SELECT COUNT(*) FROM cms_content WHERE site_id = $1 AND content_type = 'page'",
                site_id,
            )?,
            content_terms: Self::count(
                &mut client,
                "SELECT COUNT(*) FROM cms_content_terms WHERE site_id = $1",
                site_id,
            )?,
        })
    }

    fn item_count(&self, source_id: &str) -> error::Result<u64> {
        let mut client = self.lock_client()?;
        Self::count(
            &mut client,
            "SELECT COUNT(*) FROM items WHERE source_id = $1",
            source_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    /// Helper: get Postgres connection string from env or skip test.
    fn test_connstr() -> String {
        std::env::var("TEST_POSTGRES_URL")
            .expect("TEST_POSTGRES_URL not set, skipping Postgres integration test")
    }

    /// Helper: clean up test tables before each test.
    fn clean_tables(client: &mut Client) {
        client
            .batch_execute(
                "DELETE FROM cms_content_terms; DELETE FROM cms_content; DELETE FROM cms_terms; \
                 DELETE FROM cms_authors; DELETE FROM items; DELETE FROM sync_runs; DELETE FROM sites;",
            )
            .unwrap();
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    #[ignore = "requires TEST_POSTGRES_URL"]
    fn author_upsert_is_idempotent() {
        let backend = PostgresBackend::open(&test_connstr()).unwrap();
        clean_tables(&mut backend.lock_client().unwrap());

        let site = SiteRecord {
            site_id: "pg_blog".into(),
            base_url: "https://blog.example.com".into(),
            name: None,
        };
        backend.upsert_site(&site, t0()).unwrap();
        let rows = vec![AuthorRow {
            site_id: "pg_blog".into(),
            remote_user_id: 1,
            login: Some("ann".into()),
            name: Some("Ann".into()),
            slug: Some("ann".into()),
            raw: json!({"id": 1}),
        }];
        backend.upsert_authors(&rows, t0()).unwrap();
        backend
            .upsert_authors(&rows, t0() + Duration::seconds(10))
            .unwrap();

        assert_eq!(backend.entity_counts("pg_blog").unwrap().authors, 1);
        let synced: DateTime<Utc> = backend
            .lock_client()
            .unwrap()
            .query_one(
                "SELECT synced_at FROM cms_authors WHERE site_id = 'pg_blog' AND remote_user_id = 1",
                &[],
            )
            .unwrap()
            .get(0);
        assert_eq!(synced, t0() + Duration::seconds(10));
    }

    #[test]
    #[ignore = "requires TEST_POSTGRES_URL"]
    fn run_lifecycle() {
        let backend = PostgresBackend::open(&test_connstr()).unwrap();
        clean_tables(&mut backend.lock_client().unwrap());

        let run_id = RunId::new("pg_run");
        let source = SourceId::new("pg_blog");
        backend.insert_run(&run_id, &source, t0()).unwrap();

        let completion = RunCompletion {
            status: RunStatus::Success,
            finished_at: t0() + Duration::seconds(3),
            error_code: None,
            counts: RunCounts {
                posts: 12,
                ..RunCounts::default()
            },
        };
        assert_eq!(backend.finish_run(&run_id, &source, &completion).unwrap(), 1);
        assert_eq!(backend.finish_run(&run_id, &source, &completion).unwrap(), 0);

        let record = backend.get_run(&run_id, &source).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.counts.posts, 12);
    }
}

//! `SQLite`-backed implementation of [`StorageBackend`].
//!
//! Uses a single `Mutex<Connection>` for thread safety. Timestamps are stored
//! as RFC 3339 text with microsecond precision so they sort lexicographically.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use mirrorline_types::cms::{AuthorRow, ContentRow, ContentTermRow, EntityCounts, SiteRecord, TermRow};
use mirrorline_types::item::NormalizedItem;
use mirrorline_types::state::{RunCompletion, RunCounts, RunId, RunStatus, SourceId, SyncRunRecord};
use rusqlite::{Connection, OptionalExtension};

use crate::backend::{BackendKind, StorageBackend};
use crate::error::{self, StateError};

/// Idempotent DDL for all tables.
const CREATE_TABLES: &str = r"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS sites (
    site_id TEXT PRIMARY KEY,
    base_url TEXT NOT NULL,
    name TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    status TEXT NOT NULL,
    error_code TEXT,
    authors_count INTEGER NOT NULL DEFAULT 0,
    terms_count INTEGER NOT NULL DEFAULT 0,
    posts_count INTEGER NOT NULL DEFAULT 0,
    pages_count INTEGER NOT NULL DEFAULT 0,
    items_count INTEGER NOT NULL DEFAULT 0,
    media_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sync_runs_run_source ON sync_runs (run_id, source_id);

CREATE TABLE IF NOT EXISTS cms_authors (
    site_id TEXT NOT NULL REFERENCES sites(site_id),
    remote_user_id INTEGER NOT NULL,
    login TEXT,
    name TEXT,
    slug TEXT,
    raw_json TEXT NOT NULL,
    synced_at TEXT NOT NULL,
    PRIMARY KEY (site_id, remote_user_id)
);

CREATE TABLE IF NOT EXISTS cms_terms (
    site_id TEXT NOT NULL REFERENCES sites(site_id),
    taxonomy TEXT NOT NULL,
    remote_term_id INTEGER NOT NULL,
    name TEXT,
    slug TEXT,
    parent_id INTEGER,
    raw_json TEXT NOT NULL,
    synced_at TEXT NOT NULL,
    PRIMARY KEY (site_id, taxonomy, remote_term_id)
);

CREATE TABLE IF NOT EXISTS cms_content (
    site_id TEXT NOT NULL REFERENCES sites(site_id),
    content_type TEXT NOT NULL,
    remote_id INTEGER NOT NULL,
    title TEXT,
    slug TEXT NOT NULL,
    body TEXT,
    excerpt TEXT,
    status TEXT NOT NULL,
    author_id INTEGER,
    published_at TEXT,
    modified_at TEXT,
    seo_title TEXT,
    seo_description TEXT,
    seo_json TEXT,
    raw_json TEXT NOT NULL,
    synced_at TEXT NOT NULL,
    PRIMARY KEY (site_id, content_type, remote_id)
);

CREATE TABLE IF NOT EXISTS cms_content_terms (
    site_id TEXT NOT NULL,
    content_type TEXT NOT NULL,
    remote_content_id INTEGER NOT NULL,
    taxonomy TEXT NOT NULL,
    remote_term_id INTEGER NOT NULL,
    synced_at TEXT NOT NULL,
    PRIMARY KEY (site_id, content_type, remote_content_id, taxonomy, remote_term_id),
    FOREIGN KEY (site_id, content_type, remote_content_id)
        REFERENCES cms_content (site_id, content_type, remote_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS items (
    source_id TEXT NOT NULL,
    external_id TEXT NOT NULL,
    published_at TEXT,
    text TEXT NOT NULL,
    media_json TEXT NOT NULL,
    metadata_json TEXT NOT NULL,
    synced_at TEXT NOT NULL,
    PRIMARY KEY (source_id, external_id)
);
";

/// `SQLite`-backed storage.
///
/// Create with [`SqliteBackend::open`] for file-backed persistence
/// or [`SqliteBackend::in_memory`] for tests.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open or create a `SQLite` database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|e| StateError::context("open: connect", e))?;
        Self::init(conn)
    }

    /// Create an in-memory `SQLite` backend (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> error::Result<Self> {
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StateError::context("open: create tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Format a UTC timestamp for `SQLite` storage.
    fn to_sqlite_ts(ts: DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    /// Parse a stored timestamp back into UTC.
    fn from_sqlite_ts(raw: &str) -> error::Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StateError::Corrupt(format!("timestamp '{raw}': {e}")))
    }

    fn count(conn: &Connection, sql: &str, key: &str) -> error::Result<u64> {
        let n: i64 = conn.query_row(sql, [key], |row| row.get(0))?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    #[cfg(test)]
    fn author_synced_at(&self, site_id: &str, remote_user_id: i64) -> error::Result<String> {
        let conn = self.lock_conn()?;
        Ok(conn.query_row(
            "SELECT synced_at FROM cms_authors WHERE site_id = ?1 AND remote_user_id = ?2",
            rusqlite::params![site_id, remote_user_id],
            |row| row.get(0),
        )?)
    }

    #[cfg(test)]
    fn content_title(&self, site_id: &str, remote_id: i64) -> error::Result<Option<String>> {
        let conn = self.lock_conn()?;
        Ok(conn.query_row(
            "SELECT title FROM cms_content WHERE site_id = ?1 AND remote_id = ?2",
            rusqlite::params![site_id, remote_id],
            |row| row.get(0),
        )?)
    }

    #[cfg(test)]
    fn count_runs(&self) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM sync_runs", [], |row| row.get(0))?)
    }
}

impl StorageBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn upsert_site(&self, site: &SiteRecord, now: DateTime<Utc>) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let now = Self::to_sqlite_ts(now);
        conn.execute(
            "INSERT INTO sites (site_id, base_url, name, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?4) \
             ON CONFLICT(site_id) \
             DO UPDATE SET base_url = excluded.base_url, name = excluded.name, \
             updated_at = excluded.updated_at",
            rusqlite::params![site.site_id, site.base_url, site.name, now],
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
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO sync_runs (run_id, source_id, started_at, status) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                run_id.as_str(),
                source_id.as_str(),
                Self::to_sqlite_ts(started_at),
                RunStatus::Running.as_str(),
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
        let conn = self.lock_conn()?;
        let counts = &completion.counts;
        let updated = conn
            .execute(
                "UPDATE sync_runs SET finished_at = ?1, status = ?2, error_code = ?3, \
                 authors_count = ?4, terms_count = ?5, posts_count = ?6, pages_count = ?7, \
                 items_count = ?8, media_count = ?9 \
                 WHERE run_id = ?10 AND source_id = ?11 AND status = 'running'",
                rusqlite::params![
                    Self::to_sqlite_ts(completion.finished_at),
                    completion.status.as_str(),
                    completion.error_code,
                    counts.authors as i64,
                    counts.terms as i64,
                    counts.posts as i64,
                    counts.pages as i64,
                    counts.items as i64,
                    counts.media as i64,
                    run_id.as_str(),
                    source_id.as_str(),
                ],
            )
            .map_err(|e| StateError::context("finish_run: execute", e))?;
        Ok(updated as u64)
    }

    #[allow(clippy::cast_sign_loss)]
    fn get_run(
        &self,
        run_id: &RunId,
        source_id: &SourceId,
    ) -> error::Result<Option<SyncRunRecord>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT started_at, finished_at, status, error_code, authors_count, terms_count, \
                 posts_count, pages_count, items_count, media_count \
                 FROM sync_runs WHERE run_id = ?1 AND source_id = ?2 ORDER BY id DESC LIMIT 1",
                rusqlite::params![run_id.as_str(), source_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        [
                            row.get::<_, i64>(4)?,
                            row.get::<_, i64>(5)?,
                            row.get::<_, i64>(6)?,
                            row.get::<_, i64>(7)?,
                            row.get::<_, i64>(8)?,
                            row.get::<_, i64>(9)?,
                        ],
                    ))
                },
            )
            .optional()
            .map_err(|e| StateError::context("get_run: query", e))?;

        let Some((started_at, finished_at, status, error_code, c)) = row else {
            return Ok(None);
        };
        let status = RunStatus::parse(&status)
            .ok_or_else(|| StateError::Corrupt(format!("run status '{status}'")))?;
        Ok(Some(SyncRunRecord {
            run_id: run_id.as_str().to_string(),
            source_id: source_id.as_str().to_string(),
            started_at: Self::from_sqlite_ts(&started_at)?,
            finished_at: finished_at.as_deref().map(Self::from_sqlite_ts).transpose()?,
            status,
            error_code,
            counts: RunCounts {
                authors: c[0] as u64,
                terms: c[1] as u64,
                posts: c[2] as u64,
                pages: c[3] as u64,
                items: c[4] as u64,
                media: c[5] as u64,
            },
        }))
    }

    fn upsert_authors(&self, rows: &[AuthorRow], synced_at: DateTime<Utc>) -> error::Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let conn = self.lock_conn()?;
        let synced_at = Self::to_sqlite_ts(synced_at);
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::context("upsert_authors: begin tx", e))?;
        let mut stmt = tx
            .prepare(
                "INSERT INTO cms_authors (site_id, remote_user_id, login, name, slug, raw_json, synced_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(site_id, remote_user_id) DO UPDATE SET \
                 login = excluded.login, name = excluded.name, slug = excluded.slug, \
                 raw_json = excluded.raw_json, synced_at = excluded.synced_at",
            )
            .map_err(|e| StateError::context("upsert_authors: prepare", e))?;

        let mut count = 0u64;
        for row in rows {
            stmt.execute(rusqlite::params![
                row.site_id,
                row.remote_user_id,
                row.login,
                row.name,
                row.slug,
                serde_json::to_string(&row.raw)?,
                synced_at,
            ])
            .map_err(|e| StateError::context("upsert_authors: execute", e))?;
            count += 1;
        }
        drop(stmt);
        tx.commit()
            .map_err(|e| StateError::context("upsert_authors: commit", e))?;
        Ok(count)
    }

    fn upsert_terms(&self, rows: &[TermRow], synced_at: DateTime<Utc>) -> error::Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let conn = self.lock_conn()?;
        let synced_at = Self::to_sqlite_ts(synced_at);
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::context("upsert_terms: begin tx", e))?;
        let mut stmt = tx
            .prepare(
                "INSERT INTO cms_terms \
                 (site_id, taxonomy, remote_term_id, name, slug, parent_id, raw_json, synced_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT(site_id, taxonomy, remote_term_id) DO UPDATE SET \
                 name = excluded.name, slug = excluded.slug, parent_id = excluded.parent_id, \
                 raw_json = excluded.raw_json, synced_at = excluded.synced_at",
            )
            .map_err(|e| StateError::context("upsert_terms: prepare", e))?;

        let mut count = 0u64;
        for row in rows {
            stmt.execute(rusqlite::params![
                row.site_id,
                row.taxonomy,
                row.remote_term_id,
                row.name,
                row.slug,
                row.parent_id,
                serde_json::to_string(&row.raw)?,
                synced_at,
            ])
            .map_err(|e| StateError::context("upsert_terms: execute", e))?;
            count += 1;
        }
        drop(stmt);
        tx.commit()
            .map_err(|e| StateError::context("upsert_terms: commit", e))?;
        Ok(count)
    }

    fn upsert_content(&self, rows: &[ContentRow], synced_at: DateTime<Utc>) -> error::Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let conn = self.lock_conn()?;
        let synced_at = Self::to_sqlite_ts(synced_at);
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::context("upsert_content: begin tx", e))?;
        let mut stmt = tx
            .prepare(
                "INSERT INTO cms_content \
                 (site_id, content_type, remote_id, title, slug, body, excerpt, status, author_id, \
                  published_at, modified_at, seo_title, seo_description, seo_json, raw_json, synced_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16) \
                 ON CONFLICT(site_id, content_type, remote_id) DO UPDATE SET \
                 title = excluded.title, slug = excluded.slug, body = excluded.body, \
                 excerpt = excluded.excerpt, status = excluded.status, author_id = excluded.author_id, \
                 published_at = excluded.published_at, modified_at = excluded.modified_at, \
                 seo_title = excluded.seo_title, seo_description = excluded.seo_description, \
                 seo_json = excluded.seo_json, raw_json = excluded.raw_json, \
                 synced_at = excluded.synced_at",
            )
            .map_err(|e| StateError::context("upsert_content: prepare", e))?;

        let mut count = 0u64;
        for row in rows {
            let seo_json = row.seo_json.as_ref().map(serde_json::to_string).transpose()?;
            stmt.execute(rusqlite::params![
                row.site_id,
                row.content_type,
                row.remote_id,
                row.title,
                row.slug,
                row.body,
                row.excerpt,
                row.status,
                row.author_id,
                row.published_at.map(Self::to_sqlite_ts),
                row.modified_at.map(Self::to_sqlite_ts),
                row.seo_title,
                row.seo_description,
                seo_json,
                serde_json::to_string(&row.raw)?,
                synced_at,
            ])
            .map_err(|e| StateError::context("upsert_content: execute", e))?;
            count += 1;
        }
        drop(stmt);
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
        let conn = self.lock_conn()?;
        let synced_at = Self::to_sqlite_ts(synced_at);
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::context("upsert_content_terms: begin tx", e))?;
        let mut stmt = tx
            .prepare(
                "INSERT INTO cms_content_terms \
                 (site_id, content_type, remote_content_id, taxonomy, remote_term_id, synced_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(site_id, content_type, remote_content_id, taxonomy, remote_term_id) \
                 DO UPDATE SET synced_at = excluded.synced_at",
            )
            .map_err(|e| StateError::context("upsert_content_terms: prepare", e))?;

        let mut count = 0u64;
        for row in rows {
            stmt.execute(rusqlite::params![
                row.site_id,
                row.content_type,
                row.remote_content_id,
                row.taxonomy,
                row.remote_term_id,
                synced_at,
            ])
            .map_err(|e| StateError::context("upsert_content_terms: execute", e))?;
            count += 1;
        }
        drop(stmt);
        tx.commit()
            .map_err(|e| StateError::context("upsert_content_terms: commit", e))?;
        Ok(count)
    }

    fn upsert_items(&self, items: &[NormalizedItem], synced_at: DateTime<Utc>) -> error::Result<u64> {
        if items.is_empty() {
            return Ok(0);
        }
        let conn = self.lock_conn()?;
        let synced_at = Self::to_sqlite_ts(synced_at);
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::context("upsert_items: begin tx", e))?;
        let mut stmt = tx
            .prepare(
                "INSERT INTO items \
                 (source_id, external_id, published_at, text, media_json, metadata_json, synced_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(source_id, external_id) DO UPDATE SET \
                 published_at = excluded.published_at, text = excluded.text, \
                 media_json = excluded.media_json, metadata_json = excluded.metadata_json, \
                 synced_at = excluded.synced_at",
            )
            .map_err(|e| StateError::context("upsert_items: prepare", e))?;

        let mut count = 0u64;
        for item in items {
            stmt.execute(rusqlite::params![
                item.source_id,
                item.external_id,
                item.published_at.map(Self::to_sqlite_ts),
                item.text,
                serde_json::to_string(&item.media)?,
                serde_json::to_string(&item.metadata)?,
                synced_at,
            ])
            .map_err(|e| StateError::context("upsert_items: execute", e))?;
            count += 1;
        }
        drop(stmt);
        tx.commit()
            .map_err(|e| StateError::context("upsert_items: commit", e))?;
        Ok(count)
    }

    fn entity_counts(&self, site_id: &str) -> error::Result<EntityCounts> {
        let conn = self.lock_conn()?;
        Ok(EntityCounts {
            authors: Self::count(&conn, "SELECT COUNT(*) FROM cms_authors WHERE site_id = ?1", site_id)?,
            terms: Self::count(&conn, "SELECT COUNT(*) FROM cms_terms WHERE site_id = ?1", site_id)?,
            posts: Self::count(
                &conn,
                "SELECT COUNT(*) FROM cms_content WHERE site_id = ?1 AND content_type = 'post'",
                site_id,
            )?,
            pages: Self::count(
                &conn,
                "SELECT COUNT(*) FROM cms_content WHERE site_id = ?1 AND content_type = 'page'",
                site_id,
            )?,
            content_terms: Self::count(
                &conn,
                "SELECT COUNT(*) FROM cms_content_terms WHERE site_id = ?1",
                site_id,
            )?,
        })
    }

    fn item_count(&self, source_id: &str) -> error::Result<u64> {
        let conn = self.lock_conn()?;
        Self::count(&conn, "SELECT COUNT(*) FROM items WHERE source_id = ?1", source_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use mirrorline_types::item::{MediaKind, MediaRef};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn site(id: &str) -> SiteRecord {
        SiteRecord {
            site_id: id.into(),
            base_url: format!("https://{id}.example.com"),
            name: Some(id.to_uppercase()),
        }
    }

    fn backend_with_site(id: &str) -> SqliteBackend {
        let backend = SqliteBackend::in_memory().unwrap();
        backend.upsert_site(&site(id), t0()).unwrap();
        backend
    }

    fn author(site_id: &str, id: i64, name: &str) -> AuthorRow {
        AuthorRow {
            site_id: site_id.into(),
            remote_user_id: id,
            login: Some(name.to_lowercase()),
            name: Some(name.into()),
            slug: Some(name.to_lowercase()),
            raw: json!({"id": id, "name": name}),
        }
    }

    fn content(site_id: &str, content_type: &str, id: i64, title: &str) -> ContentRow {
        ContentRow {
            site_id: site_id.into(),
            content_type: content_type.into(),
            remote_id: id,
            title: Some(title.into()),
            slug: format!("{content_type}-{id}"),
            body: Some("<p>body</p>".into()),
            excerpt: None,
            status: "publish".into(),
            author_id: Some(1),
            published_at: Some(t0()),
            modified_at: None,
            seo_title: None,
            seo_description: None,
            seo_json: Some(json!({"title": title})),
            raw: json!({"id": id}),
        }
    }

    fn item(source: &str, id: i64) -> NormalizedItem {
        NormalizedItem {
            source_id: source.into(),
            external_id: id.to_string(),
            published_at: Some(t0()),
            text: format!("message {id}"),
            media: vec![MediaRef {
                kind: MediaKind::Photo,
                path: Some(format!("media/photos/{id}_photo.jpg")),
                filename: Some(format!("{id}_photo.jpg")),
                size: Some(10),
                sha256: Some("ab".repeat(32)),
                error: None,
            }],
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn author_upsert_is_idempotent_and_refreshes_synced_at() {
        let backend = backend_with_site("blog");
        let rows = vec![author("blog", 1, "Ann"), author("blog", 2, "Bob")];

        assert_eq!(backend.upsert_authors(&rows, t0()).unwrap(), 2);
        let first = backend.author_synced_at("blog", 1).unwrap();

        let later = t0() + Duration::seconds(30);
        assert_eq!(backend.upsert_authors(&rows, later).unwrap(), 2);
        let second = backend.author_synced_at("blog", 1).unwrap();

        assert_eq!(backend.entity_counts("blog").unwrap().authors, 2);
        assert!(second > first, "synced_at must advance: {first} -> {second}");
    }

    #[test]
    fn content_upsert_overwrites_mutable_fields() {
        let backend = backend_with_site("blog");
        backend
            .upsert_content(&[content("blog", "post", 7, "Draft title")], t0())
            .unwrap();
        backend
            .upsert_content(&[content("blog", "post", 7, "Final title")], t0())
            .unwrap();

        let counts = backend.entity_counts("blog").unwrap();
        assert_eq!(counts.posts, 1);
        assert_eq!(
            backend.content_title("blog", 7).unwrap().as_deref(),
            Some("Final title")
        );
    }

    #[test]
    fn posts_and_pages_with_same_remote_id_are_distinct() {
        let backend = backend_with_site("blog");
        backend
            .upsert_content(
                &[content("blog", "post", 5, "A"), content("blog", "page", 5, "B")],
                t0(),
            )
            .unwrap();
        let counts = backend.entity_counts("blog").unwrap();
        assert_eq!((counts.posts, counts.pages), (1, 1));
    }

    #[test]
    fn term_and_link_upserts_are_idempotent() {
        let backend = backend_with_site("blog");
        let term = TermRow {
            site_id: "blog".into(),
            taxonomy: "category".into(),
            remote_term_id: 3,
            name: Some("News".into()),
            slug: Some("news".into()),
            parent_id: None,
            raw: json!({}),
        };
        let link = ContentTermRow {
            site_id: "blog".into(),
            content_type: "post".into(),
            remote_content_id: 9,
            taxonomy: "category".into(),
            remote_term_id: 3,
        };
        backend.upsert_content(&[content("blog", "post", 9, "x")], t0()).unwrap();
        for _ in 0..2 {
            backend.upsert_terms(std::slice::from_ref(&term), t0()).unwrap();
            backend
                .upsert_content_terms(std::slice::from_ref(&link), t0())
                .unwrap();
        }
        let counts = backend.entity_counts("blog").unwrap();
        assert_eq!(counts.terms, 1);
        assert_eq!(counts.content_terms, 1);
    }

    #[test]
    fn author_for_unknown_site_fails_with_operation_context() {
        let backend = SqliteBackend::in_memory().unwrap();
        let err = backend
            .upsert_authors(&[author("ghost", 1, "Ann")], t0())
            .expect_err("foreign key must reject unknown site");
        assert!(err.to_string().contains("upsert_authors"), "got: {err}");
    }

    #[test]
    fn item_upsert_is_idempotent() {
        let backend = SqliteBackend::in_memory().unwrap();
        let batch: Vec<_> = (1..=5).map(|id| item("news", id)).collect();
        backend.upsert_items(&batch, t0()).unwrap();
        backend.upsert_items(&batch, t0()).unwrap();
        assert_eq!(backend.item_count("news").unwrap(), 5);
        assert_eq!(backend.item_count("other").unwrap(), 0);
    }

    #[test]
    fn empty_batches_are_noops() {
        let backend = SqliteBackend::in_memory().unwrap();
        assert_eq!(backend.upsert_authors(&[], t0()).unwrap(), 0);
        assert_eq!(backend.upsert_items(&[], t0()).unwrap(), 0);
    }

    #[test]
    fn run_lifecycle() {
        let backend = SqliteBackend::in_memory().unwrap();
        let run_id = RunId::new("ab12cd34");
        let source = SourceId::new("blog");
        backend.insert_run(&run_id, &source, t0()).unwrap();

        let running = backend.get_run(&run_id, &source).unwrap().unwrap();
        assert_eq!(running.status, RunStatus::Running);
        assert!(running.finished_at.is_none());

        let completion = RunCompletion {
            status: RunStatus::Partial,
            finished_at: t0() + Duration::seconds(5),
            error_code: Some("NETWORK_ERROR".into()),
            counts: RunCounts {
                authors: 4,
                terms: 2,
                ..RunCounts::default()
            },
        };
        assert_eq!(backend.finish_run(&run_id, &source, &completion).unwrap(), 1);

        let done = backend.get_run(&run_id, &source).unwrap().unwrap();
        assert_eq!(done.status, RunStatus::Partial);
        assert_eq!(done.error_code.as_deref(), Some("NETWORK_ERROR"));
        assert_eq!(done.counts.authors, 4);
        assert_eq!(done.finished_at, Some(completion.finished_at));
    }

    #[test]
    fn finish_run_reports_missing_row_without_raising() {
        let backend = SqliteBackend::in_memory().unwrap();
        let completion = RunCompletion {
            status: RunStatus::Success,
            finished_at: t0(),
            error_code: None,
            counts: RunCounts::default(),
        };
        let updated = backend
            .finish_run(&RunId::new("nope"), &SourceId::new("blog"), &completion)
            .unwrap();
        assert_eq!(updated, 0);
    }

    #[test]
    fn finish_run_updates_only_once() {
        let backend = SqliteBackend::in_memory().unwrap();
        let run_id = RunId::new("r1");
        let source = SourceId::new("blog");
        backend.insert_run(&run_id, &source, t0()).unwrap();
        let completion = RunCompletion {
            status: RunStatus::Success,
            finished_at: t0(),
            error_code: None,
            counts: RunCounts::default(),
        };
        assert_eq!(backend.finish_run(&run_id, &source, &completion).unwrap(), 1);
        assert_eq!(backend.finish_run(&run_id, &source, &completion).unwrap(), 0);
        assert_eq!(backend.count_runs().unwrap(), 1);
    }

    #[test]
    fn file_backend_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mirror.db");
        {
            let backend = SqliteBackend::open(&path).unwrap();
            backend.upsert_items(&[item("news", 1)], t0()).unwrap();
        }
        let reopened = SqliteBackend::open(&path).unwrap();
        assert_eq!(reopened.item_count("news").unwrap(), 1);
    }

    #[test]
    fn timestamp_roundtrip_keeps_micros() {
        let ts = t0() + Duration::microseconds(123_456);
        let stored = SqliteBackend::to_sqlite_ts(ts);
        assert_eq!(stored, "2026-03-01T12:00:00.123456Z");
        assert_eq!(SqliteBackend::from_sqlite_ts(&stored).unwrap(), ts);
    }
}

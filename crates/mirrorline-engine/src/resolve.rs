//! Startup resolution: storage backend selection and per-site credentials.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use mirrorline_state::{PostgresBackend, SqliteBackend, StorageBackend};
use mirrorline_types::SyncError;

use crate::config::types::{StorageBackendKind, StorageConfig};

/// Open the configured backend.
///
/// An unreachable network backend is fatal unless `fallback_to_embedded` is
/// set, in which case the embedded store at `storage.path` is opened
/// instead. Selection happens once; nothing switches backends mid-run.
///
/// The network client blocks internally, so call this off the async
/// runtime (see [`open_storage_blocking`]).
///
/// # Errors
///
/// Returns a config error when the network backend has no connection
/// string, or a storage error when no backend could be opened.
pub fn open_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>, SyncError> {
    match config.backend {
        StorageBackendKind::Sqlite => open_embedded(&config.path),
        StorageBackendKind::Postgres => {
            let Some(connstr) = config.connection.as_deref().filter(|c| !c.trim().is_empty()) else {
                return Err(SyncError::config(
                    "MISSING_CONNECTION",
                    "storage.connection is required for the postgres backend",
                ));
            };
            match PostgresBackend::open(connstr) {
                Ok(backend) => {
                    tracing::info!(backend = "postgres", "Storage backend opened");
                    Ok(Arc::new(backend) as Arc<dyn StorageBackend>)
                }
                Err(e) if config.fallback_to_embedded => {
                    tracing::warn!(
                        error = %e,
                        path = %config.path.display(),
                        "Postgres unreachable, falling back to embedded SQLite"
                    );
                    open_embedded(&config.path)
                }
                Err(e) => Err(SyncError::storage(
                    "STORAGE_UNREACHABLE",
                    format!("postgres backend unreachable: {e}"),
                )),
            }
        }
    }
}

/// [`open_storage`] on the blocking pool.
///
/// # Errors
///
/// Same as [`open_storage`].
pub async fn open_storage_blocking(
    config: StorageConfig,
) -> Result<Arc<dyn StorageBackend>, SyncError> {
    tokio::task::spawn_blocking(move || open_storage(&config))
        .await
        .map_err(|e| SyncError::storage("TASK_PANICKED", format!("open_storage task panicked: {e}")))?
}

/// Drop the last storage handle on the blocking pool. The network client
/// shuts down its connection synchronously on drop.
pub async fn close_storage(storage: Arc<dyn StorageBackend>) {
    if let Err(e) = tokio::task::spawn_blocking(move || drop(storage)).await {
        tracing::warn!(error = %e, "Storage shutdown task panicked");
    }
}

fn open_embedded(path: &Path) -> Result<Arc<dyn StorageBackend>, SyncError> {
    let backend = SqliteBackend::open(path).map_err(SyncError::from)?;
    tracing::info!(backend = "sqlite", path = %path.display(), "Storage backend opened");
    Ok(Arc::new(backend))
}

/// Basic-auth credentials for one site. `Debug` redacts the password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Env var names holding a site's user and application password:
/// `<PREFIX>_<SITE_ID>_USER` and `<PREFIX>_<SITE_ID>_APP_PASSWORD`, with the
/// site id uppercased and `-` mapped to `_`.
#[must_use]
pub fn credential_env_names(prefix: &str, site_id: &str) -> (String, String) {
    let key = site_id.to_ascii_uppercase().replace('-', "_");
    (
        format!("{prefix}_{key}_USER"),
        format!("{prefix}_{key}_APP_PASSWORD"),
    )
}

/// Read a site's credentials from the environment. `None` when either
/// variable is missing or empty.
#[must_use]
pub fn site_credentials(prefix: &str, site_id: &str) -> Option<Credentials> {
    let (user_var, password_var) = credential_env_names(prefix, site_id);
    let user = std::env::var(user_var).ok().filter(|v| !v.is_empty())?;
    let password = std::env::var(password_var).ok().filter(|v| !v.is_empty())?;
    Some(Credentials { user, password })
}

/// Like [`site_credentials`], but a missing pair is a config error naming
/// the variables to set.
///
/// # Errors
///
/// Returns `CONFIG_ERROR` / `MISSING_CREDENTIALS` when either variable is
/// missing or empty.
pub fn require_site_credentials(prefix: &str, site_id: &str) -> Result<Credentials, SyncError> {
    site_credentials(prefix, site_id).ok_or_else(|| {
        let (user_var, password_var) = credential_env_names(prefix, site_id);
        SyncError::config(
            "MISSING_CREDENTIALS",
            format!("site '{site_id}' needs {user_var} and {password_var}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorline_state::BackendKind;
    use mirrorline_types::ErrorKind;

    fn unreachable_postgres(dir: &Path, fallback: bool) -> StorageConfig {
        StorageConfig {
            backend: StorageBackendKind::Postgres,
            connection: Some(
                "host=127.0.0.1 port=1 user=mirror dbname=mirror connect_timeout=2".to_string(),
            ),
            path: dir.join("fallback.db"),
            fallback_to_embedded: fallback,
        }
    }

    #[test]
    fn sqlite_backend_opens_at_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            path: dir.path().join("nested").join("m.db"),
            ..StorageConfig::default()
        };
        let storage = open_storage(&config).unwrap();
        assert_eq!(storage.kind(), BackendKind::Sqlite);
        assert!(config.path.exists());
    }

    #[test]
    fn unreachable_postgres_fails_fast_without_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        let config = unreachable_postgres(dir.path(), false);
        let err = open_storage(&config).err().unwrap();
        assert_eq!(err.kind, ErrorKind::Storage);
        assert_eq!(err.code, "STORAGE_UNREACHABLE");
        assert!(!config.path.exists(), "embedded store must not be created");
    }

    #[test]
    fn unreachable_postgres_falls_back_when_opted_in() {
        let dir = tempfile::tempdir().unwrap();
        let config = unreachable_postgres(dir.path(), true);
        let storage = open_storage(&config).unwrap();
        assert_eq!(storage.kind(), BackendKind::Sqlite);
        assert!(config.path.exists());
    }

    #[test]
    fn postgres_without_connection_is_config_error() {
        let config = StorageConfig {
            backend: StorageBackendKind::Postgres,
            connection: Some("  ".into()),
            ..StorageConfig::default()
        };
        let err = open_storage(&config).err().unwrap();
        assert_eq!(err.kind, ErrorKind::Config);
    }

    #[test]
    fn credential_names_normalize_site_id() {
        let (user, password) = credential_env_names("CMS_SITE", "my-blog");
        assert_eq!(user, "CMS_SITE_MY_BLOG_USER");
        assert_eq!(password, "CMS_SITE_MY_BLOG_APP_PASSWORD");
    }

    #[test]
    fn credentials_come_from_env_and_are_redacted() {
        std::env::set_var("ML_CRED_TEST_SHOP_USER", "editor");
        std::env::set_var("ML_CRED_TEST_SHOP_APP_PASSWORD", "abcd efgh");
        let creds = site_credentials("ML_CRED_TEST", "shop").unwrap();
        assert_eq!(creds.user, "editor");
        let debug = format!("{creds:?}");
        assert!(!debug.contains("abcd"));
        std::env::remove_var("ML_CRED_TEST_SHOP_USER");
        std::env::remove_var("ML_CRED_TEST_SHOP_APP_PASSWORD");
        assert!(site_credentials("ML_CRED_TEST", "shop").is_none());
    }

    #[test]
    fn missing_credentials_are_a_config_error() {
        let err = require_site_credentials("ML_CRED_ABSENT", "docs").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
        assert_eq!(err.code, "MISSING_CREDENTIALS");
        assert!(err.message.contains("ML_CRED_ABSENT_DOCS_USER"));
    }
}

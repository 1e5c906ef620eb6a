//! Bridge from async drivers to the synchronous storage backends.

use std::sync::Arc;

use mirrorline_state::error;
use mirrorline_state::{StateError, StorageBackend};
use mirrorline_types::SyncError;

/// Run one storage operation on the blocking pool.
///
/// Backend failures are tagged with `op` and surface as storage-kind
/// [`SyncError`]s.
pub(crate) async fn with_storage<T, F>(
    storage: &Arc<dyn StorageBackend>,
    op: &'static str,
    f: F,
) -> Result<T, SyncError>
where
    F: FnOnce(&dyn StorageBackend) -> error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let storage = Arc::clone(storage);
    tokio::task::spawn_blocking(move || f(storage.as_ref()))
        .await
        .map_err(|e| SyncError::storage("TASK_PANICKED", format!("{op} task panicked: {e}")))?
        .map_err(|e| SyncError::from(StateError::context(op, e)))
}

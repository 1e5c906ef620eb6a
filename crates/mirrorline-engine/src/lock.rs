//! Cross-process exclusive lock on a session resource.
//!
//! The lock is a `<resource>.lock` file created with `create_new` and holding
//! the owner's pid. A lock whose pid is no longer alive is stale and gets
//! reclaimed. The handle removes the file on drop.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const MAX_ATTEMPTS: u32 = 50;
const RETRY_SLEEP: Duration = Duration::from_millis(50);
/// An empty lock file older than this belongs to a holder that died before
/// writing its pid.
const EMPTY_LOCK_GRACE: Duration = Duration::from_secs(2);

/// Result of [`SessionLock::try_acquire`]. Busy is an expected outcome, not
/// an error.
#[derive(Debug)]
pub enum AcquireOutcome {
    Acquired(SessionLock),
    Busy { holder_pid: Option<u32> },
}

/// Held lock. Only the acquirer can release it.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
    released: bool,
}

impl SessionLock {
    /// Lock file path for a session resource.
    #[must_use]
    pub fn lock_path_for(resource: &Path) -> PathBuf {
        let mut name = resource.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Try to take the lock for `resource`, reclaiming stale locks.
    ///
    /// Blocks for at most `MAX_ATTEMPTS` short sleeps while a concurrent
    /// holder finishes writing its pid.
    ///
    /// # Errors
    ///
    /// Returns an I/O error for failures other than contention.
    pub fn try_acquire(resource: &Path) -> io::Result<AcquireOutcome> {
        let path = Self::lock_path_for(resource);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        for _ in 0..MAX_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let written = write!(file, "{}", std::process::id()).and_then(|()| file.sync_all());
                    if let Err(e) = written {
                        drop(file);
                        let _ = fs::remove_file(&path);
                        return Err(e);
                    }
                    tracing::debug!(path = %path.display(), "Session lock acquired");
                    return Ok(AcquireOutcome::Acquired(Self {
                        path,
                        released: false,
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }

            let contents = match fs::read_to_string(&path) {
                Ok(contents) => contents,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            let trimmed = contents.trim();

            if trimmed.is_empty() {
                if is_older_than(&path, EMPTY_LOCK_GRACE) {
                    reclaim(&path, trimmed)?;
                    continue;
                }
                // holder is between create and write
                std::thread::sleep(RETRY_SLEEP);
                continue;
            }

            match trimmed.parse::<u32>() {
                Ok(pid) if pid_is_alive(pid) => {
                    return Ok(AcquireOutcome::Busy {
                        holder_pid: Some(pid),
                    });
                }
                Ok(pid) => {
                    tracing::info!(path = %path.display(), pid, "Reclaiming stale session lock");
                    reclaim(&path, trimmed)?;
                }
                Err(_) => {
                    tracing::warn!(path = %path.display(), "Unreadable session lock, reclaiming");
                    reclaim(&path, trimmed)?;
                }
            }
        }

        Ok(AcquireOutcome::Busy { holder_pid: None })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly, surfacing I/O errors.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the lock file cannot be removed.
    pub fn release(mut self) -> io::Result<()> {
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to release session lock");
            }
        }
    }
}

/// Remove a stale lock only if it still holds what was judged stale, then
/// back off so concurrent reclaimers settle on a single winner.
fn reclaim(path: &Path, seen: &str) -> io::Result<()> {
    let current = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };
    if current.trim() == seen {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    std::thread::sleep(RETRY_SLEEP);
    Ok(())
}

fn is_older_than(path: &Path, age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|elapsed| elapsed > age)
}

/// Whether a process with `pid` exists. A permission error still means alive.
#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs existence and permission checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}

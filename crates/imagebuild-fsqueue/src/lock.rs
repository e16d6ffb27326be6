//! Exclusive ownership of a store directory.
//!
//! The owner writes a small JSON sentinel naming its process into the
//! directory. A sentinel whose process is gone is taken over; one whose
//! process is still alive makes the open fail.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Sentinel file name. The leading dot keeps it out of the document scan.
pub(crate) const LOCK_FILE: &str = ".lock";

#[derive(Debug, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    hostname: String,
    acquired_at: DateTime<Utc>,
}

impl LockOwner {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: hostname(),
            acquired_at: Utc::now(),
        }
    }

    /// Owners on another host cannot be checked and count as alive.
    fn is_alive(&self) -> bool {
        if self.hostname != hostname() {
            return true;
        }
        Path::new(&format!("/proc/{}", self.pid)).exists()
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "unknown".into())
}

/// Held for as long as the directory is open; the sentinel is removed on drop.
#[derive(Debug)]
pub(crate) struct DirLock {
    path: PathBuf,
}

impl DirLock {
    /// Claim `root`, taking over a sentinel left by a dead process.
    pub(crate) fn acquire(root: &Path) -> io::Result<Self> {
        let path = root.join(LOCK_FILE);
        match Self::create(&path) {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            other => return other,
        }

        match read_owner(&path)? {
            Some(owner) if owner.is_alive() => {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    format!(
                        "{} is in use by process {} on {} since {}",
                        root.display(),
                        owner.pid,
                        owner.hostname,
                        owner.acquired_at
                    ),
                ));
            }
            Some(owner) => {
                warn!(path = %path.display(), pid = owner.pid, "Taking over lock of a dead process");
            }
            None => {
                warn!(path = %path.display(), "Replacing unreadable lock file");
            }
        }
        remove(&path)?;
        Self::create(&path)
    }

    fn create(path: &Path) -> io::Result<Self> {
        let data = serde_json::to_vec(&LockOwner::current())?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        if let Err(e) = file.write_all(&data).and_then(|()| file.sync_all()) {
            let _ = fs::remove_file(path);
            return Err(e);
        }
        debug!(path = %path.display(), "Acquired store lock");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = remove(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to release store lock");
        }
    }
}

/// `None` when the sentinel is garbage or vanished meanwhile.
fn read_owner(path: &Path) -> io::Result<Option<LockOwner>> {
    match fs::read(path) {
        Ok(data) => Ok(serde_json::from_slice(&data).ok()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn remove(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_owner_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let lock = DirLock::acquire(dir.path()).unwrap();
        let err = DirLock::acquire(dir.path()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        drop(lock);
        assert!(!dir.path().join(LOCK_FILE).exists());
        DirLock::acquire(dir.path()).unwrap();
    }

    #[test]
    fn test_dead_owner_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let stale = LockOwner {
            pid: u32::MAX,
            hostname: hostname(),
            acquired_at: Utc::now(),
        };
        fs::write(
            dir.path().join(LOCK_FILE),
            serde_json::to_vec(&stale).unwrap(),
        )
        .unwrap();

        let _lock = DirLock::acquire(dir.path()).unwrap();
        let owner = read_owner(&dir.path().join(LOCK_FILE)).unwrap().unwrap();
        assert_eq!(owner.pid, std::process::id());
    }

    #[test]
    fn test_garbage_lock_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOCK_FILE), b"{").unwrap();
        DirLock::acquire(dir.path()).unwrap();
    }
}

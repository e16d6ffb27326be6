//! One JSON document per job in a flat directory.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use imagebuild_core::{JobId, JobRecord, QueueResult};
use tracing::{error, warn};

use crate::lock::DirLock;

const DOC_SUFFIX: &str = "json";

/// Directory of job documents named `<job_id>.json`.
///
/// Documents are replaced atomically: the new content is written to a
/// hidden temporary file, fsynced, then renamed over the old document.
/// The directory is owned exclusively for as long as the store is open.
#[derive(Debug)]
pub struct DocumentStore {
    root: PathBuf,
    file_mode: u32,
    _lock: DirLock,
}

impl DocumentStore {
    /// Open (creating if needed) the document directory.
    ///
    /// Fails with an [`std::io::ErrorKind::WouldBlock`] error while another
    /// live store holds the directory.
    pub fn open(root: impl Into<PathBuf>, file_mode: u32) -> QueueResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let lock = DirLock::acquire(&root)?;
        Ok(Self {
            root,
            file_mode,
            _lock: lock,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: JobId) -> PathBuf {
        self.root.join(format!("{id}.{DOC_SUFFIX}"))
    }

    /// Atomically write the full document for `job`.
    pub fn write(&self, job: &JobRecord) -> QueueResult<()> {
        let data = serde_json::to_vec(job)?;
        let tmp = self
            .root
            .join(format!(".{}.{}.tmp", job.id, uuid::Uuid::new_v4()));

        let written = (|| -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(self.file_mode)
                .open(&tmp)?;
            // The creation mode is filtered through the umask.
            file.set_permissions(fs::Permissions::from_mode(self.file_mode))?;
            file.write_all(&data)?;
            file.sync_all()?;
            fs::rename(&tmp, self.path_for(job.id))
        })();

        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %tmp.display(), error = %cleanup, "Failed to remove temporary document");
                }
            }
            error!(job_id = %job.id, error = %e, "Failed to write job document");
            return Err(e.into());
        }
        Ok(())
    }

    /// Read every job document in the directory.
    ///
    /// Temporary files left behind by an interrupted write are skipped.
    pub fn read_all(&self) -> QueueResult<Vec<JobRecord>> {
        let mut jobs = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let is_doc = path.extension().is_some_and(|ext| ext == DOC_SUFFIX)
                && !path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with('.'));
            if !is_doc {
                continue;
            }

            let data = fs::read(&path)?;
            let job: JobRecord = serde_json::from_slice(&data).map_err(|e| {
                error!(path = %path.display(), error = %e, "Corrupt job document");
                e
            })?;
            jobs.push(job);
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imagebuild_core::payload_from_str;

    fn job() -> JobRecord {
        JobRecord::new("octopus", payload_from_str("[1, 2]").unwrap(), vec![], "")
    }

    #[test]
    fn test_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path(), 0o600).unwrap();
        let job = job();
        store.write(&job).unwrap();

        let jobs = store.read_all().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, job.id);
        assert_eq!(jobs[0].args.get(), "[1, 2]");

        let path = dir.path().join(format!("{}.json", job.id));
        let mode = fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_rewrite_replaces_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path(), 0o600).unwrap();
        let mut job = job();
        store.write(&job).unwrap();
        job.canceled = true;
        store.write(&job).unwrap();

        let jobs = store.read_all().unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].canceled);
        let documents = fs::read_dir(dir.path())
            .unwrap()
            .filter(|entry| {
                let path = entry.as_ref().unwrap().path();
                path.extension().is_some_and(|ext| ext == DOC_SUFFIX)
            })
            .count();
        assert_eq!(documents, 1);
    }

    #[test]
    fn test_skips_temporary_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path(), 0o600).unwrap();
        fs::write(dir.path().join(".abc.json"), b"garbage").unwrap();
        fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        assert!(store.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_document_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path(), 0o600).unwrap();
        fs::write(dir.path().join("broken.json"), b"{").unwrap();
        assert!(store.read_all().is_err());
    }

    #[test]
    fn test_file_mode_ignores_umask() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path(), 0o664).unwrap();
        let job = job();
        store.write(&job).unwrap();

        let path = dir.path().join(format!("{}.json", job.id));
        let mode = fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o664);
    }

    #[test]
    fn test_directory_is_owned_exclusively() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path(), 0o600).unwrap();
        let err = DocumentStore::open(dir.path(), 0o600).unwrap_err();
        assert!(matches!(
            err,
            imagebuild_core::QueueError::Io(ref e) if e.kind() == std::io::ErrorKind::WouldBlock
        ));

        drop(store);
        let store = DocumentStore::open(dir.path(), 0o600).unwrap();
        assert!(store.read_all().unwrap().is_empty());
    }
}

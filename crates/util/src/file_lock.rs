//! Cross-process exclusive file locks.
//!
//! Used to serialize work on a shared on-disk resource (for example a plugin
//! checkout) between independent processes. The lock is advisory and released
//! when the guard is dropped.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Guard holding an exclusive lock on a lock file.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until an exclusive lock on `path` is held. Parent directories and
    /// the lock file itself are created when missing.
    pub fn acquire(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).truncate(false).write(true).open(path)?;
        debug!(lock = %path.display(), "waiting for file lock");
        file.lock()?;
        debug!(lock = %path.display(), "file lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(error) = self.file.unlock() {
            warn!(lock = %self.path.display(), error = %error, "failed to release file lock");
        } else {
            debug!(lock = %self.path.display(), "file lock released");
        }
    }
}

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Cross-process writer lock for the memory store, held on a sidecar
/// `<db>.lock` file (never the db itself: SQLite owns its own locks there).
/// Released on Drop when the descriptor closes.
pub struct FileLockGuard {
    _file: File,
    lock_path: PathBuf,
}

impl FileLockGuard {
    /// Block until the exclusive advisory lock for `target` is ours.
    pub fn acquire(target: &Path) -> Result<Self> {
        let lock_path = lock_path_for(target);
        let file = open_lock_file(&lock_path)?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to acquire writer lock {}", lock_path.display()))?;
        Ok(Self {
            _file: file,
            lock_path,
        })
    }

    /// Non-blocking variant: `Ok(None)` when another process holds the lock.
    pub fn try_acquire(target: &Path) -> Result<Option<Self>> {
        let lock_path = lock_path_for(target);
        let file = open_lock_file(&lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                _file: file,
                lock_path,
            })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to test writer lock {}", lock_path.display())),
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

fn open_lock_file(lock_path: &Path) -> Result<File> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create lock dir {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)
        .with_context(|| format!("Failed to open lock file {}", lock_path.display()))
}

/// Sidecar lock path for a target file: `<target>.lock`
pub fn lock_path_for(target: &Path) -> PathBuf {
    let mut lock = target.as_os_str().to_owned();
    lock.push(".lock");
    PathBuf::from(lock)
}

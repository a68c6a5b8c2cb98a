//! Cross-process mutual exclusion over filesystem paths.
//!
//! Two flavours are provided, both backed by advisory `flock(2)` locks on a
//! dedicated lock file:
//!
//! - [`ResourceLock::acquire`] blocks until the lock is free. It serialises
//!   mutation of process-wide shared caches (repository mirrors, the
//!   package download cache).
//! - [`ResourceLock::try_acquire`] never blocks. It claims exclusive
//!   ownership of a cache root for one scheduler invocation or one parallel
//!   job; contention is reported immediately as [`LockError::Busy`].
//!
//! # Invariants
//!
//! - The lock is released when the [`LockGuard`] is dropped, on every path
//!   that acquired it.
//! - Lock files are never deleted; their existence carries no meaning
//!   without the OS-level lock.
//! - Locks are advisory: correctness depends on every participant going
//!   through this module.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;

/// Errors raised while acquiring a lock.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LockError {
    /// Another process (or thread) already holds the lock.
    #[error("{} is locked by another testrig process", path.display())]
    Busy {
        /// Lock file that could not be claimed.
        path: PathBuf,
    },

    /// The lock file could not be created or locked.
    #[error("failed to lock {}: {source}", path.display())]
    Io {
        /// Lock file being acquired.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
}

/// A lock file guarding some resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLock {
    path: PathBuf,
}

impl ResourceLock {
    /// Lock guarding `path` via the lock file `path` itself.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Lock guarding the directory `dir` through a sibling `<dir>.lock`
    /// file, so the directory itself can be created or replaced while held.
    #[must_use]
    pub fn for_directory(dir: &Path) -> Self {
        let mut name = dir.file_name().map(ToOwned::to_owned).unwrap_or_default();
        name.push(".lock");
        Self::new(dir.with_file_name(name))
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is acquired.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Io`] if the lock file cannot be opened or locked.
    pub fn acquire(&self) -> Result<LockGuard, LockError> {
        let file = self.open()?;
        file.lock_exclusive().map_err(|source| LockError::Io {
            path: self.path.clone(),
            source,
        })?;
        tracing::debug!(path = %self.path.display(), "lock acquired");
        Ok(LockGuard {
            file,
            path: self.path.clone(),
        })
    }

    /// Acquire the lock without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Busy`] if the lock is held elsewhere, or
    /// [`LockError::Io`] on unexpected filesystem errors.
    pub fn try_acquire(&self) -> Result<LockGuard, LockError> {
        let file = self.open()?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "lock acquired (non-blocking)");
                Ok(LockGuard {
                    file,
                    path: self.path.clone(),
                })
            },
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Err(LockError::Busy {
                path: self.path.clone(),
            }),
            Err(source) => Err(LockError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Run `f` while holding the lock, releasing it afterwards whether `f`
    /// succeeds or not.
    ///
    /// # Errors
    ///
    /// Returns the acquisition error, or whatever `f` returns.
    pub fn with<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: From<LockError>,
    {
        let _guard = self.acquire()?;
        f()
    }

    fn open(&self) -> Result<File, LockError> {
        let io_err = |source| LockError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .map_err(io_err)
    }
}

/// RAII guard: the lock is held for as long as this value lives.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Path of the held lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), err = %err, "failed to release lock");
        }
    }
}

//! Cross-process single-instance lock.
//!
//! The lock is an exclusive OS advisory lock (`flock` on Unix,
//! `LockFileEx` on Windows) on `<dir>/<name>.lock`. Taking it is one kernel
//! call, and the kernel drops it when the holding process exits, so a killed
//! run never leaves a stale lock behind. The file itself is never unlinked:
//! removing it would let a second process lock a fresh inode while the first
//! still holds the old one.
//!
//! The file holds the owner's PID for diagnostics only.

use crate::error::SdicError;
use crate::Result;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const FALLBACK_LOCK_NAME: &str = "sql-data-integrity-checker";

/// Lock name derived from the running executable, so two installations of
/// the checker under different names never block each other.
pub fn default_lock_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| {
            exe.file_stem()
                .and_then(|stem| stem.to_str())
                .map(str::to_string)
        })
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| FALLBACK_LOCK_NAME.to_string())
}

/// Guard for a held run lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    // Holding the handle is what keeps the lock.
    _file: File,
}

impl RunLock {
    /// Acquires the lock on `<dir>/<name>.lock`, creating the file if needed.
    ///
    /// # Errors
    /// Returns [`SdicError::AlreadyRunning`] when another handle holds the
    /// lock, or [`SdicError::Io`] when the lock directory is unusable.
    pub fn acquire(dir: &Path, name: &str) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            SdicError::io(format!("Failed to create lock directory {}", dir.display()), e)
        })?;
        let path = dir.join(format!("{}.lock", name));

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| SdicError::io(format!("Failed to open lock file {}", path.display()), e))?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                let holder = read_holder(&mut file);
                return Err(SdicError::AlreadyRunning {
                    lock_path: path,
                    holder: if holder.is_empty() {
                        "unknown".to_string()
                    } else {
                        holder
                    },
                });
            }
            Err(TryLockError::Error(e)) => {
                return Err(SdicError::io(
                    format!("Failed to lock {}", path.display()),
                    e,
                ));
            }
        }

        let written = file
            .set_len(0)
            .and_then(|()| file.seek(SeekFrom::Start(0)))
            .and_then(|_| file.write_all(std::process::id().to_string().as_bytes()))
            .and_then(|()| file.sync_all());
        if let Err(e) = written {
            return Err(SdicError::io(
                format!("Failed to write lock file {}", path.display()),
                e,
            ));
        }

        debug!(lock = %path.display(), "Acquired run lock");
        Ok(Self { path, _file: file })
    }

    /// Path of the held lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // The handle closes right after this and the kernel releases the lock.
        debug!(lock = %self.path.display(), "Released run lock");
    }
}

fn read_holder(file: &mut File) -> String {
    let mut holder = String::new();
    if file.seek(SeekFrom::Start(0)).is_ok() {
        let _ = file.read_to_string(&mut holder);
    }
    holder.trim().to_string()
}

//! Single-instance advisory lock.
//!
//! One lock file in the configuration directory, taken exclusively at
//! startup. Held for the process lifetime; the kernel releases it on crash.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{AppError, AppResult};

/// Held instance lock. Dropping it releases the advisory lock.
pub struct InstanceLock {
    path: PathBuf,
    #[cfg(unix)]
    _flock: nix::fcntl::Flock<std::fs::File>,
    #[cfg(not(unix))]
    _file: std::fs::File,
}

impl InstanceLock {
    /// Take the exclusive lock at `path`, writing the holder PID for
    /// operator diagnostics.
    ///
    /// # Errors
    ///
    /// Returns `LockHeld` when another process holds the lock, or `Io` when
    /// the file cannot be created.
    pub fn acquire(path: &Path) -> AppResult<Self> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|source| AppError::Io {
                operation: "lock.open",
                path: Some(path.to_path_buf()),
                source,
            })?;

        #[cfg(unix)]
        {
            let flock = nix::fcntl::Flock::lock(
                file.try_clone().map_err(|source| AppError::Io {
                    operation: "lock.clone",
                    path: Some(path.to_path_buf()),
                    source,
                })?,
                nix::fcntl::FlockArg::LockExclusiveNonblock,
            )
            .map_err(|_| AppError::LockHeld {
                path: path.to_path_buf(),
            })?;

            write_pid(&mut file, path)?;
            info!(path = %path.display(), "instance lock acquired");
            Ok(Self {
                path: path.to_path_buf(),
                _flock: flock,
            })
        }

        #[cfg(not(unix))]
        {
            write_pid(&mut file, path)?;
            Ok(Self {
                path: path.to_path_buf(),
                _file: file,
            })
        }
    }

    /// Path of the held lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_pid(file: &mut std::fs::File, path: &Path) -> AppResult<()> {
    file.set_len(0).map_err(|source| AppError::Io {
        operation: "lock.truncate",
        path: Some(path.to_path_buf()),
        source,
    })?;
    writeln!(file, "{}", std::process::id()).map_err(|source| AppError::Io {
        operation: "lock.write_pid",
        path: Some(path.to_path_buf()),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_in_the_same_process_is_refused() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cachelot.lock");

        let held = InstanceLock::acquire(&path)?;
        assert_eq!(held.path(), path);
        let pid: u32 = std::fs::read_to_string(&path)?.trim().parse()?;
        assert_eq!(pid, std::process::id());

        let refused = InstanceLock::acquire(&path);
        assert!(matches!(refused, Err(AppError::LockHeld { .. })));

        drop(held);
        let reacquired = InstanceLock::acquire(&path)?;
        drop(reacquired);
        Ok(())
    }
}

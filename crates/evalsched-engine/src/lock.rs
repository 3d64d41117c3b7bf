//! Implementation of the advisory file lock guarding shared cache entries.

use std::fs;
use std::fs::File;
use std::fs::TryLockError;
use std::io;
use std::path::Path;

use tokio::task::spawn_blocking;
use tracing::info;

/// Represents a held, exclusive lock on a file.
///
/// The lock is released when the value is dropped.
#[derive(Debug)]
pub struct LockedFile(File);

impl LockedFile {
    /// Acquires an exclusive file lock for the given path, waiting for any
    /// other holder to release it.
    ///
    /// The file and its parent directory are created if they do not exist.
    /// The contents of the file are left untouched.
    pub async fn acquire_exclusive(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut options = fs::OpenOptions::new();
        options.create(true).truncate(false).write(true);
        let file = options.open(path)?;

        match file.try_lock() {
            Ok(_) => Ok(Self(file)),
            Err(TryLockError::WouldBlock) => {
                let path = path.to_path_buf();
                spawn_blocking(move || {
                    info!(
                        "waiting to acquire exclusive lock on `{path}`",
                        path = path.display()
                    );

                    file.lock()?;
                    Ok(Self(file))
                })
                .await
                .map_err(io::Error::other)?
            }
            Err(TryLockError::Error(e)) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn creates_missing_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locks").join("entry.lock");
        let _lock = LockedFile::acquire_exclusive(&path).await.unwrap();
        assert!(path.is_file());
    }

    #[tokio::test]
    async fn excludes_other_holders() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("entry.lock");
        let lock = LockedFile::acquire_exclusive(&path).await.unwrap();

        let other = File::open(&path).unwrap();
        assert!(matches!(other.try_lock(), Err(TryLockError::WouldBlock)));

        drop(lock);
        other.try_lock().unwrap();
    }
}

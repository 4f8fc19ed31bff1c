use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::error::{Error, Result};

/// Name of the lock file inside the database directory.
pub const LOCK_FILE: &str = "LOCK";

/// Exclusive claim on a database directory for the lifetime of one `Db`.
#[derive(Debug)]
pub struct DirLock {
    _file: File,
    path: PathBuf,
}

impl DirLock {
    /// Locks `dir`. Fails with `Busy` when another handle, in this process
    /// or another one, already holds it.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = Self::try_lock(&file) {
            if e.kind() == io::ErrorKind::WouldBlock {
                return Err(Error::Busy(format!("lock held on {:?}", path)));
            }
            return Err(e.into());
        }

        // Owner pid, for whoever is debugging a stale lock.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        tracing::debug!(path = ?path, "Acquired database lock");
        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_writes_pid() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let lock = DirLock::acquire(temp_dir.path()).expect("Failed to acquire lock");

        assert_eq!(lock.path(), temp_dir.path().join(LOCK_FILE));
        let content = std::fs::read_to_string(lock.path()).expect("Failed to read lock file");
        assert!(content.contains(&std::process::id().to_string()));
    }

    #[test]
    fn test_double_lock_is_busy() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let _first = DirLock::acquire(temp_dir.path()).expect("Failed to acquire first lock");

        let second = DirLock::acquire(temp_dir.path());
        assert!(matches!(second, Err(Error::Busy(_))));
    }

    #[test]
    fn test_released_on_drop() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        {
            let _lock = DirLock::acquire(temp_dir.path()).expect("Failed to acquire lock");
        }
        // The file stays behind; only the lock is gone.
        assert!(temp_dir.path().join(LOCK_FILE).exists());
        DirLock::acquire(temp_dir.path()).expect("Should be able to acquire lock after drop");
    }
}

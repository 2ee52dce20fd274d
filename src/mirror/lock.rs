use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

/// A guard that holds an exclusive lock on a mirror directory.
/// Lock is released when dropped.
///
/// The lock lives next to the mirror (`<mirror>.lock`) so it survives the
/// mirror being deleted and re-cloned. A git operation abandoned by a timed
/// out sync keeps holding it until it finishes, which keeps the next sync
/// from running git on the same working copy at the same time.
#[derive(Debug)]
pub struct MirrorLock {
    file: File,
}

impl MirrorLock {
    /// Lock file path for a mirror directory.
    pub fn path_for(mirror: &Path) -> PathBuf {
        let mut name = mirror
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "mirror".into());
        name.push(".lock");
        mirror.with_file_name(name)
    }

    /// Acquire the lock, polling with exponential backoff until `timeout`.
    /// Returns an error with `ErrorKind::TimedOut` if it cannot be acquired
    /// in time.
    pub fn acquire_with_timeout(lock_path: &Path, timeout: Duration) -> io::Result<Self> {
        let file = open_lock_file(lock_path)?;

        let start = Instant::now();
        let mut sleep_duration = Duration::from_millis(10);
        let max_sleep = Duration::from_millis(500);

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("lock acquisition timed out after {:?}", timeout),
                        ));
                    }
                    std::thread::sleep(sleep_duration);
                    sleep_duration = (sleep_duration * 2).min(max_sleep);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Try to acquire lock without blocking.
    /// Returns None if the lock is held elsewhere.
    pub fn try_acquire(lock_path: &Path) -> io::Result<Option<Self>> {
        let file = open_lock_file(lock_path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn open_lock_file(lock_path: &Path) -> io::Result<File> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
}

impl Drop for MirrorLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

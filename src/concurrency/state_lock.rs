//! Cross-process lock over the state directory (fs2 flock).
//!
//! Several shellfence processes may share one filter directory. Artifact
//! writes and eviction sweeps hold this lock so one process never deletes a
//! file another is in the middle of publishing.

use fs2::FileExt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

const LOCK_FILENAME: &str = ".lock";

#[derive(Debug, Clone)]
pub struct StateLock {
    path: PathBuf,
}

/// Releases the lock on drop.
#[derive(Debug)]
pub struct StateLockGuard {
    file: File,
}

impl Drop for StateLockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl StateLock {
    /// Lock file at `<dir>/.lock`; `dir` is created if missing.
    pub fn in_dir(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(LOCK_FILENAME),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocking acquire.
    pub fn acquire(&self) -> io::Result<StateLockGuard> {
        let file = File::create(&self.path)?;
        file.lock_exclusive()?;
        Ok(StateLockGuard { file })
    }

    /// Returns `None` if another process holds the lock.
    pub fn try_acquire(&self) -> io::Result<Option<StateLockGuard>> {
        let file = File::create(&self.path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(StateLockGuard { file })),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            #[cfg(unix)]
            Err(ref e) if e.raw_os_error() == Some(35) || e.raw_os_error() == Some(11) => {
                // EAGAIN(11) / EWOULDBLOCK(35 on macOS)
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Barrier};

    #[test]
    fn acquire_creates_dir_and_releases() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = StateLock::in_dir(&tmp.path().join("filters")).unwrap();

        let guard = lock.acquire().unwrap();
        assert!(lock.path().exists());
        drop(guard);

        let _again = lock.acquire().unwrap();
    }

    #[test]
    fn try_acquire_returns_none_when_held() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = StateLock::in_dir(tmp.path()).unwrap();

        let file = File::create(lock.path()).unwrap();
        file.lock_exclusive().unwrap();
        assert!(lock.try_acquire().unwrap().is_none());

        file.unlock().unwrap();
        drop(file);
        assert!(lock.try_acquire().unwrap().is_some());
    }

    #[test]
    fn concurrent_threads_serialize() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().to_path_buf();
        let inside = Arc::new(AtomicU32::new(0));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let dir = dir.clone();
                let inside = inside.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let lock = StateLock::in_dir(&dir).unwrap();
                    barrier.wait();
                    let _guard = lock.acquire().unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    }
}

//! Advisory locking with bounded retry.
//!
//! Locks are `flock(2)` locks on the handle's descriptor, so they coordinate
//! cooperating processes (and independent descriptors within one process).
//! Before and after the OS grants a lock the handle checks that its
//! descriptor still names the file at the path; a replaced file is reopened
//! so the lock protects what other processes will open.

use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{io, thread};

use tracing::{debug, info, warn};

use crate::config::LockOptions;
use crate::error::{FileError, FileResult};
use crate::handle::FileHandle;
use crate::mode::LockMode;

/// Sleeps between nonblocking lock attempts.
pub trait Sleeper {
    /// Pauses the calling thread for `interval`.
    fn sleep(&mut self, interval: Duration);
}

/// Sleeps on the current thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, interval: Duration) {
        thread::sleep(interval);
    }
}

/// Records requested sleeps without waiting. Useful in tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    /// Every interval passed to [`Sleeper::sleep`], in order.
    pub sleeps: Vec<Duration>,
}

impl RecordingSleeper {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total time that would have been slept.
    pub fn total(&self) -> Duration {
        self.sleeps.iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&mut self, interval: Duration) {
        self.sleeps.push(interval);
    }
}

fn flock(fd: RawFd, operation: libc::c_int) -> io::Result<()> {
    // SAFETY: `fd` belongs to a `File` owned by the calling handle and stays
    // open for the duration of the call.
    let ret = unsafe { libc::flock(fd, operation) };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn is_contended(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN)
}

fn is_interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}

impl FileHandle {
    /// Acquires an advisory lock using the handle's configured
    /// [`LockOptions`].
    pub fn lock(&mut self, mode: LockMode) -> FileResult<()> {
        let options = self.config.lock;
        self.lock_with(mode, &options)
    }

    /// Acquires an advisory lock with explicit options, sleeping on the
    /// current thread between attempts.
    pub fn lock_with(&mut self, mode: LockMode, options: &LockOptions) -> FileResult<()> {
        self.lock_with_sleeper(mode, options, &mut ThreadSleeper)
    }

    /// Acquires an advisory lock, using `sleeper` between nonblocking
    /// attempts.
    ///
    /// Nonblocking acquisition makes at most `1 + max_retry` attempts.
    /// Blocking acquisition waits in the kernel. A write lock requires a
    /// writable handle. If this handle already holds a lock, the lock is
    /// converted to `mode`. `flock(2)` drops the old lock before converting,
    /// so a failed conversion leaves the handle unlocked.
    pub fn lock_with_sleeper(
        &mut self,
        mode: LockMode,
        options: &LockOptions,
        sleeper: &mut dyn Sleeper,
    ) -> FileResult<()> {
        let result = self.acquire(mode, options, sleeper);
        self.track(result)
    }

    fn acquire(
        &mut self,
        mode: LockMode,
        options: &LockOptions,
        sleeper: &mut dyn Sleeper,
    ) -> FileResult<()> {
        if self.file.is_none() {
            return Err(self.not_open());
        }
        if mode == LockMode::Write && !self.mode().is_writable() {
            return Err(FileError::InvalidOperation {
                path: self.name().to_string(),
                reason: "write lock requires a writable handle",
            });
        }

        // From here on the OS may drop a lock we already hold.
        self.held_lock = None;

        if !self.check_integrity() {
            info!(path = %self.name(), "file replaced on disk, reopening before lock");
            self.reopen()?;
        }

        let mut operation = mode.flock_operation();
        if options.nonblocking {
            operation |= libc::LOCK_NB;
        }

        let mut remaining = options.max_retry;
        let mut attempts = 0u32;
        loop {
            let fd = self.raw_fd()?;
            attempts += 1;
            self.stats.lock_attempts += 1;

            match flock(fd, operation) {
                Ok(()) => {
                    if self.check_integrity() {
                        self.held_lock = Some(mode);
                        self.stats.locks_acquired += 1;
                        debug!(path = %self.name(), ?mode, attempts, "lock acquired");
                        return Ok(());
                    }
                    // Replaced while we were acquiring; the lock guards an
                    // orphaned inode.
                    if let Err(err) = flock(fd, libc::LOCK_UN) {
                        debug!(path = %self.name(), error = %err, "release of replaced file failed");
                    }
                    if remaining == 0 {
                        warn!(path = %self.name(), "file kept changing during lock acquisition");
                        return Err(FileError::StaleHandle {
                            path: self.name().to_string(),
                        });
                    }
                    remaining -= 1;
                    info!(path = %self.name(), "file replaced during lock, reopening");
                    self.reopen()?;
                }
                Err(err) if !options.nonblocking && is_interrupted(&err) => {
                    debug!(path = %self.name(), "blocking lock interrupted, retrying");
                }
                Err(err) if is_contended(&err) || is_interrupted(&err) => {
                    if remaining == 0 {
                        self.stats.lock_contentions += 1;
                        warn!(path = %self.name(), attempts, "lock contention, giving up");
                        return Err(FileError::LockContention {
                            path: self.name().to_string(),
                            attempts,
                        });
                    }
                    remaining -= 1;
                    self.stats.lock_retries += 1;
                    debug!(path = %self.name(), remaining, "lock busy, retrying");
                    sleeper.sleep(options.retry_interval());
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Releases a lock this handle acquired. A no-op when none is held.
    ///
    /// The handle stops considering itself locked even if the release call
    /// fails; the failure is still returned and recorded.
    pub fn unlock(&mut self) -> FileResult<()> {
        let Some(mode) = self.held_lock.take() else {
            return Ok(());
        };
        self.stats.unlocks += 1;
        let result = match self.raw_fd() {
            Ok(fd) => flock(fd, libc::LOCK_UN).map_err(FileError::from),
            Err(err) => Err(err),
        };
        if result.is_ok() {
            debug!(path = %self.name(), ?mode, "lock released");
        }
        self.track(result)
    }

    fn raw_fd(&self) -> FileResult<RawFd> {
        self.file
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(|| self.not_open())
    }

    pub(crate) fn not_open(&self) -> FileError {
        FileError::NotOpen {
            path: self.name().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FileErrorKind;
    use crate::identity::FileIdentity;
    use crate::mode::{OpenFlags, OpenMode};
    use std::time::Instant;
    use tempfile::tempdir;

    fn fixture(contents: &[u8]) -> (tempfile::TempDir, String) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lockme").to_string_lossy().into_owned();
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_shared_locks_coexist() {
        let (_dir, path) = fixture(b"x");
        let mut a = FileHandle::open(&path, OpenMode::Read, OpenFlags::NONE);
        let mut b = FileHandle::open(&path, OpenMode::Read, OpenFlags::NONE);

        a.lock(LockMode::Read).unwrap();
        b.lock(LockMode::Read).unwrap();
        assert_eq!(a.lock_mode(), Some(LockMode::Read));
        assert_eq!(b.lock_mode(), Some(LockMode::Read));
    }

    #[test]
    fn test_exclusive_excludes_shared() {
        let (_dir, path) = fixture(b"x");
        let mut reader = FileHandle::open(&path, OpenMode::Read, OpenFlags::NONE);
        let mut writer = FileHandle::open(&path, OpenMode::ReadWrite, OpenFlags::NONE);
        reader.lock(LockMode::Read).unwrap();

        let mut sleeper = RecordingSleeper::new();
        let err = writer
            .lock_with_sleeper(LockMode::Write, &LockOptions::nonblocking(3, 10), &mut sleeper)
            .unwrap_err();
        assert_eq!(err.kind(), FileErrorKind::LockContention);
        assert_eq!(sleeper.sleeps.len(), 3);
        assert!(!writer.is_locked());
        assert!(writer.has_error());

        reader.unlock().unwrap();
        writer
            .lock_with_sleeper(LockMode::Write, &LockOptions::nonblocking(0, 10), &mut sleeper)
            .unwrap();
        assert!(writer.is_locked());
        assert!(!writer.has_error());
    }

    #[test]
    fn test_exclusive_excludes_exclusive() {
        let (_dir, path) = fixture(b"x");
        let mut a = FileHandle::open(&path, OpenMode::Write, OpenFlags::NONE);
        let mut b = FileHandle::open(&path, OpenMode::Write, OpenFlags::NONE);
        a.lock(LockMode::Write).unwrap();

        let mut sleeper = RecordingSleeper::new();
        let err = b
            .lock_with_sleeper(LockMode::Write, &LockOptions::nonblocking(2, 1000), &mut sleeper)
            .unwrap_err();
        match err {
            FileError::LockContention { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sleeper.total(), Duration::from_micros(2000));
        assert_eq!(b.stats().lock_attempts, 3);
        assert_eq!(b.stats().lock_retries, 2);
        assert_eq!(b.stats().lock_contentions, 1);
    }

    #[test]
    fn test_contention_waits_real_interval() {
        let (_dir, path) = fixture(b"x");
        let mut holder = FileHandle::open(&path, OpenMode::Write, OpenFlags::NONE);
        let mut waiter = FileHandle::open(&path, OpenMode::Write, OpenFlags::NONE);
        holder.lock(LockMode::Write).unwrap();

        let start = Instant::now();
        let err = waiter
            .lock_with(LockMode::Write, &LockOptions::nonblocking(2, 1000))
            .unwrap_err();
        assert!(start.elapsed() >= Duration::from_micros(2000));
        assert_eq!(err.kind(), FileErrorKind::LockContention);
    }

    #[test]
    fn test_write_lock_on_read_only_handle_rejected() {
        let (_dir, path) = fixture(b"x");
        let mut handle = FileHandle::open(&path, OpenMode::Read, OpenFlags::NONE);

        let err = handle.lock(LockMode::Write).unwrap_err();
        assert_eq!(err.kind(), FileErrorKind::InvalidOperation);
        assert!(matches!(err, FileError::InvalidOperation { .. }));
        assert_eq!(handle.stats().lock_attempts, 0);
        assert!(!handle.is_locked());
    }

    #[test]
    fn test_lock_on_closed_handle() {
        let (_dir, path) = fixture(b"x");
        let mut handle = FileHandle::open(&path, OpenMode::ReadWrite, OpenFlags::NONE);
        handle.close();

        let err = handle.lock(LockMode::Read).unwrap_err();
        assert!(matches!(err, FileError::NotOpen { .. }));
        assert!(handle.has_error());
    }

    #[test]
    fn test_unlock_twice_is_noop() {
        let (_dir, path) = fixture(b"x");
        let mut handle = FileHandle::open(&path, OpenMode::ReadWrite, OpenFlags::NONE);
        handle.lock(LockMode::Write).unwrap();

        handle.unlock().unwrap();
        assert!(!handle.is_locked());
        handle.unlock().unwrap();
        assert!(!handle.has_error());
        assert_eq!(handle.stats().unlocks, 1);
    }

    #[test]
    fn test_close_releases_lock() {
        let (_dir, path) = fixture(b"x");
        let mut a = FileHandle::open(&path, OpenMode::Write, OpenFlags::NONE);
        let mut b = FileHandle::open(&path, OpenMode::Write, OpenFlags::NONE);
        a.lock(LockMode::Write).unwrap();

        a.close();
        assert!(!a.is_locked());
        b.lock_with(LockMode::Write, &LockOptions::nonblocking(0, 0))
            .unwrap();
    }

    #[test]
    fn test_drop_releases_lock() {
        let (_dir, path) = fixture(b"x");
        {
            let mut a = FileHandle::open(&path, OpenMode::Write, OpenFlags::NONE);
            a.lock(LockMode::Write).unwrap();
        }
        let mut b = FileHandle::open(&path, OpenMode::Write, OpenFlags::NONE);
        b.lock_with(LockMode::Write, &LockOptions::nonblocking(0, 0))
            .unwrap();
    }

    #[test]
    fn test_lock_reopens_replaced_file() {
        let (_dir, path) = fixture(b"old");
        let mut handle = FileHandle::open(&path, OpenMode::ReadWrite, OpenFlags::NONE);
        let old_identity = handle.identity().unwrap();

        std::fs::remove_file(&path).unwrap();
        std::fs::write(&path, b"replacement").unwrap();

        handle.lock(LockMode::Write).unwrap();
        assert!(handle.check_integrity());
        assert_ne!(handle.identity().unwrap(), old_identity);
        assert_eq!(handle.size().unwrap(), 11);
        assert_eq!(handle.stats().reopens, 1);
    }

    #[test]
    fn test_lock_after_delete_read_only_fails_open() {
        let (_dir, path) = fixture(b"old");
        let mut handle = FileHandle::open(&path, OpenMode::Read, OpenFlags::NONE);
        std::fs::remove_file(&path).unwrap();

        let err = handle.lock(LockMode::Read).unwrap_err();
        assert_eq!(err.kind(), FileErrorKind::Open);
        assert!(!handle.is_open());
        assert!(!handle.is_locked());
    }

    #[test]
    fn test_lock_conversion() {
        let (_dir, path) = fixture(b"x");
        let mut handle = FileHandle::open(&path, OpenMode::ReadWrite, OpenFlags::NONE);
        handle.lock(LockMode::Read).unwrap();
        handle.lock(LockMode::Write).unwrap();
        assert_eq!(handle.lock_mode(), Some(LockMode::Write));

        let mut reader = FileHandle::open(&path, OpenMode::Read, OpenFlags::NONE);
        assert!(reader
            .lock_with(LockMode::Read, &LockOptions::nonblocking(0, 0))
            .is_err());
    }

    #[test]
    fn test_blocking_lock_waits_for_release() {
        let (_dir, path) = fixture(b"x");
        let mut holder = FileHandle::open(&path, OpenMode::Write, OpenFlags::NONE);
        holder.lock(LockMode::Write).unwrap();

        let waiter_path = path.clone();
        let waiter = thread::spawn(move || {
            let mut handle = FileHandle::open(&waiter_path, OpenMode::Write, OpenFlags::NONE);
            handle.lock_with(LockMode::Write, &LockOptions::blocking()).map(|_| handle.is_locked())
        });

        thread::sleep(Duration::from_millis(50));
        holder.unlock().unwrap();
        assert!(waiter.join().unwrap().unwrap());
    }

    #[test]
    fn test_failed_conversion_leaves_handle_unlocked() {
        let (_dir, path) = fixture(b"x");
        let mut a = FileHandle::open(&path, OpenMode::ReadWrite, OpenFlags::NONE);
        let mut b = FileHandle::open(&path, OpenMode::Read, OpenFlags::NONE);
        a.lock(LockMode::Read).unwrap();
        b.lock(LockMode::Read).unwrap();

        let err = a
            .lock_with(LockMode::Write, &LockOptions::nonblocking(0, 0))
            .unwrap_err();
        assert_eq!(err.kind(), FileErrorKind::LockContention);
        assert_eq!(a.lock_mode(), None);
        assert!(!a.is_locked());

        // The kernel dropped a's shared lock, so b is the only holder.
        drop(b);
        let mut c = FileHandle::open(&path, OpenMode::Write, OpenFlags::NONE);
        c.lock_with(LockMode::Write, &LockOptions::nonblocking(0, 0))
            .unwrap();

        a.unlock().unwrap();
        assert_eq!(a.stats().unlocks, 0);
    }

    #[test]
    fn test_blocking_lock_follows_replacement() {
        let (_dir, path) = fixture(b"old");
        let mut holder = FileHandle::open(&path, OpenMode::ReadWrite, OpenFlags::NONE);
        holder.lock(LockMode::Write).unwrap();

        let waiter_path = path.clone();
        let waiter = thread::spawn(move || {
            let mut handle = FileHandle::open(&waiter_path, OpenMode::ReadWrite, OpenFlags::NONE);
            let result = handle.lock_with(LockMode::Write, &LockOptions::blocking());
            (result.is_ok(), handle.is_locked(), handle.stats().reopens, handle.identity())
        });

        // Let the waiter block on the old inode before swapping the file.
        thread::sleep(Duration::from_millis(100));
        std::fs::remove_file(&path).unwrap();
        std::fs::write(&path, b"replacement").unwrap();
        let replacement = FileIdentity::of_path(&path).unwrap();
        holder.unlock().unwrap();

        let (ok, locked, reopens, identity) = waiter.join().unwrap();
        assert!(ok);
        assert!(locked);
        assert_eq!(reopens, 1);
        assert_eq!(identity, Some(replacement));
    }

    #[test]
    fn test_replacement_with_exhausted_budget_is_stale() {
        let (_dir, path) = fixture(b"old");
        let mut holder = FileHandle::open(&path, OpenMode::ReadWrite, OpenFlags::NONE);
        holder.lock(LockMode::Write).unwrap();

        let waiter_path = path.clone();
        let waiter = thread::spawn(move || {
            let mut handle = FileHandle::open(&waiter_path, OpenMode::ReadWrite, OpenFlags::NONE);
            let options = LockOptions {
                nonblocking: false,
                max_retry: 0,
                ..LockOptions::default()
            };
            let kind = handle.lock_with(LockMode::Write, &options).map_err(|e| e.kind());
            (kind, handle.is_locked(), handle.has_error())
        });

        thread::sleep(Duration::from_millis(100));
        std::fs::remove_file(&path).unwrap();
        std::fs::write(&path, b"replacement").unwrap();
        holder.unlock().unwrap();

        let (kind, locked, has_error) = waiter.join().unwrap();
        assert_eq!(kind, Err(FileErrorKind::StaleHandle));
        assert!(!locked);
        assert!(has_error);
    }

    #[test]
    fn test_recording_sleeper_total() {
        let mut sleeper = RecordingSleeper::new();
        sleeper.sleep(Duration::from_micros(5));
        sleeper.sleep(Duration::from_micros(7));
        assert_eq!(sleeper.total(), Duration::from_micros(12));
    }
}

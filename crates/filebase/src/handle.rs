//! File handle lifecycle: open, close, reopen and the integrity check.
//!
//! A [`FileHandle`] owns at most one descriptor for a named path. Every
//! fallible operation both returns its outcome and records it as the
//! handle's last error, so callers may either propagate with `?` or poll
//! [`FileHandle::has_error`] after a batch of calls.

use std::fs::File;
use std::io::{self, Seek, SeekFrom};

use tracing::{debug, warn};

use crate::config::HandleConfig;
use crate::error::{FileError, FileResult};
use crate::identity::FileIdentity;
use crate::mode::{LockMode, OpenFlags, OpenMode, RawOpenFlags};
use crate::stats::HandleStats;

/// A named file with advisory locking and stale-handle recovery.
///
/// Dropping the handle releases any lock it acquired and closes the
/// descriptor, even if the handle is in an error state.
#[derive(Debug)]
pub struct FileHandle {
    name: String,
    pub(crate) file: Option<File>,
    open_flags: RawOpenFlags,
    flags: OpenFlags,
    pub(crate) config: HandleConfig,
    identity: Option<FileIdentity>,
    last_error: Option<FileError>,
    /// Lock this handle acquired itself and must release.
    pub(crate) held_lock: Option<LockMode>,
    pub(crate) stats: HandleStats,
}

impl FileHandle {
    /// Opens `name` with the default [`HandleConfig`].
    ///
    /// Never fails: on error the handle is returned closed with the error
    /// recorded, see [`FileHandle::has_error`].
    pub fn open(name: impl Into<String>, mode: OpenMode, flags: OpenFlags) -> Self {
        Self::open_with_config(name, mode, flags, HandleConfig::default())
    }

    /// Opens `name` with an explicit configuration.
    pub fn open_with_config(
        name: impl Into<String>,
        mode: OpenMode,
        flags: OpenFlags,
        config: HandleConfig,
    ) -> Self {
        let open_flags = RawOpenFlags::derive(mode, flags, config.create_mode);
        let mut handle = Self {
            name: name.into(),
            file: None,
            open_flags,
            flags,
            config,
            identity: None,
            last_error: None,
            held_lock: None,
            stats: HandleStats::default(),
        };
        let result = handle.open_descriptor();
        // Recorded in last_error; construction itself never fails.
        let _ = handle.track(result);
        handle
    }

    fn open_descriptor(&mut self) -> FileResult<()> {
        let options = self.open_flags.to_open_options();
        let file = loop {
            match options.open(&self.name) {
                Ok(file) => break file,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(path = %self.name, error = %err, "failed to open file");
                    return Err(FileError::open(&self.name, err));
                }
            }
        };

        self.identity = FileIdentity::of_file(&file).ok();
        self.file = Some(file);
        self.stats.opens += 1;
        debug!(
            path = %self.name,
            flags = self.open_flags.bits(),
            "opened file"
        );
        Ok(())
    }

    /// Closes then opens the path again with the original flags.
    ///
    /// Callers establish that reopening is appropriate.
    pub(crate) fn reopen(&mut self) -> FileResult<()> {
        self.close();
        self.stats.reopens += 1;
        self.open_descriptor()
    }

    /// Closes the descriptor. Closing a closed handle is a no-op.
    ///
    /// Any lock held through the descriptor goes away with it. The last
    /// error is left untouched.
    pub fn close(&mut self) {
        self.held_lock = None;
        if self.file.take().is_some() {
            debug!(path = %self.name, "closed file");
        }
    }

    /// Returns whether the open descriptor still refers to the file named by
    /// the path.
    ///
    /// False when the path was deleted or recreated after opening, when
    /// either lookup fails, or when the handle is closed.
    pub fn check_integrity(&mut self) -> bool {
        let Some(file) = self.file.as_ref() else {
            return false;
        };
        let intact = match (FileIdentity::of_file(file), FileIdentity::of_path(&self.name)) {
            (Ok(held), Ok(on_disk)) => held == on_disk,
            _ => false,
        };
        if !intact {
            self.stats.integrity_failures += 1;
            debug!(path = %self.name, "descriptor no longer matches path");
        }
        intact
    }

    /// Current file size from the descriptor.
    pub fn size(&mut self) -> FileResult<u64> {
        let result = match self.file.as_ref() {
            Some(file) => file.metadata().map(|m| m.len()).map_err(FileError::from),
            None => Err(FileError::bad_descriptor()),
        };
        self.track(result)
    }

    /// Moves the file offset to `offset` bytes from the start.
    pub fn seek(&mut self, offset: u64) -> FileResult<u64> {
        let result = match self.file.as_mut() {
            Some(file) => file.seek(SeekFrom::Start(offset)).map_err(FileError::from),
            None => Err(FileError::bad_descriptor()),
        };
        self.track(result)
    }

    /// Current file offset.
    pub fn tell(&mut self) -> FileResult<u64> {
        let result = match self.file.as_mut() {
            Some(file) => file.stream_position().map_err(FileError::from),
            None => Err(FileError::bad_descriptor()),
        };
        self.track(result)
    }

    /// The path this handle was constructed with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The requested access mode.
    pub fn mode(&self) -> OpenMode {
        self.open_flags.mode()
    }

    /// The requested behavior flags.
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// The platform open flags derived at construction.
    pub fn open_flags(&self) -> RawOpenFlags {
        self.open_flags
    }

    /// The configuration this handle was opened with.
    pub fn config(&self) -> &HandleConfig {
        &self.config
    }

    /// Whether a descriptor is open.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Identity recorded at the most recent successful open.
    pub fn identity(&self) -> Option<FileIdentity> {
        self.identity
    }

    /// Whether this handle holds a lock it acquired.
    pub fn is_locked(&self) -> bool {
        self.held_lock.is_some()
    }

    /// Mode of the lock this handle holds, if any.
    pub fn lock_mode(&self) -> Option<LockMode> {
        self.held_lock
    }

    /// Operation counters.
    pub fn stats(&self) -> &HandleStats {
        &self.stats
    }

    /// Whether the most recent fallible operation failed.
    pub fn has_error(&self) -> bool {
        self.last_error.is_some()
    }

    /// The most recent error, if the last fallible operation failed.
    pub fn error(&self) -> Option<&FileError> {
        self.last_error.as_ref()
    }

    /// Human readable form of the last error.
    pub fn error_message(&self) -> String {
        self.last_error
            .as_ref()
            .map_or_else(|| "Success".to_string(), ToString::to_string)
    }

    /// Records the outcome of an operation as the last error.
    pub(crate) fn track<T>(&mut self, result: FileResult<T>) -> FileResult<T> {
        match &result {
            Ok(_) => self.last_error = None,
            Err(err) => self.last_error = Some(err.clone()),
        }
        result
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if let Err(err) = self.unlock() {
            warn!(path = %self.name, error = %err, "unlock failed during teardown");
        }
        self.close();
    }
}

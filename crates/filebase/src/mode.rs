//! Open modes, behavior flags and lock modes.

use std::fs::OpenOptions;
use std::ops::BitOr;
use std::os::unix::fs::OpenOptionsExt;

use serde::{Deserialize, Serialize};

/// Access mode a file is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpenMode {
    /// Read-only access.
    Read,
    /// Write-only access. Creates the file if missing.
    Write,
    /// Read and write access. Creates the file if missing.
    ReadWrite,
}

impl OpenMode {
    /// Returns whether the mode permits reading.
    pub fn is_readable(self) -> bool {
        matches!(self, OpenMode::Read | OpenMode::ReadWrite)
    }

    /// Returns whether the mode permits writing.
    pub fn is_writable(self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::ReadWrite)
    }
}

/// Behavior flags applied on open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpenFlags {
    /// No text-mode translation. POSIX has none, so this only records intent.
    pub binary: bool,
    /// Zero the file's length on open.
    pub truncate: bool,
}

impl OpenFlags {
    /// No flags.
    pub const NONE: OpenFlags = OpenFlags {
        binary: false,
        truncate: false,
    };
    /// The binary flag alone.
    pub const BINARY: OpenFlags = OpenFlags {
        binary: true,
        truncate: false,
    };
    /// The truncate flag alone.
    pub const TRUNCATE: OpenFlags = OpenFlags {
        binary: false,
        truncate: true,
    };
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags {
            binary: self.binary || rhs.binary,
            truncate: self.truncate || rhs.truncate,
        }
    }
}

/// Advisory lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Shared lock: any number of holders, excluded only by a write lock.
    Read,
    /// Exclusive lock: a single holder system-wide.
    Write,
}

impl LockMode {
    pub(crate) fn flock_operation(self) -> libc::c_int {
        match self {
            LockMode::Read => libc::LOCK_SH,
            LockMode::Write => libc::LOCK_EX,
        }
    }
}

/// Platform open flags derived once from an [`OpenMode`] and [`OpenFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawOpenFlags {
    mode: OpenMode,
    create: bool,
    truncate: bool,
    create_mode: u32,
}

impl RawOpenFlags {
    /// Derives the open flags. Writable modes create missing files with
    /// `create_mode` permission bits.
    pub fn derive(mode: OpenMode, flags: OpenFlags, create_mode: u32) -> Self {
        Self {
            mode,
            create: mode.is_writable(),
            truncate: flags.truncate,
            create_mode,
        }
    }

    /// The access mode these flags were derived from.
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// The flags as the `oflag` argument to `open(2)`.
    pub fn bits(&self) -> libc::c_int {
        let mut bits = match self.mode {
            OpenMode::Read => libc::O_RDONLY,
            OpenMode::Write => libc::O_WRONLY,
            OpenMode::ReadWrite => libc::O_RDWR,
        };
        if self.create {
            bits |= libc::O_CREAT;
        }
        if self.truncate {
            bits |= libc::O_TRUNC;
        }
        bits | libc::O_CLOEXEC
    }

    /// Builds the std open options. Truncating a read-only file is rejected
    /// by std with `InvalidInput` at open time.
    pub(crate) fn to_open_options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        options
            .read(self.mode.is_readable())
            .write(self.mode.is_writable())
            .create(self.create)
            .truncate(self.truncate)
            .mode(self.create_mode);
        options
    }
}

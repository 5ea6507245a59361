//! On-disk file identity used to detect replaced files.

use std::fs::{File, Metadata};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Device and inode pair identifying a file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    /// Device the file lives on.
    pub dev: u64,
    /// Inode number on that device.
    pub ino: u64,
}

impl FileIdentity {
    /// Identity of the file an open descriptor refers to (`fstat`).
    pub fn of_file(file: &File) -> io::Result<Self> {
        file.metadata().map(|m| Self::from_metadata(&m))
    }

    /// Identity of whatever the path currently names (`stat`).
    pub fn of_path(path: impl AsRef<Path>) -> io::Result<Self> {
        std::fs::metadata(path).map(|m| Self::from_metadata(&m))
    }

    fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }
}

//! Memory-mapped views over file regions.
//!
//! A [`MappedView`] is returned by value: the caller owns it outright and
//! unmaps it by dropping it. The handle that created it keeps no reference,
//! and the view stays valid after the handle is closed.

use std::io;
use std::ops::Deref;

use memmap2::{Mmap, MmapMut, MmapOptions};
use tracing::debug;

use crate::error::{FileError, FileResult};
use crate::handle::FileHandle;
use crate::mode::OpenMode;

/// An owned mapping of a byte range of a file.
#[derive(Debug)]
pub enum MappedView {
    /// A read-only shared mapping.
    ReadOnly(Mmap),
    /// A read-write shared mapping; writes reach the file.
    Writable(MmapMut),
}

impl MappedView {
    /// Length of the mapped range in bytes.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the mapping is empty. Views are never created empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the view rejects writes.
    pub fn is_read_only(&self) -> bool {
        matches!(self, MappedView::ReadOnly(_))
    }

    /// The mapped bytes.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            MappedView::ReadOnly(map) => &map[..],
            MappedView::Writable(map) => &map[..],
        }
    }

    /// The mapped bytes, mutably, for writable views.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self {
            MappedView::ReadOnly(_) => None,
            MappedView::Writable(map) => Some(&mut map[..]),
        }
    }

    /// Flushes modified pages of a writable view to the file.
    pub fn flush(&self) -> io::Result<()> {
        match self {
            MappedView::ReadOnly(_) => Ok(()),
            MappedView::Writable(map) => map.flush(),
        }
    }
}

impl Deref for MappedView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for MappedView {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl FileHandle {
    /// Maps `length` bytes starting at `offset`.
    ///
    /// Read-only views need a readable handle; writable views need a
    /// read-write handle. The range must lie within the current file size.
    /// Ownership of the returned view passes to the caller.
    pub fn create_map(
        &mut self,
        offset: u64,
        length: usize,
        read_only: bool,
    ) -> FileResult<MappedView> {
        let result = self.map_region(offset, length, read_only);
        match &result {
            Ok(view) => {
                self.stats.maps_created += 1;
                debug!(path = %self.name(), offset, length = view.len(), read_only, "mapped region");
            }
            Err(_) => self.stats.map_failures += 1,
        }
        self.track(result)
    }

    fn map_region(&self, offset: u64, length: usize, read_only: bool) -> FileResult<MappedView> {
        let file = self.file.as_ref().ok_or_else(|| self.not_open())?;

        let mode = self.mode();
        if read_only && !mode.is_readable() {
            return Err(FileError::InvalidOperation {
                path: self.name().to_string(),
                reason: "mapping requires a readable handle",
            });
        }
        if !read_only && mode != OpenMode::ReadWrite {
            return Err(FileError::InvalidOperation {
                path: self.name().to_string(),
                reason: "writable mapping requires a read-write handle",
            });
        }

        let file_size = file.metadata()?.len();
        let in_bounds = offset <= i64::MAX as u64
            && length > 0
            && offset
                .checked_add(length as u64)
                .is_some_and(|end| end <= file_size);
        if !in_bounds {
            return Err(FileError::InvalidRange {
                path: self.name().to_string(),
                offset,
                length: length as u64,
                file_size,
            });
        }

        let mut options = MmapOptions::new();
        options.offset(offset).len(length);

        // SAFETY: the range was checked against the current file size. As
        // with any shared file mapping, a concurrent truncate by another
        // process can still invalidate pages; callers coordinate through the
        // advisory lock.
        let view = if read_only {
            unsafe { options.map(file) }.map(MappedView::ReadOnly)
        } else {
            unsafe { options.map_mut(file) }.map(MappedView::Writable)
        };
        view.map_err(|err| FileError::mapping(self.name(), err))
    }
}
